use async_trait::async_trait;

use crate::upstream::UpstreamClient;
use crate::TargetError;

/// A monitored-target identifier after syntactic classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    /// Numeric post id, usable as a collection key as-is
    Key(String),
    /// Alphanumeric short-code that needs an upstream lookup
    ShortCode(String),
}

/// Classify a raw link, short-code or numeric id.
pub fn parse_target(input: &str) -> Result<TargetRef, TargetError> {
    let trimmed = input.trim();
    let invalid = || TargetError::InvalidFormat(input.to_string());

    let segment = if trimmed.contains("://") || trimmed.contains('/') {
        let without_scheme = trimmed.split_once("://").map_or(trimmed, |(_, rest)| rest);
        let path = without_scheme
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        // First part is the host.
        parts.next();
        parts.last().ok_or_else(invalid)?
    } else {
        trimmed
    };

    if segment.is_empty() || segment.len() > 24 {
        return Err(invalid());
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(TargetRef::Key(segment.to_string()));
    }
    if segment.len() >= 5 && segment.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Ok(TargetRef::ShortCode(segment.to_string()));
    }
    Err(invalid())
}

/// Turns a free-form identifier into the canonical collection key.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, input: &str) -> Result<String, TargetError>;
}

pub struct UpstreamResolver {
    client: UpstreamClient,
}

impl UpstreamResolver {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetResolver for UpstreamResolver {
    async fn resolve(&self, input: &str) -> Result<String, TargetError> {
        match parse_target(input)? {
            TargetRef::Key(key) => Ok(key),
            TargetRef::ShortCode(code) => {
                let key = self
                    .client
                    .lookup_status_id(&code)
                    .await
                    .map_err(|e| TargetError::Unresolvable {
                        input: input.to_string(),
                        reason: e.to_string(),
                    })?;
                tracing::info!(code = %code, key = %key, "resolved short-code");
                Ok(key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn classifies_identifiers() {
        assert_eq!(
            parse_target(" 4990123456789012 ").unwrap(),
            TargetRef::Key("4990123456789012".into())
        );
        assert_eq!(
            parse_target("NxYz12AbC").unwrap(),
            TargetRef::ShortCode("NxYz12AbC".into())
        );
        assert_eq!(
            parse_target("https://weibo.com/1234567/NxYz12AbC?refer=home#comments").unwrap(),
            TargetRef::ShortCode("NxYz12AbC".into())
        );
        assert_eq!(
            parse_target("https://m.weibo.cn/detail/4990123456789012").unwrap(),
            TargetRef::Key("4990123456789012".into())
        );
    }

    #[test]
    fn rejects_garbage() {
        for input in ["", "   ", "https://weibo.com/", "abc", "not a post!", "a-b-c-d-e"] {
            assert!(
                matches!(parse_target(input), Err(TargetError::InvalidFormat(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn numeric_ids_skip_the_network() {
        let resolver = UpstreamResolver::new(UpstreamClient::new("http://127.0.0.1:9", "").unwrap());
        assert_eq!(resolver.resolve("4990").await.unwrap(), "4990");
    }

    #[tokio::test]
    async fn short_codes_are_looked_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/statuses/show"))
            .and(query_param("id", "NxYz12AbC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"idstr": "4990555"})))
            .mount(&server)
            .await;

        let resolver = UpstreamResolver::new(UpstreamClient::new(server.uri(), "c").unwrap());
        assert_eq!(resolver.resolve("NxYz12AbC").await.unwrap(), "4990555");
    }

    #[tokio::test]
    async fn failed_lookup_is_unresolvable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver = UpstreamResolver::new(UpstreamClient::new(server.uri(), "").unwrap());
        let err = resolver.resolve("NxYz12AbC").await.unwrap_err();
        assert!(matches!(err, TargetError::Unresolvable { .. }), "got {err:?}");
    }
}
