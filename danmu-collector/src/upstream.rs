use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;

use crate::FetchError;

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/86.0.4240.111 Safari/537.36";

/// Comments requested per upstream page.
pub const PAGE_SIZE: u64 = 20;

/// One decoded page of the upstream comment listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPage {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub max_id: Value,
    #[serde(default)]
    pub total_number: u64,
}

impl RawPage {
    /// Continuation marker: non-zero `max_id`, or more items than pages seen.
    pub fn has_more(&self, page: u32) -> bool {
        let marker = match &self.max_id {
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            Value::String(s) => !s.is_empty() && s != "0",
            _ => false,
        };
        marker || u64::from(page) * PAGE_SIZE < self.total_number
    }
}

/// Source of comment pages; the HTTP client in production.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, target: &str, page: u32) -> Result<RawPage, FetchError>;
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base: String,
    cookie: String,
}

impl UpstreamClient {
    pub fn new(base: impl Into<String>, cookie: impl Into<String>) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            cookie: cookie.into(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base, path))
            .header(USER_AGENT, BROWSER_UA)
            .header(COOKIE, &self.cookie)
    }

    /// Look up the numeric post id for a short-code.
    pub async fn lookup_status_id(&self, code: &str) -> Result<String, FetchError> {
        let body: Value = self
            .get("/ajax/statuses/show")
            .query(&[("id", code)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match body.get("idstr").or_else(|| body.get("id")) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(FetchError::Malformed(format!("no id in status for {code}"))),
        }
    }
}

#[async_trait]
impl PageSource for UpstreamClient {
    async fn fetch_page(&self, target: &str, page: u32) -> Result<RawPage, FetchError> {
        let mut query = vec![
            ("id", target.to_string()),
            ("flow", "1".into()),
            ("is_reload", "1".into()),
            ("is_show_bulletin", "2".into()),
            ("is_mix", "0".into()),
            ("count", PAGE_SIZE.to_string()),
            ("fetch_level", "0".into()),
            ("locale", "zh-CN".into()),
        ];
        if page > 1 {
            query.push(("page", page.to_string()));
        }

        let text = self
            .get("/ajax/statuses/buildComments")
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let body: Value =
            serde_json::from_str(&text).map_err(|e| FetchError::Malformed(e.to_string()))?;
        if !body.get("data").is_some_and(Value::is_array) {
            return Err(FetchError::Malformed("response has no data list".into()));
        }
        serde_json::from_value(body).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn continuation_follows_max_id_or_total() {
        let page = |max_id: Value, total: u64| RawPage {
            data: vec![],
            max_id,
            total_number: total,
        };
        assert!(page(json!(139), 0).has_more(1));
        assert!(page(json!("139"), 0).has_more(1));
        assert!(!page(json!(0), 0).has_more(1));
        assert!(page(json!(0), 41).has_more(2));
        assert!(!page(json!(0), 40).has_more(2));
        assert!(!page(Value::Null, 0).has_more(1));
    }

    #[tokio::test]
    async fn first_page_omits_page_param_and_sends_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/statuses/buildComments"))
            .and(query_param("id", "4990"))
            .and(query_param("flow", "1"))
            .and(header("cookie", "SUB=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 1}],
                "max_id": 0,
                "total_number": 1
            })))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), "SUB=abc").unwrap();
        let page = client.fetch_page("4990", 1).await.unwrap();
        assert_eq!(page.data.len(), 1);

        let requests = server.received_requests().await.unwrap();
        assert!(!requests[0].url.query().unwrap_or("").contains("page="));
    }

    #[tokio::test]
    async fn stalled_upstream_times_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": []}))
                    .set_delay(Duration::from_secs(15)),
            )
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), "").unwrap();
        let started = std::time::Instant::now();
        let err = client.fetch_page("1", 1).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(14));
    }

    #[tokio::test]
    async fn missing_data_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/statuses/buildComments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": -100})))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), "").unwrap();
        let err = client.fetch_page("1", 2).await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), "").unwrap();
        let err = client.fetch_page("1", 1).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn status_lookup_returns_numeric_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/statuses/show"))
            .and(query_param("id", "NxYz12AbC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 4990123456789012u64})))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), "").unwrap();
        let id = client.lookup_status_id("NxYz12AbC").await.unwrap();
        assert_eq!(id, "4990123456789012");
    }
}
