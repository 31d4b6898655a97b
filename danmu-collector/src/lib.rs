pub mod error;
pub mod fetcher;
pub mod parse;
pub mod resolve;
pub mod session;
pub mod upstream;

pub use error::{FetchError, TargetError};
pub use fetcher::{FetchOutcome, FetchPolicy, PaginatedFetcher, Termination};
pub use resolve::{parse_target, TargetRef, TargetResolver, UpstreamResolver};
pub use session::{run_session, SessionConfig};
pub use upstream::{PageSource, RawPage, UpstreamClient};
