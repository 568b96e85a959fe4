//! Request interception: what gets cached, and how each request is answered.

mod coordinator;
mod fetcher;
mod policy;
mod request;
mod response;
mod stats;

pub use coordinator::FetchCoordinator;
pub use fetcher::{Fetcher, UpstreamFetcher};
pub use policy::{Interception, InterceptionPolicy};
pub use request::{ProxyRequest, RequestIdentity};
pub use response::{ProxyResponse, ResponseKind};
pub use stats::{ProxyStats, StatsSnapshot};
