//! HTTP transport (C3) and protocol client (C4).

pub mod http;
pub mod protocol;
pub mod retry;

pub use http::{download, get_signed_urls, poll_status, upload, SignedUrls, StatusOutcome, TransportClient};
pub use protocol::{check_workers, discover_gateway, fetch_capabilities};
