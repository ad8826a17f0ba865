//! HTTP ingestion of feature observations.
//!
//! This module decodes log requests and records them into the profile store.

pub mod http;
pub mod request;

pub use http::{ingest_router, ingest_router_with_limit, IngestState, API_KEY_HEADER};
pub use request::{Columnar, LogRequest, RawTags};
