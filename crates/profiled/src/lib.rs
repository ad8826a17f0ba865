//! Profiled - windowed feature-profile aggregation service.
//!
//! This crate accumulates per-request feature observations into statistical
//! profiles and ships them to a collector:
//! - Receives observations over HTTP, keyed by org, dataset and segment tags
//! - Accumulates them per key in a concurrent store with per-key guards
//! - Rotates every window on a fixed period
//! - Uploads finished profiles with jittered exponential backoff
//!
//! ## Architecture
//!
//! ```text
//! POST /logs → ProfileStore ← rotation tick
//!                                 ↓
//!                    Uploader (retry + backoff) → Publisher
//! ```

pub mod config;
pub mod error;
pub mod ingest;
pub mod key;
pub mod profile;
pub mod rotation;
pub mod store;
pub mod upload;

pub use config::ProfiledConfig;
pub use error::ProfiledError;
pub use key::WindowKey;
pub use profile::{FeatureValue, Profile, ProfileSnapshot};
pub use rotation::{start_rotation, RotationHandle};
pub use store::{ProfileStore, RotatedProfile};
pub use upload::{HttpPublisher, PublishError, Publisher, RetryPolicy, Uploader};
