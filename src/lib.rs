//! Crowd analytics and alerting.
//!
//! The workspace is split into the engine (pure per-frame analytics), the
//! service (video ingest, detection, persistence and the HTTP surface) and
//! the shared contracts in `common`.

pub use common;
pub use crowd_engine;
pub use crowd_service;
