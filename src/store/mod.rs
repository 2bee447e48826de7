//! Graph Snapshot Client
//!
//! Architecture follows the project pattern (trait + impl + mock):
//! - `GraphStoreClient` trait: narrow async contract against the external graph store
//! - `HttpGraphStore`: real implementation over the store's JSON API
//! - `MockGraphStore`: in-memory store with a write counter, for tests
//!
//! `SnapshotClient` wraps any of them with per-call timeouts and converts
//! every failure into an empty result, then builds dense `GraphSnapshot`s.

pub mod client;
pub mod http;
pub mod mock;
pub mod models;
pub mod snapshot;
pub mod traits;

pub use client::SnapshotClient;
pub use http::HttpGraphStore;
pub use mock::MockGraphStore;
pub use models::{AttentionEdgeRecord, EdgeUpsert, EntityRecord, SearchHit};
pub use snapshot::{EntityIndex, GraphSnapshot, SnapshotTensors, TypeVocabulary};
pub use traits::GraphStoreClient;
