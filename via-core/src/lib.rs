//! via-core - domain types and storage seams for the Vector Incident Atlas
//!
//! This crate holds everything the detection loop is built from: log event
//! types, the rhythm encoder, the embedding and vector-backend seams, the
//! adaptive control registry, the regression recorder, and configuration.
//! The server crate wires these into the two-tier loop.

pub mod config;
pub mod control;
pub mod embed;
pub mod error;
pub mod event;
pub mod rhythm;
pub mod schema;
pub mod vector;

pub use config::ViaConfig;
pub use control::{ActiveSet, ControlKind, ControlRecord, ControlRegistry, SqliteControlStore};
pub use embed::{cosine_similarity, Embedder, HashingEmbedder, SharedEmbedder};
pub use error::{ErrorCode, ViaError};
pub use event::{Level, LogEvent};
pub use rhythm::{encode, rhythm_hash, skeletonize, EncodedEvent, RhythmHash};
pub use vector::{MemoryBackend, SlowBackend, VectorBackend};
