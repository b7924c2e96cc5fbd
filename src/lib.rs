pub mod adapters;
pub mod checksum;
pub mod config;
pub mod connection_cache;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod fs_utils;
pub mod hash;
pub mod manifest;
pub mod orchestrator;
pub mod prioritizer;
pub mod progress;
pub mod protocol;
mod response_info;

pub use adapters::{AdapterRegistry, ChunkStream, ClientSettings, ProtocolAdapter, TransferMode};
pub use controller::{TransferController, TransferControllerBuilder};
pub use manifest::{ManifestEntry, Outcome, TsvManifest};
pub use orchestrator::{BatchOrchestrator, BatchOrchestratorBuilder, BatchSummary};
pub use protocol::{PriorityList, Protocol};
