pub mod integrity;
pub mod models;
pub mod progress;
pub mod provider;
pub mod schema_diff;
pub mod stages;
pub mod transfer_engine;
pub mod version;

pub use integrity::{IntegrityValidator, compare_schema_sets};
pub use models::{
    Asset, AssetStats, ConfigurationEntry, Entity, Link, Schema, StageItem, TransferMetadata,
};
pub use progress::{ProgressEvent, ProgressEventKind, ProgressHandle, ProgressSnapshot};
pub use provider::{
    BoxSink, DestinationProvider, ItemStream, Provider, ProviderType, SourceProvider, StageSink,
};
pub use stages::{DATA_STAGES, TRANSFER_STAGES, TransferStage};
pub use transfer_engine::{TransferEngine, TransferResults, create_transfer_engine};
