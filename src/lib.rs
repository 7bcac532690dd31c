//! Staged transfer engine for moving a content snapshot between two providers.
//!
//! A transfer validates that both endpoints are compatible (version and
//! schema integrity), then streams schemas, configuration, entities, links and
//! assets from a source provider into a destination provider, one stage at a
//! time, while publishing progress events.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod providers;

pub use config::{EngineOptions, SchemaMatching, TransferStrategy};
pub use crate::core::transfer_engine::{TransferEngine, TransferResults, create_transfer_engine};
pub use crate::core::version::VersionMatching;
pub use error::{ConstructionError, IntegrityError, TransferError};
