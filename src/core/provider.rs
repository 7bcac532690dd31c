//! Provider contract shared by transfer endpoints.
//!
//! Both sides implement [`Provider`] for identity, metadata and lifecycle.
//! A source additionally implements [`SourceProvider`] and produces one lazy
//! [`ItemStream`] per data stage it supports; a destination implements
//! [`DestinationProvider`] and hands out one [`StageSink`] per data stage it
//! accepts. Stage support is declared through `supports()` and probed once per
//! transfer, so an implementor only overrides the stage methods it declares.

use std::fmt;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{Asset, ConfigurationEntry, Entity, Link, Schema, TransferMetadata};
use super::stages::TransferStage;

/// Lazy, fallible sequence of stage items, pulled on demand.
pub type ItemStream<T> = BoxStream<'static, Result<T>>;

pub type BoxSink<T> = Box<dyn StageSink<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Source,
    Destination,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Destination => f.write_str("destination"),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Diagnostic name, used in logs and errors.
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    /// `None` when the provider cannot describe itself; the version check is
    /// then skipped.
    async fn get_metadata(&self) -> Result<Option<TransferMetadata>>;

    /// `None` when the provider cannot describe its schemas; the schema check
    /// is then skipped.
    async fn get_schemas(&self) -> Result<Option<Vec<Schema>>>;

    /// Acquire provider-held resources. Called at most once per transfer.
    async fn bootstrap(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources acquired in `bootstrap`. Called at most once, and
    /// only if `bootstrap` succeeded.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Opaque result payload, read after teardown.
    fn results(&self) -> Option<Value> {
        None
    }
}

fn unsupported(name: &str, stage: TransferStage) -> anyhow::Error {
    anyhow!("provider '{}' does not support the {} stage", name, stage)
}

#[async_trait]
pub trait SourceProvider: Provider {
    /// Whether this source produces items for the given data stage.
    fn supports(&self, stage: TransferStage) -> bool {
        let _ = stage;
        false
    }

    async fn stream_schemas(&self) -> Result<ItemStream<Schema>> {
        Err(unsupported(self.name(), TransferStage::Schemas))
    }

    async fn stream_configuration(&self) -> Result<ItemStream<ConfigurationEntry>> {
        Err(unsupported(self.name(), TransferStage::Configuration))
    }

    async fn stream_entities(&self) -> Result<ItemStream<Entity>> {
        Err(unsupported(self.name(), TransferStage::Entities))
    }

    async fn stream_links(&self) -> Result<ItemStream<Link>> {
        Err(unsupported(self.name(), TransferStage::Links))
    }

    async fn stream_assets(&self) -> Result<ItemStream<Asset>> {
        Err(unsupported(self.name(), TransferStage::Assets))
    }
}

#[async_trait]
pub trait DestinationProvider: Provider {
    /// Whether this destination accepts items for the given data stage.
    fn supports(&self, stage: TransferStage) -> bool {
        let _ = stage;
        false
    }

    async fn schemas_sink(&self) -> Result<BoxSink<Schema>> {
        Err(unsupported(self.name(), TransferStage::Schemas))
    }

    async fn configuration_sink(&self) -> Result<BoxSink<ConfigurationEntry>> {
        Err(unsupported(self.name(), TransferStage::Configuration))
    }

    async fn entities_sink(&self) -> Result<BoxSink<Entity>> {
        Err(unsupported(self.name(), TransferStage::Entities))
    }

    async fn links_sink(&self) -> Result<BoxSink<Link>> {
        Err(unsupported(self.name(), TransferStage::Links))
    }

    async fn assets_sink(&self) -> Result<BoxSink<Asset>> {
        Err(unsupported(self.name(), TransferStage::Assets))
    }
}

/// Destination-side consumer for one data stage.
///
/// The pipeline awaits each `write` before handing over the next item, so a
/// slow sink throttles the source.
#[async_trait]
pub trait StageSink<T: Send + 'static>: Send {
    async fn write(&mut self, item: T) -> Result<()>;

    /// Commit anything still buffered. Called once after the last item.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}
