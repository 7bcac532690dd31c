//! In-memory providers.
//!
//! [`MemorySource`] streams a fixed snapshot held in memory and
//! [`MemoryDestination`] collects whatever it receives. Both are cheap to
//! clone; clones share the call log and the destination's store, so a test can
//! keep one handle while the engine owns the other. Faults can be injected per
//! operation to exercise the engine's failure paths.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::core::models::{
    Asset, AssetStats, ConfigurationEntry, Entity, Link, ProducerInfo, Schema, TransferMetadata,
};
use crate::core::provider::{
    BoxSink, DestinationProvider, ItemStream, Provider, ProviderType, SourceProvider, StageSink,
};
use crate::core::stages::{DATA_STAGES, TransferStage};

/// Asset content is streamed in chunks of this many bytes.
pub const ASSET_CHUNK_SIZE: usize = 64 * 1024;

/// A provider operation, used to count calls and to inject faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    GetMetadata,
    GetSchemas,
    Bootstrap,
    Close,
    /// Opening a stage's stream (source) or sink (destination).
    Open(TransferStage),
    /// One item pulled from a source stream.
    Read(TransferStage),
    /// One item handed to a destination sink.
    Write(TransferStage),
    /// A destination sink committing after its last item.
    Finish(TransferStage),
}

/// Shared per-operation call counters.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    counts: Arc<Mutex<BTreeMap<Operation, usize>>>,
}

impl CallLog {
    fn record(&self, op: Operation) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(op).or_default() += 1;
    }

    pub fn count(&self, op: Operation) -> usize {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(&op).copied().unwrap_or(0)
    }
}

/// Asset content held fully in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAsset {
    pub filename: String,
    pub filepath: PathBuf,
    pub mimetype: Option<String>,
    pub data: Vec<u8>,
}

impl MemoryAsset {
    pub fn new(filepath: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        let filepath = filepath.into();
        let filename = filepath
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            filename,
            filepath,
            mimetype: None,
            data: data.into(),
        }
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    fn into_asset(self) -> Asset {
        let chunks: Vec<std::io::Result<Vec<u8>>> = self
            .data
            .chunks(ASSET_CHUNK_SIZE)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Asset {
            filename: self.filename,
            filepath: self.filepath,
            stats: AssetStats {
                size: self.data.len() as u64,
            },
            mimetype: self.mimetype,
            stream: stream::iter(chunks).boxed(),
        }
    }

    async fn read(asset: Asset) -> Result<Self> {
        let chunks: Vec<Vec<u8>> = asset
            .stream
            .try_collect()
            .await
            .with_context(|| format!("failed to read asset '{}'", asset.filepath.display()))?;
        Ok(Self {
            filename: asset.filename,
            filepath: asset.filepath,
            mimetype: asset.mimetype,
            data: chunks.concat(),
        })
    }
}

/// Everything that flows through the five data stages.
#[derive(Debug, Clone, Default)]
pub struct MemoryContents {
    pub schemas: Vec<Schema>,
    pub configuration: Vec<ConfigurationEntry>,
    pub entities: Vec<Entity>,
    pub links: Vec<Link>,
    pub assets: Vec<MemoryAsset>,
}

/// Identity, lifecycle and fault state shared by both memory providers.
#[derive(Debug, Clone)]
struct Endpoint {
    name: String,
    metadata: Option<TransferMetadata>,
    schemas: Option<Vec<Schema>>,
    stages: BTreeSet<TransferStage>,
    faults: BTreeMap<Operation, String>,
    results: Option<Value>,
    calls: CallLog,
}

impl Endpoint {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: None,
            schemas: None,
            stages: DATA_STAGES.into_iter().collect(),
            faults: BTreeMap::new(),
            results: None,
            calls: CallLog::default(),
        }
    }

    /// Record a call to `op`, failing it if a fault was injected.
    fn check(&self, op: Operation) -> Result<()> {
        self.calls.record(op);
        check_fault(&self.faults, op)
    }
}

fn check_fault(faults: &BTreeMap<Operation, String>, op: Operation) -> Result<()> {
    match faults.get(&op) {
        Some(message) => Err(anyhow!("{}", message)),
        None => Ok(()),
    }
}

fn producer_metadata(version: &str) -> TransferMetadata {
    TransferMetadata {
        created_at: Utc::now(),
        producer: ProducerInfo {
            name: "memory".to_string(),
            version: version.to_string(),
            extensions: Vec::new(),
        },
    }
}

/// Source provider streaming a snapshot held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    endpoint: Endpoint,
    contents: MemoryContents,
    read_faults: BTreeMap<TransferStage, (usize, String)>,
}

impl MemorySource {
    /// A source supporting every data stage, with no content, metadata or
    /// schemas.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::new(name),
            contents: MemoryContents::default(),
            read_faults: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: TransferMetadata) -> Self {
        self.endpoint.metadata = Some(metadata);
        self
    }

    pub fn with_version(self, version: &str) -> Self {
        self.with_metadata(producer_metadata(version))
    }

    /// Schemas both reported to the integrity check and streamed.
    pub fn with_schemas(mut self, schemas: Vec<Schema>) -> Self {
        self.contents.schemas = schemas.clone();
        self.endpoint.schemas = Some(schemas);
        self
    }

    pub fn with_configuration(mut self, entries: Vec<ConfigurationEntry>) -> Self {
        self.contents.configuration = entries;
        self
    }

    pub fn with_entities(mut self, entities: Vec<Entity>) -> Self {
        self.contents.entities = entities;
        self
    }

    pub fn with_links(mut self, links: Vec<Link>) -> Self {
        self.contents.links = links;
        self
    }

    pub fn with_assets(mut self, assets: Vec<MemoryAsset>) -> Self {
        self.contents.assets = assets;
        self
    }

    pub fn with_results(mut self, results: Value) -> Self {
        self.endpoint.results = Some(results);
        self
    }

    /// Stop declaring support for `stage`.
    pub fn without(mut self, stage: TransferStage) -> Self {
        self.endpoint.stages.remove(&stage);
        self
    }

    pub fn fail_on(mut self, op: Operation, message: impl Into<String>) -> Self {
        self.endpoint.faults.insert(op, message.into());
        self
    }

    /// Make `stage`'s stream yield an error in place of the item at `index`.
    pub fn fail_read_at(
        mut self,
        stage: TransferStage,
        index: usize,
        message: impl Into<String>,
    ) -> Self {
        self.read_faults.insert(stage, (index, message.into()));
        self
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.endpoint.calls.count(op)
    }

    fn item_stream<T: Send + 'static>(
        &self,
        stage: TransferStage,
        items: Vec<T>,
    ) -> Result<ItemStream<T>> {
        self.endpoint.check(Operation::Open(stage))?;

        let mut results: Vec<Result<T>> = items.into_iter().map(Ok).collect();
        if let Some((index, message)) = self.read_faults.get(&stage) {
            results.truncate(*index);
            results.push(Err(anyhow!("{}", message)));
        }

        let calls = self.endpoint.calls.clone();
        Ok(stream::iter(results)
            .inspect(move |_| calls.record(Operation::Read(stage)))
            .boxed())
    }
}

#[async_trait]
impl Provider for MemorySource {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Source
    }

    async fn get_metadata(&self) -> Result<Option<TransferMetadata>> {
        self.endpoint.check(Operation::GetMetadata)?;
        Ok(self.endpoint.metadata.clone())
    }

    async fn get_schemas(&self) -> Result<Option<Vec<Schema>>> {
        self.endpoint.check(Operation::GetSchemas)?;
        Ok(self.endpoint.schemas.clone())
    }

    async fn bootstrap(&self) -> Result<()> {
        self.endpoint.check(Operation::Bootstrap)
    }

    async fn close(&self) -> Result<()> {
        self.endpoint.check(Operation::Close)
    }

    fn results(&self) -> Option<Value> {
        self.endpoint.results.clone()
    }
}

#[async_trait]
impl SourceProvider for MemorySource {
    fn supports(&self, stage: TransferStage) -> bool {
        self.endpoint.stages.contains(&stage)
    }

    async fn stream_schemas(&self) -> Result<ItemStream<Schema>> {
        self.item_stream(TransferStage::Schemas, self.contents.schemas.clone())
    }

    async fn stream_configuration(&self) -> Result<ItemStream<ConfigurationEntry>> {
        self.item_stream(
            TransferStage::Configuration,
            self.contents.configuration.clone(),
        )
    }

    async fn stream_entities(&self) -> Result<ItemStream<Entity>> {
        self.item_stream(TransferStage::Entities, self.contents.entities.clone())
    }

    async fn stream_links(&self) -> Result<ItemStream<Link>> {
        self.item_stream(TransferStage::Links, self.contents.links.clone())
    }

    async fn stream_assets(&self) -> Result<ItemStream<Asset>> {
        let assets = self
            .contents
            .assets
            .iter()
            .cloned()
            .map(MemoryAsset::into_asset)
            .collect();
        self.item_stream(TransferStage::Assets, assets)
    }
}

type Store = Arc<Mutex<MemoryContents>>;

/// Destination provider collecting every item it receives.
///
/// Bootstrapping clears the store, so each transfer restores into an empty
/// destination.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    endpoint: Endpoint,
    store: Store,
    write_delay: Option<Duration>,
}

impl MemoryDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::new(name),
            store: Store::default(),
            write_delay: None,
        }
    }

    pub fn with_metadata(mut self, metadata: TransferMetadata) -> Self {
        self.endpoint.metadata = Some(metadata);
        self
    }

    pub fn with_version(self, version: &str) -> Self {
        self.with_metadata(producer_metadata(version))
    }

    /// Schemas reported to the integrity check.
    pub fn with_schemas(mut self, schemas: Vec<Schema>) -> Self {
        self.endpoint.schemas = Some(schemas);
        self
    }

    pub fn with_results(mut self, results: Value) -> Self {
        self.endpoint.results = Some(results);
        self
    }

    /// Sleep before accepting each item.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn without(mut self, stage: TransferStage) -> Self {
        self.endpoint.stages.remove(&stage);
        self
    }

    pub fn fail_on(mut self, op: Operation, message: impl Into<String>) -> Self {
        self.endpoint.faults.insert(op, message.into());
        self
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.endpoint.calls.count(op)
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> MemoryContents {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn sink<T: Send + 'static>(
        &self,
        stage: TransferStage,
        push: fn(&mut MemoryContents, T),
    ) -> Result<BoxSink<T>> {
        self.endpoint.check(Operation::Open(stage))?;
        Ok(Box::new(MemorySink {
            stage,
            store: self.store.clone(),
            faults: self.endpoint.faults.clone(),
            calls: self.endpoint.calls.clone(),
            write_delay: self.write_delay,
            push,
        }))
    }
}

#[async_trait]
impl Provider for MemoryDestination {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Destination
    }

    async fn get_metadata(&self) -> Result<Option<TransferMetadata>> {
        self.endpoint.check(Operation::GetMetadata)?;
        Ok(self.endpoint.metadata.clone())
    }

    async fn get_schemas(&self) -> Result<Option<Vec<Schema>>> {
        self.endpoint.check(Operation::GetSchemas)?;
        Ok(self.endpoint.schemas.clone())
    }

    async fn bootstrap(&self) -> Result<()> {
        self.endpoint.check(Operation::Bootstrap)?;
        *self.store.lock().unwrap_or_else(PoisonError::into_inner) = MemoryContents::default();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.endpoint.check(Operation::Close)
    }

    fn results(&self) -> Option<Value> {
        self.endpoint.results.clone()
    }
}

#[async_trait]
impl DestinationProvider for MemoryDestination {
    fn supports(&self, stage: TransferStage) -> bool {
        self.endpoint.stages.contains(&stage)
    }

    async fn schemas_sink(&self) -> Result<BoxSink<Schema>> {
        self.sink(TransferStage::Schemas, |store, item| store.schemas.push(item))
    }

    async fn configuration_sink(&self) -> Result<BoxSink<ConfigurationEntry>> {
        self.sink(TransferStage::Configuration, |store, item| {
            store.configuration.push(item)
        })
    }

    async fn entities_sink(&self) -> Result<BoxSink<Entity>> {
        self.sink(TransferStage::Entities, |store, item| store.entities.push(item))
    }

    async fn links_sink(&self) -> Result<BoxSink<Link>> {
        self.sink(TransferStage::Links, |store, item| store.links.push(item))
    }

    async fn assets_sink(&self) -> Result<BoxSink<Asset>> {
        self.endpoint.check(Operation::Open(TransferStage::Assets))?;
        Ok(Box::new(AssetSink {
            store: self.store.clone(),
            faults: self.endpoint.faults.clone(),
            calls: self.endpoint.calls.clone(),
            write_delay: self.write_delay,
        }))
    }
}

struct MemorySink<T> {
    stage: TransferStage,
    store: Store,
    faults: BTreeMap<Operation, String>,
    calls: CallLog,
    write_delay: Option<Duration>,
    push: fn(&mut MemoryContents, T),
}

#[async_trait]
impl<T: Send + 'static> StageSink<T> for MemorySink<T> {
    async fn write(&mut self, item: T) -> Result<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let op = Operation::Write(self.stage);
        self.calls.record(op);
        check_fault(&self.faults, op)?;

        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        (self.push)(&mut store, item);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let op = Operation::Finish(self.stage);
        self.calls.record(op);
        check_fault(&self.faults, op)
    }
}

/// Reads each asset's byte stream to the end before storing it.
struct AssetSink {
    store: Store,
    faults: BTreeMap<Operation, String>,
    calls: CallLog,
    write_delay: Option<Duration>,
}

#[async_trait]
impl StageSink<Asset> for AssetSink {
    async fn write(&mut self, item: Asset) -> Result<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let op = Operation::Write(TransferStage::Assets);
        self.calls.record(op);
        check_fault(&self.faults, op)?;

        let asset = MemoryAsset::read(item).await?;
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .assets
            .push(asset);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let op = Operation::Finish(TransferStage::Assets);
        self.calls.record(op);
        check_fault(&self.faults, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_asset_content_survives_chunking() {
        let data: Vec<u8> = (0..(ASSET_CHUNK_SIZE * 2 + 10)).map(|i| i as u8).collect();
        let asset = MemoryAsset::new("uploads/photo.png", data.clone()).with_mimetype("image/png");
        assert_eq!(asset.filename, "photo.png");

        let streamed = asset.clone().into_asset();
        assert_eq!(streamed.stats.size, data.len() as u64);

        let read = MemoryAsset::read(streamed).await.unwrap();
        assert_eq!(read, asset);
    }

    #[tokio::test]
    async fn test_source_stream_counts_reads_and_injects_errors() {
        let entities = (1..=3)
            .map(|id| Entity {
                id,
                entity_type: "api::foo.foo".to_string(),
                data: Default::default(),
            })
            .collect();
        let source = MemorySource::new("memory")
            .with_entities(entities)
            .fail_read_at(TransferStage::Entities, 2, "row 3 is corrupt");

        let items: Vec<Result<Entity>> = source.stream_entities().await.unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(items[2].as_ref().unwrap_err().to_string().contains("corrupt"));
        assert_eq!(source.calls(Operation::Read(TransferStage::Entities)), 3);
        assert_eq!(source.calls(Operation::Open(TransferStage::Entities)), 1);
    }

    #[tokio::test]
    async fn test_destination_bootstrap_clears_store() {
        let destination = MemoryDestination::new("memory");
        let handle = destination.clone();

        let mut sink = destination.links_sink().await.unwrap();
        sink.write(Link {
            kind: "relation".to_string(),
            relation: crate::core::models::RelationKind::OneToOne,
            left: crate::core::models::LinkEndpoint {
                entity_type: "a".to_string(),
                entity_ref: 1,
                field: "b".to_string(),
            },
            right: crate::core::models::LinkEndpoint {
                entity_type: "b".to_string(),
                entity_ref: 2,
                field: "a".to_string(),
            },
        })
        .await
        .unwrap();
        assert_eq!(handle.contents().links.len(), 1);

        destination.bootstrap().await.unwrap();
        assert!(handle.contents().links.is_empty());
        assert_eq!(handle.calls(Operation::Bootstrap), 1);
    }

    #[tokio::test]
    async fn test_injected_faults_fail_the_operation() {
        let destination = MemoryDestination::new("memory")
            .fail_on(Operation::Open(TransferStage::Schemas), "read-only");

        assert!(destination.schemas_sink().await.is_err());
        assert!(destination.entities_sink().await.is_ok());
        assert!(destination.supports(TransferStage::Schemas));
        assert!(!destination.without(TransferStage::Assets).supports(TransferStage::Assets));
    }
}
