//! Stage pipeline runner.
//!
//! Drives the fixed stage order for one transfer: bootstrap, the five data
//! stages, then close. Each data stage moves items from the source stream to
//! the destination sink through a bounded channel. The stream is drained by a
//! spawned producer task, so at most `pipe_capacity` items are buffered and a
//! slow sink throttles the source.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::models::StageItem;
use crate::core::progress::ProgressReporter;
use crate::core::provider::{
    BoxSink, DestinationProvider, ItemStream, ProviderType, SourceProvider,
};
use crate::core::stages::{DATA_STAGES, StageCapabilities, TransferStage};
use crate::error::{StageFailure, TransferError};
use crate::logging::LogThrottle;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

/// Which lifecycle hooks have run on each side.
#[derive(Debug, Default)]
struct Lifecycle {
    source_bootstrapped: bool,
    destination_bootstrapped: bool,
    source_closed: bool,
    destination_closed: bool,
}

pub(crate) struct StagePipeline<'a> {
    source: &'a dyn SourceProvider,
    destination: &'a dyn DestinationProvider,
    reporter: &'a ProgressReporter,
    capabilities: StageCapabilities,
    pipe_capacity: usize,
    lifecycle: Lifecycle,
}

impl<'a> StagePipeline<'a> {
    pub(crate) fn new(
        source: &'a dyn SourceProvider,
        destination: &'a dyn DestinationProvider,
        reporter: &'a ProgressReporter,
        capabilities: StageCapabilities,
        pipe_capacity: usize,
    ) -> Self {
        Self {
            source,
            destination,
            reporter,
            capabilities,
            pipe_capacity,
            lifecycle: Lifecycle::default(),
        }
    }

    /// Run every stage in order. Stops at the first failure, after releasing
    /// whatever was bootstrapped.
    pub(crate) async fn run(&mut self) -> Result<(), TransferError> {
        self.bootstrap().await?;

        for stage in DATA_STAGES {
            let span = info_span!("stage", stage = %stage);
            if let Err(err) = self.run_data_stage(stage).instrument(span).await {
                self.teardown().await;
                return Err(err);
            }
        }

        self.close().await
    }

    async fn bootstrap(&mut self) -> Result<(), TransferError> {
        let stage = TransferStage::Bootstrap;
        self.reporter.stage_started(stage).await;
        info!(
            source = %self.source.name(),
            destination = %self.destination.name(),
            "Bootstrapping providers"
        );

        if let Err(source) = self.source.bootstrap().await {
            return Err(TransferError::Lifecycle {
                stage,
                provider: ProviderType::Source,
                source,
            });
        }
        self.lifecycle.source_bootstrapped = true;

        if let Err(source) = self.destination.bootstrap().await {
            self.teardown().await;
            return Err(TransferError::Lifecycle {
                stage,
                provider: ProviderType::Destination,
                source,
            });
        }
        self.lifecycle.destination_bootstrapped = true;

        self.reporter.stage_finished(stage).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        let stage = TransferStage::Close;
        self.reporter.stage_started(stage).await;
        info!("Closing providers");

        // Both sides are closed even if the source fails to.
        let source_closed = self.close_source().await;
        let destination_closed = self.close_destination().await;
        source_closed.and(destination_closed)?;

        self.reporter.stage_finished(stage).await;
        Ok(())
    }

    /// Best-effort release after a failure. Emits no stage events.
    async fn teardown(&mut self) {
        if let Err(err) = self.close_source().await {
            warn!(error = %err, "Source provider failed to close during teardown");
        }
        if let Err(err) = self.close_destination().await {
            warn!(error = %err, "Destination provider failed to close during teardown");
        }
    }

    async fn close_source(&mut self) -> Result<(), TransferError> {
        if !self.lifecycle.source_bootstrapped || self.lifecycle.source_closed {
            return Ok(());
        }
        self.lifecycle.source_closed = true;
        self.source
            .close()
            .await
            .map_err(|source| TransferError::Lifecycle {
                stage: TransferStage::Close,
                provider: ProviderType::Source,
                source,
            })
    }

    async fn close_destination(&mut self) -> Result<(), TransferError> {
        if !self.lifecycle.destination_bootstrapped || self.lifecycle.destination_closed {
            return Ok(());
        }
        self.lifecycle.destination_closed = true;
        self.destination
            .close()
            .await
            .map_err(|source| TransferError::Lifecycle {
                stage: TransferStage::Close,
                provider: ProviderType::Destination,
                source,
            })
    }

    async fn run_data_stage(&self, stage: TransferStage) -> Result<(), TransferError> {
        if !self.capabilities.is_available(stage) {
            if let Some(capability) = self.capabilities.get(stage) {
                debug!(
                    source = capability.source,
                    destination = capability.destination,
                    "Stage not supported by both providers"
                );
            }
            info!("Skipping stage");
            self.reporter.stage_skipped(stage).await;
            return Ok(());
        }

        self.reporter.stage_started(stage).await;

        let (source, destination) = (self.source, self.destination);
        let count = match stage {
            TransferStage::Schemas => {
                self.pipe(source.stream_schemas(), destination.schemas_sink())
                    .await?
            }
            TransferStage::Configuration => {
                self.pipe(
                    source.stream_configuration(),
                    destination.configuration_sink(),
                )
                .await?
            }
            TransferStage::Entities => {
                self.pipe(source.stream_entities(), destination.entities_sink())
                    .await?
            }
            TransferStage::Links => {
                self.pipe(source.stream_links(), destination.links_sink())
                    .await?
            }
            TransferStage::Assets => {
                self.pipe(source.stream_assets(), destination.assets_sink())
                    .await?
            }
            TransferStage::Bootstrap | TransferStage::Close => 0,
        };

        info!(items = count, "Stage complete");
        self.reporter.stage_finished(stage).await;
        Ok(())
    }

    /// Move every item of one stage from source to destination. Returns the
    /// number of items written.
    async fn pipe<T: StageItem>(
        &self,
        open_stream: impl Future<Output = anyhow::Result<ItemStream<T>>>,
        open_sink: impl Future<Output = anyhow::Result<BoxSink<T>>>,
    ) -> Result<u64, TransferError> {
        let stage = T::STAGE;
        let stream = open_stream
            .await
            .map_err(|e| TransferError::stage(stage, StageFailure::OpenSource, e))?;
        let mut sink = open_sink
            .await
            .map_err(|e| TransferError::stage(stage, StageFailure::OpenDestination, e))?;

        let (tx, mut rx) = mpsc::channel(self.pipe_capacity);
        let producer = tokio::spawn(produce(stream, tx));
        let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
        let mut count = 0u64;

        let consumed = async {
            while let Some(next) = rx.recv().await {
                let item = next.map_err(|e| TransferError::stage(stage, StageFailure::Read, e))?;
                let bytes = item.progress_size();
                let key = item.aggregate_key().map(str::to_owned);

                sink.write(item)
                    .await
                    .map_err(|e| TransferError::stage(stage, StageFailure::Write, e))?;
                count += 1;
                self.reporter
                    .item_transferred(stage, bytes, key.as_deref())
                    .await;

                if throttle.should_log() {
                    debug!(items = count, "Stage progress");
                }
            }
            Ok::<_, TransferError>(())
        }
        .await;

        if let Err(err) = consumed {
            producer.abort();
            return Err(err);
        }

        // A producer that died early closes the channel just like a drained
        // stream would.
        if let Err(join_err) = producer.await {
            return Err(TransferError::stage(
                stage,
                StageFailure::Read,
                anyhow::anyhow!("source stream task failed: {}", join_err),
            ));
        }

        sink.finish()
            .await
            .map_err(|e| TransferError::stage(stage, StageFailure::Commit, e))?;
        Ok(count)
    }
}

/// Forward stream items into the pipe until the stream ends, yields an error,
/// or the consumer hangs up.
async fn produce<T: Send + 'static>(
    mut stream: ItemStream<T>,
    tx: mpsc::Sender<anyhow::Result<T>>,
) {
    while let Some(item) = stream.next().await {
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_producer_stops_after_first_error() {
        let items: Vec<anyhow::Result<u32>> = vec![Ok(1), Err(anyhow::anyhow!("bad row")), Ok(3)];
        let (tx, mut rx) = mpsc::channel(4);

        produce(stream::iter(items).boxed(), tx).await;

        assert_eq!(rx.recv().await.unwrap().unwrap(), 1);
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_stops_when_consumer_hangs_up() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let items = stream::iter((0..100u32).map(Ok)).boxed();
        produce(items, tx).await;
    }
}
