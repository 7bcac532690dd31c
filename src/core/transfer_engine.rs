//! The transfer engine: validates a source/destination pair, then runs the
//! stage pipeline once and reports progress along the way.

mod pipeline;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use self::pipeline::StagePipeline;
use super::integrity::IntegrityValidator;
use super::progress::{ProgressHandle, ProgressReporter};
use super::provider::{DestinationProvider, Provider, ProviderType, SourceProvider};
use super::stages::StageCapabilities;
use crate::config::EngineOptions;
use crate::error::{ConstructionError, TransferError};

/// Opaque payloads reported by both providers after a successful transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferResults {
    pub source: Option<Value>,
    pub destination: Option<Value>,
}

/// Moves one source snapshot into one destination.
///
/// An engine runs at most one transfer; create a new engine to run another.
pub struct TransferEngine {
    id: Uuid,
    source: Box<dyn SourceProvider>,
    destination: Box<dyn DestinationProvider>,
    options: EngineOptions,
    validator: IntegrityValidator,
    reporter: ProgressReporter,
    started: AtomicBool,
}

/// Build an engine after checking provider roles and options.
pub fn create_transfer_engine(
    source: Box<dyn SourceProvider>,
    destination: Box<dyn DestinationProvider>,
    options: EngineOptions,
) -> Result<TransferEngine, ConstructionError> {
    TransferEngine::new(source, destination, options)
}

fn check_role<P: Provider + ?Sized>(
    provider: &P,
    expected: ProviderType,
) -> Result<(), ConstructionError> {
    if provider.provider_type() != expected {
        return Err(ConstructionError::ProviderRole {
            name: provider.name().to_string(),
            expected,
            actual: provider.provider_type(),
        });
    }
    if provider.name().trim().is_empty() {
        return Err(ConstructionError::EmptyProviderName(expected));
    }
    Ok(())
}

impl TransferEngine {
    pub fn new(
        source: Box<dyn SourceProvider>,
        destination: Box<dyn DestinationProvider>,
        options: EngineOptions,
    ) -> Result<Self, ConstructionError> {
        check_role(source.as_ref(), ProviderType::Source)?;
        check_role(destination.as_ref(), ProviderType::Destination)?;
        options.validate()?;
        let validator = IntegrityValidator::new(&options)?;
        let reporter = ProgressReporter::new(options.progress_capacity);

        Ok(Self {
            id: Uuid::now_v7(),
            source,
            destination,
            options,
            validator,
            reporter,
            started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn source(&self) -> &dyn SourceProvider {
        self.source.as_ref()
    }

    pub fn destination(&self) -> &dyn DestinationProvider {
        self.destination.as_ref()
    }

    /// Progress counters and the event stream. Subscribe before calling
    /// [`transfer`](Self::transfer) to observe every event.
    pub fn progress(&self) -> &ProgressHandle {
        self.reporter.handle()
    }

    /// Run the transfer: integrity checks, then every stage in order.
    ///
    /// Integrity failures reject the run before any provider is bootstrapped
    /// and before `transfer::start` is emitted. Any later failure emits
    /// `transfer::error` and releases the providers.
    pub async fn transfer(&self) -> Result<TransferResults, TransferError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransferError::AlreadyStarted);
        }

        let span = info_span!(
            "transfer",
            id = %self.id,
            source = %self.source.name(),
            destination = %self.destination.name()
        );

        async {
            info!(
                strategy = %self.options.strategy,
                version_matching = %self.options.version_matching,
                "Validating providers"
            );
            if let Err(err) = self
                .validator
                .validate(self.source.as_ref(), self.destination.as_ref())
                .await
            {
                error!(error = %err, "Integrity check failed");
                self.reporter.abandon();
                return Err(err);
            }

            let capabilities = StageCapabilities::probe(
                |stage| self.source.supports(stage),
                |stage| self.destination.supports(stage),
            );

            info!("Starting transfer");
            let start_time = Instant::now();
            self.reporter.transfer_started().await;

            let mut pipeline = StagePipeline::new(
                self.source.as_ref(),
                self.destination.as_ref(),
                &self.reporter,
                capabilities,
                self.options.pipe_capacity,
            );

            match pipeline.run().await {
                Ok(()) => {
                    let results = TransferResults {
                        source: self.source.results(),
                        destination: self.destination.results(),
                    };
                    let data = self.progress().data().await;
                    info!(
                        items = data.total_count(),
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        "Transfer complete"
                    );
                    self.reporter.transfer_finished().await;
                    Ok(results)
                }
                Err(err) => {
                    error!(
                        error = %err,
                        stage = ?err.failed_stage(),
                        "Transfer failed"
                    );
                    self.reporter.transfer_failed(&err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}
