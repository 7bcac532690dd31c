//! Error types for transfer engine construction and runs.

use thiserror::Error;

use crate::core::provider::ProviderType;
use crate::core::schema_diff::Difference;
use crate::core::stages::TransferStage;
use crate::core::version::VersionMatching;

/// Malformed providers or options, raised when the engine is created.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("expected a {expected} provider, but '{name}' is a {actual} provider")]
    ProviderRole {
        name: String,
        expected: ProviderType,
        actual: ProviderType,
    },

    #[error("{0} provider has an empty name")]
    EmptyProviderName(ProviderType),

    #[error("invalid exclude path '{0}'")]
    InvalidExcludePath(String),

    #[error("transfer strategy '{0}' is not supported")]
    UnsupportedStrategy(String),

    #[error("pipe capacity must be greater than zero")]
    ZeroPipeCapacity,

    #[error("progress capacity must be greater than zero")]
    ZeroProgressCapacity,
}

/// Source and destination are not compatible. Detected before any stage runs.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error(
        "incompatible versions under '{matching}' matching: source {source_version}, destination {destination_version} ({reason})"
    )]
    IncompatibleVersions {
        source_version: String,
        destination_version: String,
        matching: VersionMatching,
        reason: String,
    },

    #[error("schema '{schema}' is missing in the {missing_in}")]
    MissingSchema {
        schema: String,
        missing_in: ProviderType,
    },

    #[error("schema '{schema}' does not match: {difference}")]
    SchemaMismatch {
        schema: String,
        difference: Difference,
    },

    #[error("schema '{schema}' could not be encoded for comparison: {source}")]
    SchemaEncoding {
        schema: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What a data stage was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFailure {
    OpenSource,
    OpenDestination,
    Read,
    Write,
    Commit,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenSource => "opening the source stream",
            Self::OpenDestination => "opening the destination sink",
            Self::Read => "reading from the source",
            Self::Write => "writing to the destination",
            Self::Commit => "committing the destination",
        };
        f.write_str(s)
    }
}

/// Any failure that rejects a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("failed to fetch {what} from {provider} provider: {source}")]
    Metadata {
        provider: ProviderType,
        what: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} stage failed while {failure}: {source}")]
    Stage {
        stage: TransferStage,
        failure: StageFailure,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} failed on {provider} provider: {source}")]
    Lifecycle {
        stage: TransferStage,
        provider: ProviderType,
        #[source]
        source: anyhow::Error,
    },

    #[error("this engine has already run a transfer")]
    AlreadyStarted,
}

impl TransferError {
    pub fn stage(stage: TransferStage, failure: StageFailure, source: anyhow::Error) -> Self {
        Self::Stage {
            stage,
            failure,
            source,
        }
    }

    /// Stage in which the run failed, if it got that far.
    pub fn failed_stage(&self) -> Option<TransferStage> {
        match self {
            Self::Stage { stage, .. } | Self::Lifecycle { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
