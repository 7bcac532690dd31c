use std::fmt;
use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::schema_diff::IgnoredPaths;
use crate::core::version::VersionMatching;
use crate::error::ConstructionError;

/// Environment variable prefix for option overrides, e.g.
/// `DATA_TRANSFER_VERSION_MATCHING=minor`.
pub const ENV_PREFIX: &str = "DATA_TRANSFER_";

/// Default number of items buffered between a stage's source and destination.
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

/// Default number of progress events retained for a subscriber that has not
/// read them yet.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStrategy {
    /// Replace the destination content with the source snapshot.
    #[default]
    Restore,
    /// Merge into existing destination content. Requires identifier conflict
    /// resolution, which this engine does not perform.
    Merge,
}

impl fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restore => f.write_str("restore"),
            Self::Merge => f.write_str("merge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMatching {
    /// Structural equality, minus the exclude list.
    #[default]
    Exact,
    Ignore,
}

/// Options for one transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub strategy: TransferStrategy,
    pub version_matching: VersionMatching,
    pub schemas_matching: SchemaMatching,
    /// Dotted schema field paths left out of the schema comparison.
    pub exclude: Vec<String>,
    pub pipe_capacity: usize,
    /// Progress events kept per subscriber. A subscriber further behind
    /// than this skips the oldest ones.
    pub progress_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            strategy: TransferStrategy::default(),
            version_matching: VersionMatching::default(),
            schemas_matching: SchemaMatching::default(),
            exclude: Vec::new(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
        }
    }
}

impl EngineOptions {
    /// Layer defaults, an optional TOML file, then `DATA_TRANSFER_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new().merge(Serialized::defaults(EngineOptions::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX)).extract()
    }

    /// Coherence checks run when an engine is constructed.
    pub fn validate(&self) -> Result<(), ConstructionError> {
        if self.strategy != TransferStrategy::Restore {
            return Err(ConstructionError::UnsupportedStrategy(
                self.strategy.to_string(),
            ));
        }
        if self.pipe_capacity == 0 {
            return Err(ConstructionError::ZeroPipeCapacity);
        }
        if self.progress_capacity == 0 {
            return Err(ConstructionError::ZeroProgressCapacity);
        }
        self.ignored_paths()?;
        Ok(())
    }

    pub fn ignored_paths(&self) -> Result<IgnoredPaths, ConstructionError> {
        IgnoredPaths::parse(&self.exclude).map_err(ConstructionError::InvalidExcludePath)
    }
}
