use std::fmt;

use serde::{Deserialize, Serialize};

/// One phase of a transfer.
///
/// `Bootstrap` and `Close` are lifecycle stages; the remaining five move data
/// and may be skipped when either side lacks the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStage {
    Bootstrap,
    Schemas,
    Configuration,
    Entities,
    Links,
    Assets,
    Close,
}

/// Every stage, in execution order.
pub const TRANSFER_STAGES: [TransferStage; 7] = [
    TransferStage::Bootstrap,
    TransferStage::Schemas,
    TransferStage::Configuration,
    TransferStage::Entities,
    TransferStage::Links,
    TransferStage::Assets,
    TransferStage::Close,
];

/// The data stages, in execution order.
pub const DATA_STAGES: [TransferStage; 5] = [
    TransferStage::Schemas,
    TransferStage::Configuration,
    TransferStage::Entities,
    TransferStage::Links,
    TransferStage::Assets,
];

impl TransferStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Schemas => "schemas",
            Self::Configuration => "configuration",
            Self::Entities => "entities",
            Self::Links => "links",
            Self::Assets => "assets",
            Self::Close => "close",
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Bootstrap | Self::Close)
    }

    pub fn is_data_stage(&self) -> bool {
        !self.is_lifecycle()
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether each side can take part in one data stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCapability {
    pub stage: TransferStage,
    pub source: bool,
    pub destination: bool,
}

impl StageCapability {
    pub fn is_available(&self) -> bool {
        self.source && self.destination
    }
}

/// Capability map computed once per transfer from both providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCapabilities {
    entries: Vec<StageCapability>,
}

impl StageCapabilities {
    /// Probe both sides for every data stage.
    pub fn probe(
        source: impl Fn(TransferStage) -> bool,
        destination: impl Fn(TransferStage) -> bool,
    ) -> Self {
        let entries = DATA_STAGES
            .iter()
            .map(|&stage| StageCapability {
                stage,
                source: source(stage),
                destination: destination(stage),
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, stage: TransferStage) -> Option<&StageCapability> {
        self.entries.iter().find(|c| c.stage == stage)
    }

    pub fn is_available(&self, stage: TransferStage) -> bool {
        self.get(stage).is_some_and(StageCapability::is_available)
    }

    /// Data stages that will be skipped, in execution order.
    pub fn skipped(&self) -> impl Iterator<Item = TransferStage> + '_ {
        self.entries
            .iter()
            .filter(|c| !c.is_available())
            .map(|c| c.stage)
    }
}
