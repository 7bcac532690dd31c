use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::stages::TransferStage;

pub type EntityId = u64;

/// A single structured record, unique per `(type, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
    MorphToOne,
    MorphToMany,
}

/// One side of a link: the field `field` of record `(type, ref)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEndpoint {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(rename = "ref")]
    pub entity_ref: EntityId,
    pub field: String,
}

/// A typed relation between two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub kind: String,
    pub relation: RelationKind,
    pub left: LinkEndpoint,
    pub right: LinkEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetStats {
    pub size: u64,
}

/// Chunked asset content. Consumed exactly once by the destination sink.
pub type ByteStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

/// A named binary blob. Identity is its file path.
pub struct Asset {
    pub filename: String,
    pub filepath: PathBuf,
    pub stats: AssetStats,
    pub mimetype: Option<String>,
    pub stream: ByteStream,
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("filename", &self.filename)
            .field("filepath", &self.filepath)
            .field("stats", &self.stats)
            .field("mimetype", &self.mimetype)
            .finish_non_exhaustive()
    }
}

/// A configuration key/value pair. Keys are unique within the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelType {
    ContentType,
    Component,
}

/// Descriptor for one modeled field: primitive type, optional relation
/// target, and any remaining constraints (`required`, `minLength`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(rename = "type")]
    pub attribute_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub constraints: Map<String, Value>,
}

/// Structural description of one modeled type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub uid: String,
    pub model_type: ModelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub info: Map<String, Value>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Schema {
    /// Generic tree form used by the structural comparator.
    pub fn to_tree(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub name: String,
    pub version: String,
}

/// Identity of the installation that produced (or will receive) the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub extensions: Vec<ExtensionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub created_at: DateTime<Utc>,
    pub producer: ProducerInfo,
}

/// An item that flows through one data stage's pipe.
pub trait StageItem: Send + 'static {
    const STAGE: TransferStage;

    /// Approximate size in bytes, added to the stage's `bytes` counter.
    fn progress_size(&self) -> u64;

    /// Key under which the item is aggregated in the stage progress.
    fn aggregate_key(&self) -> Option<&str> {
        None
    }
}

fn json_size<T: Serialize>(value: &T) -> u64 {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}

impl StageItem for Schema {
    const STAGE: TransferStage = TransferStage::Schemas;

    fn progress_size(&self) -> u64 {
        json_size(self)
    }
}

impl StageItem for ConfigurationEntry {
    const STAGE: TransferStage = TransferStage::Configuration;

    fn progress_size(&self) -> u64 {
        json_size(self)
    }
}

impl StageItem for Entity {
    const STAGE: TransferStage = TransferStage::Entities;

    fn progress_size(&self) -> u64 {
        json_size(self)
    }

    fn aggregate_key(&self) -> Option<&str> {
        Some(&self.entity_type)
    }
}

impl StageItem for Link {
    const STAGE: TransferStage = TransferStage::Links;

    fn progress_size(&self) -> u64 {
        json_size(self)
    }

    fn aggregate_key(&self) -> Option<&str> {
        Some(&self.kind)
    }
}

impl StageItem for Asset {
    const STAGE: TransferStage = TransferStage::Assets;

    fn progress_size(&self) -> u64 {
        self.stats.size
    }

    fn aggregate_key(&self) -> Option<&str> {
        self.mimetype.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_round_trips_unknown_fields_through_tree() {
        let raw = json!({
            "uid": "api::homepage.homepage",
            "modelType": "contentType",
            "kind": "singleType",
            "info": { "displayName": "Homepage" },
            "collectionName": "homepages",
            "attributes": {
                "title": { "type": "string", "required": true },
                "createdBy": { "type": "relation", "relation": "oneToOne", "target": "admin::user" }
            }
        });

        let schema: Schema = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(schema.attributes["createdBy"].target.as_deref(), Some("admin::user"));
        assert_eq!(schema.extra["collectionName"], json!("homepages"));
        assert_eq!(schema.to_tree().unwrap(), raw);
    }

    #[test]
    fn entity_aggregates_by_type() {
        let entity = Entity {
            id: 1,
            entity_type: "foo".to_string(),
            data: Map::new(),
        };
        assert_eq!(entity.aggregate_key(), Some("foo"));
        assert!(entity.progress_size() > 0);
    }

    #[test]
    fn asset_size_comes_from_stats() {
        let asset = Asset {
            filename: "foo.jpg".to_string(),
            filepath: PathBuf::from("/tmp/foo.jpg"),
            stats: AssetStats { size: 24 },
            mimetype: Some("image/jpeg".to_string()),
            stream: Box::pin(futures::stream::empty()),
        };
        assert_eq!(asset.progress_size(), 24);
        assert_eq!(asset.aggregate_key(), Some("image/jpeg"));
    }
}
