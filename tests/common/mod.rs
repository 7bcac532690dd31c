#![allow(dead_code)]

use std::time::Duration;

use data_transfer::core::models::{
    ConfigurationEntry, Entity, Link, LinkEndpoint, RelationKind, Schema,
};
use data_transfer::core::progress::{ProgressEvent, ProgressSubscription};
use data_transfer::core::stages::TransferStage;
use data_transfer::providers::{MemoryAsset, MemoryDestination, MemorySource};
use data_transfer::{EngineOptions, TransferEngine, create_transfer_engine};
use serde_json::{Value, json};
use tokio::time::timeout;

pub const VERSION: &str = "4.15.2";

pub fn entity(id: u64, entity_type: &str, title: &str) -> Entity {
    Entity {
        id,
        entity_type: entity_type.to_string(),
        data: json!({ "title": title }).as_object().cloned().unwrap_or_default(),
    }
}

pub fn link(left: u64, right: u64) -> Link {
    Link {
        kind: "relation".to_string(),
        relation: RelationKind::ManyToOne,
        left: LinkEndpoint {
            entity_type: "api::article.article".to_string(),
            entity_ref: left,
            field: "author".to_string(),
        },
        right: LinkEndpoint {
            entity_type: "api::author.author".to_string(),
            entity_ref: right,
            field: "articles".to_string(),
        },
    }
}

pub fn schema(uid: &str, attributes: Value) -> Schema {
    serde_json::from_value(json!({
        "uid": uid,
        "modelType": "contentType",
        "kind": "collectionType",
        "info": { "displayName": uid, "pluralName": uid },
        "attributes": attributes,
    }))
    .unwrap()
}

pub fn schemas() -> Vec<Schema> {
    vec![
        schema(
            "api::article.article",
            json!({
                "title": { "type": "string", "required": true, "minLength": 3 },
                "author": {
                    "type": "relation",
                    "relation": "manyToOne",
                    "target": "api::author.author",
                    "inversedBy": "articles"
                }
            }),
        ),
        schema(
            "api::author.author",
            json!({
                "name": { "type": "string" },
                "articles": {
                    "type": "relation",
                    "relation": "oneToMany",
                    "target": "api::article.article",
                    "mappedBy": "author"
                }
            }),
        ),
    ]
}

/// A source holding a little of everything.
pub fn full_source() -> MemorySource {
    MemorySource::new("memory-source")
        .with_version(VERSION)
        .with_schemas(schemas())
        .with_configuration(vec![
            ConfigurationEntry {
                key: "plugin_upload_settings".to_string(),
                value: json!({ "sizeOptimization": true }),
            },
            ConfigurationEntry {
                key: "core_admin_auth".to_string(),
                value: json!({ "providers": [] }),
            },
        ])
        .with_entities(vec![
            entity(1, "api::article.article", "Hello"),
            entity(2, "api::article.article", "World"),
            entity(1, "api::author.author", "Ada"),
        ])
        .with_links(vec![link(1, 1), link(2, 1)])
        .with_assets(vec![
            MemoryAsset::new("uploads/cover.png", vec![7u8; 1500]).with_mimetype("image/png"),
        ])
}

pub fn matching_destination() -> MemoryDestination {
    MemoryDestination::new("memory-destination")
        .with_version(VERSION)
        .with_schemas(schemas())
}

pub fn engine(source: MemorySource, destination: MemoryDestination) -> TransferEngine {
    engine_with(source, destination, EngineOptions::default())
}

pub fn engine_with(
    source: MemorySource,
    destination: MemoryDestination,
    options: EngineOptions,
) -> TransferEngine {
    create_transfer_engine(Box::new(source), Box::new(destination), options)
        .expect("engine should be constructible")
}

/// Every event up to the end of the stream.
pub async fn collect(mut sub: ProgressSubscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match timeout(Duration::from_secs(5), sub.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => return events,
            Err(_) => panic!("timeout waiting for progress stream to close"),
        }
    }
}

/// `(kind, stage)` pairs, for comparing event sequences.
pub fn shape(events: &[ProgressEvent]) -> Vec<(&'static str, Option<TransferStage>)> {
    events.iter().map(|e| (e.kind.as_str(), e.stage)).collect()
}

pub fn count(events: &[ProgressEvent], kind: &str, stage: Option<TransferStage>) -> usize {
    events
        .iter()
        .filter(|e| e.kind.as_str() == kind && e.stage == stage)
        .count()
}
