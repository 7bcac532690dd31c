//! Pre-transfer compatibility checks between source and destination.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::models::{Schema, TransferMetadata};
use super::provider::{DestinationProvider, ProviderType, SourceProvider};
use super::schema_diff::{IgnoredPaths, diff};
use super::version::{VersionMatching, check_versions};
use crate::config::{EngineOptions, SchemaMatching};
use crate::error::{ConstructionError, IntegrityError, TransferError};

/// Metadata and schemas fetched once from both sides.
#[derive(Debug, Clone, Default)]
pub struct IntegrityInputs {
    pub source_metadata: Option<TransferMetadata>,
    pub destination_metadata: Option<TransferMetadata>,
    pub source_schemas: Option<Vec<Schema>>,
    pub destination_schemas: Option<Vec<Schema>>,
}

impl IntegrityInputs {
    pub async fn fetch(
        source: &dyn SourceProvider,
        destination: &dyn DestinationProvider,
    ) -> Result<Self, TransferError> {
        let (source_metadata, destination_metadata, source_schemas, destination_schemas) = tokio::try_join!(
            async {
                source
                    .get_metadata()
                    .await
                    .map_err(fetch_error(ProviderType::Source, "metadata"))
            },
            async {
                destination
                    .get_metadata()
                    .await
                    .map_err(fetch_error(ProviderType::Destination, "metadata"))
            },
            async {
                source
                    .get_schemas()
                    .await
                    .map_err(fetch_error(ProviderType::Source, "schemas"))
            },
            async {
                destination
                    .get_schemas()
                    .await
                    .map_err(fetch_error(ProviderType::Destination, "schemas"))
            },
        )?;

        Ok(Self {
            source_metadata,
            destination_metadata,
            source_schemas,
            destination_schemas,
        })
    }
}

fn fetch_error(
    provider: ProviderType,
    what: &'static str,
) -> impl FnOnce(anyhow::Error) -> TransferError {
    move |source| TransferError::Metadata {
        provider,
        what,
        source,
    }
}

/// Applies the version and schema comparators under the engine options.
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    version_matching: VersionMatching,
    schemas_matching: SchemaMatching,
    ignored: IgnoredPaths,
}

impl IntegrityValidator {
    pub fn new(options: &EngineOptions) -> Result<Self, ConstructionError> {
        Ok(Self {
            version_matching: options.version_matching,
            schemas_matching: options.schemas_matching,
            ignored: options.ignored_paths()?,
        })
    }

    /// Fetch both sides' metadata and schemas, then check them.
    pub async fn validate(
        &self,
        source: &dyn SourceProvider,
        destination: &dyn DestinationProvider,
    ) -> Result<IntegrityInputs, TransferError> {
        let inputs = IntegrityInputs::fetch(source, destination).await?;
        self.check(&inputs)?;
        Ok(inputs)
    }

    pub fn check(&self, inputs: &IntegrityInputs) -> Result<(), IntegrityError> {
        self.check_versions(
            inputs.source_metadata.as_ref(),
            inputs.destination_metadata.as_ref(),
        )?;
        self.check_schemas(
            inputs.source_schemas.as_deref(),
            inputs.destination_schemas.as_deref(),
        )
    }

    fn check_versions(
        &self,
        source: Option<&TransferMetadata>,
        destination: Option<&TransferMetadata>,
    ) -> Result<(), IntegrityError> {
        if self.version_matching == VersionMatching::Ignore {
            return Ok(());
        }
        match (source, destination) {
            (Some(src), Some(dst)) => {
                debug!(
                    source = %src.producer.version,
                    destination = %dst.producer.version,
                    matching = %self.version_matching,
                    "Checking version compatibility"
                );
                check_versions(
                    &src.producer.version,
                    &dst.producer.version,
                    self.version_matching,
                )
            }
            _ => {
                warn!("Metadata unavailable on at least one side, skipping version check");
                Ok(())
            }
        }
    }

    fn check_schemas(
        &self,
        source: Option<&[Schema]>,
        destination: Option<&[Schema]>,
    ) -> Result<(), IntegrityError> {
        if self.schemas_matching == SchemaMatching::Ignore {
            return Ok(());
        }
        match (source, destination) {
            (Some(src), Some(dst)) => compare_schema_sets(src, dst, &self.ignored),
            _ => {
                warn!("Schemas unavailable on at least one side, skipping schema check");
                Ok(())
            }
        }
    }
}

/// Compare two schema sets keyed by uid.
///
/// Names present on one side only fail first (in uid order); then each shared
/// schema is diffed structurally with `ignored` paths removed.
fn tree(uid: &str, schema: &Schema) -> Result<serde_json::Value, IntegrityError> {
    schema
        .to_tree()
        .map_err(|source| IntegrityError::SchemaEncoding {
            schema: uid.to_string(),
            source,
        })
}

pub fn compare_schema_sets(
    source: &[Schema],
    destination: &[Schema],
    ignored: &IgnoredPaths,
) -> Result<(), IntegrityError> {
    let src: BTreeMap<&str, &Schema> = source.iter().map(|s| (s.uid.as_str(), s)).collect();
    let dst: BTreeMap<&str, &Schema> = destination.iter().map(|s| (s.uid.as_str(), s)).collect();

    if let Some(uid) = src.keys().find(|uid| !dst.contains_key(*uid)) {
        return Err(IntegrityError::MissingSchema {
            schema: uid.to_string(),
            missing_in: ProviderType::Destination,
        });
    }
    if let Some(uid) = dst.keys().find(|uid| !src.contains_key(*uid)) {
        return Err(IntegrityError::MissingSchema {
            schema: uid.to_string(),
            missing_in: ProviderType::Source,
        });
    }

    for (uid, schema) in &src {
        let other = dst[uid];
        if let Some(difference) = diff(&tree(uid, schema)?, &tree(uid, other)?, ignored) {
            return Err(IntegrityError::SchemaMismatch {
                schema: uid.to_string(),
                difference,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ModelType;
    use serde_json::json;

    fn schema(uid: &str, attributes: serde_json::Value) -> Schema {
        serde_json::from_value(json!({
            "uid": uid,
            "modelType": "contentType",
            "info": { "displayName": uid },
            "attributes": attributes,
        }))
        .unwrap()
    }

    fn sample() -> Vec<Schema> {
        vec![
            schema(
                "admin::permission",
                json!({
                    "action": { "type": "string", "minLength": 1, "required": true },
                    "role": { "type": "relation", "relation": "manyToOne", "target": "admin::role" }
                }),
            ),
            schema("api::homepage.homepage", json!({ "title": { "type": "string" } })),
        ]
    }

    #[test]
    fn identical_sets_match() {
        assert!(compare_schema_sets(&sample(), &sample(), &IgnoredPaths::none()).is_ok());
    }

    #[test]
    fn set_order_is_irrelevant() {
        let mut reversed = sample();
        reversed.reverse();
        assert!(compare_schema_sets(&sample(), &reversed, &IgnoredPaths::none()).is_ok());
    }

    #[test]
    fn schema_tree_keeps_unknown_fields() {
        let mut extended = sample().remove(1);
        extended
            .extra
            .insert("pluginOptions".to_string(), json!({ "i18n": true }));

        let value = tree("api::homepage.homepage", &extended).unwrap();
        assert_eq!(value["pluginOptions"]["i18n"], true);
        assert_eq!(value["uid"], "api::homepage.homepage");
    }

    #[test]
    fn schema_encoding_error_names_the_schema() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = IntegrityError::SchemaEncoding {
            schema: "api::homepage.homepage".to_string(),
            source,
        };

        let message = err.to_string();
        assert!(message.contains("api::homepage.homepage"), "{message}");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn extra_source_schema_is_missing_in_destination() {
        let mut source = sample();
        source.push(schema("api::extra.extra", json!({})));

        let err = compare_schema_sets(&source, &sample(), &IgnoredPaths::none()).unwrap_err();
        assert!(matches!(
            err,
            IntegrityError::MissingSchema { ref schema, missing_in: ProviderType::Destination }
                if schema == "api::extra.extra"
        ));
    }

    #[test]
    fn extra_destination_schema_is_missing_in_source() {
        let mut destination = sample();
        destination.push(schema("api::extra.extra", json!({})));

        let err = compare_schema_sets(&sample(), &destination, &IgnoredPaths::none()).unwrap_err();
        assert!(matches!(
            err,
            IntegrityError::MissingSchema { missing_in: ProviderType::Source, .. }
        ));
    }

    #[test]
    fn nested_change_names_schema_and_field() {
        let mut destination = sample();
        destination[0]
            .attributes
            .get_mut("action")
            .unwrap()
            .constraints
            .insert("minLength".to_string(), json!(2));

        let err = compare_schema_sets(&sample(), &destination, &IgnoredPaths::none()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("admin::permission"), "{msg}");
        assert!(msg.contains("attributes.action.minLength"), "{msg}");

        let ignored = IgnoredPaths::parse(["attributes.action.minLength"]).unwrap();
        assert!(compare_schema_sets(&sample(), &destination, &ignored).is_ok());
    }

    #[test]
    fn model_type_change_is_detected() {
        let mut destination = sample();
        destination[1].model_type = ModelType::Component;

        let err = compare_schema_sets(&sample(), &destination, &IgnoredPaths::none()).unwrap_err();
        assert!(matches!(err, IntegrityError::SchemaMismatch { ref schema, .. } if schema == "api::homepage.homepage"));
    }

    #[test]
    fn ignore_modes_disable_checks() {
        let validator = IntegrityValidator::new(&EngineOptions {
            version_matching: VersionMatching::Ignore,
            schemas_matching: SchemaMatching::Ignore,
            ..Default::default()
        })
        .unwrap();

        let mut destination = sample();
        destination.pop();
        let inputs = IntegrityInputs {
            source_schemas: Some(sample()),
            destination_schemas: Some(destination),
            ..Default::default()
        };
        assert!(validator.check(&inputs).is_ok());
    }

    #[test]
    fn missing_inputs_skip_checks() {
        let validator = IntegrityValidator::new(&EngineOptions::default()).unwrap();
        let inputs = IntegrityInputs {
            source_schemas: Some(sample()),
            ..Default::default()
        };
        assert!(validator.check(&inputs).is_ok());
    }
}
