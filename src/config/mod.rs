use anyhow::{Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::source::Fields;

/// Per-provider `config.yaml` describing the collections to upload.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub source: SourceInfo,
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SourceInfo {
    pub name: String,
}

impl ProviderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.collections
            .iter()
            .map(|c| c.collection.as_str())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    #[default]
    Shapefiles,
    Table,
}

fn default_latitude() -> String {
    "latitude".to_string()
}

fn default_longitude() -> String {
    "longitude".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CollectionConfig {
    pub collection: String,
    #[serde(default)]
    pub kind: CollectionKind,
    /// Table-kind only: CSV path relative to the collection directory.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_latitude")]
    pub latitude: String,
    #[serde(default = "default_longitude")]
    pub longitude: String,
    #[serde(default)]
    pub fields: FieldsConfig,
}

/// Field mappings. A source value starting with `=` names a column in the
/// input; anything else is a literal copied into every row.
#[derive(Debug, Deserialize, Default)]
pub struct FieldsConfig {
    #[serde(default)]
    pub required: BTreeMap<String, String>,
    #[serde(default)]
    pub optional: BTreeMap<String, String>,
}

impl CollectionConfig {
    /// Structural validation; failures here abort this collection only.
    pub fn validate(&self) -> Result<()> {
        if self.fields.required.is_empty() {
            bail!(
                "collection '{}': section fields.required is missing or empty",
                self.collection
            );
        }
        if self.kind == CollectionKind::Table {
            self.table_file()?;
        }
        Ok(())
    }

    /// The input file of a table-kind collection.
    pub fn table_file(&self) -> Result<&str> {
        match self.table.as_deref() {
            Some(file) => Ok(file),
            None => bail!(
                "collection '{}': kind 'table' requires a 'table' file",
                self.collection
            ),
        }
    }

    /// The literal (non-column) fields every row starts from, including the
    /// injected provider/collection pair.
    pub fn default_fields(&self, provider: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("provider", provider.to_lowercase());
        fields.insert("collection", self.collection.to_lowercase());
        for (target, source) in self.fields.required.iter().chain(&self.fields.optional) {
            if !source.starts_with('=') && !source.is_empty() {
                fields.insert(target.clone(), source.clone());
            }
        }
        fields
    }

    /// Resolves one target field against a raw input row. A required field
    /// with no usable source is a hard error.
    pub fn map_field(
        &self,
        raw: &Fields,
        target: &str,
        source: &str,
        required: bool,
    ) -> Result<Option<String>> {
        if source.is_empty() {
            if required {
                bail!(
                    "collection '{}': required field '{}' is not mapped to any value",
                    self.collection,
                    target
                );
            }
            return Ok(Some(String::new()));
        }

        if let Some(column) = source.strip_prefix('=') {
            let column = column.to_lowercase();
            match raw.get(&column) {
                Some(value) => Ok(Some(value.to_string())),
                None if required => {
                    bail!(
                        "collection '{}': unable to map required field '{}' from column '{}' \
                         (available: {})",
                        self.collection,
                        target,
                        column,
                        raw.keys().collect::<Vec<_>>().join(", ")
                    );
                }
                None => Ok(Some(String::new())),
            }
        } else {
            Ok(Some(source.to_string()))
        }
    }

    /// Maps a raw input row into the normalized field set.
    pub fn map_fields(&self, provider: &str, raw: &Fields) -> Result<Fields> {
        let mut mapped = self.default_fields(provider);
        for (target, source) in &self.fields.required {
            if let Some(value) = self.map_field(raw, target, source, true)? {
                mapped.insert(target.clone(), value);
            }
        }
        for (target, source) in &self.fields.optional {
            if let Some(value) = self.map_field(raw, target, source, false)? {
                mapped.insert(target.clone(), value);
            }
        }
        Ok(mapped)
    }

    /// Checks that every configured field made it into the mapped row.
    pub fn verify_fields(&self, filename: &str, mapped: &Fields) -> Result<()> {
        let missing: Vec<&str> = self
            .fields
            .required
            .keys()
            .chain(self.fields.optional.keys())
            .map(|k| k.as_str())
            .filter(|k| !mapped.contains_key(k))
            .collect();
        if !missing.is_empty() {
            bail!(
                "collection '{}', file '{}': unmapped fields: {}",
                self.collection,
                filename,
                missing.join(", ")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_collection() -> CollectionConfig {
        CollectionConfig {
            collection: "Reptiles".to_string(),
            kind: CollectionKind::Shapefiles,
            table: None,
            latitude: default_latitude(),
            longitude: default_longitude(),
            fields: FieldsConfig {
                required: [
                    ("scientificname".to_string(), "=sciname".to_string()),
                    ("accessrights".to_string(), "public".to_string()),
                ]
                .into_iter()
                .collect(),
                optional: [("citation".to_string(), "=cite".to_string())]
                    .into_iter()
                    .collect(),
            },
        }
    }

    #[test]
    fn default_fields_injects_provider_and_collection() {
        let collection = make_collection();
        let fields = collection.default_fields("IUCN");
        assert_eq!(fields.get("provider"), Some("iucn"));
        assert_eq!(fields.get("collection"), Some("reptiles"));
        assert_eq!(fields.get("accessrights"), Some("public"));
        assert_eq!(fields.get("scientificname"), None);
    }

    #[test]
    fn map_fields_resolves_columns_case_insensitively() {
        let collection = make_collection();
        let raw: Fields = [("sciname", "Anolis carolinensis"), ("cite", "Smith 2001")]
            .into_iter()
            .collect();

        let mapped = collection.map_fields("IUCN", &raw).unwrap();
        assert_eq!(mapped.get("scientificname"), Some("Anolis carolinensis"));
        assert_eq!(mapped.get("citation"), Some("Smith 2001"));
        collection.verify_fields("anolis.shp", &mapped).unwrap();
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let collection = make_collection();
        let raw: Fields = [("other", "x")].into_iter().collect();
        assert!(collection.map_fields("IUCN", &raw).is_err());
    }

    #[test]
    fn missing_optional_column_maps_to_empty() {
        let collection = make_collection();
        let raw: Fields = [("sciname", "Anolis carolinensis")].into_iter().collect();
        let mapped = collection.map_fields("IUCN", &raw).unwrap();
        assert_eq!(mapped.get("citation"), Some(""));
    }

    #[test]
    fn blank_required_source_is_fatal() {
        let mut collection = make_collection();
        collection
            .fields
            .required
            .insert("scientificname".to_string(), String::new());
        let raw = Fields::new();
        assert!(collection.map_fields("IUCN", &raw).is_err());
    }

    #[test]
    fn table_kind_requires_a_table_file() {
        let mut collection = make_collection();
        collection.kind = CollectionKind::Table;
        collection.table = None;
        assert!(collection.validate().is_err());
        assert!(collection.table_file().is_err());

        collection.table = Some("points.csv".to_string());
        assert!(collection.validate().is_ok());
        assert_eq!(collection.table_file().unwrap(), "points.csv");
    }

    #[test]
    fn validate_rejects_missing_required_section() {
        let mut collection = make_collection();
        collection.fields.required.clear();
        assert!(collection.validate().is_err());
    }
}
