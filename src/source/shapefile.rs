use anyhow::{Context, Result, bail};
use geojson::GeoJson;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{Fields, SourceFeature, supported_geometry};

/// Yields features from a directory of shapefiles, one external converter
/// invocation per file. Files are visited in lexicographic order so repeated
/// runs over identical inputs see identical row numbering.
pub struct ShapefileSource {
    provider: String,
    collection: String,
    files: VecDeque<PathBuf>,
    current: std::vec::IntoIter<SourceFeature>,
    converter: String,
}

impl ShapefileSource {
    pub fn new(dir: &Path, provider: &str, collection: &str) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Source: failed to read directory {:?}", dir))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("shp"))
            })
            .collect();
        files.sort();

        tracing::info!(
            "Processing {} shapefile(s) in {:?} for collection '{}'",
            files.len(),
            dir,
            collection
        );

        Ok(Self {
            provider: provider.to_string(),
            collection: collection.to_string(),
            files: files.into(),
            current: Vec::new().into_iter(),
            converter: std::env::var("OGR2OGR").unwrap_or_else(|_| "ogr2ogr".to_string()),
        })
    }

    /// Converts one shapefile to GeoJSON (reprojected to WGS84) and parses
    /// every feature out of it. Any failure skips the whole file.
    fn convert_file(&self, shapefile: &Path) -> Result<Vec<SourceFeature>> {
        let output = shapefile.with_extension("geojson");
        if output.exists() {
            std::fs::remove_file(&output)
                .with_context(|| format!("Source: failed to delete stale output {:?}", output))?;
        }

        tracing::info!("Converting {:?} with {}", shapefile, self.converter);
        let status = Command::new(&self.converter)
            .arg("-f")
            .arg("GeoJSON")
            .arg("-t_srs")
            .arg("EPSG:4326")
            .arg(&output)
            .arg(shapefile)
            .status()
            .with_context(|| {
                format!(
                    "Source: failed to execute '{}'; is it on your path?",
                    self.converter
                )
            })?;
        if !status.success() {
            bail!("Source: converter exited with {} for {:?}", status, shapefile);
        }

        let content = std::fs::read_to_string(&output)
            .with_context(|| format!("Source: unreadable converter output {:?}", output))?;
        let filename = file_stem_lower(shapefile);
        parse_features(&content, &self.provider, &self.collection, &filename)
    }
}

impl Iterator for ShapefileSource {
    type Item = SourceFeature;

    fn next(&mut self) -> Option<SourceFeature> {
        loop {
            if let Some(feature) = self.current.next() {
                return Some(feature);
            }
            let file = self.files.pop_front()?;
            match self.convert_file(&file) {
                Ok(features) => {
                    tracing::info!("Parsed {} feature(s) from {:?}", features.len(), file);
                    self.current = features.into_iter();
                }
                Err(err) => {
                    // A malformed file aborts that file only.
                    tracing::error!("Skipping {:?}: {:#}", file, err);
                }
            }
        }
    }
}

pub fn file_stem_lower(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_lowercase()
}

/// Parses converter output into annotated features. Row numbers count every
/// feature in the file, including ones dropped for unsupported geometry.
pub fn parse_features(
    content: &str,
    provider: &str,
    collection: &str,
    filename: &str,
) -> Result<Vec<SourceFeature>> {
    let geojson: GeoJson = content
        .parse()
        .with_context(|| format!("Source: malformed GeoJSON for '{}'", filename))?;
    let GeoJson::FeatureCollection(feature_collection) = geojson else {
        bail!("Source: expected a FeatureCollection for '{}'", filename);
    };

    let mut features = Vec::new();
    for (i, feature) in feature_collection.features.into_iter().enumerate() {
        let row = (i + 1) as u32;
        let Some(geojson_geometry) = feature.geometry else {
            tracing::warn!("{}:{}: feature has no geometry, skipping row", filename, row);
            continue;
        };
        let geometry = match geo_types::Geometry::<f64>::try_from(geojson_geometry.value) {
            Ok(geometry) => geometry,
            Err(err) => {
                tracing::warn!("{}:{}: unparseable geometry ({}), skipping row", filename, row, err);
                continue;
            }
        };
        if !supported_geometry(&geometry) {
            tracing::warn!("{}:{}: unsupported geometry type, skipping row", filename, row);
            continue;
        }

        let mut properties = Fields::new();
        if let Some(map) = feature.properties {
            for (key, value) in map {
                properties.insert(key.to_lowercase(), json_value_string(&value));
            }
        }

        features.push(SourceFeature {
            geometry,
            properties,
            provider: provider.to_string(),
            collection: collection.to_string(),
            filename: filename.to_string(),
            row,
        });
    }
    Ok(features)
}

fn json_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
