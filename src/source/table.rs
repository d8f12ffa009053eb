use anyhow::{Context, Result};
use geo_types::{Geometry, Point};
use std::io::Read;
use std::path::Path;

use super::{Fields, SourceFeature};

/// Yields point features from a flat latitude/longitude table. A record
/// missing either coordinate is dropped with a warning but still consumes
/// its row number, keeping the upload index stable across re-runs.
pub struct TableSource<R: Read> {
    provider: String,
    collection: String,
    filename: String,
    latitude: String,
    longitude: String,
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<R>,
    row: u32,
}

impl TableSource<std::fs::File> {
    pub fn open(
        path: &Path,
        provider: &str,
        collection: &str,
        latitude: &str,
        longitude: &str,
    ) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Source: failed to open table {:?}", path))?;
        let filename = super::shapefile::file_stem_lower(path);
        Self::from_reader(file, provider, collection, &filename, latitude, longitude)
    }
}

impl<R: Read> TableSource<R> {
    pub fn from_reader(
        reader: R,
        provider: &str,
        collection: &str,
        filename: &str,
        latitude: &str,
        longitude: &str,
    ) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = csv_reader
            .headers()
            .context("Source: failed to read table header")?
            .iter()
            .map(|h| h.to_lowercase())
            .collect();

        Ok(Self {
            provider: provider.to_string(),
            collection: collection.to_string(),
            filename: filename.to_string(),
            latitude: latitude.to_lowercase(),
            longitude: longitude.to_lowercase(),
            headers,
            records: csv_reader.into_records(),
            row: 0,
        })
    }
}

impl<R: Read> Iterator for TableSource<R> {
    type Item = SourceFeature;

    fn next(&mut self) -> Option<SourceFeature> {
        loop {
            let record = self.records.next()?;
            self.row += 1;
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!("{}:{}: bad record ({}), skipping row", self.filename, self.row, err);
                    continue;
                }
            };

            let mut properties = Fields::new();
            for (header, value) in self.headers.iter().zip(record.iter()) {
                properties.insert(header.clone(), value);
            }

            let lat = parse_coordinate(properties.get(&self.latitude));
            let lon = parse_coordinate(properties.get(&self.longitude));
            let (Some(lat), Some(lon)) = (lat, lon) else {
                tracing::warn!(
                    "{}:{}: missing latitude/longitude, skipping row",
                    self.filename,
                    self.row
                );
                continue;
            };

            return Some(SourceFeature {
                geometry: Geometry::Point(Point::new(lon, lat)),
                properties,
                provider: self.provider.clone(),
                collection: self.collection.clone(),
                filename: self.filename.clone(),
                row: self.row,
            });
        }
    }
}

fn parse_coordinate(value: Option<&str>) -> Option<f64> {
    value.filter(|v| !v.is_empty())?.parse().ok()
}
