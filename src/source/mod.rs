use geo_types::Geometry;

pub mod shapefile;
pub mod table;

pub use self::shapefile::ShapefileSource;
pub use self::table::TableSource;

/// A string-keyed map with defined (insertion) iteration order, so that SQL
/// column/value ordering stays deterministic across runs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fields {
    entries: Vec<(String, String)>,
}

impl Fields {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts or replaces in place, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Entries sorted by key, for canonical serialization.
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// One geometry + property record, annotated with provenance. The atomic
/// unit of upload.
#[derive(Clone, Debug)]
pub struct SourceFeature {
    pub geometry: Geometry<f64>,
    pub properties: Fields,
    pub provider: String,
    pub collection: String,
    pub filename: String,
    /// 1-based, unique within a file. Dropped input records still consume a
    /// row number so the upload index stays stable across re-runs.
    pub row: u32,
}

/// Only these geometry types survive the source boundary; anything else is
/// dropped per row with a warning.
pub fn supported_geometry(geometry: &Geometry<f64>) -> bool {
    matches!(
        geometry,
        Geometry::Point(_) | Geometry::Polygon(_) | Geometry::MultiPolygon(_)
    )
}
