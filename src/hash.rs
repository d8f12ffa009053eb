use geo_types::Geometry;
use sha1::{Digest, Sha1};

use crate::source::Fields;

/// Stable content fingerprint for a mapped feature: canonical text form
/// (GeoJSON geometry plus key-sorted properties) pushed through a 160-bit
/// digest. Stored as an audit column alongside each row; never consulted to
/// suppress duplicate inserts.
pub fn feature_hash(geometry: &Geometry<f64>, properties: &Fields) -> String {
    let geojson_geometry = geojson::Geometry::from(geometry);
    let mut canonical =
        serde_json::to_string(&geojson_geometry).unwrap_or_else(|_| String::from("null"));
    for (key, value) in properties.sorted() {
        canonical.push('\n');
        canonical.push_str(key);
        canonical.push('=');
        canonical.push_str(value);
    }

    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    hex::encode_upper(hasher.finalize())
}
