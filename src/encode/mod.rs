use anyhow::Result;
use geo::algorithm::bounding_rect::BoundingRect;
use geo_types::Geometry;
use geozero::{CoordDimensions, ToWkb};
use sha1::{Digest, Sha1};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::source::Fields;
use crate::utils::ascii_escape;

/// Converts a mapped feature into one INSERT statement, or `None` when the
/// geometry cannot be encoded (logged, row skipped, never fatal to a batch).
///
/// Geometry goes out as hex-encoded WKB wrapped in an SRID assignment;
/// polygons are promoted to multipolygons so both share one column type.
/// The bounding box is injected as four extra properties ahead of the
/// column listing.
pub fn encode_insert(
    geometry: &Geometry<f64>,
    properties: &Fields,
    table: &str,
) -> Result<Option<String>> {
    let Some(bbox) = geometry.bounding_rect() else {
        tracing::warn!("Geometry has no bounding box, skipping row");
        return Ok(None);
    };
    let wkb = match geometry.to_wkb(CoordDimensions::xy()) {
        Ok(wkb) => wkb,
        Err(err) => {
            tracing::warn!("Unparseable geometry ({}), skipping row", err);
            return Ok(None);
        }
    };

    let geometry_sql = {
        let constructed = format!(
            "ST_SetSRID(ST_GeomFromWKB(decode('{}', 'hex')), 4326)",
            hex::encode_upper(wkb)
        );
        if matches!(geometry, Geometry::Polygon(_)) {
            format!("ST_Multi({})", constructed)
        } else {
            constructed
        }
    };

    let mut columns = properties.clone();
    columns.insert("minx", bbox.min().x.to_string());
    columns.insert("miny", bbox.min().y.to_string());
    columns.insert("maxx", bbox.max().x.to_string());
    columns.insert("maxy", bbox.max().y.to_string());

    let tag = dollar_tag(&columns);
    let names: Vec<&str> = columns.keys().collect();
    let values: Vec<String> = columns.iter().map(|(_, v)| quote(v, &tag)).collect();

    Ok(Some(format!(
        "INSERT INTO {} (the_geom, {}) VALUES ({}, {})",
        table,
        names.join(", "),
        geometry_sql,
        values.join(", ")
    )))
}

/// Reset statement for a (provider, collection) pair.
pub fn delete_statement(table: &str, source: &str, collection: &str) -> String {
    let fields: Fields = [("provider", source), ("collection", collection)]
        .into_iter()
        .collect();
    let tag = dollar_tag(&fields);
    format!(
        "DELETE FROM {} WHERE provider = {} AND collection = {}",
        table,
        quote(source, &tag),
        quote(collection, &tag)
    )
}

/// A salted dollar-quote delimiter. Arbitrary user content containing quote
/// characters cannot terminate a string early because the tag is derived
/// from the current time and the row's own values.
pub fn dollar_tag(fields: &Fields) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha1::new();
    hasher.update(nanos.to_string().as_bytes());
    for (_, value) in fields.iter() {
        hasher.update(value.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("$tag_{}$", &digest[..8])
}

/// Wraps a value in the dollar-quote tag, ASCII-escaping it first: the
/// transport to the remote executor cannot reliably carry arbitrary
/// encodings.
pub fn quote(value: &str, tag: &str) -> String {
    format!("{}{}{}", tag, ascii_escape(value), tag)
}
