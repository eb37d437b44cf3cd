use std::fmt;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref KML_FILE_NAME: Regex = Regex::new(r"^(way|relation)-(\d+)-").unwrap();
}

/// The two OSM element kinds a boundary KML export can originate from.
/// A closed two-variant tag, carrying the code type used to record the
/// element's identity on an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsmElementType {
    Way,
    Relation,
}

impl OsmElementType {
    pub fn code_type(&self) -> &'static str {
        match self {
            OsmElementType::Way => "osm_way",
            OsmElementType::Relation => "osm_rel",
        }
    }

    pub fn from_code_type(code_type: &str) -> Option<Self> {
        match code_type {
            "osm_way" => Some(OsmElementType::Way),
            "osm_rel" => Some(OsmElementType::Relation),
            _ => None,
        }
    }

    /// The element kind as it appears in API paths and file names.
    pub fn api_name(&self) -> &'static str {
        match self {
            OsmElementType::Way => "way",
            OsmElementType::Relation => "relation",
        }
    }
}

impl fmt::Display for OsmElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsmElementRef {
    pub element_type: OsmElementType,
    pub id: String,
}

impl fmt::Display for OsmElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.element_type, self.id)
    }
}

/// Extracts the OSM element type and numeric id from a KML file name of
/// the form `way-1234-some-slug.kml` or `relation-5678-other.kml`.
pub fn parse_kml_file_name(file_name: &str) -> Result<OsmElementRef> {
    let captures = KML_FILE_NAME
        .captures(file_name)
        .ok_or_else(|| anyhow!("couldn't extract OSM element type and ID from: {}", file_name))?;
    let element_type = match &captures[1] {
        "way" => OsmElementType::Way,
        "relation" => OsmElementType::Relation,
        other => return Err(anyhow!("unknown OSM element type: {}", other)),
    };
    Ok(OsmElementRef { element_type, id: captures[2].to_string() })
}
