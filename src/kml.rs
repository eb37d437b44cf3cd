use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use quick_xml::events::Event;
use quick_xml::Reader;

/// KML exports wrap each boundary in a folder named like this; such
/// names are never the area name.
const BOUNDARY_FOLDER_PREFIX: &str = "Boundaries for";

/// A closed ring needs at least 4 coordinate entries (first = last).
const MIN_RING_COORDS: usize = 4;

/// One `<Polygon>`: an outer ring plus any number of holes, as raw
/// coordinate lists in the order they appeared in the file.
#[derive(Debug, Clone, Default)]
pub struct KmlRingSet {
    pub outer: Vec<Coord<f64>>,
    pub inners: Vec<Vec<Coord<f64>>>,
}

impl KmlRingSet {
    fn rings(&self) -> impl Iterator<Item = &Vec<Coord<f64>>> {
        std::iter::once(&self.outer).chain(self.inners.iter())
    }

    fn has_degenerate_ring(&self) -> bool {
        self.rings().any(|ring| ring.len() < MIN_RING_COORDS)
    }
}

/// The parts of a boundary KML file this importer consumes: every
/// `<name>` seen (folder and placemark level) mapped to the extended
/// data of the element it names, plus the placemark's polygons.
#[derive(Debug, Default)]
pub struct KmlDocument {
    pub data: BTreeMap<String, BTreeMap<String, String>>,
    pub placemark_count: usize,
    pub polygons: Vec<KmlRingSet>,
}

impl KmlDocument {
    pub fn parse_file(path: &Path) -> Result<Self> {
        let reader = Reader::from_file(path)
            .with_context(|| format!("failed to open KML file {}", path.display()))?;
        Self::parse(reader).with_context(|| format!("failed to parse KML file {}", path.display()))
    }

    pub fn parse_str(kml: &str) -> Result<Self> {
        Self::parse(Reader::from_str(kml))
    }

    fn parse<R: BufRead>(mut reader: Reader<R>) -> Result<Self> {
        reader.config_mut().trim_text(true);

        #[derive(PartialEq)]
        enum Capture {
            None,
            Name,
            Value,
            Coordinates,
        }
        enum RingRole {
            Outer,
            Inner,
        }

        let mut document = KmlDocument::default();
        let mut capture = Capture::None;
        let mut current_name: Option<String> = None;
        let mut current_data_key: Option<String> = None;
        let mut current_polygon: Option<KmlRingSet> = None;
        let mut ring_role = RingRole::Outer;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"Placemark" => document.placemark_count += 1,
                    b"name" => capture = Capture::Name,
                    b"value" => capture = Capture::Value,
                    b"coordinates" => capture = Capture::Coordinates,
                    b"Data" | b"SimpleData" => {
                        current_data_key = e
                            .try_get_attribute("name")?
                            .map(|attr| attr.unescape_value())
                            .transpose()?
                            .map(|value| value.into_owned());
                    }
                    b"Polygon" => current_polygon = Some(KmlRingSet::default()),
                    b"outerBoundaryIs" => ring_role = RingRole::Outer,
                    b"innerBoundaryIs" => ring_role = RingRole::Inner,
                    _ => {}
                },
                Event::End(e) => match e.local_name().as_ref() {
                    b"name" | b"value" | b"coordinates" => capture = Capture::None,
                    b"Data" | b"SimpleData" => current_data_key = None,
                    b"Polygon" => {
                        if let Some(polygon) = current_polygon.take() {
                            document.polygons.push(polygon);
                        }
                    }
                    _ => {}
                },
                Event::Text(t) => {
                    let text = t.unescape()?.into_owned();
                    match capture {
                        Capture::Name => {
                            document.data.entry(text.clone()).or_default();
                            current_name = Some(text);
                        }
                        Capture::Value => {
                            if let (Some(name), Some(key)) = (&current_name, &current_data_key) {
                                document
                                    .data
                                    .entry(name.clone())
                                    .or_default()
                                    .insert(key.clone(), text);
                            }
                        }
                        Capture::Coordinates => {
                            let ring = parse_coordinates(&text)?;
                            if let Some(polygon) = current_polygon.as_mut() {
                                match ring_role {
                                    RingRole::Outer => polygon.outer = ring,
                                    RingRole::Inner => polygon.inners.push(ring),
                                }
                            }
                        }
                        Capture::None => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(document)
    }

    /// The single placemark name that actually names the area. Zero or
    /// several candidates indicate malformed upstream data.
    pub fn useful_name(&self) -> Result<&str> {
        let useful: Vec<&str> = self
            .data
            .keys()
            .filter(|name| !name.starts_with(BOUNDARY_FOLDER_PREFIX))
            .map(String::as_str)
            .collect();
        match useful.as_slice() {
            [] => bail!("no useful names found in KML data"),
            [name] => Ok(name),
            _ => bail!("multiple useful names found in KML data: {}", useful.join(", ")),
        }
    }

    pub fn polygon_count(&self) -> usize {
        self.polygons.len()
    }

    /// Number of polygons with a ring too small to be a closed ring.
    pub fn degenerate_polygon_count(&self) -> usize {
        self.polygons.iter().filter(|polygon| polygon.has_degenerate_ring()).count()
    }

    pub fn multipolygon(&self) -> MultiPolygon<f64> {
        let polygons = self
            .polygons
            .iter()
            .map(|ring_set| {
                Polygon::new(
                    LineString::from(ring_set.outer.clone()),
                    ring_set.inners.iter().cloned().map(LineString::from).collect(),
                )
            })
            .collect();
        MultiPolygon::new(polygons)
    }
}

/// Parses a KML `<coordinates>` blob: whitespace-separated
/// `lon,lat[,elevation]` triples.
fn parse_coordinates(text: &str) -> Result<Vec<Coord<f64>>> {
    let mut ring = Vec::new();
    for entry in text.split_whitespace() {
        let mut parts = entry.split(',');
        let lon = parts.next().unwrap_or_default();
        let lat = parts
            .next()
            .with_context(|| format!("coordinate entry without latitude: {}", entry))?;
        let x: f64 = lon.parse().with_context(|| format!("bad longitude: {}", lon))?;
        let y: f64 = lat.parse().with_context(|| format!("bad latitude: {}", lat))?;
        ring.push(Coord { x, y });
    }
    Ok(ring)
}
