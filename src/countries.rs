use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use geo::{Contains, InteriorPoint, MultiPolygon};
use quick_xml::events::Event;
use quick_xml::Reader;
use rusqlite::Connection;

use crate::db;
use crate::osm::OsmElementType;

/// Country-level areas carry this boundary type (OSM admin level 2).
pub const COUNTRY_TYPE_CODE: &str = "O02";
pub const OSM_COUNTRY_CODE_KEY: &str = "ISO3166-1";

pub const OSM_API_BASE_URL: &str = "https://api.openstreetmap.org";

pub enum ElementFetch {
    /// The element's current metadata document.
    Found(String),
    /// `410 Gone`: deleted upstream since the last boundary import.
    Gone,
}

/// Per-element metadata lookups, injectable so the assignment pass can
/// be exercised without network access.
pub trait OsmApi {
    fn fetch_element(&self, element_type: OsmElementType, id: &str) -> Result<ElementFetch>;
}

pub struct OsmApiClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl OsmApiClient {
    pub fn new() -> Self {
        Self::with_base_url(OSM_API_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self { base_url: base_url.to_string(), client: reqwest::blocking::Client::new() }
    }
}

impl Default for OsmApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OsmApi for OsmApiClient {
    fn fetch_element(&self, element_type: OsmElementType, id: &str) -> Result<ElementFetch> {
        let url = format!("{}/api/0.6/{}/{}", self.base_url, element_type.api_name(), id);
        log::debug!("fetching {}", url);
        let response = self.client.get(&url).send().with_context(|| format!("fetching {}", url))?;
        if response.status() == reqwest::StatusCode::GONE {
            return Ok(ElementFetch::Gone);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("unexpected response fetching {}", url))?;
        Ok(ElementFetch::Found(response.text()?))
    }
}

/// Pulls the values of all `<tag k="..." v="..."/>` children with the
/// given key out of an OSM API element document.
pub fn extract_tag_values(xml: &str, key: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut values = Vec::new();
    loop {
        let event = reader.read_event()?;
        let element = match &event {
            Event::Start(e) | Event::Empty(e) => e,
            Event::Eof => break,
            _ => continue,
        };
        if element.local_name().as_ref() != b"tag" {
            continue;
        }
        let k = element
            .try_get_attribute("k")?
            .map(|attr| attr.unescape_value())
            .transpose()?;
        if k.as_deref() != Some(key) {
            continue;
        }
        let v = element
            .try_get_attribute("v")?
            .map(|attr| attr.unescape_value())
            .transpose()?
            .context("tag element without a value attribute")?;
        values.push(v.into_owned());
    }
    Ok(values)
}

/// Assigns every area in the generation to its enclosing countries, in
/// one all-or-nothing transaction. Without `commit` the transaction is
/// rolled back at the end regardless of success, making this a safe dry
/// run.
pub fn update_countries(
    conn: &mut Connection,
    api: &dyn OsmApi,
    generation_id: i64,
    commit: bool,
) -> Result<()> {
    let generation = db::generation(conn, generation_id)?
        .with_context(|| format!("couldn't find the generation {}", generation_id))?;

    let tx = conn.transaction()?;
    db::ensure_code_type(&tx, db::CODE_TYPE_ISO_COUNTRY, "ISO3166-1 country code from OSM")?;
    set_country_codes_for_countries(&tx, api, generation.id)?;
    ensure_countries_exist(&tx)?;
    set_country_on_all_areas(&tx, generation.id)?;

    if commit {
        tx.commit()?;
    } else {
        log::info!("rolling back, since --commit was not specified");
        tx.rollback()?;
    }
    Ok(())
}

/// For every country-level area, re-discover its ISO3166-1 code from
/// the OSM element metadata endpoint.
fn set_country_codes_for_countries(
    conn: &Connection,
    api: &dyn OsmApi,
    generation: i64,
) -> Result<()> {
    for area in db::areas_of_type_in_generation(conn, COUNTRY_TYPE_CODE, generation)? {
        db::delete_code(conn, area.id, db::CODE_TYPE_ISO_COUNTRY)?;
        let (identity_type, osm_id) = db::osm_identity_code(conn, area.id)?;
        let element_type = OsmElementType::from_code_type(&identity_type)
            .with_context(|| format!("unknown OSM code type '{}' on area {}", identity_type, area.id))?;
        let xml = match api.fetch_element(element_type, &osm_id)? {
            ElementFetch::Found(xml) => xml,
            ElementFetch::Gone => {
                log::info!(
                    "{} {} is gone upstream, skipping area {} ({})",
                    element_type,
                    osm_id,
                    area.id,
                    area.name
                );
                continue;
            }
        };
        let tags = extract_tag_values(&xml, OSM_COUNTRY_CODE_KEY)?;
        let country_code = match tags.as_slice() {
            [] => {
                log::info!(
                    "no {} tag found for area {} ({})",
                    OSM_COUNTRY_CODE_KEY,
                    area.id,
                    area.name
                );
                continue;
            }
            [code] => code.clone(),
            _ => bail!(
                "more than one {} tag found for {} (area {})",
                OSM_COUNTRY_CODE_KEY,
                area.name,
                area.id
            ),
        };
        db::upsert_code(conn, area.id, db::CODE_TYPE_ISO_COUNTRY, &country_code)?;
    }
    Ok(())
}

/// Makes sure a Country entity exists for every discovered ISO code,
/// plus the "multiple enclosing countries" sentinel.
fn ensure_countries_exist(conn: &Connection) -> Result<()> {
    for (code, area_name) in db::iso_codes_with_area_names(conn)? {
        db::ensure_country(conn, &code, &area_name)?;
    }
    db::ensure_country(conn, db::MULTIPLE_COUNTRIES_CODE, "Multiple enclosing countries")?;
    Ok(())
}

fn set_country_on_all_areas(conn: &Connection, generation: i64) -> Result<()> {
    db::require_country(conn, db::GLOBAL_COUNTRY_CODE)?;
    let countries = country_geometries(conn, generation)?;
    for area in db::areas_in_generation(conn, generation)? {
        log::info!("considering area: {} ({})", area.name, area.id);
        let codes = enclosing_country_codes(conn, &countries, area.id)?;
        for code in &codes {
            db::require_country(conn, code)?;
        }
        db::set_area_country(conn, area.id, db::GLOBAL_COUNTRY_CODE)?;
        db::replace_area_countries(conn, area.id, &codes)?;
    }
    Ok(())
}

/// Loads all country-level areas of the generation that carry an ISO
/// country code, with their geometries, once per pass.
fn country_geometries(
    conn: &Connection,
    generation: i64,
) -> Result<Vec<(String, MultiPolygon<f64>)>> {
    let mut countries = Vec::new();
    for area in db::areas_of_type_in_generation(conn, COUNTRY_TYPE_CODE, generation)? {
        let code = match db::area_code(conn, area.id, db::CODE_TYPE_ISO_COUNTRY)? {
            Some(code) => code,
            None => continue,
        };
        let geometry = match db::area_multipolygon(conn, area.id)? {
            Some(geometry) => geometry,
            None => continue,
        };
        countries.push((code, geometry));
    }
    Ok(countries)
}

/// A representative interior point of each of the area's polygons is
/// tested against every country geometry; the union of matches,
/// deduplicated and sorted lexicographically, is the area's country
/// set.
fn enclosing_country_codes(
    conn: &Connection,
    countries: &[(String, MultiPolygon<f64>)],
    area_id: i64,
) -> Result<Vec<String>> {
    let mut codes = BTreeSet::new();
    let geometry = match db::area_multipolygon(conn, area_id)? {
        Some(geometry) => geometry,
        None => return Ok(Vec::new()),
    };
    for polygon in geometry.iter() {
        let point = match polygon.interior_point() {
            Some(point) => point,
            None => continue,
        };
        for (code, country_geometry) in countries {
            if country_geometry.contains(&point) {
                codes.insert(code.clone());
            }
        }
    }
    Ok(codes.into_iter().collect())
}
