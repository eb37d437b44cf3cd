use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use geo::MultiPolygon;
use rusqlite::{params, Connection, OptionalExtension, Row};
use wkt::ToWkt;

use crate::geometry::wkt_string_to_multipolygon;

pub const GLOBAL_COUNTRY_CODE: &str = "G";
pub const MULTIPLE_COUNTRIES_CODE: &str = "?";
pub const CODE_TYPE_OSM_ATTR_REF: &str = "osm_attr_ref";
pub const CODE_TYPE_ISO_COUNTRY: &str = "iso3166_1";
pub const NAME_TYPE_DEFAULT: &str = "default";

/// An immutable, ordered snapshot of the whole boundary set. At most one
/// generation is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    pub id: i64,
    pub active: bool,
}

/// One administrative-boundary row, valid over an inclusive generation
/// range. The same logical area may have several rows over time when
/// its boundary changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Area {
    pub id: i64,
    pub name: String,
    pub area_type: String,
    pub country: Option<String>,
    pub parent_area: Option<i64>,
    pub generation_low: i64,
    pub generation_high: i64,
}

pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS generation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            active INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS area_type (
            code TEXT PRIMARY KEY,
            description TEXT
        );
        CREATE TABLE IF NOT EXISTS code_type (
            code TEXT PRIMARY KEY,
            description TEXT
        );
        CREATE TABLE IF NOT EXISTS name_type (
            code TEXT PRIMARY KEY,
            description TEXT
        );
        CREATE TABLE IF NOT EXISTS country (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS area (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            type TEXT NOT NULL REFERENCES area_type(code),
            country TEXT REFERENCES country(code),
            parent_area INTEGER REFERENCES area(id),
            generation_low INTEGER NOT NULL REFERENCES generation(id),
            generation_high INTEGER NOT NULL REFERENCES generation(id)
        );
        CREATE TABLE IF NOT EXISTS code (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            area_id INTEGER NOT NULL REFERENCES area(id),
            type TEXT NOT NULL REFERENCES code_type(code),
            code TEXT NOT NULL,
            UNIQUE (area_id, type)
        );
        CREATE TABLE IF NOT EXISTS name (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            area_id INTEGER NOT NULL REFERENCES area(id),
            language TEXT NOT NULL REFERENCES name_type(code),
            name TEXT NOT NULL,
            UNIQUE (area_id, language)
        );
        CREATE TABLE IF NOT EXISTS polygon (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            area_id INTEGER NOT NULL REFERENCES area(id),
            wkt TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS area_country (
            area_id INTEGER NOT NULL REFERENCES area(id),
            country_code TEXT NOT NULL REFERENCES country(code),
            UNIQUE (area_id, country_code)
        );
        CREATE INDEX IF NOT EXISTS idx_code_type_code ON code(type, code);
        CREATE INDEX IF NOT EXISTS idx_area_generations ON area(generation_low, generation_high);",
    )?;
    Ok(())
}

/// Seeds the reference rows the importer expects to find: OSM code
/// types, the global placeholder country and the OSM admin-level
/// boundary types O02..O11.
pub fn seed_reference_data(conn: &Connection) -> Result<()> {
    ensure_code_type(conn, "osm_way", "OSM way ID")?;
    ensure_code_type(conn, "osm_rel", "OSM relation ID")?;
    ensure_code_type(conn, CODE_TYPE_OSM_ATTR_REF, "OSM ref attribute")?;
    ensure_country(conn, GLOBAL_COUNTRY_CODE, "Global")?;
    for level in 2..=11 {
        conn.execute(
            "INSERT OR IGNORE INTO area_type (code, description) VALUES (?1, ?2)",
            params![
                format!("O{:02}", level),
                format!("OSM Administrative Boundary Level {}", level)
            ],
        )?;
    }
    Ok(())
}

fn row_to_generation(row: &Row) -> rusqlite::Result<Generation> {
    Ok(Generation { id: row.get(0)?, active: row.get(1)? })
}

pub fn generation(conn: &Connection, id: i64) -> Result<Option<Generation>> {
    let found = conn
        .query_row("SELECT id, active FROM generation WHERE id = ?1", params![id], row_to_generation)
        .optional()?;
    Ok(found)
}

/// The highest-id active generation, the one visible to readers.
pub fn current_generation(conn: &Connection) -> Result<Option<Generation>> {
    let found = conn
        .query_row(
            "SELECT id, active FROM generation WHERE active = 1 ORDER BY id DESC LIMIT 1",
            [],
            row_to_generation,
        )
        .optional()?;
    Ok(found)
}

/// The latest generation, provided it has not been activated yet.
pub fn new_generation(conn: &Connection) -> Result<Option<Generation>> {
    let found = conn
        .query_row(
            "SELECT id, active FROM generation ORDER BY id DESC LIMIT 1",
            [],
            row_to_generation,
        )
        .optional()?;
    Ok(found.filter(|generation| !generation.active))
}

pub fn create_generation(conn: &Connection) -> Result<Generation> {
    conn.execute("INSERT INTO generation (active) VALUES (0)", [])?;
    Ok(Generation { id: conn.last_insert_rowid(), active: false })
}

pub fn activate_generation(conn: &Connection, id: i64) -> Result<Generation> {
    let generation =
        generation(conn, id)?.with_context(|| format!("couldn't find the generation {}", id))?;
    conn.execute("UPDATE generation SET active = 1 WHERE id = ?1", params![id])?;
    Ok(Generation { active: true, ..generation })
}

pub fn require_area_type(conn: &Connection, code: &str) -> Result<()> {
    let exists: Option<String> = conn
        .query_row("SELECT code FROM area_type WHERE code = ?1", params![code], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        bail!("the boundary type '{}' is missing from the database", code);
    }
    Ok(())
}

pub fn require_code_type(conn: &Connection, code: &str) -> Result<()> {
    let exists: Option<String> = conn
        .query_row("SELECT code FROM code_type WHERE code = ?1", params![code], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        bail!("the code type '{}' is missing from the database", code);
    }
    Ok(())
}

pub fn ensure_code_type(conn: &Connection, code: &str, description: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO code_type (code, description) VALUES (?1, ?2)",
        params![code, description],
    )?;
    Ok(())
}

pub fn ensure_name_type(conn: &Connection, code: &str, description: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO name_type (code, description) VALUES (?1, ?2)
         ON CONFLICT (code) DO UPDATE SET description = excluded.description",
        params![code, description],
    )?;
    Ok(())
}

fn row_to_area(row: &Row) -> rusqlite::Result<Area> {
    Ok(Area {
        id: row.get(0)?,
        name: row.get(1)?,
        area_type: row.get(2)?,
        country: row.get(3)?,
        parent_area: row.get(4)?,
        generation_low: row.get(5)?,
        generation_high: row.get(6)?,
    })
}

const AREA_COLUMNS: &str =
    "a.id, a.name, a.type, a.country, a.parent_area, a.generation_low, a.generation_high";

pub fn area(conn: &Connection, id: i64) -> Result<Area> {
    let found = conn
        .query_row(
            &format!("SELECT {} FROM area a WHERE a.id = ?1", AREA_COLUMNS),
            params![id],
            row_to_area,
        )
        .with_context(|| format!("couldn't find area {}", id))?;
    Ok(found)
}

/// Finds the area identified by the given OSM code that is valid in the
/// given generation. Duplicate OSM ids can exist from historical data
/// issues; the most recently created row wins.
pub fn find_osm_area(
    conn: &Connection,
    code_type: &str,
    osm_id: &str,
    generation: i64,
) -> Result<Option<Area>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {} FROM code c JOIN area a ON a.id = c.area_id
                 WHERE c.type = ?1 AND c.code = ?2
                   AND a.generation_low <= ?3 AND a.generation_high >= ?3
                 ORDER BY a.id DESC LIMIT 1",
                AREA_COLUMNS
            ),
            params![code_type, osm_id, generation],
            row_to_area,
        )
        .optional()?;
    Ok(found)
}

pub fn create_area(
    conn: &Connection,
    name: &str,
    area_type: &str,
    country: &str,
    generation: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO area (name, type, country, parent_area, generation_low, generation_high)
         VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
        params![name, area_type, country, generation],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Brings a reused area row up to date and extends its validity range
/// to the target generation. `generation_low` is never touched.
pub fn refresh_area(
    conn: &Connection,
    id: i64,
    name: &str,
    area_type: &str,
    generation_high: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE area SET name = ?2, type = ?3, generation_high = ?4 WHERE id = ?1",
        params![id, name, area_type, generation_high],
    )?;
    Ok(())
}

pub fn areas_in_generation(conn: &Connection, generation: i64) -> Result<Vec<Area>> {
    let mut statement = conn.prepare(&format!(
        "SELECT {} FROM area a
         WHERE a.generation_low <= ?1 AND a.generation_high >= ?1 ORDER BY a.id",
        AREA_COLUMNS
    ))?;
    let areas = statement
        .query_map(params![generation], row_to_area)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(areas)
}

pub fn areas_of_type_in_generation(
    conn: &Connection,
    area_type: &str,
    generation: i64,
) -> Result<Vec<Area>> {
    let mut statement = conn.prepare(&format!(
        "SELECT {} FROM area a
         WHERE a.type = ?1 AND a.generation_low <= ?2 AND a.generation_high >= ?2
         ORDER BY a.id",
        AREA_COLUMNS
    ))?;
    let areas = statement
        .query_map(params![area_type, generation], row_to_area)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(areas)
}

/// All polygons of an area, collected into one multi-polygon. `None`
/// when the area has no stored geometry at all.
pub fn area_multipolygon(conn: &Connection, area_id: i64) -> Result<Option<MultiPolygon<f64>>> {
    let mut statement =
        conn.prepare("SELECT wkt FROM polygon WHERE area_id = ?1 ORDER BY id")?;
    let rows = statement
        .query_map(params![area_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut polygons = Vec::new();
    for wkt_string in rows {
        let geometry = wkt_string_to_multipolygon(&wkt_string)
            .with_context(|| format!("corrupt polygon row for area {}", area_id))?;
        polygons.extend(geometry.0);
    }
    Ok(Some(MultiPolygon::new(polygons)))
}

/// Replaces the stored geometry of an area, one row per simple polygon.
pub fn replace_polygons(conn: &Connection, area_id: i64, geometry: &MultiPolygon<f64>) -> Result<()> {
    conn.execute("DELETE FROM polygon WHERE area_id = ?1", params![area_id])?;
    for polygon in geometry.iter() {
        conn.execute(
            "INSERT INTO polygon (area_id, wkt) VALUES (?1, ?2)",
            params![area_id, polygon.wkt_string()],
        )?;
    }
    Ok(())
}

pub fn area_name_languages(conn: &Connection, area_id: i64) -> Result<HashSet<String>> {
    let mut statement = conn.prepare("SELECT language FROM name WHERE area_id = ?1")?;
    let languages = statement
        .query_map(params![area_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(languages)
}

pub fn area_names(conn: &Connection, area_id: i64) -> Result<Vec<(String, String)>> {
    let mut statement =
        conn.prepare("SELECT language, name FROM name WHERE area_id = ?1 ORDER BY language")?;
    let names = statement
        .query_map(params![area_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

pub fn upsert_name(conn: &Connection, area_id: i64, language: &str, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO name (area_id, language, name) VALUES (?1, ?2, ?3)
         ON CONFLICT (area_id, language) DO UPDATE SET name = excluded.name",
        params![area_id, language, name],
    )?;
    Ok(())
}

pub fn delete_names(conn: &Connection, area_id: i64, languages: &HashSet<String>) -> Result<()> {
    for language in languages {
        conn.execute(
            "DELETE FROM name WHERE area_id = ?1 AND language = ?2",
            params![area_id, language],
        )?;
    }
    Ok(())
}

pub fn upsert_code(conn: &Connection, area_id: i64, code_type: &str, code: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO code (area_id, type, code) VALUES (?1, ?2, ?3)
         ON CONFLICT (area_id, type) DO UPDATE SET code = excluded.code",
        params![area_id, code_type, code],
    )?;
    Ok(())
}

pub fn delete_code(conn: &Connection, area_id: i64, code_type: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM code WHERE area_id = ?1 AND type = ?2",
        params![area_id, code_type],
    )?;
    Ok(())
}

pub fn area_code(conn: &Connection, area_id: i64, code_type: &str) -> Result<Option<String>> {
    let found = conn
        .query_row(
            "SELECT code FROM code WHERE area_id = ?1 AND type = ?2",
            params![area_id, code_type],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found)
}

/// The single `osm_way`/`osm_rel` code that identifies an area's OSM
/// origin. Zero or several such codes violate the data model.
pub fn osm_identity_code(conn: &Connection, area_id: i64) -> Result<(String, String)> {
    let mut statement = conn.prepare(
        "SELECT type, code FROM code WHERE area_id = ?1 AND type IN ('osm_way', 'osm_rel')",
    )?;
    let codes = statement
        .query_map(params![area_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
    match codes.as_slice() {
        [identity] => Ok(identity.clone()),
        _ => bail!("area {} has {} OSM identity codes, expected exactly one", area_id, codes.len()),
    }
}

/// Every ISO country code discovered so far, with the name of the area
/// carrying it.
pub fn iso_codes_with_area_names(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut statement = conn.prepare(
        "SELECT c.code, a.name FROM code c JOIN area a ON a.id = c.area_id
         WHERE c.type = ?1 ORDER BY c.id",
    )?;
    let codes = statement
        .query_map(params![CODE_TYPE_ISO_COUNTRY], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(codes)
}

/// Creates a country if missing; an existing country's name is never
/// overwritten.
pub fn ensure_country(conn: &Connection, code: &str, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO country (code, name) VALUES (?1, ?2)",
        params![code, name],
    )?;
    Ok(())
}

pub fn require_country(conn: &Connection, code: &str) -> Result<()> {
    let exists: Option<String> = conn
        .query_row("SELECT code FROM country WHERE code = ?1", params![code], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        bail!("the country '{}' is missing from the database", code);
    }
    Ok(())
}

pub fn set_area_country(conn: &Connection, area_id: i64, country: &str) -> Result<()> {
    conn.execute("UPDATE area SET country = ?2 WHERE id = ?1", params![area_id, country])?;
    Ok(())
}

/// Replaces the area's country set wholesale; never incremental.
pub fn replace_area_countries(conn: &Connection, area_id: i64, codes: &[String]) -> Result<()> {
    conn.execute("DELETE FROM area_country WHERE area_id = ?1", params![area_id])?;
    for code in codes {
        conn.execute(
            "INSERT INTO area_country (area_id, country_code) VALUES (?1, ?2)",
            params![area_id, code],
        )?;
    }
    Ok(())
}

pub fn area_country_codes(conn: &Connection, area_id: i64) -> Result<Vec<String>> {
    let mut statement = conn.prepare(
        "SELECT country_code FROM area_country WHERE area_id = ?1 ORDER BY country_code",
    )?;
    let codes = statement
        .query_map(params![area_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(codes)
}
