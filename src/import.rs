use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::Connection;

use crate::db::{self, Area, Generation};
use crate::geometry;
use crate::kml::KmlDocument;
use crate::osm;

lazy_static! {
    static ref TYPE_DIRECTORY: Regex = Regex::new(r"^[A-Z0-9]{3}$").unwrap();
}

/// How an incoming element is reconciled against the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Import to a new inactive generation; reuse an existing area only
    /// when its boundary is unchanged within tolerance.
    NewGenerationCompareBoundaries,
    /// Import to a new inactive generation; reuse any matching area
    /// unconditionally and update its boundary.
    NewGenerationForceReuse,
    /// Update the current, active generation in place. A changed
    /// boundary on an existing area is a fatal error here.
    AlterActiveGeneration,
}

/// Terminal state of one KML file. Decisions are reported even in dry
/// runs, where nothing is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Reused,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoPolygons,
    DegenerateRing,
    UnfixableGeometry,
}

enum Decision {
    Reuse(Area),
    Create,
}

/// Walks a directory tree of typed KML files and imports every boundary
/// into the target generation. Per-file skips keep the run going; any
/// fatal error aborts the whole run with prior files' writes already
/// committed.
pub fn import_directory(
    conn: &Connection,
    directory: &Path,
    mode: ImportMode,
    commit: bool,
    languages: &HashMap<String, String>,
) -> Result<()> {
    let current_generation = db::current_generation(conn)?;
    let target_generation = match mode {
        ImportMode::AlterActiveGeneration => {
            current_generation.context("no active generation to alter")?
        }
        _ => db::new_generation(conn)?.context("no new generation to be used for import")?,
    };
    ensure!(directory.is_dir(), "'{}' is not a directory", directory.display());
    db::require_country(conn, db::GLOBAL_COUNTRY_CODE)?;

    let type_directories = list_type_directories(directory)?;
    if type_directories.is_empty() {
        bail!(
            "'{}' did not contain any directories that look like boundary types (e.g. O02, O04)",
            directory.display()
        );
    }

    log::info!("Loading admin boundaries from {}", directory.display());
    for type_code in &type_directories {
        db::require_area_type(conn, type_code)?;
        log::info!("Loading all KML in {}", type_code);

        let files = list_files(&directory.join(type_code))?;
        let total_files = files.len();
        for (i, file_name) in files.iter().enumerate() {
            let progress = i * 100 / total_files;
            if !file_name.ends_with(".kml") {
                log::info!("Ignoring non-KML file: {}", file_name);
                continue;
            }
            let kml_path = directory.join(type_code).join(file_name);
            log::info!("[{}% complete] Loading {}", progress, kml_path.display());
            import_file(
                conn,
                &kml_path,
                type_code,
                languages,
                current_generation.as_ref(),
                &target_generation,
                mode,
                commit,
            )?;
        }
    }
    Ok(())
}

fn list_type_directories(directory: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(directory)
        .with_context(|| format!("failed to read directory {}", directory.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && TYPE_DIRECTORY.is_match(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn list_files(directory: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(directory)
        .with_context(|| format!("failed to read directory {}", directory.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Imports one KML file: parses the element identity and geometry,
/// reconciles against the current generation, and persists the upsert
/// plan when `commit` is set.
#[allow(clippy::too_many_arguments)]
pub fn import_file(
    conn: &Connection,
    kml_path: &Path,
    type_code: &str,
    languages: &HashMap<String, String>,
    current_generation: Option<&Generation>,
    target_generation: &Generation,
    mode: ImportMode,
    commit: bool,
) -> Result<Outcome> {
    let file_name = kml_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let element = osm::parse_kml_file_name(&file_name)?;
    let code_type = element.element_type.code_type();
    db::require_code_type(conn, code_type)?;

    let document = KmlDocument::parse_file(kml_path)?;
    let name = document.useful_name()?.to_string();
    log::info!("  {}", name);

    ensure!(
        document.placemark_count == 1,
        "expected exactly one placemark in {}, found {}",
        kml_path.display(),
        document.placemark_count
    );

    if document.polygon_count() == 0 {
        log::debug!("    ignoring that file - it contained no polygons");
        return Ok(Outcome::Skipped(SkipReason::NoPolygons));
    }
    let polygons_too_small = document.degenerate_polygon_count();
    if polygons_too_small > 0 {
        log::debug!(
            "    skipping, since {} out of {} polygon(s) were too small",
            polygons_too_small,
            document.polygon_count()
        );
        return Ok(Outcome::Skipped(SkipReason::DegenerateRing));
    }
    let geometry = match geometry::make_valid(document.multipolygon()) {
        Some(geometry) => geometry,
        None => {
            log::debug!("    invalid polygons couldn't be fixed in {}", kml_path.display());
            return Ok(Outcome::Skipped(SkipReason::UnfixableGeometry));
        }
    };

    let existing = match current_generation {
        Some(generation) => db::find_osm_area(conn, code_type, &element.id, generation.id)?,
        None => None,
    };

    let decision = match existing {
        None => {
            log::debug!("    no area existed in the current generation with that OSM element type and ID");
            Decision::Create
        }
        Some(area) => match mode {
            ImportMode::NewGenerationForceReuse => Decision::Reuse(area),
            ImportMode::NewGenerationCompareBoundaries => {
                let previous = db::area_multipolygon(conn, area.id)?;
                if geometry::boundaries_equal(previous.as_ref(), &geometry) {
                    Decision::Reuse(area)
                } else {
                    // Leave the old row's validity range untouched and
                    // create a second row, preserving the point-in-time
                    // boundary snapshot of the earlier generation.
                    Decision::Create
                }
            }
            ImportMode::AlterActiveGeneration => {
                let previous = db::area_multipolygon(conn, area.id)?;
                if geometry::boundaries_equal(previous.as_ref(), &geometry) {
                    Decision::Reuse(area)
                } else {
                    bail!(
                        "the boundary of area {} ({}) has changed; refusing to alter the active generation {}",
                        area.id,
                        element,
                        target_generation.id
                    );
                }
            }
        },
    };

    if !commit {
        return Ok(match decision {
            Decision::Reuse(_) => Outcome::Reused,
            Decision::Create => Outcome::Created,
        });
    }

    let (area_id, created) = match decision {
        Decision::Reuse(area) => {
            db::refresh_area(conn, area.id, &name, type_code, target_generation.id)?;
            (area.id, false)
        }
        Decision::Create => {
            let id = db::create_area(
                conn,
                &name,
                type_code,
                db::GLOBAL_COUNTRY_CODE,
                target_generation.id,
            )?;
            (id, true)
        }
    };
    log::debug!("    area ID: {}", area_id);

    let tags = document
        .data
        .get(&name)
        .with_context(|| format!("no extended data found for '{}'", name))?;

    reconcile_names(conn, area_id, tags, languages)?;

    db::require_code_type(conn, db::CODE_TYPE_OSM_ATTR_REF)?;
    match tags.get("ref") {
        Some(reference) => db::upsert_code(conn, area_id, db::CODE_TYPE_OSM_ATTR_REF, reference)?,
        None => db::delete_code(conn, area_id, db::CODE_TYPE_OSM_ATTR_REF)?,
    }

    // A reused row keeps its old OSM identity code; only a brand-new
    // row needs one attached.
    if created {
        db::upsert_code(conn, area_id, code_type, &element.id)?;
    }

    db::replace_polygons(conn, area_id, &geometry)?;

    Ok(if created { Outcome::Created } else { Outcome::Reused })
}

/// Reconciles the area's name set with the KML tags as a symmetric
/// diff: the default name and every `name:<lang>` tag that resolves via
/// the language table are upserted, any previously stored language not
/// present any more is deleted.
fn reconcile_names(
    conn: &Connection,
    area_id: i64,
    tags: &std::collections::BTreeMap<String, String>,
    languages: &HashMap<String, String>,
) -> Result<()> {
    let mut old_languages = db::area_name_languages(conn, area_id)?;
    for (key, translated_name) in tags {
        let (language, language_name) = if key == "name" {
            (db::NAME_TYPE_DEFAULT, "OSM Default".to_string())
        } else if let Some(language) = key.strip_prefix("name:") {
            match languages.get(language) {
                Some(english_name) => (language, english_name.clone()),
                None => continue,
            }
        } else {
            continue;
        };
        old_languages.remove(language);
        db::ensure_name_type(conn, language, &language_name)?;
        db::upsert_name(conn, area_id, language, translated_name)?;
    }
    if !old_languages.is_empty() {
        let removed: Vec<&str> = old_languages.iter().map(String::as_str).collect();
        log::debug!("    removing deleted language codes: {}", removed.join(" "));
        db::delete_names(conn, area_id, &old_languages)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn type_directory_pattern() {
        assert!(TYPE_DIRECTORY.is_match("O02"));
        assert!(TYPE_DIRECTORY.is_match("OWA"));
        assert!(TYPE_DIRECTORY.is_match("A1B"));
        assert!(!TYPE_DIRECTORY.is_match("o02"));
        assert!(!TYPE_DIRECTORY.is_match("O002"));
        assert!(!TYPE_DIRECTORY.is_match("O2"));
    }

    #[test]
    fn importing_a_missing_directory_fails() {
        let conn = db::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        db::seed_reference_data(&conn).unwrap();
        db::create_generation(&conn).unwrap();
        let result = import_directory(
            &conn,
            &PathBuf::from("/nonexistent/kml"),
            ImportMode::NewGenerationCompareBoundaries,
            false,
            &HashMap::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn import_without_a_new_generation_fails() {
        let conn = db::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        db::seed_reference_data(&conn).unwrap();
        let result = import_directory(
            &conn,
            &PathBuf::from("."),
            ImportMode::NewGenerationCompareBoundaries,
            false,
            &HashMap::new(),
        );
        assert!(result.unwrap_err().to_string().contains("no new generation"));
    }
}
