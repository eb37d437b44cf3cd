use std::collections::HashMap;

use anyhow::{bail, Result};
use rusqlite::Connection;

use osm_boundary_import::countries::{update_countries, ElementFetch, OsmApi};
use osm_boundary_import::db;
use osm_boundary_import::geometry::wkt_string_to_multipolygon;
use osm_boundary_import::osm::OsmElementType;

/// Canned element-metadata responses keyed by `<type>/<id>`.
struct FakeOsmApi {
    responses: HashMap<String, String>,
    gone: Vec<String>,
}

impl FakeOsmApi {
    fn new() -> Self {
        FakeOsmApi { responses: HashMap::new(), gone: Vec::new() }
    }

    fn with_iso_code(mut self, element_type: OsmElementType, id: &str, iso_code: &str) -> Self {
        self.responses.insert(
            format!("{}/{}", element_type, id),
            format!(
                r#"<osm><{t} id="{id}"><tag k="ISO3166-1" v="{code}"/></{t}></osm>"#,
                t = element_type,
                id = id,
                code = iso_code
            ),
        );
        self
    }

    fn with_body(mut self, element_type: OsmElementType, id: &str, body: &str) -> Self {
        self.responses.insert(format!("{}/{}", element_type, id), body.to_string());
        self
    }

    fn with_gone(mut self, element_type: OsmElementType, id: &str) -> Self {
        self.gone.push(format!("{}/{}", element_type, id));
        self
    }
}

impl OsmApi for FakeOsmApi {
    fn fetch_element(&self, element_type: OsmElementType, id: &str) -> Result<ElementFetch> {
        let key = format!("{}/{}", element_type, id);
        if self.gone.contains(&key) {
            return Ok(ElementFetch::Gone);
        }
        match self.responses.get(&key) {
            Some(body) => Ok(ElementFetch::Found(body.clone())),
            None => bail!("unexpected API call for {}", key),
        }
    }
}

fn square_wkt(x0: f64, y0: f64, x1: f64, y1: f64) -> String {
    format!(
        "POLYGON(({x0} {y0}, {x0} {y1}, {x1} {y1}, {x1} {y0}, {x0} {y0}))",
        x0 = x0,
        y0 = y0,
        x1 = x1,
        y1 = y1
    )
}

fn make_area(
    conn: &Connection,
    name: &str,
    area_type: &str,
    generation: i64,
    osm_code: (&str, &str),
    wkt_polygons: &[String],
) -> i64 {
    let area_id = db::create_area(conn, name, area_type, db::GLOBAL_COUNTRY_CODE, generation).unwrap();
    db::upsert_code(conn, area_id, osm_code.0, osm_code.1).unwrap();
    let polygons: Vec<_> = wkt_polygons
        .iter()
        .flat_map(|wkt| wkt_string_to_multipolygon(wkt).unwrap().0)
        .collect();
    db::replace_polygons(conn, area_id, &geo::MultiPolygon::new(polygons)).unwrap();
    area_id
}

struct Fixture {
    conn: Connection,
    generation: i64,
    france: i64,
    germany: i64,
    village: i64,
    border_region: i64,
}

/// Two adjacent country squares, a village inside the first, and a
/// region with one polygon in each country.
fn fixture() -> Fixture {
    let conn = db::open_in_memory().unwrap();
    db::init_schema(&conn).unwrap();
    db::seed_reference_data(&conn).unwrap();
    let generation = db::create_generation(&conn).unwrap().id;

    let france = make_area(
        &conn,
        "France",
        "O02",
        generation,
        ("osm_rel", "1"),
        &[square_wkt(0.0, 0.0, 4.0, 4.0)],
    );
    let germany = make_area(
        &conn,
        "Germany",
        "O02",
        generation,
        ("osm_rel", "2"),
        &[square_wkt(4.0, 0.0, 8.0, 4.0)],
    );
    let village = make_area(
        &conn,
        "Village",
        "O04",
        generation,
        ("osm_way", "10"),
        &[square_wkt(1.0, 1.0, 2.0, 2.0)],
    );
    let border_region = make_area(
        &conn,
        "Border Region",
        "O04",
        generation,
        ("osm_rel", "11"),
        &[square_wkt(1.0, 2.5, 2.0, 3.5), square_wkt(5.0, 2.5, 6.0, 3.5)],
    );
    Fixture { conn, generation, france, germany, village, border_region }
}

fn standard_api() -> FakeOsmApi {
    FakeOsmApi::new()
        .with_iso_code(OsmElementType::Relation, "1", "FR")
        .with_iso_code(OsmElementType::Relation, "2", "DE")
}

#[test]
fn assigns_every_area_to_its_enclosing_countries() {
    let mut fixture = fixture();
    update_countries(&mut fixture.conn, &standard_api(), fixture.generation, true).unwrap();

    let conn = &fixture.conn;
    assert_eq!(db::area_code(conn, fixture.france, "iso3166_1").unwrap().as_deref(), Some("FR"));
    assert_eq!(db::area_code(conn, fixture.germany, "iso3166_1").unwrap().as_deref(), Some("DE"));

    assert_eq!(db::area_country_codes(conn, fixture.france).unwrap(), vec!["FR".to_string()]);
    assert_eq!(db::area_country_codes(conn, fixture.village).unwrap(), vec!["FR".to_string()]);
    // Union over the region's polygons, deduplicated and sorted ascending.
    assert_eq!(
        db::area_country_codes(conn, fixture.border_region).unwrap(),
        vec!["DE".to_string(), "FR".to_string()]
    );

    // The denormalized country stays the global placeholder everywhere.
    for area in db::areas_in_generation(conn, fixture.generation).unwrap() {
        assert_eq!(area.country.as_deref(), Some("G"));
    }

    // Countries materialized from the discovered codes plus the sentinel.
    for (code, name) in [("FR", "France"), ("DE", "Germany"), ("?", "Multiple enclosing countries")] {
        let found: String = conn
            .query_row("SELECT name FROM country WHERE code = ?1", [code], |row| row.get(0))
            .unwrap();
        assert_eq!(found, name);
    }
}

#[test]
fn assignment_is_deterministic_across_runs() {
    let mut fixture = fixture();
    update_countries(&mut fixture.conn, &standard_api(), fixture.generation, true).unwrap();
    let first = db::area_country_codes(&fixture.conn, fixture.border_region).unwrap();
    update_countries(&mut fixture.conn, &standard_api(), fixture.generation, true).unwrap();
    let second = db::area_country_codes(&fixture.conn, fixture.border_region).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, vec!["DE".to_string(), "FR".to_string()]);
}

#[test]
fn dry_run_rolls_the_whole_pass_back() {
    let mut fixture = fixture();
    update_countries(&mut fixture.conn, &standard_api(), fixture.generation, false).unwrap();

    let conn = &fixture.conn;
    assert_eq!(db::area_code(conn, fixture.france, "iso3166_1").unwrap(), None);
    assert_eq!(db::area_country_codes(conn, fixture.village).unwrap(), Vec::<String>::new());
    let countries: i64 =
        conn.query_row("SELECT COUNT(*) FROM country", [], |row| row.get(0)).unwrap();
    // Only the seeded global placeholder remains.
    assert_eq!(countries, 1);
}

#[test]
fn gone_elements_are_skipped_not_fatal() {
    let mut fixture = fixture();
    let api = FakeOsmApi::new()
        .with_iso_code(OsmElementType::Relation, "1", "FR")
        .with_gone(OsmElementType::Relation, "2");
    update_countries(&mut fixture.conn, &api, fixture.generation, true).unwrap();

    let conn = &fixture.conn;
    assert_eq!(db::area_code(conn, fixture.germany, "iso3166_1").unwrap(), None);
    // Germany's square no longer counts as a country, so the region
    // resolves to France alone.
    assert_eq!(
        db::area_country_codes(conn, fixture.border_region).unwrap(),
        vec!["FR".to_string()]
    );
}

#[test]
fn elements_without_an_iso_tag_are_skipped() {
    let mut fixture = fixture();
    let api = FakeOsmApi::new()
        .with_iso_code(OsmElementType::Relation, "1", "FR")
        .with_body(
            OsmElementType::Relation,
            "2",
            r#"<osm><relation id="2"><tag k="boundary" v="administrative"/></relation></osm>"#,
        );
    update_countries(&mut fixture.conn, &api, fixture.generation, true).unwrap();
    assert_eq!(db::area_code(&fixture.conn, fixture.germany, "iso3166_1").unwrap(), None);
}

#[test]
fn multiple_iso_tags_are_fatal_and_roll_back() {
    let mut fixture = fixture();
    let api = FakeOsmApi::new()
        .with_iso_code(OsmElementType::Relation, "1", "FR")
        .with_body(
            OsmElementType::Relation,
            "2",
            r#"<osm><relation id="2">
                <tag k="ISO3166-1" v="DE"/>
                <tag k="ISO3166-1" v="AT"/>
            </relation></osm>"#,
        );
    let err = update_countries(&mut fixture.conn, &api, fixture.generation, true).unwrap_err();
    assert!(err.to_string().contains("more than one ISO3166-1 tag"));

    // France was processed first, but the transaction rolled back.
    assert_eq!(db::area_code(&fixture.conn, fixture.france, "iso3166_1").unwrap(), None);
}

#[test]
fn country_area_without_an_osm_identity_code_is_fatal() {
    let fixture = fixture();
    let mut conn = fixture.conn;
    db::delete_code(&conn, fixture.france, "osm_rel").unwrap();
    let err = update_countries(&mut conn, &standard_api(), fixture.generation, true).unwrap_err();
    assert!(err.to_string().contains("OSM identity"));
}
