use std::str::FromStr;

use anyhow::{bail, Result};
use approx::AbsDiffEq;
use geo::{unary_union, HasDimensions, MultiPolygon, Simplify, Validation};
use wkt::Wkt;

/// Coordinates matching to 7 decimal places are considered identical,
/// which tolerates floating-point and projection round-trip noise.
const COORD_TOLERANCE: f64 = 1e-7;

/// Decides whether an area's stored boundary and a freshly imported one
/// are the same boundary within tolerance. An absent or empty stored
/// geometry never matches: there is nothing to compare against.
pub fn boundaries_equal(existing: Option<&MultiPolygon<f64>>, new: &MultiPolygon<f64>) -> bool {
    let existing = match existing {
        Some(geometry) if !geometry.is_empty() => geometry,
        _ => {
            log::debug!("    in the current generation, that area was empty");
            return false;
        }
    };
    // Zero-tolerance simplification forces both operands into canonical form.
    let previous = existing.simplify(&0.0);
    let incoming = new.simplify(&0.0);
    if previous.abs_diff_eq(&incoming, COORD_TOLERANCE) {
        log::debug!("    the boundary was identical in the previous generation");
        true
    } else {
        log::debug!("    in the current generation, the boundary was different");
        false
    }
}

/// Returns a valid version of the multi-polygon, re-noding
/// self-intersections with a unary union where needed, or `None` if the
/// fix yields an empty geometry.
pub fn make_valid(geometry: MultiPolygon<f64>) -> Option<MultiPolygon<f64>> {
    if geometry.is_valid() {
        return Some(geometry);
    }
    let fixed: MultiPolygon<f64> = unary_union(geometry.iter());
    if fixed.is_empty() {
        None
    } else {
        Some(fixed)
    }
}

pub fn wkt_string_to_multipolygon(wkt_string: &str) -> Result<MultiPolygon<f64>> {
    let parsed: Wkt<f64> = Wkt::from_str(wkt_string)
        .map_err(|e| anyhow::anyhow!("unparseable WKT geometry: {}", e))?;
    match parsed {
        Wkt::MultiPolygon(mp) => Ok(mp.into()),
        Wkt::Polygon(p) => {
            let polygon: geo::Polygon<f64> = p.into();
            Ok(MultiPolygon::new(vec![polygon]))
        }
        _ => bail!("unsupported geometry type in WKT: {}", wkt_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(offset: f64) -> MultiPolygon<f64> {
        wkt_string_to_multipolygon(&format!(
            "POLYGON(({o} {o}, {o} 1.0, 1.0 1.0, 1.0 {o}, {o} {o}))",
            o = offset
        ))
        .unwrap()
    }

    #[test]
    fn identical_boundaries_are_equal() {
        assert!(boundaries_equal(Some(&square(0.0)), &square(0.0)));
    }

    #[test]
    fn sub_tolerance_noise_is_equal() {
        assert!(boundaries_equal(Some(&square(0.0)), &square(0.000000001)));
    }

    #[test]
    fn above_tolerance_shift_differs() {
        assert!(!boundaries_equal(Some(&square(0.0)), &square(0.001)));
    }

    #[test]
    fn absent_or_empty_existing_geometry_never_matches() {
        assert!(!boundaries_equal(None, &square(0.0)));
        let empty = MultiPolygon::<f64>::new(vec![]);
        assert!(!boundaries_equal(Some(&empty), &square(0.0)));
    }

    #[test]
    fn valid_geometry_is_returned_unchanged() {
        let geometry = square(0.0);
        let checked = make_valid(geometry.clone()).unwrap();
        assert_eq!(checked, geometry);
    }

    #[test]
    fn self_intersecting_geometry_is_fixed() {
        // A bow-tie: the exterior ring crosses itself.
        let bowtie = wkt_string_to_multipolygon(
            "POLYGON((0.0 0.0, 2.0 2.0, 2.0 0.0, 0.0 2.0, 0.0 0.0))",
        )
        .unwrap();
        assert!(!bowtie.is_valid());
        let fixed = make_valid(bowtie).unwrap();
        assert!(!fixed.is_empty());
        assert!(fixed.is_valid());
    }

    #[test]
    fn wkt_round_trip_accepts_polygon_and_multipolygon() {
        assert_eq!(wkt_string_to_multipolygon("POLYGON((0 0, 0 1, 1 1, 1 0, 0 0))").unwrap().0.len(), 1);
        assert_eq!(
            wkt_string_to_multipolygon(
                "MULTIPOLYGON(((0 0, 0 1, 1 1, 1 0, 0 0)), ((2 2, 2 3, 3 3, 3 2, 2 2)))"
            )
            .unwrap()
            .0
            .len(),
            2
        );
        assert!(wkt_string_to_multipolygon("POINT(1 1)").is_err());
        assert!(wkt_string_to_multipolygon("garbage").is_err());
    }
}
