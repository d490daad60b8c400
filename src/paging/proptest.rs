//! Property-Based Tests for Page Geometry
//!
//! # Test Properties
//!
//! 1. **Determinism**: the same tile always resolves to the same page
//! 2. **Containment**: a page's tile range contains every tile mapped to it
//! 3. **Monotonicity**: doubling the tile span never shrinks pages or page counts

#![cfg(test)]

use proptest::prelude::*;

use super::pyramid::{pages_for, tiles_per_page, PagePyramid};
use crate::domain::layer::GridSubset;

// =============================================================================
// Property Strategies
// =============================================================================

/// Doubling gridset: tiles at zoom 0 and the deepest zoom level
fn gridset_strategy() -> impl Strategy<Value = (i64, i64, u32)> {
    (1i64..=4, 1i64..=4, 0u32..=14)
}

/// A tile inside a doubling gridset, as fractions of the level extent
fn tile_strategy() -> impl Strategy<Value = (f64, f64, f64)> {
    (0.0f64..1.0, 0.0f64..1.0, 0.0f64..1.0)
}

fn pick_tile(
    wide: i64,
    high: i64,
    zoom_stop: u32,
    (fx, fy, fz): (f64, f64, f64),
) -> (i64, i64, u32) {
    let z = ((zoom_stop + 1) as f64 * fz) as u32;
    let z = z.min(zoom_stop);
    let scale = 1i64 << z;
    let x = ((wide * scale) as f64 * fx) as i64;
    let y = ((high * scale) as f64 * fy) as i64;
    (x.min(wide * scale - 1), y.min(high * scale - 1), z)
}

// =============================================================================
// Mapping Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: page lookup is deterministic and the page range covers the tile.
    #[test]
    fn prop_page_mapping_round_trip(
        (wide, high, zoom_stop) in gridset_strategy(),
        fractions in tile_strategy(),
    ) {
        let pyramid = PagePyramid::new(
            "layer",
            &GridSubset::doubling("grid", wide, high, 0, zoom_stop),
        )?;
        let (x, y, z) = pick_tile(wide, high, zoom_stop, fractions);

        let first = pyramid.page_index_for(x, y, z)?;
        let second = pyramid.page_for(x, y, z)?.index();
        prop_assert_eq!(first, second);

        let coverage = pyramid.to_grid_coverage(first)?;
        let level = coverage.level(z).copied();
        prop_assert!(level.is_some());
        prop_assert!(level.is_some_and(|l| l.contains(x, y)));
        prop_assert_eq!(coverage.populated().count(), 1);
    }

    /// Property: every page index of a level maps back inside the level coverage.
    #[test]
    fn prop_pages_tile_the_level(
        (wide, high, zoom_stop) in gridset_strategy(),
    ) {
        let pyramid = PagePyramid::new(
            "layer",
            &GridSubset::doubling("grid", wide, high, 0, zoom_stop),
        )?;
        let level = *pyramid.level(zoom_stop).unwrap();
        let last = super::page::PageIndex::new(
            (level.pages_x - 1) as u32,
            (level.pages_y - 1) as u32,
            zoom_stop,
        );
        let coverage = pyramid.to_grid_coverage(last)?;
        let range = coverage.level(zoom_stop).copied().unwrap();
        prop_assert_eq!(range.max_x, level.coverage.max_x);
        prop_assert_eq!(range.max_y, level.coverage.max_y);
        prop_assert!(range.min_x <= range.max_x);
        prop_assert!(range.min_y <= range.max_y);
    }
}

// =============================================================================
// Size Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Property: a wider axis never gets smaller pages or fewer pages.
    #[test]
    fn prop_page_size_monotonic_on_doubling(span in 1u64..(1 << 24)) {
        let tpp = tiles_per_page(span);
        let tpp_doubled = tiles_per_page(span * 2);
        prop_assert!(tpp_doubled >= tpp);
        prop_assert!(pages_for(span * 2, tpp_doubled) >= pages_for(span, tpp));
    }

    /// Property: pages always cover the span with less than one page of slack.
    #[test]
    fn prop_pages_cover_span(span in 1u64..(1 << 30)) {
        let tpp = tiles_per_page(span);
        let pages = pages_for(span, tpp);
        prop_assert!(pages * tpp >= span);
        prop_assert!((pages - 1) * tpp < span);
    }
}

#[test]
fn test_deeper_levels_have_larger_pages() {
    let pyramid = PagePyramid::new("layer", &GridSubset::doubling("grid", 2, 1, 0, 30)).unwrap();
    for pair in pyramid.levels().windows(2) {
        assert!(pair[1].tiles_per_page_x >= pair[0].tiles_per_page_x);
        assert!(pair[1].pages_x >= pair[0].pages_x);
        assert!(pair[1].pages_per_level() >= pair[0].pages_per_level());
    }
}
