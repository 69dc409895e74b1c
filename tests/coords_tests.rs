//! Coordinate codec unit tests

#[cfg(test)]
mod tests {
    use quarry_world::coords::{
        block_in_bounds, local_index, sections_in_radius, CoordError, SectionCoord,
        WORLD_EXTENT_XZ, WORLD_EXTENT_Y, WORLD_SECTIONS_Y,
    };

    // -----------------------------------------------------------------------
    // Parse / format
    // -----------------------------------------------------------------------

    #[test]
    fn parse_and_format_round_trip() {
        let coord = SectionCoord::parse("12:200:7").unwrap();
        assert_eq!(coord, SectionCoord::new(12, 200, 7).unwrap());
        assert_eq!(coord.to_string(), "12:200:7");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        for bad in [
            "", "1:2", "1:2:3:4", "a:2:3", "1:-2:3", " 1:2:3", "1:2:3 ", "1::3", "+1:2:3",
        ] {
            assert!(
                matches!(SectionCoord::parse(bad), Err(CoordError::Malformed(_))),
                "expected malformed for {bad:?}"
            );
        }
    }

    #[test]
    fn parse_rejects_out_of_bounds_components() {
        assert!(matches!(
            SectionCoord::parse("256:0:0"),
            Err(CoordError::OutOfBounds(..))
        ));
        assert!(matches!(
            SectionCoord::parse("0:0:8"),
            Err(CoordError::OutOfBounds(..))
        ));
    }

    // -----------------------------------------------------------------------
    // World ↔ section math
    // -----------------------------------------------------------------------

    #[test]
    fn from_world_floors_by_sixteen() {
        let coord = SectionCoord::from_world(17, 33, 15).unwrap();
        assert_eq!((coord.cx, coord.cz, coord.sy), (1, 0, 2));
        assert_eq!(coord.local_of(17, 33, 15), (1, 1, 15));
    }

    #[test]
    fn from_world_rejects_outside_extents() {
        assert!(SectionCoord::from_world(-1, 0, 0).is_err());
        assert!(SectionCoord::from_world(0, WORLD_EXTENT_Y, 0).is_err());
        assert!(SectionCoord::from_world(WORLD_EXTENT_XZ, 0, 0).is_err());
    }

    #[test]
    fn local_index_formula() {
        assert_eq!(local_index(0, 0, 0), 0);
        assert_eq!(local_index(5, 0, 0), 5);
        assert_eq!(local_index(0, 0, 3), 48);
        assert_eq!(local_index(0, 2, 0), 512);
        assert_eq!(local_index(15, 15, 15), 4095);
    }

    #[test]
    fn block_bounds() {
        assert!(block_in_bounds(0, 0, 0));
        assert!(block_in_bounds(4095, 127, 4095));
        assert!(!block_in_bounds(4096, 0, 0));
        assert!(!block_in_bounds(0, 128, 0));
        assert!(!block_in_bounds(0, -1, 0));
    }

    // -----------------------------------------------------------------------
    // Radius query
    // -----------------------------------------------------------------------

    #[test]
    fn radius_zero_is_one_full_column() {
        let centre = SectionCoord::new(10, 10, 3).unwrap();
        let sections = sections_in_radius(centre, 0);
        assert_eq!(sections.len(), WORLD_SECTIONS_Y as usize);
        assert!(sections.iter().all(|s| s.cx == 10 && s.cz == 10));
        // Full column, ordered by sy via the lexicographic tie-break.
        let sys: Vec<i32> = sections.iter().map(|s| s.sy).collect();
        assert_eq!(sys, (0..WORLD_SECTIONS_Y).collect::<Vec<_>>());
    }

    #[test]
    fn radius_uses_closed_disk_not_square() {
        let centre = SectionCoord::new(100, 100, 0).unwrap();
        let sections = sections_in_radius(centre, 2);
        // (102, 102) has distance sqrt(8) > 2 and must be excluded; (2, 0)
        // sits exactly on the boundary and must be included.
        assert!(!sections.iter().any(|s| s.cx == 102 && s.cz == 102));
        assert!(sections.iter().any(|s| s.cx == 102 && s.cz == 100));
        // 13 columns in the closed disk of radius 2.
        assert_eq!(sections.len(), 13 * WORLD_SECTIONS_Y as usize);
    }

    #[test]
    fn radius_ordering_is_manhattan_then_lexicographic() {
        let centre = SectionCoord::new(100, 100, 0).unwrap();
        let sections = sections_in_radius(centre, 2);
        let distances: Vec<i32> = sections
            .iter()
            .map(|s| (s.cx - 100).abs() + (s.cz - 100).abs())
            .collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        // The centre column comes first.
        assert_eq!(sections[0], SectionCoord::new(100, 100, 0).unwrap());
        // Equal-distance entries are ordered by (cx, cz, sy).
        let ring: Vec<(i32, i32)> = sections
            .iter()
            .filter(|s| (s.cx - 100).abs() + (s.cz - 100).abs() == 1 && s.sy == 0)
            .map(|s| (s.cx, s.cz))
            .collect();
        assert_eq!(ring, vec![(99, 100), (100, 99), (100, 101), (101, 100)]);
    }

    #[test]
    fn radius_clips_to_world_bounds() {
        let centre = SectionCoord::new(0, 0, 0).unwrap();
        let sections = sections_in_radius(centre, 3);
        assert!(sections.iter().all(|s| s.cx >= 0 && s.cz >= 0));
        assert!(!sections.is_empty());
    }
}
