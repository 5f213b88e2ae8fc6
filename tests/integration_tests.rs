use quadmap::{
    ConvertConfig, Converter, Entity, EntityKind, GroupingsLast, LatLon, LatLonRect, MapReader,
    MemberRef, MemorySource, QuadmapError, RawGrouping, RawMember, RawPoint, RawPolyline, Result,
};
use std::fs;
use tempfile::TempDir;

fn point(id: i64, lat: f64, lon: f64, tags: &[(&str, &str)]) -> Entity {
    Entity::Point(RawPoint {
        id,
        lat,
        lon,
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    })
}

fn polyline(id: i64, point_refs: &[i64], tags: &[(&str, &str)]) -> Entity {
    Entity::Polyline(RawPolyline {
        id,
        point_refs: point_refs.to_vec(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    })
}

fn member(kind: EntityKind, label: &str, id: i64) -> RawMember {
    RawMember {
        kind,
        label: label.to_string(),
        id,
    }
}

fn convert(entities: Vec<Entity>) -> (TempDir, quadmap::ConvertStats) {
    let dir = TempDir::new().unwrap();
    let mut source = MemorySource::new(entities);
    let stats = Converter::default()
        .convert(&mut source, dir.path())
        .unwrap();
    (dir, stats)
}

fn cafe_scenario() -> Vec<Entity> {
    vec![
        point(1, 10.0, 20.0, &[("amenity", "cafe")]),
        point(2, 10.001, 20.001, &[("amenity", "cafe")]),
        point(3, -5.0, 100.0, &[("amenity", "bar")]),
        polyline(50, &[1, 2], &[("highway", "residential")]),
    ]
}

#[test]
fn test_end_to_end_dense_id_and_geometry() {
    let (dir, stats) = convert(cafe_scenario());
    assert_eq!(stats.points, 3);
    assert_eq!(stats.polylines, 1);

    let mut reader = MapReader::open(dir.path()).unwrap();
    assert_eq!(reader.polyline_count(), 1);

    // The first polyline gets dense ID 1 and its geometry round-trips.
    let way = reader.polyline(1).unwrap();
    assert_eq!(
        way.points,
        vec![
            LatLon::from_degrees(10.0, 20.0).unwrap(),
            LatLon::from_degrees(10.001, 20.001).unwrap(),
        ]
    );
    assert!(matches!(
        reader.polyline(2),
        Err(QuadmapError::NotFound(_))
    ));
}

#[test]
fn test_end_to_end_geometry_byte_layout() {
    let (dir, _) = convert(cafe_scenario());

    let bytes = fs::read(dir.path().join("polylines.dat")).unwrap();
    assert_eq!(&bytes[..15], b"PLIN:1:      1:");

    // Record: point count, first point packed in full, then one signed
    // varint delta pair for the second point.
    let p1 = LatLon::from_degrees(10.0, 20.0).unwrap();
    let p2 = LatLon::from_degrees(10.001, 20.001).unwrap();
    assert_eq!(bytes[15], 2);
    assert_eq!(&bytes[16..24], &p1.packed().to_le_bytes());
    let mut cursor = std::io::Cursor::new(&bytes[24..]);
    let dlat = quadmap::varint::read_svarint(&mut cursor).unwrap();
    let dlon = quadmap::varint::read_svarint(&mut cursor).unwrap();
    assert_eq!(dlat, (p2.lat - p1.lat) as i64);
    assert_eq!(dlon, (p2.lon - p1.lon) as i64);
    assert_eq!(cursor.position() as usize, bytes.len() - 24);
}

#[test]
fn test_end_to_end_remainder_bucket_values() {
    let (dir, _) = convert(cafe_scenario());
    let reader = MapReader::open(dir.path()).unwrap();

    // Three tagged points are far below the dedicated threshold, so the
    // amenity key has a remainder bucket only, values recoverable.
    assert!(reader
        .dedicated_values(EntityKind::Point, "amenity")
        .is_empty());
    let mut found: Vec<(LatLon, String)> = reader
        .query_points("amenity", None, &LatLonRect::full())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap()
        .into_iter()
        .map(|p| (p.coord, p.value))
        .collect();
    found.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.lat.cmp(&b.0.lat)));
    assert_eq!(
        found,
        vec![
            (
                LatLon::from_degrees(-5.0, 100.0).unwrap(),
                "bar".to_string()
            ),
            (
                LatLon::from_degrees(10.0, 20.0).unwrap(),
                "cafe".to_string()
            ),
            (
                LatLon::from_degrees(10.001, 20.001).unwrap(),
                "cafe".to_string()
            ),
        ]
    );
}

#[test]
fn test_end_to_end_region_query_isolates_point() {
    let (dir, _) = convert(cafe_scenario());
    let reader = MapReader::open(dir.path()).unwrap();

    let around_p3 = LatLonRect::from_points(
        LatLon::from_degrees(-5.1, 99.9).unwrap(),
        LatLon::from_degrees(-4.9, 100.1).unwrap(),
    );
    let found: Vec<_> = reader
        .query_points("amenity", None, &around_p3)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].coord, LatLon::from_degrees(-5.0, 100.0).unwrap());
    assert_eq!(found[0].value, "bar");
}

#[test]
fn test_end_to_end_value_filtered_query() {
    let (dir, _) = convert(cafe_scenario());
    let reader = MapReader::open(dir.path()).unwrap();

    let cafes: Vec<_> = reader
        .query_points("amenity", Some("cafe"), &LatLonRect::full())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(cafes.len(), 2);
    assert!(cafes.iter().all(|p| p.value == "cafe"));

    let pubs: Vec<_> = reader
        .query_points("amenity", Some("pub"), &LatLonRect::full())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert!(pubs.is_empty());
}

#[test]
fn test_polyline_tag_query() {
    let (dir, _) = convert(cafe_scenario());
    let reader = MapReader::open(dir.path()).unwrap();

    let nearby = LatLonRect::from_points(
        LatLon::from_degrees(9.9, 19.9).unwrap(),
        LatLon::from_degrees(10.1, 20.1).unwrap(),
    );
    let hits: Vec<_> = reader
        .query_polylines("highway", None, &nearby)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 1);
    assert_eq!(hits[0].value, "residential");
}

#[test]
fn test_polyline_tag_query_prunes_distant_subtrees() {
    // A split threshold of two forces the tree to separate the two
    // polylines into different cells, so a distant query prunes.
    let entities = vec![
        point(1, 10.0, 20.0, &[]),
        point(2, 10.001, 20.001, &[]),
        point(3, -40.0, -60.0, &[]),
        point(4, -40.001, -60.001, &[]),
        polyline(50, &[1, 2], &[("highway", "residential")]),
        polyline(51, &[3, 4], &[("highway", "residential")]),
    ];
    let config = ConvertConfig {
        polyline_tree: quadmap::QuadtreeParams::new(16, 2),
        ..ConvertConfig::default()
    };
    let dir = TempDir::new().unwrap();
    let mut source = MemorySource::new(entities);
    Converter::new(config.clone())
        .convert(&mut source, dir.path())
        .unwrap();

    let reader = MapReader::open_with_config(dir.path(), config).unwrap();
    let near_first = LatLonRect::from_points(
        LatLon::from_degrees(9.9, 19.9).unwrap(),
        LatLon::from_degrees(10.1, 20.1).unwrap(),
    );
    let hits: Vec<_> = reader
        .query_polylines("highway", None, &near_first)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 1);

    let near_second = LatLonRect::from_points(
        LatLon::from_degrees(-40.1, -60.1).unwrap(),
        LatLon::from_degrees(-39.9, -59.9).unwrap(),
    );
    let hits: Vec<_> = reader
        .query_polylines("highway", None, &near_second)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 2);
}

#[test]
fn test_grouping_drop_writes_serialized_count() {
    let mut entities = cafe_scenario();
    entities.push(Entity::Grouping(RawGrouping {
        id: 700,
        members: vec![
            member(EntityKind::Point, "stop", 1),
            member(EntityKind::Point, "stop", 999), // absent from the dataset
            member(EntityKind::Polyline, "route", 50),
        ],
        tags: vec![("route".to_string(), "bus".to_string())],
    }));
    let (dir, stats) = convert(entities);
    assert_eq!(stats.groupings, 1);
    assert_eq!(stats.dropped_members, 1);

    // The on-disk member count field must equal the serialized member
    // count, not the original three.
    let bytes = fs::read(dir.path().join("groupings.dat")).unwrap();
    assert_eq!(bytes[15], 2);

    let mut reader = MapReader::open(dir.path()).unwrap();
    let grouping = reader.grouping(1).unwrap();
    assert_eq!(grouping.members.len(), 2);
    assert_eq!(grouping.members[0].label, "stop");
    assert_eq!(
        grouping.members[0].target,
        MemberRef::Point(LatLon::from_degrees(10.0, 20.0).unwrap())
    );
    assert_eq!(grouping.members[1].label, "route");
    assert_eq!(grouping.members[1].target, MemberRef::Polyline(1));
}

#[test]
fn test_grouping_tag_query_uses_member_rectangles() {
    let mut entities = cafe_scenario();
    entities.push(Entity::Grouping(RawGrouping {
        id: 700,
        members: vec![member(EntityKind::Polyline, "route", 50)],
        tags: vec![("route".to_string(), "bus".to_string())],
    }));
    let (dir, _) = convert(entities);
    let reader = MapReader::open(dir.path()).unwrap();

    // The grouping's rectangle is the union of its members', so it is
    // findable around the polyline it contains.
    let nearby = LatLonRect::from_points(
        LatLon::from_degrees(9.9, 19.9).unwrap(),
        LatLon::from_degrees(10.1, 20.1).unwrap(),
    );
    let hits: Vec<_> = reader
        .query_groupings("route", Some("bus"), &nearby)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 1);
}

#[test]
fn test_groupings_last_wrapper_enables_forward_references() {
    // The grouping arrives first in stream order and references entities
    // that only appear later; the replay wrapper reorders it to the end.
    let mut entities = vec![Entity::Grouping(RawGrouping {
        id: 700,
        members: vec![
            member(EntityKind::Point, "stop", 3),
            member(EntityKind::Polyline, "route", 50),
        ],
        tags: vec![("route".to_string(), "bus".to_string())],
    })];
    entities.extend(cafe_scenario());

    let dir = TempDir::new().unwrap();
    let mut source = GroupingsLast::new(
        MemorySource::new(entities),
        dir.path().join("extract.groupings"),
    );
    let db_dir = dir.path().join("db");
    let stats = Converter::default().convert(&mut source, &db_dir).unwrap();
    assert_eq!(stats.groupings, 1);
    assert_eq!(stats.dropped_members, 0);

    let mut reader = MapReader::open(&db_dir).unwrap();
    let grouping = reader.grouping(1).unwrap();
    assert_eq!(grouping.members.len(), 2);
}

#[test]
fn test_source_ids_roundtrip() {
    let entities = vec![
        point(1, 1.0, 1.0, &[]),
        point(2, 1.0, 1.1, &[]),
        polyline(100, &[1, 2], &[]),
        polyline(250, &[2, 1], &[]),
        polyline(251, &[1], &[]),
    ];
    let (dir, _) = convert(entities);
    let reader = MapReader::open(dir.path()).unwrap();

    assert_eq!(
        reader.source_ids(EntityKind::Polyline).unwrap(),
        vec![100, 250, 251]
    );
    assert!(matches!(
        reader.source_ids(EntityKind::Point),
        Err(QuadmapError::NotFound(_))
    ));
}

#[test]
fn test_sequential_scan() {
    let entities = vec![
        point(1, 1.0, 1.0, &[]),
        point(2, 2.0, 2.0, &[]),
        point(3, 3.0, 3.0, &[]),
        polyline(10, &[1, 2], &[]),
        polyline(11, &[2, 3], &[]),
        polyline(12, &[3], &[]),
    ];
    let (dir, _) = convert(entities);
    let reader = MapReader::open(dir.path()).unwrap();

    let scanned: Vec<(u32, usize)> = reader
        .polylines_scan()
        .unwrap()
        .map(|r| r.map(|(id, way)| (id, way.points.len())))
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(scanned, vec![(1, 2), (2, 2), (3, 1)]);
}

#[test]
fn test_dedicated_bucket_split() {
    let mut entities = Vec::new();
    // Six cafes exceed the dedicated threshold of five; one bar does not.
    for i in 0..6 {
        entities.push(point(
            i,
            10.0 + i as f64 * 0.001,
            20.0,
            &[("amenity", "cafe")],
        ));
    }
    entities.push(point(100, 10.0, 21.0, &[("amenity", "bar")]));

    let config = ConvertConfig {
        dedicated_value_threshold: 5,
        ..ConvertConfig::default()
    };
    let dir = TempDir::new().unwrap();
    let mut source = MemorySource::new(entities);
    Converter::new(config.clone())
        .convert(&mut source, dir.path())
        .unwrap();

    assert!(dir
        .path()
        .join("amenity/point.tag.amenity=cafe.qtr")
        .exists());
    assert!(dir.path().join("amenity/point.tag.amenity.qtr").exists());

    let reader = MapReader::open_with_config(dir.path(), config).unwrap();
    assert_eq!(
        reader.dedicated_values(EntityKind::Point, "amenity"),
        vec!["cafe"]
    );

    // Value-filtered queries hit the dedicated file; keyless ones merge
    // dedicated and remainder buckets.
    let cafes: Vec<_> = reader
        .query_points("amenity", Some("cafe"), &LatLonRect::full())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(cafes.len(), 6);
    let all: Vec<_> = reader
        .query_points("amenity", None, &LatLonRect::full())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(all.len(), 7);
}

#[test]
fn test_interned_remainder_values() {
    let mut entities = Vec::new();
    for i in 0..4 {
        entities.push(point(i, 1.0 + i as f64, 2.0, &[("surface", "gravel")]));
    }
    let config = ConvertConfig {
        interned_remainder_threshold: 2,
        ..ConvertConfig::default()
    };
    let dir = TempDir::new().unwrap();
    let mut source = MemorySource::new(entities);
    Converter::new(config.clone())
        .convert(&mut source, dir.path())
        .unwrap();

    // Four remainder items exceed the interning threshold, so the values
    // live in a string table instead of inline.
    assert!(dir
        .path()
        .join("surface/point.tag.surface.strings")
        .exists());

    let reader = MapReader::open_with_config(dir.path(), config).unwrap();
    let found: Vec<_> = reader
        .query_points("surface", None, &LatLonRect::full())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(found.len(), 4);
    assert!(found.iter().all(|p| p.value == "gravel"));
}

#[test]
fn test_unknown_key_is_empty_not_error() {
    let (dir, _) = convert(cafe_scenario());
    let reader = MapReader::open(dir.path()).unwrap();
    let found: Vec<_> = reader
        .query_points("landuse", None, &LatLonRect::full())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert!(found.is_empty());
}

#[test]
fn test_unresolved_polyline_reference_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut source = MemorySource::new(vec![
        point(1, 1.0, 1.0, &[]),
        polyline(10, &[1, 42], &[]),
    ]);
    let err = Converter::default()
        .convert(&mut source, dir.path())
        .unwrap_err();
    assert!(matches!(
        err,
        QuadmapError::UnresolvedPointRef {
            polyline: 10,
            point: 42
        }
    ));
}

#[test]
fn test_out_of_range_coordinate_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut source = MemorySource::new(vec![point(1, 300.0, 0.0, &[])]);
    let err = Converter::default()
        .convert(&mut source, dir.path())
        .unwrap_err();
    assert!(matches!(err, QuadmapError::CoordinateRange { .. }));
}

#[test]
fn test_header_counts_match_contents() {
    let (dir, stats) = convert(cafe_scenario());
    for name in ["polylines.dat", "polylines.offsets", "source_ids.polylines.dat"] {
        let bytes = fs::read(dir.path().join(name)).unwrap();
        let count = std::str::from_utf8(&bytes[7..14]).unwrap().trim().to_string();
        assert_eq!(count.parse::<u64>().unwrap(), stats.polylines, "{name}");
    }
}

#[test]
fn test_uppercase_tag_value_survives_roundtrip() {
    let entities = vec![point(1, 1.0, 2.0, &[("name", "Blue Cafe")])];
    let (dir, _) = convert(entities);
    let reader = MapReader::open(dir.path()).unwrap();
    let found: Vec<_> = reader
        .query_points("name", None, &LatLonRect::full())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, "Blue Cafe");
}
