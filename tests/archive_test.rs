use std::io::Cursor;

use vdbio::compression::{
    COMPRESS_ACTIVE_MASK, COMPRESS_NONE, COMPRESS_ZIP, MASK_AND_NO_INACTIVE_VALS,
};
use vdbio::grid::{META_FILE_BBOX_MAX, META_FILE_BBOX_MIN, META_FILE_COMPRESSION,
    META_FILE_DELAYED_LOAD};
use vdbio::metadata::MetaValue;
use vdbio::stream::{set_stream_metadata, StreamMetadata};
use vdbio::{
    AnyGrid, Archive, Coord, FloatGrid, GridClass, GridDescriptor, InStream, Int32Grid, MetaMap,
    OutStream, Vec3SGrid,
};

fn write_archive(archive: &mut Archive, grids: &[&dyn AnyGrid], meta: &MetaMap) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    let mut os = OutStream::new(&mut buf);
    archive.write(&mut os, grids, true, meta).unwrap();
    drop(os);
    buf.into_inner()
}

fn read_archive(bytes: &[u8]) -> (MetaMap, Vec<Box<dyn AnyGrid>>) {
    let mut archive = Archive::new();
    let mut is = InStream::new(bytes);
    archive.read(&mut is).unwrap()
}

fn sample_fog_grid() -> FloatGrid {
    let mut grid = FloatGrid::new(0.0);
    grid.set_name("density");
    grid.set_grid_class(GridClass::FogVolume);
    grid.set_value(Coord::new(0, 0, 0), 0.25).unwrap();
    grid.set_value(Coord::new(3, 4, 5), 0.5).unwrap();
    grid.set_value(Coord::new(-10, 2, 40), 1.0).unwrap();
    grid
}

#[test]
fn fog_volume_round_trip() {
    vdbio::initialize();
    let grid = sample_fog_grid();

    let mut file_meta = MetaMap::new();
    file_meta.insert_meta("creator", MetaValue::String("smoke solver".into()));

    let mut archive = Archive::new();
    archive.set_compression(COMPRESS_ZIP | COMPRESS_ACTIVE_MASK);
    let bytes = write_archive(&mut archive, &[&grid], &file_meta);

    let (meta_out, grids) = read_archive(&bytes);
    assert_eq!(meta_out, file_meta);
    assert_eq!(grids.len(), 1);

    let out = grids[0].as_any().downcast_ref::<FloatGrid>().unwrap();
    assert_eq!(out.name(), "density");
    assert_eq!(
        out.meta().get("class").and_then(|v| v.as_string()),
        Some("fog volume")
    );
    // Zip is masked off for fog volumes, leaving only the value mask.
    assert_eq!(
        out.meta().get(META_FILE_COMPRESSION).and_then(|v| v.as_string()),
        Some("active values")
    );
    assert!(out.meta().get(META_FILE_BBOX_MIN).is_some());
    assert!(out.meta().get(META_FILE_BBOX_MAX).is_some());
    // The delayed-load record never survives a normal read.
    assert!(out.meta().get(META_FILE_DELAYED_LOAD).is_none());

    assert_eq!(out.value(Coord::new(0, 0, 0)).unwrap(), 0.25);
    assert_eq!(out.value(Coord::new(3, 4, 5)).unwrap(), 0.5);
    assert_eq!(out.value(Coord::new(-10, 2, 40)).unwrap(), 1.0);
    assert_eq!(out.value(Coord::new(7, 7, 7)).unwrap(), 0.0);
    assert_eq!(out.active_voxel_count(), 3);
    assert_eq!(*out.transform(), *grid.transform());
}

#[test]
fn empty_grid_list_round_trips() {
    vdbio::initialize();
    let mut file_meta = MetaMap::new();
    file_meta.insert_meta("purpose", MetaValue::String("empty".into()));

    let mut archive = Archive::new();
    let bytes = write_archive(&mut archive, &[], &file_meta);
    let (meta_out, grids) = read_archive(&bytes);
    assert_eq!(meta_out, file_meta);
    assert!(grids.is_empty());
}

#[test]
fn mixed_value_types_round_trip() {
    vdbio::initialize();
    let mut float_grid = FloatGrid::new(1.5);
    float_grid.set_name("f");
    float_grid.set_value(Coord::new(1, 1, 1), 8.0).unwrap();

    let mut int_grid = Int32Grid::new(-1);
    int_grid.set_name("i");
    int_grid.set_value(Coord::new(9, 9, 9), 1234).unwrap();

    let mut vec_grid = Vec3SGrid::new([0.0; 3]);
    vec_grid.set_name("v");
    vec_grid
        .set_value(Coord::new(2, 4, 6), [1.0, 2.0, 3.0])
        .unwrap();

    let mut archive = Archive::new();
    let bytes = write_archive(
        &mut archive,
        &[&float_grid, &int_grid, &vec_grid],
        &MetaMap::new(),
    );
    let (_, grids) = read_archive(&bytes);
    assert_eq!(grids.len(), 3);

    let f = grids[0].as_any().downcast_ref::<FloatGrid>().unwrap();
    assert_eq!(f.tree().background(), 1.5);
    assert_eq!(f.value(Coord::new(1, 1, 1)).unwrap(), 8.0);

    let i = grids[1].as_any().downcast_ref::<Int32Grid>().unwrap();
    assert_eq!(i.tree().background(), -1);
    assert_eq!(i.value(Coord::new(9, 9, 9)).unwrap(), 1234);

    let v = grids[2].as_any().downcast_ref::<Vec3SGrid>().unwrap();
    assert_eq!(v.value(Coord::new(2, 4, 6)).unwrap(), [1.0, 2.0, 3.0]);
}

#[test]
fn compression_variants_round_trip() {
    vdbio::initialize();
    for flags in [
        COMPRESS_NONE,
        COMPRESS_ACTIVE_MASK,
        COMPRESS_ZIP,
        COMPRESS_ZIP | COMPRESS_ACTIVE_MASK,
    ] {
        let mut grid = FloatGrid::new(0.0);
        grid.set_name("g");
        for i in 0..64 {
            grid.set_value(Coord::new(i, i * 2, -i), i as f32).unwrap();
        }

        let mut archive = Archive::new();
        archive.set_compression(flags);
        let bytes = write_archive(&mut archive, &[&grid], &MetaMap::new());
        let (_, grids) = read_archive(&bytes);
        let out = grids[0].as_any().downcast_ref::<FloatGrid>().unwrap();
        for i in 0..64 {
            assert_eq!(
                out.value(Coord::new(i, i * 2, -i)).unwrap(),
                i as f32,
                "flags {flags:#x}"
            );
        }
    }
}

#[test]
fn half_float_round_trip() {
    vdbio::initialize();
    let mut grid = FloatGrid::new(0.0);
    grid.set_name("sdf");
    grid.set_save_float_as_half(true);
    // Values exactly representable in 16 bits.
    grid.set_value(Coord::new(0, 0, 0), 0.5).unwrap();
    grid.set_value(Coord::new(5, 5, 5), -4.0).unwrap();

    let mut archive = Archive::new();
    let bytes = write_archive(&mut archive, &[&grid], &MetaMap::new());
    let (_, grids) = read_archive(&bytes);
    let out = grids[0].as_any().downcast_ref::<FloatGrid>().unwrap();
    assert!(out.save_float_as_half());
    assert_eq!(out.value(Coord::new(0, 0, 0)).unwrap(), 0.5);
    assert_eq!(out.value(Coord::new(5, 5, 5)).unwrap(), -4.0);
}

#[test]
fn colliding_and_empty_names_get_unique_descriptors() {
    vdbio::initialize();
    let mut a = FloatGrid::new(0.0);
    a.set_name("grid");
    a.set_value(Coord::new(0, 0, 0), 1.0).unwrap();
    let mut b = FloatGrid::new(0.0);
    b.set_name("grid");
    b.set_value(Coord::new(0, 0, 0), 2.0).unwrap();
    let c = FloatGrid::new(0.0); // unnamed
    c.set_value(Coord::new(0, 0, 0), 3.0).unwrap();

    let mut archive = Archive::new();
    let bytes = write_archive(&mut archive, &[&a, &b, &c], &MetaMap::new());

    // Walk the descriptors by hand to observe the unique names.
    let mut reader = Archive::new();
    let mut is = InStream::new(bytes.as_slice());
    reader.read_header(&mut is).unwrap();
    let mut sm = StreamMetadata::new();
    sm.set_file_version(reader.file_version());
    set_stream_metadata(&mut is, sm, true);
    MetaMap::read_meta(&mut is).unwrap();
    let count = Archive::read_grid_count(&mut is).unwrap();
    assert_eq!(count, 3);

    let mut names = Vec::new();
    for _ in 0..count {
        let (gd, mut grid) = GridDescriptor::read(&mut is).unwrap();
        reader.read_grid(grid.as_mut(), &gd, &mut is).unwrap();
        names.push(gd.unique_name().to_owned());
        assert_eq!(gd.grid_name(), GridDescriptor::strip_suffix(gd.unique_name()));
    }
    assert_eq!(names[0], GridDescriptor::add_suffix("grid", 0));
    assert_eq!(names[1], GridDescriptor::add_suffix("grid", 1));
    assert_eq!(names[2], GridDescriptor::add_suffix("", 0));

    // The grids themselves keep their original name metadata.
    let (_, grids) = read_archive(&bytes);
    assert_eq!(grids[0].name(), "grid");
    assert_eq!(grids[1].name(), "grid");
    assert_eq!(grids[2].name(), "");
    let g1 = grids[1].as_any().downcast_ref::<FloatGrid>().unwrap();
    assert_eq!(g1.value(Coord::new(0, 0, 0)).unwrap(), 2.0);
}

#[test]
fn instanced_grids_share_one_tree_after_round_trip() {
    vdbio::initialize();
    let mut parent = Vec3SGrid::new([0.0; 3]);
    parent.set_name("velocity");
    parent
        .set_value(Coord::new(1, 2, 3), [4.0, 5.0, 6.0])
        .unwrap();

    let mut child = Vec3SGrid::from_tree(parent.tree_handle());
    child.set_name("velocity_copy");
    assert_eq!(parent.tree_ptr(), child.tree_ptr());

    let mut archive = Archive::new();
    let bytes = write_archive(&mut archive, &[&parent, &child], &MetaMap::new());

    // The second descriptor names the first as its instance parent.
    {
        let mut reader = Archive::new();
        let mut is = InStream::new(bytes.as_slice());
        reader.read_header(&mut is).unwrap();
        let mut sm = StreamMetadata::new();
        sm.set_file_version(reader.file_version());
        set_stream_metadata(&mut is, sm, true);
        MetaMap::read_meta(&mut is).unwrap();
        Archive::read_grid_count(&mut is).unwrap();

        let (gd0, mut g0) = GridDescriptor::read(&mut is).unwrap();
        assert!(!gd0.is_instance());
        reader.read_grid(g0.as_mut(), &gd0, &mut is).unwrap();

        let (gd1, mut g1) = GridDescriptor::read(&mut is).unwrap();
        assert!(gd1.is_instance());
        assert_eq!(gd1.instance_parent_name(), gd0.unique_name());
        reader.read_grid(g1.as_mut(), &gd1, &mut is).unwrap();
    }

    let (_, grids) = read_archive(&bytes);
    assert_eq!(grids.len(), 2);
    assert_eq!(grids[0].tree_ptr(), grids[1].tree_ptr());
    let out = grids[1].as_any().downcast_ref::<Vec3SGrid>().unwrap();
    assert_eq!(out.value(Coord::new(1, 2, 3)).unwrap(), [4.0, 5.0, 6.0]);

    // With instancing disabled on read, the trees are deep copies.
    let mut reader = Archive::new();
    reader.set_instancing_enabled(false);
    let mut is = InStream::new(bytes.as_slice());
    let (_, grids) = reader.read(&mut is).unwrap();
    assert_ne!(grids[0].tree_ptr(), grids[1].tree_ptr());
    let out = grids[1].as_any().downcast_ref::<Vec3SGrid>().unwrap();
    assert_eq!(out.value(Coord::new(1, 2, 3)).unwrap(), [4.0, 5.0, 6.0]);
}

#[test]
fn instancing_disabled_on_write_stores_two_trees() {
    vdbio::initialize();
    let mut parent = FloatGrid::new(0.0);
    parent.set_name("a");
    parent.set_value(Coord::new(0, 0, 0), 1.0).unwrap();
    let mut child = FloatGrid::from_tree(parent.tree_handle());
    child.set_name("b");

    let mut archive = Archive::new();
    archive.set_instancing_enabled(false);
    let bytes = write_archive(&mut archive, &[&parent, &child], &MetaMap::new());

    let (_, grids) = read_archive(&bytes);
    assert_ne!(grids[0].tree_ptr(), grids[1].tree_ptr());
    let b = grids[1].as_any().downcast_ref::<FloatGrid>().unwrap();
    assert_eq!(b.value(Coord::new(0, 0, 0)).unwrap(), 1.0);
}

#[test]
fn rewrite_is_byte_identical_after_uuid() {
    vdbio::initialize();
    let grid = sample_fog_grid();
    let mut file_meta = MetaMap::new();
    file_meta.insert_meta("creator", MetaValue::String("solver".into()));

    let mut archive = Archive::new();
    let first = write_archive(&mut archive, &[&grid], &file_meta);

    let (meta_out, grids) = read_archive(&first);
    let grid_refs: Vec<&dyn AnyGrid> = grids.iter().map(|g| g.as_ref()).collect();
    let mut archive2 = Archive::new();
    let second = write_archive(&mut archive2, &grid_refs, &meta_out);

    // Bytes 21..57 hold the regenerated UUID; everything after matches.
    const UUID_END: usize = 57;
    assert_eq!(first[..21], second[..21]);
    assert_ne!(first[21..UUID_END], second[21..UUID_END]);
    assert_eq!(first[UUID_END..], second[UUID_END..]);
}

#[test]
fn seekable_offsets_are_patched_and_ordered() {
    vdbio::initialize();
    let grid = sample_fog_grid();
    let mut archive = Archive::new();
    let bytes = write_archive(&mut archive, &[&grid], &MetaMap::new());

    let mut reader = Archive::new();
    let mut is = InStream::new(bytes.as_slice());
    reader.read_header(&mut is).unwrap();
    assert!(reader.input_has_grid_offsets());
    let mut sm = StreamMetadata::new();
    sm.set_file_version(reader.file_version());
    set_stream_metadata(&mut is, sm, true);
    MetaMap::read_meta(&mut is).unwrap();
    Archive::read_grid_count(&mut is).unwrap();

    let (gd, _) = GridDescriptor::read(&mut is).unwrap();
    assert!(gd.grid_pos() > 0);
    assert!(gd.block_pos() > gd.grid_pos());
    assert!(gd.end_pos() > gd.block_pos());
    assert_eq!(gd.end_pos(), bytes.len() as u64);
}

#[test]
fn non_seekable_write_zeroes_offsets() {
    vdbio::initialize();
    let grid = sample_fog_grid();

    let mut buf = Cursor::new(Vec::new());
    let mut os = OutStream::new(&mut buf);
    let mut archive = Archive::new();
    archive.write(&mut os, &[&grid], false, &MetaMap::new()).unwrap();
    drop(os);
    let bytes = buf.into_inner();

    let mut reader = Archive::new();
    let mut is = InStream::new(bytes.as_slice());
    reader.read_header(&mut is).unwrap();
    assert!(!reader.input_has_grid_offsets());
    let mut sm = StreamMetadata::new();
    sm.set_file_version(reader.file_version());
    set_stream_metadata(&mut is, sm, true);
    MetaMap::read_meta(&mut is).unwrap();
    Archive::read_grid_count(&mut is).unwrap();

    let (gd, mut grid_out) = GridDescriptor::read(&mut is).unwrap();
    assert_eq!(gd.grid_pos(), 0);
    assert_eq!(gd.block_pos(), 0);
    assert_eq!(gd.end_pos(), 0);

    // Sequential reading still works without offsets.
    reader.read_grid(grid_out.as_mut(), &gd, &mut is).unwrap();
    let out = grid_out.as_any().downcast_ref::<FloatGrid>().unwrap();
    assert_eq!(out.value(Coord::new(3, 4, 5)).unwrap(), 0.5);
}

#[test]
fn clipped_read_drops_voxels_outside_box() {
    vdbio::initialize();
    let grid = sample_fog_grid();
    let mut archive = Archive::new();
    let bytes = write_archive(&mut archive, &[&grid], &MetaMap::new());

    let mut reader = Archive::new();
    let mut is = InStream::new(bytes.as_slice());
    let clip = vdbio::Clip::Index(vdbio::CoordBBox::new(
        Coord::new(0, 0, 0),
        Coord::new(7, 7, 7),
    ));
    let (_, grids) = reader.read_with_clip(&mut is, &clip).unwrap();
    let out = grids[0].as_any().downcast_ref::<FloatGrid>().unwrap();
    assert_eq!(out.value(Coord::new(3, 4, 5)).unwrap(), 0.5);
    // Outside the clip region only the background remains.
    assert_eq!(out.value(Coord::new(-10, 2, 40)).unwrap(), 0.0);
}

#[test]
fn delayed_load_sizes_match_on_disk_records() {
    vdbio::initialize();
    // Unknown class keeps zip enabled, so per-leaf sizes are recorded.
    let mut grid = FloatGrid::new(0.0);
    grid.set_name("data");
    for i in 0..32 {
        grid.set_value(Coord::new(i, 0, 0), (i * 3) as f32).unwrap();
        grid.set_value(Coord::new(0, 40 + i, 0), 0.125).unwrap();
    }

    let mut archive = Archive::new();
    archive.set_compression(COMPRESS_ZIP | COMPRESS_ACTIVE_MASK);
    let bytes = write_archive(&mut archive, &[&grid], &MetaMap::new());

    // Retain the delayed-load record via the test hook.
    let mut reader = Archive::new();
    let mut is = InStream::new(bytes.as_slice());
    let mut sm = StreamMetadata::new();
    sm.set_test(1);
    set_stream_metadata(&mut is, sm, false);
    let (_, grids) = reader.read(&mut is).unwrap();
    let out = grids[0].as_any().downcast_ref::<FloatGrid>().unwrap();

    let record = match out.meta().get(META_FILE_DELAYED_LOAD) {
        Some(MetaValue::DelayedLoad(d)) => d.clone(),
        other => panic!("expected retained delayed-load record, got {other:?}"),
    };
    assert_eq!(record.leaf_count(), out.tree().leaf_count());

    // Find the buffer section via the descriptor and verify each leaf
    // record against the recorded mask byte and size.
    let mut is = InStream::new(bytes.as_slice());
    let mut walker = Archive::new();
    walker.read_header(&mut is).unwrap();
    let mut sm = StreamMetadata::new();
    sm.set_file_version(walker.file_version());
    set_stream_metadata(&mut is, sm, true);
    MetaMap::read_meta(&mut is).unwrap();
    Archive::read_grid_count(&mut is).unwrap();
    let (gd, _) = GridDescriptor::read(&mut is).unwrap();

    let mut pos = gd.block_pos() as usize;
    for idx in 0..record.leaf_count() {
        let mask_byte = bytes[pos];
        assert_eq!(Some(mask_byte), record.mask(idx));
        assert_eq!(mask_byte, MASK_AND_NO_INACTIVE_VALS);
        pos += 1;
        let prefix = i64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        let payload = prefix.unsigned_abs() as usize;
        assert_eq!(record.compressed_size(idx), Some(payload as u64 + 8));
        pos += 8 + payload;
    }
    assert_eq!(pos as u64, gd.end_pos());
}
