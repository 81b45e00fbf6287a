mod common;

use bpio::{Comm, Error, Mode, JOINED_DIM};
use common::{io_with, path_str, run_ranks};
use rand::Rng;

/// Two ranks write halves of a global array; the reader sees it whole
#[test]
fn test_two_ranks_tile_global_array() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiled.bp");

    run_ranks(2, |comm| {
        let rank = comm.rank() as u64;
        let io = io_with(&[]);
        let v = io
            .define_variable::<f64>("v", &[10], &[rank * 5], &[5], true)
            .unwrap();
        let values: Vec<f64> = (0..5).map(|i| (rank * 5 + i) as f64).collect();
        let mut writer = io
            .open_with_comm(path_str(&path), Mode::Write, Box::new(comm))
            .unwrap();
        writer.begin_step().unwrap();
        writer.put(&v, &values, Mode::Sync).unwrap();
        writer.end_step().unwrap();
        writer.close().unwrap();
    });

    let io = io_with(&[]);
    let mut reader = io.open(path_str(&path), Mode::ReadRandomAccess).unwrap();
    let v = io.inquire_variable::<f64>("v").unwrap().unwrap();
    v.set_selection(&[0], &[10]).unwrap();
    let expected: Vec<f64> = (0..10).map(|i| i as f64).collect();
    assert_eq!(reader.get(&v).unwrap(), expected);

    let blocks = reader.blocks_info(&v, 0).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!((blocks[1].rank, blocks[1].start.clone()), (1, vec![5]));
}

/// Random sub-boxes of a 2-D array written by four ranks as 2x2 tiles
#[test]
fn test_random_boxes_match_reference() {
    const NX: u64 = 12;
    const NY: u64 = 10;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.bp");
    let value = |x: u64, y: u64| (x * 100 + y) as i32;

    run_ranks(4, |comm| {
        let rank = comm.rank() as u64;
        let (ox, oy) = ((rank / 2) * NX / 2, (rank % 2) * NY / 2);
        let count = [NX / 2, NY / 2];
        let io = io_with(&[("AggregationType", "TwoLevelShm"), ("NumAggregators", "2")]);
        let grid = io
            .define_variable::<i32>("grid", &[NX, NY], &[ox, oy], &count, true)
            .unwrap();
        let mut tile = Vec::new();
        for x in ox..ox + count[0] {
            for y in oy..oy + count[1] {
                tile.push(value(x, y));
            }
        }
        let mut writer = io
            .open_with_comm(path_str(&path), Mode::Write, Box::new(comm))
            .unwrap();
        writer.put(&grid, &tile, Mode::Sync).unwrap();
        writer.close().unwrap();
    });
    assert!(path.join("data.1").is_file());
    assert!(!path.join("data.2").exists());

    let io = io_with(&[("Threads", "3")]);
    let mut reader = io.open(path_str(&path), Mode::ReadRandomAccess).unwrap();
    let grid = io.inquire_variable::<i32>("grid").unwrap().unwrap();
    assert_eq!(grid.shape(), vec![NX, NY]);

    let mut rng = rand::thread_rng();
    for _ in 0..25 {
        let sx = rng.gen_range(0..NX);
        let sy = rng.gen_range(0..NY);
        let cx = rng.gen_range(1..=NX - sx);
        let cy = rng.gen_range(1..=NY - sy);
        grid.set_selection(&[sx, sy], &[cx, cy]).unwrap();

        let mut expected = Vec::new();
        for x in sx..sx + cx {
            for y in sy..sy + cy {
                expected.push(value(x, y));
            }
        }
        assert_eq!(reader.get(&grid).unwrap(), expected, "box {sx},{sy} {cx}x{cy}");
    }
}

#[test]
fn test_points_and_write_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("points.bp");

    run_ranks(2, |comm| {
        let rank = comm.rank() as u64;
        let io = io_with(&[]);
        let v = io
            .define_variable::<u16>("v", &[8], &[rank * 4], &[4], true)
            .unwrap();
        let values: Vec<u16> = (0..4).map(|i| (rank * 4 + i) as u16 * 3).collect();
        let mut writer = io
            .open_with_comm(path_str(&path), Mode::Write, Box::new(comm))
            .unwrap();
        writer.put(&v, &values, Mode::Sync).unwrap();
        writer.close().unwrap();
    });

    let io = io_with(&[]);
    let mut reader = io.open(path_str(&path), Mode::ReadRandomAccess).unwrap();
    let v = io.inquire_variable::<u16>("v").unwrap().unwrap();

    v.set_point_selection(vec![vec![7], vec![0], vec![4]]).unwrap();
    assert_eq!(reader.get(&v).unwrap(), [21, 0, 12]);

    v.set_block_selection(1);
    assert_eq!(reader.get(&v).unwrap(), [12, 15, 18, 21]);
    v.set_block_selection(2);
    assert!(reader.get(&v).is_err());

    v.set_selection(&[6], &[4]).unwrap();
    assert!(matches!(reader.get(&v), Err(Error::OutOfRange(_))));
}

/// Where blocks overlap the later rank's values are read, whatever the selection
#[test]
fn test_overlapping_blocks_read_consistently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overlap.bp");

    run_ranks(2, |comm| {
        let rank = comm.rank() as u64;
        let io = io_with(&[]);
        let v = io
            .define_variable::<u32>("v", &[10], &[rank * 4], &[6], true)
            .unwrap();
        let base = 100 * (rank as u32 + 1);
        let values: Vec<u32> = (0..6).map(|i| base + i).collect();
        let mut writer = io
            .open_with_comm(path_str(&path), Mode::Write, Box::new(comm))
            .unwrap();
        writer.put(&v, &values, Mode::Sync).unwrap();
        writer.close().unwrap();
    });

    let io = io_with(&[]);
    let mut reader = io.open(path_str(&path), Mode::ReadRandomAccess).unwrap();
    let v = io.inquire_variable::<u32>("v").unwrap().unwrap();
    assert_eq!(
        reader.get(&v).unwrap(),
        [100, 101, 102, 103, 200, 201, 202, 203, 204, 205]
    );

    v.set_selection(&[4], &[2]).unwrap();
    assert_eq!(reader.get(&v).unwrap(), [200, 201]);

    v.set_point_selection(vec![vec![4], vec![5], vec![3]]).unwrap();
    assert_eq!(reader.get(&v).unwrap(), [200, 201, 103]);
}

#[test]
fn test_local_arrays_read_by_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.bp");

    run_ranks(3, |comm| {
        let rank = comm.rank();
        let io = io_with(&[]);
        let len = rank as u64 + 1;
        let v = io.define_variable::<f32>("particles", &[], &[], &[len], false).unwrap();
        let mut writer = io
            .open_with_comm(path_str(&path), Mode::Write, Box::new(comm))
            .unwrap();
        writer.put(&v, &vec![rank as f32; len as usize], Mode::Sync).unwrap();
        writer.close().unwrap();
    });

    let io = io_with(&[]);
    let mut reader = io.open(path_str(&path), Mode::ReadRandomAccess).unwrap();
    let v = io.inquire_variable::<f32>("particles").unwrap().unwrap();
    assert_eq!(reader.get(&v).unwrap(), [0.0]);
    v.set_block_selection(2);
    assert_eq!(reader.get(&v).unwrap(), [2.0, 2.0, 2.0]);
    assert!(matches!(
        v.set_selection(&[0], &[1]).and_then(|()| reader.get(&v)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_joined_array_concatenates_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("joined.bp");

    run_ranks(3, |comm| {
        let rank = comm.rank();
        let rows = rank as u64 + 1;
        let io = io_with(&[]);
        let table = io
            .define_variable::<i64>("table", &[JOINED_DIM, 2], &[], &[rows, 2], false)
            .unwrap();
        let values: Vec<i64> = (0..rows * 2).map(|_| rank as i64).collect();
        let mut writer = io
            .open_with_comm(path_str(&path), Mode::Write, Box::new(comm))
            .unwrap();
        writer.put(&table, &values, Mode::Sync).unwrap();
        writer.close().unwrap();
    });

    let io = io_with(&[]);
    let mut reader = io.open(path_str(&path), Mode::ReadRandomAccess).unwrap();
    let table = io.inquire_variable::<i64>("table").unwrap().unwrap();
    assert_eq!(table.shape(), vec![6, 2]);
    assert_eq!(
        reader.get(&table).unwrap(),
        [0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2]
    );
}

#[test]
fn test_memory_selection_places_box() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memsel.bp");

    let io = io_with(&[]);
    let v = io.define_variable::<u8>("v", &[2, 2], &[0, 0], &[2, 2], true).unwrap();
    let mut writer = io.open(path_str(&path), Mode::Write).unwrap();
    writer.put(&v, &[1u8, 2, 3, 4], Mode::Sync).unwrap();
    writer.close().unwrap();

    let io = io_with(&[]);
    let mut reader = io.open(path_str(&path), Mode::ReadRandomAccess).unwrap();
    let v = io.inquire_variable::<u8>("v").unwrap().unwrap();
    v.set_memory_selection(&[1, 1], &[4, 4]).unwrap();
    let mut out = [9u8; 16];
    reader.get_into(&v, &mut out).unwrap();
    assert_eq!(
        out,
        [0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0, 0, 0, 0]
    );
}
