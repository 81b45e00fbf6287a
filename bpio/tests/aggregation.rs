mod common;

use bpio::{Comm, Error, Mode, StepStatus};
use common::{io_with, path_str, run_ranks};

const RANKS: usize = 4;

/// Write three steps of a rank-tiled array and return the subfiles created
fn write_tiled(strategy: &str, aggregators: Option<&str>) -> (tempfile::TempDir, Vec<String>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agg.bp");

    run_ranks(RANKS, |comm| {
        let rank = comm.rank() as u64;
        let mut params = vec![("AggregationType", strategy)];
        if let Some(n) = aggregators {
            params.push(("NumAggregators", n));
        }
        let io = io_with(&params);
        // uneven block sizes so size-based balancing has something to do
        let len = rank + 1;
        let offset: u64 = (0..rank).map(|r| r + 1).sum();
        let total: u64 = (1..=RANKS as u64).sum();
        let v = io
            .define_variable::<u32>("v", &[total], &[offset], &[len], true)
            .unwrap();
        let mut writer = io
            .open_with_comm(path_str(&path), Mode::Write, Box::new(comm))
            .unwrap();
        for step in 0..3u32 {
            writer.begin_step().unwrap();
            let values: Vec<u32> = (0..len as u32).map(|i| step * 100 + offset as u32 + i).collect();
            writer.put(&v, &values, Mode::Sync).unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    });

    let mut subfiles: Vec<String> = std::fs::read_dir(&path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("data."))
        .collect();
    subfiles.sort();
    (dir, subfiles)
}

fn assert_readable(dir: &tempfile::TempDir) {
    let path = dir.path().join("agg.bp");
    let io = io_with(&[]);
    let mut reader = io.open(path_str(&path), Mode::Read).unwrap();
    let mut step = 0u32;
    while reader.begin_step().unwrap() == StepStatus::Ok {
        let v = io.inquire_variable::<u32>("v").unwrap().unwrap();
        let expected: Vec<u32> = (0..10).map(|i| step * 100 + i).collect();
        assert_eq!(reader.get(&v).unwrap(), expected, "step {step}");
        assert_eq!(reader.blocks_info(&v, step as u64).unwrap().len(), RANKS);
        reader.end_step().unwrap();
        step += 1;
    }
    assert_eq!(step, 3);
}

#[test]
fn test_everyone_writes_one_subfile_per_rank() {
    let (dir, subfiles) = write_tiled("EveryoneWrites", None);
    assert_eq!(subfiles, ["data.0", "data.1", "data.2", "data.3"]);
    assert_readable(&dir);
}

#[test]
fn test_everyone_writes_serial() {
    let (dir, subfiles) = write_tiled("EveryoneWritesSerial", None);
    assert_eq!(subfiles.len(), RANKS);
    assert_readable(&dir);
}

#[test]
fn test_two_level_shm_groups_ranks() {
    let (dir, subfiles) = write_tiled("TwoLevelShm", None);
    assert_eq!(subfiles, ["data.0"]);
    assert_readable(&dir);

    let (dir, subfiles) = write_tiled("TwoLevelShm", Some("2"));
    assert_eq!(subfiles, ["data.0", "data.1"]);
    assert_readable(&dir);
}

#[test]
fn test_data_size_based_balances() {
    let (dir, subfiles) = write_tiled("DataSizeBased", None);
    assert_eq!(subfiles, ["data.0", "data.1"]);
    assert_readable(&dir);

    // more aggregators than ranks is clamped
    let (dir, subfiles) = write_tiled("DataSizeBased", Some("16"));
    assert_eq!(subfiles.len(), RANKS);
    assert_readable(&dir);
}

#[test]
fn test_overflow_spills_per_rank_subfile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spill.bp");

    let io = io_with(&[
        ("MaxBufferSize", "64b"),
        ("InitialBufferSize", "16b"),
        ("BufferOverflowPolicy", "Flush"),
    ]);
    let a = io.define_variable::<u64>("a", &[8], &[0], &[8], true).unwrap();
    let b = io.define_variable::<u64>("b", &[8], &[0], &[8], true).unwrap();
    let mut writer = io.open(path_str(&path), Mode::Write).unwrap();
    writer.begin_step().unwrap();
    writer.put(&a, &[1u64; 8], Mode::Sync).unwrap();
    writer.put(&b, &[2u64; 8], Mode::Sync).unwrap();
    writer.end_step().unwrap();
    writer.close().unwrap();

    let io = io_with(&[]);
    let mut reader = io.open(path_str(&path), Mode::ReadRandomAccess).unwrap();
    let a = io.inquire_variable::<u64>("a").unwrap().unwrap();
    let b = io.inquire_variable::<u64>("b").unwrap().unwrap();
    assert_eq!(reader.get(&a).unwrap(), [1; 8]);
    assert_eq!(reader.get(&b).unwrap(), [2; 8]);
}

#[test]
fn test_overflow_cannot_spill_into_shared_subfile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nospill.bp");

    let io = io_with(&[
        ("AggregationType", "TwoLevelShm"),
        ("MaxBufferSize", "64b"),
        ("BufferOverflowPolicy", "Flush"),
    ]);
    let a = io.define_variable::<u64>("a", &[8], &[0], &[8], true).unwrap();
    let mut writer = io.open(path_str(&path), Mode::Write).unwrap();
    writer.put(&a, &[1u64; 8], Mode::Sync).unwrap();
    assert!(matches!(
        writer.put(&a, &[1u64; 8], Mode::Sync),
        Err(Error::OutOfMemory { .. })
    ));
    writer.close().unwrap();
}

#[test]
fn test_collective_failure_reaches_every_rank() {
    let dir = tempfile::tempdir().unwrap();
    // a regular file where the dataset directory should go
    let path = dir.path().join("blocked.bp");
    std::fs::write(&path, b"not a directory").unwrap();

    let results = run_ranks(2, |comm| {
        let io = io_with(&[]);
        io.open_with_comm(path_str(&path), Mode::Write, Box::new(comm))
            .map(|_| ())
    });
    assert!(results.iter().all(|r| r.is_err()));
}
