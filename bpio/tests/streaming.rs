mod common;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bpio::{Adios, Mode, StepMode, StepStatus};
use common::{io_with, path_str};

/// A reader follows a file dataset while the writer is still producing it
#[test]
fn test_reader_follows_live_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.bp");
    let (opened_tx, opened_rx) = mpsc::channel();
    let (polled_tx, polled_rx) = mpsc::channel();

    thread::scope(|scope| {
        scope.spawn(|| {
            let polled_rx = polled_rx;
            let io = io_with(&[]);
            let step_var = io.define_variable::<u32>("step", &[], &[], &[], true).unwrap();
            let mut writer = io.open(path_str(&path), Mode::Write).unwrap();
            opened_tx.send(()).unwrap();
            polled_rx.recv().unwrap();
            for step in 0..3u32 {
                writer.begin_step().unwrap();
                writer.put(&step_var, &[step * 10], Mode::Sync).unwrap();
                writer.end_step().unwrap();
                thread::sleep(Duration::from_millis(20));
            }
            writer.close().unwrap();
        });

        opened_rx.recv().unwrap();
        let io = io_with(&[("BeginStepPollingFrequencySecs", "0.005")]);
        let mut reader = io.open(path_str(&path), Mode::Read).unwrap();
        let mut not_ready = 0;
        let mut seen = Vec::new();
        loop {
            match reader.begin_step_with(StepMode::Read, 0.0).unwrap() {
                StepStatus::NotReady => {
                    if not_ready == 0 {
                        polled_tx.send(()).unwrap();
                    }
                    not_ready += 1;
                    thread::sleep(Duration::from_millis(5));
                }
                StepStatus::Ok => {
                    let v = io.inquire_variable::<u32>("step").unwrap().unwrap();
                    seen.push((reader.current_step(), reader.get(&v).unwrap()[0]));
                    reader.end_step().unwrap();
                }
                StepStatus::EndOfStream => break,
                StepStatus::OtherError => panic!("unexpected step status OtherError"),
            }
        }
        reader.close().unwrap();
        assert!(not_ready >= 1);
        assert_eq!(seen, [(0, 0), (1, 10), (2, 20)]);
    });
}

#[test]
fn test_stream_between_threads() {
    let adios = Adios::default();

    thread::scope(|scope| {
        let producer = adios.clone();
        scope.spawn(move || {
            let io = producer.declare_io("producer").unwrap();
            io.set_engine("Stream").unwrap();
            io.define_attribute("origin", String::from("solver")).unwrap();
            let field = io.define_variable::<f64>("field", &[4], &[0], &[4], true).unwrap();
            let mut writer = io.open("pipeline", Mode::Write).unwrap();
            for step in 0..3 {
                writer.begin_step().unwrap();
                writer.put(&field, &[step as f64; 4], Mode::Deferred).unwrap();
                writer.end_step().unwrap();
            }
            writer.close().unwrap();
        });

        let io = adios.declare_io("consumer").unwrap();
        io.set_engine("Stream").unwrap();
        io.set_parameter("OpenTimeoutSecs", "10");
        let mut reader = io.open("pipeline", Mode::Read).unwrap();
        let mut seen = Vec::new();
        while reader.begin_step().unwrap() == StepStatus::Ok {
            let field = io.inquire_variable::<f64>("field").unwrap().unwrap();
            field.set_selection(&[1], &[2]).unwrap();
            seen.push(reader.get(&field).unwrap());
            reader.end_step().unwrap();
        }
        reader.close().unwrap();
        assert_eq!(seen, [vec![0.0; 2], vec![1.0; 2], vec![2.0; 2]]);

        let origin = io.inquire_attribute::<String>("origin").unwrap().unwrap();
        assert_eq!(origin.value().map(String::as_str), Some("solver"));
    });
}

#[test]
fn test_stream_block_policy_keeps_every_step() {
    let adios = Adios::default();

    thread::scope(|scope| {
        let producer = adios.clone();
        scope.spawn(move || {
            let io = producer.declare_io("producer").unwrap();
            io.set_engine("Stream").unwrap();
            io.set_parameters([("QueueLimit", "1"), ("QueueFullPolicy", "Block")]);
            let n = io.define_variable::<i64>("n", &[], &[], &[], true).unwrap();
            let mut writer = io.open("blocking", Mode::Write).unwrap();
            for step in 0..5i64 {
                writer.begin_step().unwrap();
                writer.put(&n, &[step], Mode::Sync).unwrap();
                writer.end_step().unwrap();
            }
            writer.close().unwrap();
        });

        let io = adios.declare_io("consumer").unwrap();
        io.set_engine("Stream").unwrap();
        io.set_parameter("OpenTimeoutSecs", "10");
        let mut reader = io.open("blocking", Mode::Read).unwrap();
        let mut seen = Vec::new();
        while reader.begin_step().unwrap() == StepStatus::Ok {
            thread::sleep(Duration::from_millis(5));
            let n = io.inquire_variable::<i64>("n").unwrap().unwrap();
            seen.push(reader.get(&n).unwrap()[0]);
            reader.end_step().unwrap();
        }
        assert_eq!(seen, [0, 1, 2, 3, 4]);
    });
}

#[test]
fn test_stream_discard_policy_drops_oldest() {
    let adios = Adios::default();

    let io = adios.declare_io("producer").unwrap();
    io.set_engine("Stream").unwrap();
    io.set_parameters([("QueueLimit", "1"), ("QueueFullPolicy", "Discard")]);
    let n = io.define_variable::<u16>("n", &[], &[], &[], true).unwrap();
    let mut writer = io.open("lossy", Mode::Write).unwrap();
    for step in 0..3u16 {
        writer.begin_step().unwrap();
        writer.put(&n, &[step], Mode::Sync).unwrap();
        writer.end_step().unwrap();
    }
    writer.close().unwrap();

    let io = adios.declare_io("consumer").unwrap();
    io.set_engine("Stream").unwrap();
    let mut reader = io.open("lossy", Mode::Read).unwrap();
    assert_eq!(reader.begin_step().unwrap(), StepStatus::Ok);
    assert_eq!(reader.current_step(), 2);
    let n = io.inquire_variable::<u16>("n").unwrap().unwrap();
    assert_eq!(reader.get(&n).unwrap(), [2]);
    reader.end_step().unwrap();
    assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
}
