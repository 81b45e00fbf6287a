#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::thread;

use bpio::{Adios, Io, ThreadComm};

/// Run `f` on `size` in-process ranks and collect the results in rank order
pub fn run_ranks<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(ThreadComm) -> R + Sync,
{
    let comms = ThreadComm::create(size);
    thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                scope.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Fresh catalog with the given engine parameters
pub fn io_with(params: &[(&str, &str)]) -> Io {
    let io = Adios::default().declare_io("test").unwrap();
    io.set_parameters(params.iter().copied());
    io
}

pub fn dataset(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

pub fn path_str(path: &Path) -> &str {
    path.to_str().expect("temporary paths are UTF-8")
}
