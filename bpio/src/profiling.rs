//! Engine profiling
//!
//! Each writer rank keeps wall-clock timers for the phases of the engine.
//! On close rank 0 gathers every rank's profile and writes them, together
//! with the effective parameters, to `profiling.json` in the dataset.

use std::path::Path;
use std::time::{Duration, Instant};

use bpio_core::format::constants::files;
use serde::Serialize;

use crate::comm::Comm;
use crate::error::{Error, IoContext, Result};
use crate::params::EngineParams;

/// Engine phases that are timed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Buffering,
    Aggregation,
    Transport,
    Close,
}

/// Accumulated time of one phase
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Timer {
    pub calls: u64,
    pub micros: u64,
}

impl Timer {
    fn record(&mut self, elapsed: Duration) {
        self.calls += 1;
        self.micros += elapsed.as_micros().min(u64::MAX as u128) as u64;
    }
}

/// Timers and byte counters of one rank
#[derive(Debug, Default, Clone, Serialize)]
pub struct Profile {
    pub rank: usize,
    pub buffering: Timer,
    pub aggregation: Timer,
    pub transport: Timer,
    pub close: Timer,
    pub bytes_written: u64,
    pub metadata_bytes: u64,
}

impl Profile {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            ..Default::default()
        }
    }

    fn timer(&mut self, phase: Phase) -> &mut Timer {
        match phase {
            Phase::Buffering => &mut self.buffering,
            Phase::Aggregation => &mut self.aggregation,
            Phase::Transport => &mut self.transport,
            Phase::Close => &mut self.close,
        }
    }

    /// Run `f`, charging its wall-clock time to `phase`
    pub fn measure<T>(&mut self, phase: Phase, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let out = f();
        self.timer(phase).record(started.elapsed());
        out
    }

    pub fn add(&mut self, phase: Phase, elapsed: Duration) {
        self.timer(phase).record(elapsed);
    }
}

#[derive(Serialize)]
struct Report<'a> {
    engine: &'a str,
    params: &'a EngineParams,
    ranks: Vec<serde_json::Value>,
}

/// Gather every rank's profile and write the report on rank 0
pub fn write_report(
    comm: &dyn Comm,
    dir: &Path,
    engine: &str,
    params: &EngineParams,
    profile: &Profile,
) -> Result<()> {
    let own = serde_json::to_vec(profile)
        .map_err(|e| Error::invalid(format!("serializing profile: {e}")))?;
    let Some(parts) = comm.gather_bytes(own, 0)? else {
        return Ok(());
    };

    let ranks = parts
        .iter()
        .map(|p| serde_json::from_slice(p))
        .collect::<std::result::Result<Vec<serde_json::Value>, _>>()
        .map_err(|e| Error::CollectiveFailure(format!("malformed profile: {e}")))?;
    let report = Report {
        engine,
        params,
        ranks,
    };
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| Error::invalid(format!("serializing profile: {e}")))?;
    let path = dir.join(files::PROFILING);
    std::fs::write(&path, json).context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;

    #[test]
    fn test_measure_accumulates() {
        let mut p = Profile::new(0);
        let v = p.measure(Phase::Transport, || 7);
        p.measure(Phase::Transport, || ());
        assert_eq!(v, 7);
        assert_eq!(p.transport.calls, 2);
        assert_eq!(p.close.calls, 0);
    }

    #[test]
    fn test_report_lists_ranks_and_params() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = Profile::new(0);
        profile.bytes_written = 1234;
        write_report(&SelfComm, dir.path(), "BPFile", &EngineParams::default(), &profile).unwrap();

        let text = std::fs::read_to_string(dir.path().join("profiling.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["engine"], "BPFile");
        assert_eq!(json["ranks"][0]["bytes_written"], 1234);
        assert_eq!(json["params"]["initial_buffer_size"], 16384);
    }
}
