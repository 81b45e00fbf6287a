//! Engine parameters
//!
//! Engines are configured through a flat, string-keyed map set on the
//! [`Io`](crate::Io). Keys are case-insensitive and unknown keys are ignored
//! so that configurations written for other engines keep working.

use std::time::Duration;

use bpio_core::validation::{parse_f64, parse_flag, parse_size, parse_u64};
use hashbrown::HashMap;
use log::debug;
use serde::Serialize;

use crate::error::{Error, Result};

/// Default initial payload buffer size (16 KiB)
pub const DEFAULT_INITIAL_BUFFER_SIZE: u64 = 16 * 1024;

/// Default growth factor of the payload buffer
pub const DEFAULT_BUFFER_GROWTH_FACTOR: f64 = 1.05;

/// How per-rank payloads are mapped onto data subfiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum AggregationType {
    /// Every rank writes its own subfile concurrently
    #[default]
    EveryoneWrites,
    /// Every rank writes its own subfile, one rank at a time
    EveryoneWritesSerial,
    /// Consecutive ranks are grouped; the first rank of a group writes for all
    TwoLevelShm,
    /// Ranks are rebalanced onto aggregators by payload size every flush
    DataSizeBased,
}

impl AggregationType {
    fn parse(value: &str) -> Option<Self> {
        let v = value.trim().to_ascii_lowercase();
        match v.as_str() {
            "everyonewrites" | "everyone_writes" => Some(Self::EveryoneWrites),
            "everyonewritesserial" | "everyone_writes_serial" => Some(Self::EveryoneWritesSerial),
            "twolevelshm" | "two_level_shm" => Some(Self::TwoLevelShm),
            "datasizebased" | "data_size_based" => Some(Self::DataSizeBased),
            _ => None,
        }
    }

    /// Whether every rank owns its subfile
    pub fn is_per_rank(self) -> bool {
        matches!(self, Self::EveryoneWrites | Self::EveryoneWritesSerial)
    }
}

/// What the serializer does when the payload buffer would pass its ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum BufferOverflowPolicy {
    /// Spill the buffer to the rank's own subfile and reset it
    #[default]
    Flush,
    /// Report `OutOfMemory`
    Fail,
}

/// Transport implementation used for data and metadata files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum TransportLibrary {
    #[default]
    Posix,
    /// Memory-mapped reads; writes fall back to POSIX
    Mmap,
    /// Discards writes
    Null,
}

/// Behavior of a stream writer when the step queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum QueueFullPolicy {
    #[default]
    Block,
    /// Drop the oldest step no reader has started
    Discard,
}

/// Typed view of the parameter map
#[derive(Debug, Clone, Serialize)]
pub struct EngineParams {
    pub aggregation_type: AggregationType,
    /// 0 selects the strategy default
    pub num_aggregators: usize,
    pub buffer_growth_factor: f64,
    pub initial_buffer_size: u64,
    pub max_buffer_size: u64,
    pub buffer_overflow_policy: BufferOverflowPolicy,
    /// Aggregate and flush every N steps
    pub flush_steps_count: u64,
    /// 0 disables min/max characteristics
    pub stats_level: u32,
    pub profile: bool,
    pub open_timeout_secs: f64,
    pub begin_step_polling_frequency_secs: f64,
    pub collective_timeout_secs: f64,
    pub library: TransportLibrary,
    /// Maximum number of queued stream steps, 0 for unbounded
    pub queue_limit: usize,
    pub queue_full_policy: QueueFullPolicy,
    /// Worker threads used to fetch blocks on the read side
    pub threads: usize,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            aggregation_type: AggregationType::default(),
            num_aggregators: 0,
            buffer_growth_factor: DEFAULT_BUFFER_GROWTH_FACTOR,
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
            max_buffer_size: u64::MAX,
            buffer_overflow_policy: BufferOverflowPolicy::default(),
            flush_steps_count: 1,
            stats_level: 1,
            profile: true,
            open_timeout_secs: 0.0,
            begin_step_polling_frequency_secs: 1.0,
            collective_timeout_secs: 60.0,
            library: TransportLibrary::default(),
            queue_limit: 0,
            queue_full_policy: QueueFullPolicy::default(),
            threads: 1,
        }
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::invalid(format!("parameter {key} has invalid value '{value}'"))
}

impl EngineParams {
    /// Parse a parameter map, keys already lower-cased
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut params = Self::default();
        for (key, value) in map {
            params.apply(key, value)?;
        }
        params.validate()?;
        Ok(params)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let bad = || invalid(key, value);
        match key {
            "aggregationtype" => {
                self.aggregation_type = AggregationType::parse(value).ok_or_else(bad)?
            }
            "numaggregators" | "substreams" => {
                self.num_aggregators = parse_u64(value).map_err(|_| bad())? as usize
            }
            "buffergrowthfactor" => {
                self.buffer_growth_factor = parse_f64(value).map_err(|_| bad())?
            }
            "initialbuffersize" => {
                self.initial_buffer_size = parse_size(value).map_err(|_| bad())?
            }
            "maxbuffersize" => self.max_buffer_size = parse_size(value).map_err(|_| bad())?,
            "bufferoverflowpolicy" => {
                self.buffer_overflow_policy = match value.trim().to_ascii_lowercase().as_str() {
                    "flush" => BufferOverflowPolicy::Flush,
                    "fail" => BufferOverflowPolicy::Fail,
                    _ => return Err(bad()),
                }
            }
            "flushstepscount" => self.flush_steps_count = parse_u64(value).map_err(|_| bad())?,
            "statslevel" => {
                self.stats_level = parse_u64(value).map_err(|_| bad())?.min(u32::MAX as u64) as u32
            }
            "profile" => self.profile = parse_flag(value).map_err(|_| bad())?,
            "opentimeoutsecs" => self.open_timeout_secs = parse_f64(value).map_err(|_| bad())?,
            "beginsteppollingfrequencysecs" => {
                self.begin_step_polling_frequency_secs = parse_f64(value).map_err(|_| bad())?
            }
            "collectivetimeoutsecs" => {
                self.collective_timeout_secs = parse_f64(value).map_err(|_| bad())?
            }
            "library" => {
                self.library = match value.trim().to_ascii_lowercase().as_str() {
                    "posix" | "fstream" | "stdio" => TransportLibrary::Posix,
                    "mmap" => TransportLibrary::Mmap,
                    "null" => TransportLibrary::Null,
                    _ => return Err(bad()),
                }
            }
            "queuelimit" => self.queue_limit = parse_u64(value).map_err(|_| bad())? as usize,
            "queuefullpolicy" => {
                self.queue_full_policy = match value.trim().to_ascii_lowercase().as_str() {
                    "block" => QueueFullPolicy::Block,
                    "discard" => QueueFullPolicy::Discard,
                    _ => return Err(bad()),
                }
            }
            "threads" => self.threads = (parse_u64(value).map_err(|_| bad())? as usize).max(1),
            _ => debug!("ignoring unknown engine parameter {key}={value}"),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_growth_factor < 1.0 {
            return Err(Error::invalid(format!(
                "BufferGrowthFactor must be at least 1, got {}",
                self.buffer_growth_factor
            )));
        }
        if self.flush_steps_count == 0 {
            return Err(Error::invalid("FlushStepsCount must be at least 1"));
        }
        if self.initial_buffer_size > self.max_buffer_size {
            return Err(Error::invalid(format!(
                "InitialBufferSize {} exceeds MaxBufferSize {}",
                self.initial_buffer_size, self.max_buffer_size
            )));
        }
        Ok(())
    }

    /// Collective timeout, `None` to wait forever
    pub fn collective_timeout(&self) -> Option<Duration> {
        secs_to_duration(self.collective_timeout_secs)
    }

    pub fn open_timeout(&self) -> Option<Duration> {
        secs_to_duration(self.open_timeout_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        secs_to_duration(self.begin_step_polling_frequency_secs)
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_millis(1))
    }
}

/// Convert seconds to a duration; negative means "forever" (`None`)
pub fn secs_to_duration(secs: f64) -> Option<Duration> {
    if secs < 0.0 {
        None
    } else {
        Some(Duration::from_secs_f64(secs.min(u32::MAX as f64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let p = EngineParams::default();
        assert_eq!(p.initial_buffer_size, 16384);
        assert_eq!(p.buffer_growth_factor, 1.05);
        assert_eq!(p.aggregation_type, AggregationType::EveryoneWrites);
    }

    #[test]
    fn test_parse_known_and_unknown_keys() {
        let p = EngineParams::from_map(&map(&[
            ("AggregationType", "TwoLevelShm"),
            ("NumAggregators", "2"),
            ("MaxBufferSize", "1Mb"),
            ("Profile", "off"),
            ("SomeFutureKnob", "42"),
        ]))
        .unwrap();
        assert_eq!(p.aggregation_type, AggregationType::TwoLevelShm);
        assert_eq!(p.num_aggregators, 2);
        assert_eq!(p.max_buffer_size, 1 << 20);
        assert!(!p.profile);
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(EngineParams::from_map(&map(&[("BufferGrowthFactor", "0.5")])).is_err());
        assert!(EngineParams::from_map(&map(&[("Profile", "sometimes")])).is_err());
        assert!(EngineParams::from_map(&map(&[
            ("InitialBufferSize", "2kb"),
            ("MaxBufferSize", "1kb")
        ]))
        .is_err());
    }

    #[test]
    fn test_negative_timeout_means_forever() {
        assert_eq!(secs_to_duration(-1.0), None);
        assert_eq!(secs_to_duration(0.0), Some(Duration::ZERO));
    }
}
