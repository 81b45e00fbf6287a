//! Writer of the file engine
//!
//! Blocks are serialized into the rank's payload buffer. Every
//! `FlushStepsCount` steps the buffer goes through the aggregator, the
//! buffered block records are pointed at where their bytes landed and the
//! closed steps' metadata is merged and published.

use std::path::Path;
use std::time::Instant;

use bpio_core::format::constants::FILE_HEADER_SIZE;
use hashbrown::HashSet;
use log::{debug, info};

use super::BlockWriter;
use crate::aggregator::Aggregator;
use crate::buffer::BufferPolicy;
use crate::comm::Comm;
use crate::error::Result;
use crate::io::Io;
use crate::params::{BufferOverflowPolicy, EngineParams};
use crate::profiling::{self, Phase};
use crate::serializer::Serializer;

pub(crate) struct BpWriter {
    serializer: Serializer,
    aggregator: Aggregator,
    params: EngineParams,
    next_step: u64,
    unflushed_steps: u64,
    /// Names of the attributes already serialized
    attributes_written: HashSet<String>,
}

impl BpWriter {
    pub fn open(
        io: &Io,
        dir: &Path,
        params: EngineParams,
        comm: Box<dyn Comm>,
        append: bool,
    ) -> Result<Self> {
        let aggregator = Aggregator::open(comm, dir, &params, append)?;
        let mut policy = BufferPolicy::from_params(&params);
        if policy.overflow == BufferOverflowPolicy::Flush && !aggregator.can_spill() {
            debug!(
                "{:?} cannot spill outside a collective flush, overflow fails",
                params.aggregation_type
            );
            policy.overflow = BufferOverflowPolicy::Fail;
        }
        let serializer = Serializer::new(
            aggregator.comm().rank() as u32,
            policy,
            FILE_HEADER_SIZE as u64,
            params.stats_level,
            io.operators(),
        );
        let next_step = aggregator.first_step();
        Ok(Self {
            serializer,
            aggregator,
            params,
            next_step,
            unflushed_steps: 0,
            attributes_written: HashSet::new(),
        })
    }

    pub fn begin_step(&mut self) -> u64 {
        let step = self.next_step;
        self.serializer.begin_step(step);
        step
    }

    /// Steps in the dataset, including those of earlier runs when appending
    pub fn steps(&self) -> u64 {
        self.next_step
    }

    pub fn record_buffering(&mut self, started: Instant) {
        self.aggregator
            .profile_mut()
            .add(Phase::Buffering, started.elapsed());
    }

    pub fn end_step(&mut self, io: &Io) -> Result<()> {
        let attributes = io.new_attribute_records(&mut self.attributes_written);
        if self.aggregator.comm().rank() == 0 {
            for record in &attributes {
                self.serializer.put_attribute(record)?;
            }
        }
        self.serializer.end_step();
        self.next_step += 1;
        self.unflushed_steps += 1;
        if self.unflushed_steps >= self.params.flush_steps_count.max(1) {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let (payload, start) = self.serializer.take_payload();
        let placement = self.aggregator.write_payload(payload, start)?;
        self.serializer.relocate(placement.subfile, placement.delta)?;
        let metadata = self.serializer.take_metadata()?;
        self.aggregator.write_metadata(metadata)?;
        self.unflushed_steps = 0;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.unflushed_steps > 0 {
            self.flush()?;
        }
        self.aggregator.finalize()?;
        if self.params.profile {
            profiling::write_report(
                self.aggregator.comm(),
                self.aggregator.dir(),
                "BPFile",
                &self.params,
                self.aggregator.profile(),
            )?;
        }
        if self.aggregator.comm().rank() == 0 {
            info!(
                "closed {} after {} step(s)",
                self.aggregator.dir().display(),
                self.next_step
            );
        }
        Ok(())
    }
}

impl BlockWriter for BpWriter {
    fn serializer(&mut self) -> &mut Serializer {
        &mut self.serializer
    }

    fn spill(&mut self) -> Result<()> {
        let (payload, start) = self.serializer.take_payload();
        let placement = self.aggregator.spill(&payload, start)?;
        self.serializer.relocate(placement.subfile, placement.delta)
    }
}
