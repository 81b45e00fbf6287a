//! In-process stream engine
//!
//! Writers publish every closed step, merged metadata plus each rank's
//! payload, to a [`StreamHub`] owned by the [`Adios`](crate::Adios)
//! context. A reader takes steps in order and holds one until its EndStep.
//! `QueueLimit` bounds the steps that are queued or held; when it is reached
//! the writer either waits (`Block`) or drops the oldest unread step
//! (`Discard`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use super::{BlockWriter, StepStatus};
use crate::aggregator::merge_steps;
use crate::buffer::BufferPolicy;
use crate::comm::{collective, Comm};
use crate::deserializer::{Deserializer, MetadataIndex, StreamPayloads};
use crate::error::{Error, Result};
use crate::io::Io;
use crate::params::{BufferOverflowPolicy, EngineParams, QueueFullPolicy};
use crate::serializer::Serializer;

/// One published step
#[derive(Debug, Clone)]
pub struct StreamStep {
    pub step: u64,
    /// Merged step chunk
    pub chunk: Bytes,
    /// Payload of every writer rank, indexed by rank
    pub payloads: Vec<Bytes>,
}

/// Outcome of waiting for the next step
#[derive(Debug)]
pub enum StepWait {
    Ready(StreamStep),
    NotReady,
    EndOfStream,
}

#[derive(Debug, Default)]
struct Channel {
    queue: VecDeque<StreamStep>,
    writer_open: bool,
    writer_seen: bool,
    /// Steps taken by the reader and not yet released
    held: usize,
    limit: usize,
    policy: QueueFullPolicy,
}

impl Channel {
    fn full(&self) -> bool {
        self.limit > 0 && self.queue.len() + self.held >= self.limit
    }
}

/// Registry of named in-process streams
#[derive(Debug, Default)]
pub struct StreamHub {
    streams: Mutex<HashMap<String, Channel>>,
    changed: Condvar,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the writer of `name`
    pub fn open_writer(&self, name: &str, limit: usize, policy: QueueFullPolicy) -> Result<()> {
        let mut streams = self.streams.lock();
        let channel = streams.entry(name.to_string()).or_default();
        if channel.writer_open {
            return Err(Error::invalid(format!("stream '{name}' already has a writer")));
        }
        channel.queue.clear();
        channel.writer_open = true;
        channel.writer_seen = true;
        channel.limit = limit;
        channel.policy = policy;
        self.changed.notify_all();
        Ok(())
    }

    /// Queue a closed step, honoring the queue limit
    pub fn publish(&self, name: &str, step: StreamStep) -> Result<()> {
        let mut streams = self.streams.lock();
        loop {
            let channel = streams
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("stream '{name}'")))?;
            if !channel.full() {
                channel.queue.push_back(step);
                self.changed.notify_all();
                return Ok(());
            }
            match channel.policy {
                QueueFullPolicy::Discard if !channel.queue.is_empty() => {
                    if let Some(dropped) = channel.queue.pop_front() {
                        debug!("stream '{name}': queue full, discarding step {}", dropped.step);
                    }
                }
                _ => self.changed.wait(&mut streams),
            }
        }
    }

    pub fn close_writer(&self, name: &str) {
        if let Some(channel) = self.streams.lock().get_mut(name) {
            channel.writer_open = false;
        }
        self.changed.notify_all();
    }

    /// Wait until a writer attached to `name`; `None` waits forever
    pub fn wait_for_writer(&self, name: &str, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut streams = self.streams.lock();
        loop {
            if streams.entry(name.to_string()).or_default().writer_seen {
                return true;
            }
            match deadline {
                None => self.changed.wait(&mut streams),
                Some(deadline) => {
                    if self.changed.wait_until(&mut streams, deadline).timed_out() {
                        return streams.get(name).is_some_and(|c| c.writer_seen);
                    }
                }
            }
        }
    }

    /// Take the next step; `None` waits forever
    pub fn next_step(&self, name: &str, timeout: Option<Duration>) -> StepWait {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut streams = self.streams.lock();
        loop {
            let channel = streams.entry(name.to_string()).or_default();
            if let Some(step) = channel.queue.pop_front() {
                channel.held += 1;
                self.changed.notify_all();
                return StepWait::Ready(step);
            }
            if channel.writer_seen && !channel.writer_open {
                return StepWait::EndOfStream;
            }
            match deadline {
                None => self.changed.wait(&mut streams),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return StepWait::NotReady;
                    }
                    self.changed.wait_until(&mut streams, deadline);
                }
            }
        }
    }

    /// Give a held step back so the writer may reuse its slot
    pub fn release(&self, name: &str) {
        if let Some(channel) = self.streams.lock().get_mut(name) {
            channel.held = channel.held.saturating_sub(1);
        }
        self.changed.notify_all();
    }

    /// Number of steps waiting for the reader
    pub fn queued(&self, name: &str) -> usize {
        self.streams.lock().get(name).map_or(0, |c| c.queue.len())
    }
}

/// Writer side of a stream
pub(crate) struct StreamWriter {
    name: String,
    comm: Box<dyn Comm>,
    hub: Arc<StreamHub>,
    serializer: Serializer,
    next_step: u64,
    /// Names of the attributes already serialized
    attributes_written: HashSet<String>,
}

impl StreamWriter {
    pub fn open(
        io: &Io,
        name: &str,
        params: &EngineParams,
        mut comm: Box<dyn Comm>,
    ) -> Result<Self> {
        comm.set_timeout(params.collective_timeout());
        let hub = io.hub();
        let opened = if comm.rank() == 0 {
            hub.open_writer(name, params.queue_limit, params.queue_full_policy)
        } else {
            Ok(())
        };
        collective(comm.as_ref(), "stream open", opened)?;
        let ack = comm.barrier();
        collective(comm.as_ref(), "stream open", ack)?;

        // a stream has no subfile to spill into
        let policy = BufferPolicy {
            overflow: BufferOverflowPolicy::Fail,
            ..BufferPolicy::from_params(params)
        };
        let serializer = Serializer::new(
            comm.rank() as u32,
            policy,
            0,
            params.stats_level,
            io.operators(),
        );
        debug!("rank {}: writing stream '{name}'", comm.rank());
        Ok(Self {
            name: name.to_string(),
            comm,
            hub,
            serializer,
            next_step: 0,
            attributes_written: HashSet::new(),
        })
    }

    pub fn begin_step(&mut self) -> u64 {
        let step = self.next_step;
        self.serializer.begin_step(step);
        step
    }

    pub fn steps(&self) -> u64 {
        self.next_step
    }

    pub fn end_step(&mut self, io: &Io) -> Result<()> {
        let rank = self.comm.rank();
        let attributes = io.new_attribute_records(&mut self.attributes_written);
        if rank == 0 {
            for record in &attributes {
                self.serializer.put_attribute(record)?;
            }
        }
        let marker = self.serializer.end_step();
        self.next_step += 1;

        // payload offsets become relative to this rank's buffer for the step
        let (payload, start) = self.serializer.take_payload();
        self.serializer.relocate(rank as u32, -(start as i64))?;
        self.serializer.reset_data_base(0);
        let metadata = self.serializer.take_metadata()?;

        let result = self.publish(marker.step, metadata, payload);
        collective(self.comm.as_ref(), "stream publish", result)
    }

    fn publish(&mut self, step: u64, metadata: Vec<u8>, payload: Vec<u8>) -> Result<()> {
        let metadata = self.comm.gather_bytes(metadata, 0)?;
        let payloads = self.comm.gather_bytes(payload, 0)?;
        if let (Some(metadata), Some(payloads)) = (metadata, payloads) {
            let published = merge_steps(&metadata).and_then(|mut chunks| {
                let chunk = chunks
                    .pop()
                    .filter(|_| chunks.is_empty())
                    .ok_or_else(|| Error::CollectiveFailure(format!("step {step} did not merge into one chunk")))?;
                self.hub.publish(
                    &self.name,
                    StreamStep {
                        step,
                        chunk: Bytes::from(chunk.bytes),
                        payloads: payloads.into_iter().map(Bytes::from).collect(),
                    },
                )
            });
            collective(self.comm.as_ref(), "stream publish", published)?;
            self.comm.broadcast_bytes(Some(Vec::new()), 0)?;
        } else {
            self.comm.broadcast_bytes(None, 0)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let ack = self.comm.barrier();
        let ack = collective(self.comm.as_ref(), "stream close", ack);
        if self.comm.rank() == 0 {
            self.hub.close_writer(&self.name);
        }
        ack
    }
}

impl BlockWriter for StreamWriter {
    fn serializer(&mut self) -> &mut Serializer {
        &mut self.serializer
    }

    fn spill(&mut self) -> Result<()> {
        Err(Error::invalid(format!(
            "stream '{}' cannot spill a full buffer",
            self.name
        )))
    }
}

/// Reader side of a stream
pub(crate) struct StreamReader {
    name: String,
    hub: Arc<StreamHub>,
    deserializer: Deserializer,
    current: Option<u64>,
    holding: bool,
    received: u64,
}

impl StreamReader {
    pub fn open(io: &Io, name: &str, params: &EngineParams) -> Result<Self> {
        let hub = io.hub();
        if !hub.wait_for_writer(name, params.open_timeout()) {
            return Err(Error::NotFound(format!("stream '{name}' has no writer")));
        }
        let deserializer = Deserializer::new(
            MetadataIndex::new(),
            Box::new(StreamPayloads::default()),
            io.operators(),
            params.threads,
        )?;
        Ok(Self {
            name: name.to_string(),
            hub,
            deserializer,
            current: None,
            holding: false,
            received: 0,
        })
    }

    pub fn begin_step(&mut self, io: &Io, timeout: Option<Duration>) -> Result<StepStatus> {
        match self.hub.next_step(&self.name, timeout) {
            StepWait::Ready(step) => {
                let mut index = MetadataIndex::new();
                index.add_chunk(&step.chunk)?;
                self.deserializer
                    .replace(index, Box::new(StreamPayloads::new(step.payloads)));
                self.current = Some(step.step);
                self.holding = true;
                self.received += 1;
                io.register_from_index(self.deserializer.index(), self.current);
                Ok(StepStatus::Ok)
            }
            StepWait::NotReady => Ok(StepStatus::NotReady),
            StepWait::EndOfStream => Ok(StepStatus::EndOfStream),
        }
    }

    pub fn current_step(&self) -> Option<u64> {
        self.current
    }

    pub fn steps(&self) -> u64 {
        self.received
    }

    pub fn deserializer(&self) -> &Deserializer {
        &self.deserializer
    }

    pub fn end_step(&mut self) {
        if std::mem::take(&mut self.holding) {
            self.hub.release(&self.name);
        }
    }

    pub fn close(&mut self) {
        if self.holding {
            warn!("stream '{}': closing while holding a step", self.name);
        }
        self.end_step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn step(n: u64) -> StreamStep {
        StreamStep {
            step: n,
            chunk: Bytes::new(),
            payloads: Vec::new(),
        }
    }

    #[test]
    fn test_reader_sees_steps_then_end() {
        let hub = StreamHub::new();
        hub.open_writer("s", 0, QueueFullPolicy::Block).unwrap();
        assert!(matches!(hub.next_step("s", Some(Duration::ZERO)), StepWait::NotReady));

        hub.publish("s", step(0)).unwrap();
        hub.publish("s", step(1)).unwrap();
        hub.close_writer("s");
        for expected in 0..2 {
            match hub.next_step("s", Some(Duration::ZERO)) {
                StepWait::Ready(s) => assert_eq!(s.step, expected),
                other => panic!("expected step {expected}, got {other:?}"),
            }
            hub.release("s");
        }
        assert!(matches!(hub.next_step("s", None), StepWait::EndOfStream));
    }

    #[test]
    fn test_discard_drops_oldest_unread() {
        let hub = StreamHub::new();
        hub.open_writer("s", 2, QueueFullPolicy::Discard).unwrap();
        for n in 0..4 {
            hub.publish("s", step(n)).unwrap();
        }
        assert_eq!(hub.queued("s"), 2);
        match hub.next_step("s", Some(Duration::ZERO)) {
            StepWait::Ready(s) => assert_eq!(s.step, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_block_waits_for_release() {
        let hub = Arc::new(StreamHub::new());
        hub.open_writer("s", 1, QueueFullPolicy::Block).unwrap();
        hub.publish("s", step(0)).unwrap();

        let writer = {
            let hub = Arc::clone(&hub);
            thread::spawn(move || hub.publish("s", step(1)))
        };
        let StepWait::Ready(first) = hub.next_step("s", None) else {
            panic!("expected a step");
        };
        assert_eq!(first.step, 0);
        thread::sleep(Duration::from_millis(20));
        // the held step still counts against the limit
        assert_eq!(hub.queued("s"), 0);
        hub.release("s");
        writer.join().unwrap().unwrap();
        assert_eq!(hub.queued("s"), 1);
    }

    #[test]
    fn test_second_writer_rejected() {
        let hub = StreamHub::new();
        hub.open_writer("s", 0, QueueFullPolicy::Block).unwrap();
        assert!(hub.open_writer("s", 0, QueueFullPolicy::Block).is_err());
        assert!(hub.wait_for_writer("s", Some(Duration::ZERO)));
        assert!(!hub.wait_for_writer("other", Some(Duration::ZERO)));
    }
}
