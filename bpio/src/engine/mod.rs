//! Engines
//!
//! An [`Engine`] is opened from an [`Io`] and drives the step protocol:
//! `begin_step`, any number of puts or gets, `end_step`, and finally
//! `close`. Deferred operations are queued and run in call order at
//! `perform_puts`/`perform_gets` or at the end of the step.
//!
//! Two back ends exist: the file engine, which writes the binary-pack
//! dataset layout, and the in-process stream engine.

mod bp_reader;
mod bp_writer;
pub mod stream;

use std::path::Path;
use std::time::Instant;

use bpio_core::Element;
use log::{debug, warn};

use crate::buffer::SharedBuffer;
use crate::comm::Comm;
use crate::deserializer::{BlockSummary, Deserializer};
use crate::error::{Error, Result};
use crate::io::{EngineKind, Io};
use crate::params::secs_to_duration;
use crate::serializer::{PutOutcome, Serializer};
use crate::variable::{Variable, VariableDesc};

use bp_reader::BpReader;
use bp_writer::BpWriter;
use stream::{StreamReader, StreamWriter};

/// How an engine is opened, and whether a put or get runs now or later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Write,
    Read,
    /// Continue an existing dataset with new steps
    Append,
    /// Read with every step visible at once; the step protocol is disabled
    ReadRandomAccess,
    /// Run the put or get before returning
    Sync,
    /// Queue the put or get until the next perform or end of step
    Deferred,
}

/// Requested step mode of `begin_step_with`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    Append,
    Update,
    #[default]
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    /// No step arrived before the timeout
    NotReady,
    /// The writer closed and every step was consumed
    EndOfStream,
    OtherError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StepInactive,
    StepActive,
    Closed,
}

/// Data handed to a put
pub enum PutData<'a, T> {
    /// Copied at the time of the put
    Slice(&'a [T]),
    /// Read when the put is performed
    Shared(SharedBuffer<T>),
}

impl<'a, T> From<&'a [T]> for PutData<'a, T> {
    fn from(values: &'a [T]) -> Self {
        PutData::Slice(values)
    }
}

impl<'a, T> From<&'a Vec<T>> for PutData<'a, T> {
    fn from(values: &'a Vec<T>) -> Self {
        PutData::Slice(values)
    }
}

impl<'a, T, const N: usize> From<&'a [T; N]> for PutData<'a, T> {
    fn from(values: &'a [T; N]) -> Self {
        PutData::Slice(values)
    }
}

impl<T> From<SharedBuffer<T>> for PutData<'_, T> {
    fn from(buffer: SharedBuffer<T>) -> Self {
        PutData::Shared(buffer)
    }
}

impl<T> From<&SharedBuffer<T>> for PutData<'_, T> {
    fn from(buffer: &SharedBuffer<T>) -> Self {
        PutData::Shared(buffer.clone())
    }
}

/// Write side shared by the file and stream writers
pub(crate) trait BlockWriter {
    fn serializer(&mut self) -> &mut Serializer;

    /// Move the buffered payload out so the next block fits
    fn spill(&mut self) -> Result<()>;
}

fn put_block<T: Element>(w: &mut dyn BlockWriter, desc: &VariableDesc, values: &[T]) -> Result<()> {
    match w.serializer().put(desc, values)? {
        PutOutcome::Buffered => Ok(()),
        PutOutcome::NeedsSpill => {
            debug!("buffer full at '{}', spilling", desc.name);
            w.spill()?;
            match w.serializer().put(desc, values)? {
                PutOutcome::Buffered => Ok(()),
                // an emptied buffer never asks for another spill
                PutOutcome::NeedsSpill => Err(Error::invalid(format!(
                    "block of '{}' does not fit an empty buffer",
                    desc.name
                ))),
            }
        }
    }
}

type DeferredPut = Box<dyn FnOnce(&mut dyn BlockWriter) -> Result<()> + Send>;
type DeferredGet = Box<dyn FnOnce(&Deserializer, Option<u64>) -> Result<()> + Send>;

enum Backend {
    BpWriter(BpWriter),
    BpReader(BpReader),
    StreamWriter(StreamWriter),
    StreamReader(StreamReader),
}

impl Backend {
    fn writer(&mut self) -> Option<&mut dyn BlockWriter> {
        match self {
            Backend::BpWriter(w) => Some(w as &mut dyn BlockWriter),
            Backend::StreamWriter(w) => Some(w as &mut dyn BlockWriter),
            _ => None,
        }
    }

    fn deserializer(&self) -> Option<&Deserializer> {
        match self {
            Backend::BpReader(r) => Some(r.deserializer()),
            Backend::StreamReader(r) => Some(r.deserializer()),
            _ => None,
        }
    }

    fn is_writer(&self) -> bool {
        matches!(self, Backend::BpWriter(_) | Backend::StreamWriter(_))
    }
}

/// A dataset or stream opened for writing or reading
pub struct Engine {
    name: String,
    io: Io,
    mode: Mode,
    state: State,
    current_step: u64,
    backend: Backend,
    deferred_puts: Vec<DeferredPut>,
    deferred_gets: Vec<DeferredGet>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("current_step", &self.current_step)
            .finish()
    }
}

impl Engine {
    pub(crate) fn open(io: &Io, name: &str, mode: Mode, comm: Box<dyn Comm>) -> Result<Self> {
        let params = io.engine_params()?;
        let kind = io.engine_kind();
        let backend = match (kind, mode) {
            (EngineKind::BpFile, Mode::Write | Mode::Append) => Backend::BpWriter(BpWriter::open(
                io,
                Path::new(name),
                params,
                comm,
                mode == Mode::Append,
            )?),
            (EngineKind::BpFile, Mode::Read | Mode::ReadRandomAccess) => {
                Backend::BpReader(BpReader::open(io, Path::new(name), params)?)
            }
            (EngineKind::Stream, Mode::Write) => {
                Backend::StreamWriter(StreamWriter::open(io, name, &params, comm)?)
            }
            (EngineKind::Stream, Mode::Read) => {
                Backend::StreamReader(StreamReader::open(io, name, &params)?)
            }
            (kind, mode) => {
                return Err(Error::invalid(format!(
                    "{kind:?} engine cannot be opened in {mode:?} mode"
                )))
            }
        };
        let current_step = match &backend {
            Backend::BpWriter(w) => w.steps(),
            _ => 0,
        };
        debug!("opened {kind:?} engine '{name}' in {mode:?} mode");
        Ok(Self {
            name: name.to_string(),
            io: io.clone(),
            mode,
            state: State::StepInactive,
            current_step,
            backend,
            deferred_puts: Vec::new(),
            deferred_gets: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn io(&self) -> &Io {
        &self.io
    }

    /// Step the engine is in, or the last one it was in
    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    pub fn is_step_active(&self) -> bool {
        self.state == State::StepActive
    }

    fn check_open(&self) -> Result<()> {
        if self.state == State::Closed {
            return Err(Error::ClosedEngine(self.name.clone()));
        }
        Ok(())
    }

    /// Begin the next step, waiting forever for a reader
    pub fn begin_step(&mut self) -> Result<StepStatus> {
        self.begin_step_with(StepMode::default(), -1.0)
    }

    /// Begin the next step; a reader waits at most `timeout_secs`, a
    /// negative timeout waits forever and zero polls once
    pub fn begin_step_with(&mut self, step_mode: StepMode, timeout_secs: f32) -> Result<StepStatus> {
        self.check_open()?;
        if self.state == State::StepActive {
            return Err(Error::invalid(format!(
                "engine '{}': begin_step while step {} is active",
                self.name, self.current_step
            )));
        }
        if self.mode == Mode::ReadRandomAccess {
            return Err(Error::invalid(format!(
                "engine '{}' was opened for random access and has no steps to iterate",
                self.name
            )));
        }
        let timeout = secs_to_duration(timeout_secs as f64);
        let status = match &mut self.backend {
            Backend::BpWriter(w) => {
                self.current_step = w.begin_step();
                StepStatus::Ok
            }
            Backend::StreamWriter(w) => {
                self.current_step = w.begin_step();
                StepStatus::Ok
            }
            Backend::BpReader(r) => {
                let status = r.begin_step(&self.io, timeout)?;
                if let Some(step) = r.current_step() {
                    self.current_step = step;
                }
                status
            }
            Backend::StreamReader(r) => {
                let status = r.begin_step(&self.io, timeout)?;
                if let Some(step) = r.current_step() {
                    self.current_step = step;
                }
                status
            }
        };
        if status == StepStatus::Ok {
            self.state = State::StepActive;
        }
        debug!(
            "engine '{}': begin_step ({step_mode:?}) -> {status:?}",
            self.name
        );
        Ok(status)
    }

    fn writer_for(&mut self, what: &str) -> Result<()> {
        self.check_open()?;
        if !self.backend.is_writer() {
            return Err(Error::invalid(format!(
                "{what} on engine '{}' opened in {:?} mode",
                self.name, self.mode
            )));
        }
        if self.state == State::StepInactive {
            self.begin_step()?;
        }
        Ok(())
    }

    fn run_put(&mut self, op: impl FnOnce(&mut dyn BlockWriter) -> Result<()>) -> Result<()> {
        let started = Instant::now();
        let writer = self
            .backend
            .writer()
            .ok_or_else(|| Error::invalid("engine has no writer"))?;
        let result = op(writer);
        if let Backend::BpWriter(w) = &mut self.backend {
            w.record_buffering(started);
        }
        result
    }

    /// Put one block of `var`, now (`Mode::Sync`) or at the next perform
    /// (`Mode::Deferred`). A deferred slice is copied at call time while a
    /// deferred [`SharedBuffer`] is read when the put is performed.
    pub fn put<'a, T: Element>(
        &mut self,
        var: &Variable<T>,
        data: impl Into<PutData<'a, T>>,
        mode: Mode,
    ) -> Result<()> {
        self.writer_for("put")?;
        let desc = var.desc().read().clone();
        match (mode, data.into()) {
            (Mode::Sync, PutData::Slice(values)) => {
                self.run_put(|w| put_block(w, &desc, values))
            }
            (Mode::Sync, PutData::Shared(buffer)) => {
                self.run_put(|w| put_block(w, &desc, &buffer.read()[..]))
            }
            (Mode::Deferred, PutData::Slice(values)) => {
                let values = values.to_vec();
                self.deferred_puts
                    .push(Box::new(move |w: &mut dyn BlockWriter| put_block(w, &desc, &values)));
                Ok(())
            }
            (Mode::Deferred, PutData::Shared(buffer)) => {
                self.deferred_puts.push(Box::new(move |w: &mut dyn BlockWriter| {
                    put_block(w, &desc, &buffer.read()[..])
                }));
                Ok(())
            }
            (mode, _) => Err(Error::invalid(format!(
                "put mode must be Sync or Deferred, got {mode:?}"
            ))),
        }
    }

    /// Run every queued put in call order; a no-op when none are queued
    pub fn perform_puts(&mut self) -> Result<()> {
        self.check_open()?;
        if self.deferred_puts.is_empty() {
            return Ok(());
        }
        let queued = std::mem::take(&mut self.deferred_puts);
        self.run_put(|w| queued.into_iter().try_for_each(|put| put(&mut *w)))
    }

    fn reader_for(&self, what: &str) -> Result<&Deserializer> {
        self.check_open()?;
        self.backend.deserializer().ok_or_else(|| {
            Error::invalid(format!(
                "{what} on engine '{}' opened in {:?} mode",
                self.name, self.mode
            ))
        })
    }

    /// Step a get resolves against: the active step, or none
    fn read_step(&self) -> Option<u64> {
        (self.state == State::StepActive).then_some(self.current_step)
    }

    /// Read `var`'s current selection
    pub fn get<T: Element>(&mut self, var: &Variable<T>) -> Result<Vec<T>> {
        let deserializer = self.reader_for("get")?;
        let desc = var.desc().read().clone();
        deserializer.read(&desc, self.read_step())
    }

    /// Read `var`'s current selection into `out`, which must match its size
    pub fn get_into<T: Element>(&mut self, var: &Variable<T>, out: &mut [T]) -> Result<()> {
        let values = self.get(var)?;
        if values.len() != out.len() {
            return Err(Error::invalid(format!(
                "get of '{}' yields {} elements into a buffer of {}",
                var.name(),
                values.len(),
                out.len()
            )));
        }
        out.clone_from_slice(&values);
        Ok(())
    }

    /// Queue a get; `buffer` receives the values at the next perform
    pub fn get_deferred<T: Element>(
        &mut self,
        var: &Variable<T>,
        buffer: &SharedBuffer<T>,
    ) -> Result<()> {
        self.reader_for("get")?;
        let desc = var.desc().read().clone();
        let buffer = buffer.clone();
        self.deferred_gets.push(Box::new(move |deserializer: &Deserializer, step: Option<u64>| {
            let values = deserializer.read::<T>(&desc, step)?;
            *buffer.write() = values;
            Ok(())
        }));
        Ok(())
    }

    /// Run every queued get in call order
    pub fn perform_gets(&mut self) -> Result<()> {
        let step = self.read_step();
        self.reader_for("perform_gets")?;
        let queued = std::mem::take(&mut self.deferred_gets);
        let deserializer = self.reader_for("perform_gets")?;
        queued.into_iter().try_for_each(|get| get(deserializer, step))
    }

    /// Per-block characteristics of `var` at `step`
    pub fn blocks_info<T: Element>(
        &self,
        var: &Variable<T>,
        step: u64,
    ) -> Result<Vec<BlockSummary<T>>> {
        self.reader_for("blocks_info")?.blocks_info(&var.name(), step)
    }

    /// Steps written so far, or steps available to the reader
    pub fn steps(&self) -> u64 {
        match &self.backend {
            Backend::BpWriter(w) => w.steps(),
            Backend::StreamWriter(w) => w.steps(),
            Backend::BpReader(r) => r.steps(),
            Backend::StreamReader(r) => r.steps(),
        }
    }

    /// Close the active step, performing whatever is still queued
    pub fn end_step(&mut self) -> Result<()> {
        self.check_open()?;
        if self.state != State::StepActive {
            return Err(Error::invalid(format!(
                "engine '{}': end_step without an active step",
                self.name
            )));
        }
        let result = if self.backend.is_writer() {
            self.perform_puts()
        } else {
            self.perform_gets()
        };
        // the step is over whether or not the queued operations succeeded
        self.state = State::StepInactive;
        result?;
        match &mut self.backend {
            Backend::BpWriter(w) => w.end_step(&self.io),
            Backend::StreamWriter(w) => w.end_step(&self.io),
            Backend::BpReader(_) => Ok(()),
            Backend::StreamReader(r) => {
                r.end_step();
                Ok(())
            }
        }
    }

    /// Finish the dataset or stream; every later call fails with `ClosedEngine`
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        let ended = if self.state == State::StepActive {
            self.end_step()
        } else if self.backend.is_writer() {
            self.perform_puts()
        } else {
            self.perform_gets()
        };
        let closed = match &mut self.backend {
            Backend::BpWriter(w) => w.close(),
            Backend::StreamWriter(w) => w.close(),
            Backend::BpReader(r) => r.close(),
            Backend::StreamReader(r) => {
                r.close();
                Ok(())
            }
        };
        self.state = State::Closed;
        debug!("closed engine '{}'", self.name);
        ended.and(closed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state != State::Closed && self.backend.is_writer() {
            warn!("engine '{}' dropped without close, the dataset is incomplete", self.name);
        }
    }
}
