//! Reader of the file engine
//!
//! A finished dataset is indexed from the step table behind the `md.0`
//! footer. While the writer is still active the `md.idx` records are
//! followed instead and re-read whenever the reader runs out of steps.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bpio_core::format::constants::files;
use bpio_core::FileKind;
use log::{debug, trace};

use super::StepStatus;
use crate::deserializer::{
    read_chunk, read_header, read_index, read_step_table, Deserializer, FilePayloads,
    MetadataIndex,
};
use crate::error::{Error, Result};
use crate::io::Io;
use crate::params::{EngineParams, TransportLibrary};
use crate::transport::{open_transport, OpenMode, Transport};

pub(crate) struct BpReader {
    dir: PathBuf,
    params: EngineParams,
    md: Box<dyn Transport>,
    payloads: Arc<FilePayloads>,
    deserializer: Deserializer,
    /// Step chunks already added to the index
    chunks_loaded: usize,
    /// Position in the index's step list of the next step to hand out
    cursor: usize,
    current: Option<u64>,
    writer_active: bool,
}

fn wait_for_dataset(dir: &Path, timeout: Option<Duration>, poll: Duration) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let ready = dir.join(files::METADATA).is_file() && dir.join(files::METADATA_INDEX).is_file();
        if ready {
            return Ok(());
        }
        match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                return Err(Error::NotFound(format!("dataset {}", dir.display())));
            }
            Some(deadline) => {
                thread::sleep(poll.min(deadline.saturating_duration_since(Instant::now())))
            }
            None => thread::sleep(poll),
        }
    }
}

impl BpReader {
    pub fn open(io: &Io, dir: &Path, params: EngineParams) -> Result<Self> {
        wait_for_dataset(dir, params.open_timeout(), params.polling_interval())?;
        let mut md = open_transport(params.library, &dir.join(files::METADATA), OpenMode::Read)?;
        read_header(md.as_mut(), FileKind::Metadata)?;

        let payloads = Arc::new(FilePayloads::new(dir, params.library));
        let deserializer = Deserializer::new(
            MetadataIndex::new(),
            Box::new(Arc::clone(&payloads)),
            io.operators(),
            params.threads,
        )?;
        let mut reader = Self {
            dir: dir.to_path_buf(),
            params,
            md,
            payloads,
            deserializer,
            chunks_loaded: 0,
            cursor: 0,
            current: None,
            writer_active: true,
        };
        reader.refresh()?;
        debug!(
            "opened {} with {} step(s), writer {}",
            reader.dir.display(),
            reader.deserializer.index().steps().len(),
            if reader.writer_active { "active" } else { "done" }
        );
        io.register_from_index(reader.deserializer.index(), None);
        Ok(reader)
    }

    /// Pick up steps published since the last look
    fn refresh(&mut self) -> Result<()> {
        // md.idx is polled while it grows, so it is always read through posix
        let idx_path = self.dir.join(files::METADATA_INDEX);
        let mut idx = open_transport(TransportLibrary::Posix, &idx_path, OpenMode::Read)?;
        let (active, records) = read_index(idx.as_mut())?;
        idx.close()?;

        let table = if active {
            None
        } else {
            read_step_table(self.md.as_mut())?
        };
        let locations: Vec<(u64, u64)> = match &table {
            Some(entries) => entries.iter().map(|e| (e.chunk_offset, e.chunk_length)).collect(),
            None => records.iter().map(|r| (r.chunk_offset, r.chunk_length)).collect(),
        };
        for &(offset, len) in locations.iter().skip(self.chunks_loaded) {
            let chunk = read_chunk(self.md.as_mut(), offset, len)?;
            let header = self.deserializer.index_mut().add_chunk(&chunk)?;
            trace!("indexed step {} ({} blocks)", header.step, header.block_count);
            self.chunks_loaded += 1;
        }
        self.writer_active = active;
        Ok(())
    }

    /// Advance to the next step; `None` waits forever
    pub fn begin_step(&mut self, io: &Io, timeout: Option<Duration>) -> Result<StepStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut refreshed = false;
        loop {
            if let Some(&step) = self.deserializer.index().steps().get(self.cursor) {
                self.cursor += 1;
                self.current = Some(step);
                io.register_from_index(self.deserializer.index(), self.current);
                return Ok(StepStatus::Ok);
            }
            if !self.writer_active {
                return Ok(StepStatus::EndOfStream);
            }
            if refreshed {
                match deadline {
                    Some(deadline) if Instant::now() >= deadline => return Ok(StepStatus::NotReady),
                    Some(deadline) => {
                        let left = deadline.saturating_duration_since(Instant::now());
                        thread::sleep(self.params.polling_interval().min(left))
                    }
                    None => thread::sleep(self.params.polling_interval()),
                }
            }
            self.refresh()?;
            refreshed = true;
        }
    }

    pub fn current_step(&self) -> Option<u64> {
        self.current
    }

    pub fn steps(&self) -> u64 {
        self.deserializer.index().steps().len() as u64
    }

    pub fn deserializer(&self) -> &Deserializer {
        &self.deserializer
    }

    pub fn close(&mut self) -> Result<()> {
        self.payloads.close()?;
        self.md.close()
    }
}
