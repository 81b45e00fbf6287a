//! Aggregation
//!
//! Reconciles the independently produced buffers of every writer rank into
//! one dataset. Payloads are routed to data subfiles according to the
//! [`AggregationType`]; metadata is gathered on rank 0, merged per step in
//! rank order and appended to `md.0`, with one `md.idx` record per step.
//! Sizes always travel before payloads, so no rank needs to know another
//! rank's buffer length in advance.
//!
//! Every collective settles through [`collective`], which broadcasts an
//! abort on failure so all ranks report the same `CollectiveFailure`.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bpio_core::format::constants::{files, FILE_HEADER_SIZE};
use bpio_core::{
    ByteReader, ChunkHeader, FileHeader, FileKind, Footer, IndexRecord, Record, StepMarker,
    StepTableEntry,
};
use hashbrown::{HashMap, HashSet};
use log::{debug, trace};

use crate::comm::{collective, decode_u64, tags, Comm};
use crate::deserializer::{read_chunk_header, read_index, read_step_table};
use crate::error::{Error, IoContext, Result};
use crate::params::{AggregationType, EngineParams, TransportLibrary};
use crate::profiling::{Phase, Profile};
use crate::transport::{open_transport, OpenMode, Transport};

/// Default number of subfiles for a strategy and communicator size
pub fn default_aggregators(strategy: AggregationType, size: usize) -> usize {
    match strategy {
        AggregationType::EveryoneWrites | AggregationType::EveryoneWritesSerial => size,
        AggregationType::TwoLevelShm => 1,
        AggregationType::DataSizeBased => (size / 2).max(1),
    }
}

/// Assignment of ranks to data subfiles for one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Subfile receiving each rank's payload
    pub subfile_of: Vec<u32>,
    /// Rank writing each subfile
    pub writer_of: Vec<usize>,
}

impl Plan {
    /// Plan a flush; `sizes` holds every rank's payload length
    pub fn new(strategy: AggregationType, num_aggregators: usize, sizes: &[u64]) -> Self {
        let size = sizes.len().max(1);
        let n = match num_aggregators {
            0 => default_aggregators(strategy, size),
            n => n,
        }
        .clamp(1, size);

        let subfile_of: Vec<u32> = match strategy {
            AggregationType::EveryoneWrites | AggregationType::EveryoneWritesSerial => {
                (0..size as u32).collect()
            }
            AggregationType::TwoLevelShm => (0..size).map(|r| (r * n / size) as u32).collect(),
            AggregationType::DataSizeBased => {
                let mut order: Vec<usize> = (0..size).collect();
                order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]).then(a.cmp(&b)));
                let mut load = vec![(0u64, 0usize); n];
                let mut out = vec![0u32; size];
                for rank in order {
                    let (target, _) = load
                        .iter()
                        .enumerate()
                        .min_by_key(|(i, l)| (**l, *i))
                        .unwrap_or((0, &(0, 0)));
                    out[rank] = target as u32;
                    load[target].0 += sizes[rank];
                    load[target].1 += 1;
                }
                out
            }
        };

        let subfiles = subfile_of.iter().map(|&s| s as usize + 1).max().unwrap_or(1);
        let mut writer_of = vec![usize::MAX; subfiles];
        for (rank, &s) in subfile_of.iter().enumerate() {
            let w = &mut writer_of[s as usize];
            *w = (*w).min(rank);
        }
        Self {
            subfile_of,
            writer_of,
        }
    }

    /// Ranks whose payload goes to `subfile`, in rank order
    pub fn members(&self, subfile: u32) -> impl Iterator<Item = usize> + '_ {
        self.subfile_of
            .iter()
            .enumerate()
            .filter(move |(_, &s)| s == subfile)
            .map(|(r, _)| r)
    }
}

/// Where a rank's flushed payload landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub subfile: u32,
    /// Final offset minus the serializer's absolute position of the batch
    pub delta: i64,
}

/// One merged step: chunk header followed by each rank's records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepChunk {
    pub header: ChunkHeader,
    pub bytes: Vec<u8>,
}

struct Section<'a> {
    marker: StepMarker,
    bytes: &'a [u8],
    names: Vec<String>,
    attributes: u32,
}

fn split_sections(buf: &[u8]) -> Result<Vec<Section<'_>>> {
    let mut out = Vec::new();
    let mut reader = ByteReader::new(buf);
    let mut start = 0;
    let mut names = Vec::new();
    let mut attributes = 0;
    while !reader.is_empty() {
        match Record::decode(&mut reader)? {
            Record::Block(block) => names.push(block.name),
            Record::Attribute(_) => attributes += 1,
            Record::StepEnd(marker) => {
                let end = reader.position();
                out.push(Section {
                    marker,
                    bytes: &buf[start..end],
                    names: std::mem::take(&mut names),
                    attributes,
                });
                attributes = 0;
                start = end;
            }
        }
    }
    if start != buf.len() {
        return Err(Error::CollectiveFailure(
            "metadata ends inside an unterminated step".into(),
        ));
    }
    Ok(out)
}

/// Merge per-rank metadata streams into one chunk per step
pub fn merge_steps(rank_buffers: &[Vec<u8>]) -> Result<Vec<StepChunk>> {
    let sections = rank_buffers
        .iter()
        .map(|b| split_sections(b))
        .collect::<Result<Vec<_>>>()?;
    let steps = sections.first().map_or(0, Vec::len);
    if let Some((rank, s)) = sections.iter().enumerate().find(|(_, s)| s.len() != steps) {
        return Err(Error::CollectiveFailure(format!(
            "rank {rank} closed {} steps, rank 0 closed {steps}",
            s.len()
        )));
    }

    let mut chunks = Vec::with_capacity(steps);
    for i in 0..steps {
        let step = sections[0][i].marker.step;
        let mut header = ChunkHeader {
            step,
            rank_count: rank_buffers.len() as u32,
            ..Default::default()
        };
        let mut variables = HashSet::new();
        for (rank, rank_sections) in sections.iter().enumerate() {
            let section = &rank_sections[i];
            if section.marker.step != step {
                return Err(Error::CollectiveFailure(format!(
                    "rank {rank} closed step {} while rank 0 closed step {step}",
                    section.marker.step
                )));
            }
            header.block_count += section.marker.block_count;
            header.attribute_count += section.attributes;
            variables.extend(section.names.iter().map(String::as_str));
        }
        header.variable_count = variables.len() as u32;

        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        for rank_sections in &sections {
            bytes.extend_from_slice(rank_sections[i].bytes);
        }
        chunks.push(StepChunk { header, bytes });
    }
    Ok(chunks)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct Subfile {
    transport: Box<dyn Transport>,
    end: u64,
}

/// Metadata files owned by rank 0
struct MetadataFiles {
    md: Box<dyn Transport>,
    idx: Box<dyn Transport>,
    md_end: u64,
    entries: Vec<StepTableEntry>,
}

impl MetadataFiles {
    fn create(dir: &Path, library: TransportLibrary) -> Result<Self> {
        let mut md = open_transport(library, &dir.join(files::METADATA), OpenMode::Write)?;
        let mut idx = open_transport(library, &dir.join(files::METADATA_INDEX), OpenMode::Write)?;
        md.write(&FileHeader::new(FileKind::Metadata).to_bytes(), Some(0))?;
        idx.write(
            &FileHeader::new(FileKind::MetadataIndex)
                .with_active(true)
                .to_bytes(),
            Some(0),
        )?;
        idx.flush()?;
        Ok(Self {
            md,
            idx,
            md_end: FILE_HEADER_SIZE as u64,
            entries: Vec::new(),
        })
    }

    /// Reopen an existing dataset for appending steps
    fn append(dir: &Path, library: TransportLibrary) -> Result<Self> {
        let md_path = dir.join(files::METADATA);
        if !md_path.exists() {
            return Self::create(dir, library);
        }
        let mut md = open_transport(library, &md_path, OpenMode::Append)?;
        let mut idx = open_transport(library, &dir.join(files::METADATA_INDEX), OpenMode::Append)?;

        let (active, records) = read_index(idx.as_mut())?;
        let table = if active {
            None
        } else {
            read_step_table(md.as_mut())?
        };
        let entries = match table {
            Some(entries) => entries,
            None => records
                .iter()
                .map(|r| {
                    let chunk = read_chunk_header(md.as_mut(), r.chunk_offset)?;
                    Ok(r.to_step_entry(chunk.variable_count))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        // drop a partially written trailing record before appending
        let idx_len = (FILE_HEADER_SIZE + records.len() * IndexRecord::SIZE) as u64;
        if idx.size()? != idx_len {
            let mut rebuilt = Vec::with_capacity(idx_len as usize);
            rebuilt.extend_from_slice(&FileHeader::new(FileKind::MetadataIndex).with_active(true).to_bytes());
            for r in &records {
                rebuilt.extend_from_slice(&r.to_bytes());
            }
            idx.close()?;
            idx = open_transport(library, &dir.join(files::METADATA_INDEX), OpenMode::Write)?;
            idx.write(&rebuilt, Some(0))?;
        } else {
            idx.write(
                &FileHeader::new(FileKind::MetadataIndex)
                    .with_active(true)
                    .to_bytes(),
                Some(0),
            )?;
        }
        idx.flush()?;

        let mut md_end = md.size()?;
        if md_end < FILE_HEADER_SIZE as u64 {
            md.write(&FileHeader::new(FileKind::Metadata).to_bytes(), Some(0))?;
            md_end = FILE_HEADER_SIZE as u64;
        }
        debug!(
            "appending to {} after {} steps at offset {md_end}",
            dir.display(),
            entries.len()
        );
        Ok(Self {
            md,
            idx,
            md_end,
            entries,
        })
    }

    fn next_step(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.step + 1)
    }

    fn publish(&mut self, chunks: &[StepChunk]) -> Result<u64> {
        let mut records = Vec::with_capacity(chunks.len());
        let mut written = 0;
        for chunk in chunks {
            let offset = self.md_end;
            self.md.write(&chunk.bytes, Some(offset))?;
            self.md_end += chunk.bytes.len() as u64;
            written += chunk.bytes.len() as u64;

            let record = IndexRecord {
                step: chunk.header.step,
                chunk_offset: offset,
                chunk_length: chunk.bytes.len() as u64,
                block_count: chunk.header.block_count as u64,
                rank_count: chunk.header.rank_count as u64,
                timestamp_ms: now_ms(),
            };
            self.entries
                .push(record.to_step_entry(chunk.header.variable_count));
            records.push(record);
        }
        // chunks must be durable before the index points at them
        self.md.flush()?;
        for record in &records {
            self.idx.write(&record.to_bytes(), None)?;
        }
        self.idx.flush()?;
        Ok(written)
    }

    fn finalize(&mut self) -> Result<()> {
        let table: Vec<u8> = self.entries.iter().flat_map(|e| e.to_bytes()).collect();
        let footer = Footer::new(self.md_end, table.len() as u64, self.entries.len() as u64);
        self.md.write(&table, Some(self.md_end))?;
        self.md
            .write(&footer.to_bytes(), Some(self.md_end + table.len() as u64))?;
        self.md.flush()?;
        self.md.close()?;

        self.idx.write(
            &FileHeader::new(FileKind::MetadataIndex)
                .with_active(false)
                .to_bytes(),
            Some(0),
        )?;
        self.idx.flush()?;
        self.idx.close()
    }
}

/// Per-rank aggregation state of a file writer
pub struct Aggregator {
    comm: Box<dyn Comm>,
    strategy: AggregationType,
    num_aggregators: usize,
    dir: PathBuf,
    library: TransportLibrary,
    append: bool,
    subfiles: HashMap<u32, Subfile>,
    metadata: Option<MetadataFiles>,
    first_step: u64,
    profile: Profile,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("rank", &self.comm.rank())
            .field("strategy", &self.strategy)
            .field("dir", &self.dir)
            .finish()
    }
}

impl Aggregator {
    /// Collective open: rank 0 prepares the dataset directory and the
    /// metadata files, every rank learns the first step to write
    pub fn open(
        mut comm: Box<dyn Comm>,
        dir: &Path,
        params: &EngineParams,
        append: bool,
    ) -> Result<Self> {
        comm.set_timeout(params.collective_timeout());
        let mut metadata = None;
        let prepared = if comm.rank() == 0 {
            Self::prepare(dir, params.library, append).map(|files| {
                let next = files.next_step();
                metadata = Some(files);
                next
            })
        } else {
            Ok(0)
        };
        let prepared = collective(comm.as_ref(), "open", prepared)?;
        let announced = comm.broadcast_bytes(Some(prepared.to_le_bytes().to_vec()), 0);
        let first_step = collective(comm.as_ref(), "open", announced.and_then(|b| decode_u64(&b)))?;

        debug!(
            "rank {}/{}: writing {} with {:?}, first step {first_step}",
            comm.rank(),
            comm.size(),
            dir.display(),
            params.aggregation_type
        );
        let profile = Profile::new(comm.rank());
        Ok(Self {
            comm,
            strategy: params.aggregation_type,
            num_aggregators: params.num_aggregators,
            dir: dir.to_path_buf(),
            library: params.library,
            append,
            subfiles: HashMap::new(),
            metadata,
            first_step,
            profile,
        })
    }

    fn prepare(dir: &Path, library: TransportLibrary, append: bool) -> Result<MetadataFiles> {
        std::fs::create_dir_all(dir).context(|| format!("creating {}", dir.display()))?;
        if append {
            return MetadataFiles::append(dir, library);
        }
        // subfiles of an earlier, wider run would confuse readers
        let entries = std::fs::read_dir(dir).context(|| format!("listing {}", dir.display()))?;
        for entry in entries {
            let entry = entry.context(|| format!("listing {}", dir.display()))?;
            if entry.file_name().to_string_lossy().starts_with(files::DATA_PREFIX) {
                std::fs::remove_file(entry.path())
                    .context(|| format!("removing {}", entry.path().display()))?;
            }
        }
        MetadataFiles::create(dir, library)
    }

    pub fn comm(&self) -> &dyn Comm {
        self.comm.as_ref()
    }

    pub fn first_step(&self) -> u64 {
        self.first_step
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> &mut Profile {
        &mut self.profile
    }

    /// Whether a full buffer may be spilled without a collective
    pub fn can_spill(&self) -> bool {
        self.strategy.is_per_rank()
    }

    fn append_to_subfile(&mut self, subfile: u32, bytes: &[u8]) -> Result<u64> {
        if bytes.is_empty() {
            return Ok(self
                .subfiles
                .get(&subfile)
                .map_or(FILE_HEADER_SIZE as u64, |s| s.end));
        }
        let started = Instant::now();
        if !self.subfiles.contains_key(&subfile) {
            let path = self.dir.join(format!("{}{subfile}", files::DATA_PREFIX));
            let mode = if self.append {
                OpenMode::Append
            } else {
                OpenMode::Write
            };
            let mut transport = open_transport(self.library, &path, mode)?;
            let mut end = transport.size()?;
            if end < FILE_HEADER_SIZE as u64 {
                transport.write(&FileHeader::new(FileKind::Data).to_bytes(), Some(0))?;
                end = FILE_HEADER_SIZE as u64;
            }
            self.subfiles.insert(subfile, Subfile { transport, end });
        }
        let file = self
            .subfiles
            .get_mut(&subfile)
            .ok_or_else(|| Error::NotFound(format!("subfile {subfile}")))?;
        let offset = file.end;
        file.transport.write(bytes, Some(offset))?;
        file.end += bytes.len() as u64;
        trace!("subfile {subfile}: {} bytes at {offset}", bytes.len());

        self.profile.bytes_written += bytes.len() as u64;
        self.profile.add(Phase::Transport, started.elapsed());
        Ok(offset)
    }

    /// Write a full buffer to this rank's own subfile, outside any collective
    pub fn spill(&mut self, payload: &[u8], batch_start: u64) -> Result<Placement> {
        if !self.can_spill() {
            return Err(Error::invalid(format!(
                "{:?} aggregation cannot spill a full buffer",
                self.strategy
            )));
        }
        let subfile = self.comm.rank() as u32;
        let offset = self.append_to_subfile(subfile, payload)?;
        debug!(
            "rank {}: spilled {} bytes to subfile {subfile}",
            self.comm.rank(),
            payload.len()
        );
        Ok(Placement {
            subfile,
            delta: offset as i64 - batch_start as i64,
        })
    }

    /// Collective data phase: route every rank's payload to its subfile
    pub fn write_payload(&mut self, payload: Vec<u8>, batch_start: u64) -> Result<Placement> {
        let started = Instant::now();
        let result = self.exchange_payload(payload, batch_start);
        self.profile.add(Phase::Aggregation, started.elapsed());
        collective(self.comm.as_ref(), "data aggregation", result)
    }

    fn exchange_payload(&mut self, mut payload: Vec<u8>, batch_start: u64) -> Result<Placement> {
        let rank = self.comm.rank();
        let size = self.comm.size();
        let sizes = if self.strategy == AggregationType::DataSizeBased && size > 1 {
            self.comm.all_gather_u64(payload.len() as u64)?
        } else {
            vec![0; size]
        };
        let plan = Plan::new(self.strategy, self.num_aggregators, &sizes);
        let subfile = plan.subfile_of[rank];
        let writer = plan.writer_of[subfile as usize];

        // sends never block, so members hand off before any writer waits
        if writer != rank {
            self.comm
                .send(writer, tags::DATA_SIZE, (payload.len() as u64).to_le_bytes().to_vec())?;
            self.comm.send(writer, tags::DATA, std::mem::take(&mut payload))?;
        }

        let serial = self.strategy == AggregationType::EveryoneWritesSerial;
        if serial && rank > 0 {
            self.comm.recv(rank - 1, tags::TOKEN)?;
        }

        let mut own_offset = None;
        let owned: Vec<u32> = (0..plan.writer_of.len() as u32)
            .filter(|&s| plan.writer_of[s as usize] == rank)
            .collect();
        for s in owned {
            let members: Vec<usize> = plan.members(s).collect();
            for member in members {
                if member == rank {
                    own_offset = Some(self.append_to_subfile(s, &payload)?);
                    continue;
                }
                let announced = decode_u64(&self.comm.recv(member, tags::DATA_SIZE)?)?;
                let bytes = self.comm.recv(member, tags::DATA)?;
                if bytes.len() as u64 != announced {
                    return Err(Error::CollectiveFailure(format!(
                        "rank {member} announced {announced} payload bytes but sent {}",
                        bytes.len()
                    )));
                }
                let offset = self.append_to_subfile(s, &bytes)?;
                self.comm
                    .send(member, tags::DATA_OFFSET, offset.to_le_bytes().to_vec())?;
            }
            if let Some(file) = self.subfiles.get_mut(&s) {
                file.transport.flush()?;
            }
        }

        if serial && rank + 1 < size {
            self.comm.send(rank + 1, tags::TOKEN, Vec::new())?;
        }

        let offset = match own_offset {
            Some(offset) => offset,
            None => decode_u64(&self.comm.recv(writer, tags::DATA_OFFSET)?)?,
        };
        Ok(Placement {
            subfile,
            delta: offset as i64 - batch_start as i64,
        })
    }

    /// Collective metadata phase: gather, merge and publish closed steps
    pub fn write_metadata(&mut self, metadata: Vec<u8>) -> Result<()> {
        let started = Instant::now();
        self.profile.metadata_bytes += metadata.len() as u64;
        let result = self.exchange_metadata(metadata);
        self.profile.add(Phase::Aggregation, started.elapsed());
        collective(self.comm.as_ref(), "metadata aggregation", result)
    }

    fn exchange_metadata(&mut self, metadata: Vec<u8>) -> Result<()> {
        let gathered = self.comm.gather_bytes(metadata, 0)?;
        if let Some(buffers) = gathered {
            let published = merge_steps(&buffers).and_then(|chunks| {
                let files = self
                    .metadata
                    .as_mut()
                    .ok_or_else(|| Error::invalid("metadata files are not open"))?;
                let written = files.publish(&chunks)?;
                debug!("published {} step(s), {written} metadata bytes", chunks.len());
                Ok(())
            });
            collective(self.comm.as_ref(), "metadata publish", published)?;
            self.comm.broadcast_bytes(Some(Vec::new()), 0)?;
        } else {
            self.comm.broadcast_bytes(None, 0)?;
        }
        Ok(())
    }

    /// Collective close: step table, footer, cleared active flag
    pub fn finalize(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut result = Ok(());
        for (_, mut file) in self.subfiles.drain() {
            if let Err(err) = file.transport.close() {
                result = Err(err);
            }
        }
        if let Some(mut files) = self.metadata.take() {
            result = result.and_then(|()| files.finalize());
        }
        let result = collective(self.comm.as_ref(), "close", result);
        let result = result.and_then(|()| {
            let ack = self.comm.barrier();
            collective(self.comm.as_ref(), "close", ack)
        });
        self.profile.add(Phase::Close, started.elapsed());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_stream(step: u64, names: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let block = bpio_core::BlockRecord {
                name: name.to_string(),
                shape_id: Some(bpio_core::ShapeId::GlobalValue),
                data_type: Some(bpio_core::DataType::I32),
                step,
                block_id: i as u32,
                value: 1i32.to_le_bytes().to_vec(),
                ..Default::default()
            };
            block.encode(&mut buf).unwrap();
        }
        StepMarker {
            step,
            variable_count: names.len() as u32,
            block_count: names.len() as u32,
            metadata_start: 0,
            metadata_length: buf.len() as u64,
        }
        .encode(&mut buf);
        buf
    }

    #[test]
    fn test_plans() {
        let plan = Plan::new(AggregationType::EveryoneWrites, 0, &[0; 3]);
        assert_eq!(plan.subfile_of, vec![0, 1, 2]);
        assert_eq!(plan.writer_of, vec![0, 1, 2]);

        let plan = Plan::new(AggregationType::TwoLevelShm, 2, &[0; 5]);
        assert_eq!(plan.subfile_of, vec![0, 0, 0, 1, 1]);
        assert_eq!(plan.writer_of, vec![0, 3]);
        assert_eq!(plan.members(1).collect::<Vec<_>>(), vec![3, 4]);

        let plan = Plan::new(AggregationType::TwoLevelShm, 0, &[0; 4]);
        assert_eq!(plan.writer_of, vec![0]);
    }

    #[test]
    fn test_data_size_based_balances_load() {
        let plan = Plan::new(AggregationType::DataSizeBased, 2, &[100, 10, 60, 50]);
        // 100 -> 0, 60 -> 1, 50 -> 1, 10 -> 0
        assert_eq!(plan.subfile_of, vec![0, 0, 1, 1]);
        assert_eq!(plan.writer_of, vec![0, 2]);

        // empty payloads still spread over every subfile
        let plan = Plan::new(AggregationType::DataSizeBased, 0, &[0; 4]);
        assert_eq!(plan.writer_of.len(), 2);
    }

    #[test]
    fn test_merge_keeps_rank_order() {
        let mut r0 = step_stream(0, &["a"]);
        r0.extend(step_stream(1, &["a"]));
        let mut r1 = step_stream(0, &["a", "b"]);
        r1.extend(step_stream(1, &["b"]));

        let chunks = merge_steps(&[r0.clone(), r1]).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].header.block_count, 3);
        assert_eq!(chunks[0].header.variable_count, 2);
        assert_eq!(chunks[0].header.rank_count, 2);
        assert_eq!(chunks[1].header.step, 1);

        let mut reader = ByteReader::new(&chunks[0].bytes);
        ChunkHeader::decode(&mut reader).unwrap();
        match Record::decode(&mut reader).unwrap() {
            Record::Block(b) => assert_eq!(b.name, "a"),
            other => panic!("unexpected {other:?}"),
        }

        let mismatch = merge_steps(&[r0, step_stream(0, &["a"])]);
        assert!(matches!(mismatch, Err(Error::CollectiveFailure(_))));
    }
}
