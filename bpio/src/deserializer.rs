//! Reader-side deserializer
//!
//! Builds the per-variable `step -> blocks` index from merged step chunks
//! and resolves reads against it. A read computes the requested box, tests
//! every block of the step for intersection, fetches only the byte range
//! covering the overlap (the whole block when an operator chain has to be
//! undone) and copies the overlap into place. Elements no block covers are
//! left at `T::default()`, so a selection without any overlapping block
//! yields a zero-filled result rather than an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bpio_core::format::constants::{files, FILE_HEADER_SIZE, JOINED_DIM};
use bpio_core::selection::{copy_region, covering_range, View};
use bpio_core::validation::checked_element_count;
use bpio_core::{
    AttributeRecord, BlockRecord, ByteReader, ChunkHeader, DataType, Element, FileHeader,
    FileKind, Footer, FormatError, IndexRecord, Record, Region, Selection, ShapeId,
    StepTableEntry,
};
use bytes::Bytes;
use hashbrown::HashMap;
use log::trace;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::operator::OperatorRegistry;
use crate::params::TransportLibrary;
use crate::transport::{open_transport, OpenMode, Transport};
use crate::variable::VariableDesc;

/// Read a whole file through a transport
pub(crate) fn read_all(t: &mut dyn Transport) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; t.size()? as usize];
    if !buf.is_empty() {
        t.read(&mut buf, 0)?;
    }
    Ok(buf)
}

/// Validate the header of a dataset file
pub(crate) fn read_header(t: &mut dyn Transport, kind: FileKind) -> Result<FileHeader> {
    let mut raw = [0u8; FILE_HEADER_SIZE];
    t.read(&mut raw, 0)?;
    let header = FileHeader::from_bytes(&raw)?;
    if header.kind != kind {
        return Err(FormatError::InvalidHeader.into());
    }
    Ok(header)
}

/// Writer-active flag and complete step records of `md.idx`
///
/// A file still shorter than its header belongs to a writer that is
/// creating it; a trailing partial record is ignored.
pub(crate) fn read_index(idx: &mut dyn Transport) -> Result<(bool, Vec<IndexRecord>)> {
    let bytes = read_all(idx)?;
    if bytes.len() < FILE_HEADER_SIZE {
        return Ok((true, Vec::new()));
    }
    let header = FileHeader::from_bytes(&bytes[..FILE_HEADER_SIZE])?;
    if header.kind != FileKind::MetadataIndex {
        return Err(FormatError::InvalidHeader.into());
    }
    let records = bytes[FILE_HEADER_SIZE..]
        .chunks_exact(IndexRecord::SIZE)
        .map(IndexRecord::from_bytes)
        .collect::<std::result::Result<Vec<_>, FormatError>>()?;
    Ok((header.active, records))
}

/// Step table located through the footer, `None` when there is no valid footer
pub(crate) fn read_step_table(md: &mut dyn Transport) -> Result<Option<Vec<StepTableEntry>>> {
    let size = md.size()?;
    if size < (FILE_HEADER_SIZE + Footer::SIZE) as u64 {
        return Ok(None);
    }
    let mut tail = [0u8; Footer::SIZE];
    md.read(&mut tail, size - Footer::SIZE as u64)?;
    let Ok(footer) = Footer::from_bytes(&tail) else {
        return Ok(None);
    };
    if footer.metadata_offset + footer.metadata_length + Footer::SIZE as u64 != size {
        return Ok(None);
    }

    let mut table = vec![0u8; footer.metadata_length as usize];
    md.read(&mut table, footer.metadata_offset)?;
    let entries = table
        .chunks_exact(StepTableEntry::SIZE)
        .map(StepTableEntry::from_bytes)
        .collect::<std::result::Result<Vec<_>, FormatError>>()?;
    Ok(Some(entries))
}

pub(crate) fn read_chunk(md: &mut dyn Transport, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut chunk = vec![0u8; len as usize];
    md.read(&mut chunk, offset)?;
    Ok(chunk)
}

pub(crate) fn read_chunk_header(md: &mut dyn Transport, offset: u64) -> Result<ChunkHeader> {
    let raw = read_chunk(md, offset, ChunkHeader::SIZE as u64)?;
    Ok(ChunkHeader::decode(&mut ByteReader::new(&raw))?)
}

/// Blocks of one variable, per step
#[derive(Debug, Clone)]
pub struct VariableIndex {
    pub name: String,
    pub data_type: DataType,
    pub shape_id: ShapeId,
    pub steps: BTreeMap<u64, Vec<BlockRecord>>,
}

impl VariableIndex {
    /// Global shape of the variable at `step`
    pub fn shape_at(&self, step: u64) -> Vec<u64> {
        let blocks = self.steps.get(&step).map(Vec::as_slice).unwrap_or_default();
        match self.shape_id {
            ShapeId::GlobalArray | ShapeId::JoinedArray => {
                blocks.first().map(|b| b.shape.clone()).unwrap_or_default()
            }
            ShapeId::LocalValue => vec![blocks.len() as u64],
            ShapeId::GlobalValue | ShapeId::LocalArray => Vec::new(),
        }
    }

    /// Steps at which the variable was written, ascending
    pub fn step_ids(&self) -> Vec<u64> {
        self.steps.keys().copied().collect()
    }

    pub fn last_step(&self) -> Option<u64> {
        self.steps.keys().next_back().copied()
    }
}

/// Merged metadata of every step loaded so far
#[derive(Debug, Default, Clone)]
pub struct MetadataIndex {
    variables: HashMap<String, VariableIndex>,
    attributes: Vec<AttributeRecord>,
    steps: Vec<u64>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one step chunk; block ids are renumbered in merged rank order
    pub fn add_chunk(&mut self, chunk: &[u8]) -> Result<ChunkHeader> {
        let mut reader = ByteReader::new(chunk);
        let header = ChunkHeader::decode(&mut reader)?;

        let mut order: Vec<String> = Vec::new();
        let mut blocks: HashMap<String, Vec<BlockRecord>> = HashMap::new();
        while !reader.is_empty() {
            match Record::decode(&mut reader)? {
                Record::Block(block) => {
                    if block.step != header.step {
                        return Err(FormatError::CorruptedData.into());
                    }
                    if !blocks.contains_key(&block.name) {
                        order.push(block.name.clone());
                    }
                    blocks.entry(block.name.clone()).or_default().push(block);
                }
                Record::Attribute(attr) => {
                    if !self.attributes.iter().any(|a| a.name == attr.name) {
                        self.attributes.push(attr);
                    }
                }
                Record::StepEnd(_) => {}
            }
        }

        for name in order {
            let Some(mut step_blocks) = blocks.remove(&name) else {
                continue;
            };
            let first = &step_blocks[0];
            let data_type = first.data_type()?;
            let shape_id = first.shape_id()?;
            if step_blocks
                .iter()
                .any(|b| b.data_type != Some(data_type) || b.shape_id != Some(shape_id))
            {
                return Err(FormatError::CorruptedData.into());
            }
            for (id, block) in step_blocks.iter_mut().enumerate() {
                block.block_id = id as u32;
            }
            if shape_id == ShapeId::JoinedArray {
                join_blocks(&mut step_blocks)?;
            }

            let var = self
                .variables
                .entry(name.clone())
                .or_insert_with(|| VariableIndex {
                    name,
                    data_type,
                    shape_id,
                    steps: BTreeMap::new(),
                });
            if var.data_type != data_type {
                return Err(FormatError::CorruptedData.into());
            }
            var.steps.insert(header.step, step_blocks);
        }

        if let Err(pos) = self.steps.binary_search(&header.step) {
            self.steps.insert(pos, header.step);
        }
        trace!(
            "indexed step {}: {} blocks from {} ranks",
            header.step,
            header.block_count,
            header.rank_count
        );
        Ok(header)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableIndex> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableIndex> {
        self.variables.values()
    }

    pub fn attributes(&self) -> &[AttributeRecord] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeRecord> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Known steps, ascending
    pub fn steps(&self) -> &[u64] {
        &self.steps
    }
}

/// Resolve the joined dimension: blocks are stacked in merged order
fn join_blocks(blocks: &mut [BlockRecord]) -> Result<()> {
    let dim = blocks[0]
        .shape
        .iter()
        .position(|&d| d == JOINED_DIM)
        .ok_or(FormatError::CorruptedData)?;
    let mut total = 0u64;
    for block in blocks.iter_mut() {
        let count = *block.count.get(dim).ok_or(FormatError::CorruptedData)?;
        *block.start.get_mut(dim).ok_or(FormatError::CorruptedData)? = total;
        total = total.checked_add(count).ok_or(FormatError::ArraySizeOverflow)?;
    }
    for block in blocks.iter_mut() {
        *block.shape.get_mut(dim).ok_or(FormatError::CorruptedData)? = total;
    }
    Ok(())
}

/// Random-access source of block payload bytes
pub trait PayloadSource: Send + Sync {
    fn read_at(&self, subfile: u32, offset: u64, len: u64) -> Result<Bytes>;
}

impl<P: PayloadSource + ?Sized> PayloadSource for Arc<P> {
    fn read_at(&self, subfile: u32, offset: u64, len: u64) -> Result<Bytes> {
        (**self).read_at(subfile, offset, len)
    }
}

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Payloads in `data.<n>` subfiles, opened on first use
pub struct FilePayloads {
    dir: PathBuf,
    library: TransportLibrary,
    files: Mutex<HashMap<u32, SharedTransport>>,
}

impl FilePayloads {
    pub fn new(dir: &Path, library: TransportLibrary) -> Self {
        Self {
            dir: dir.to_path_buf(),
            library,
            files: Mutex::new(HashMap::new()),
        }
    }

    fn transport(&self, subfile: u32) -> Result<SharedTransport> {
        let mut open = self.files.lock();
        if let Some(t) = open.get(&subfile) {
            return Ok(Arc::clone(t));
        }
        let path = self.dir.join(format!("{}{subfile}", files::DATA_PREFIX));
        let mut transport = open_transport(self.library, &path, OpenMode::Read)?;
        read_header(transport.as_mut(), FileKind::Data)?;
        let shared = Arc::new(Mutex::new(transport));
        open.insert(subfile, Arc::clone(&shared));
        Ok(shared)
    }

    /// Release every open subfile
    pub fn close(&self) -> Result<()> {
        for (_, t) in self.files.lock().drain() {
            t.lock().close()?;
        }
        Ok(())
    }
}

impl PayloadSource for FilePayloads {
    fn read_at(&self, subfile: u32, offset: u64, len: u64) -> Result<Bytes> {
        let transport = self.transport(subfile)?;
        let mut buf = vec![0u8; len as usize];
        transport.lock().read(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }
}

/// Payloads delivered in memory, one buffer per writer rank
#[derive(Debug, Default, Clone)]
pub struct StreamPayloads {
    payloads: Vec<Bytes>,
}

impl StreamPayloads {
    pub fn new(payloads: Vec<Bytes>) -> Self {
        Self { payloads }
    }
}

impl PayloadSource for StreamPayloads {
    fn read_at(&self, subfile: u32, offset: u64, len: u64) -> Result<Bytes> {
        let payload = self
            .payloads
            .get(subfile as usize)
            .ok_or_else(|| Error::NotFound(format!("payload of rank {subfile}")))?;
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= payload.len())
            .ok_or(FormatError::InsufficientBuffer)?;
        Ok(payload.slice(start..end))
    }
}

/// Per-block characteristics reported to callers
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSummary<T> {
    pub block_id: u32,
    pub rank: u32,
    pub start: Vec<u64>,
    pub count: Vec<u64>,
    pub min: Option<T>,
    pub max: Option<T>,
    /// Value of single-value blocks
    pub value: Option<T>,
}

fn first_decoded<T: Element>(bytes: &[u8]) -> Result<Option<T>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(T::decode(bytes)?.into_iter().next())
}

fn block_region(block: &BlockRecord) -> Region {
    Region::new(block.start.clone(), block.count.clone())
}

/// Resolves reads against an index and a payload source
pub struct Deserializer {
    index: MetadataIndex,
    source: Box<dyn PayloadSource>,
    operators: Arc<OperatorRegistry>,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for Deserializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deserializer")
            .field("steps", &self.index.steps())
            .field("threads", &self.pool.as_ref().map(|p| p.current_num_threads()))
            .finish()
    }
}

impl Deserializer {
    pub fn new(
        index: MetadataIndex,
        source: Box<dyn PayloadSource>,
        operators: Arc<OperatorRegistry>,
        threads: usize,
    ) -> Result<Self> {
        let pool = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| Error::invalid(format!("cannot start {threads} read threads: {e}")))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            index,
            source,
            operators,
            pool,
        })
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut MetadataIndex {
        &mut self.index
    }

    /// Swap in the metadata and payloads of a new stream step
    pub fn replace(&mut self, index: MetadataIndex, source: Box<dyn PayloadSource>) {
        self.index = index;
        self.source = source;
    }

    fn lookup<T: Element>(&self, name: &str) -> Result<&VariableIndex> {
        let var = self
            .index
            .variable(name)
            .ok_or_else(|| Error::NotFound(format!("variable '{name}'")))?;
        if var.data_type != T::DATA_TYPE {
            return Err(Error::TypeMismatch {
                name: name.to_string(),
                requested: T::DATA_TYPE,
                stored: var.data_type,
            });
        }
        Ok(var)
    }

    fn resolve_steps(
        var: &VariableIndex,
        step_selection: Option<(u64, u64)>,
        current: Option<u64>,
    ) -> Result<Vec<u64>> {
        let ids = var.step_ids();
        match (step_selection, current) {
            (Some((start, count)), _) => {
                let end = start.saturating_add(count);
                if end > ids.len() as u64 {
                    return Err(Error::OutOfRange(format!(
                        "steps {start}..{end} of '{}', {} available",
                        var.name,
                        ids.len()
                    )));
                }
                Ok(ids[start as usize..end as usize].to_vec())
            }
            (None, Some(step)) => {
                if var.steps.contains_key(&step) {
                    Ok(vec![step])
                } else if var.last_step().is_some_and(|last| step > last) {
                    Err(Error::OutOfRange(format!(
                        "step {step} of '{}' is past the last step",
                        var.name
                    )))
                } else {
                    Err(Error::NotFound(format!(
                        "variable '{}' at step {step}",
                        var.name
                    )))
                }
            }
            (None, None) => ids
                .first()
                .map(|&s| vec![s])
                .ok_or_else(|| Error::NotFound(format!("variable '{}' has no steps", var.name))),
        }
    }

    /// Read `desc`'s selection; `current` is the active step, if any
    pub fn read<T: Element>(&self, desc: &VariableDesc, current: Option<u64>) -> Result<Vec<T>> {
        let var = self.lookup::<T>(&desc.name)?;
        let steps = Self::resolve_steps(var, desc.step_selection, current)?;
        let mut out = Vec::new();
        for step in steps {
            let blocks = var.steps.get(&step).map(Vec::as_slice).unwrap_or_default();
            let values = match var.shape_id {
                ShapeId::GlobalValue | ShapeId::LocalValue => {
                    self.read_values::<T>(var, blocks, desc.selection.as_ref())?
                }
                _ => self.read_array::<T>(var, step, blocks, desc)?,
            };
            out.extend(values);
        }
        Ok(out)
    }

    fn read_values<T: Element>(
        &self,
        var: &VariableIndex,
        blocks: &[BlockRecord],
        selection: Option<&Selection>,
    ) -> Result<Vec<T>> {
        let value = |b: &BlockRecord| -> Result<T> {
            first_decoded::<T>(&b.value)?.ok_or_else(|| FormatError::CorruptedData.into())
        };
        let pick = |id: u64| -> Result<T> {
            blocks
                .get(id as usize)
                .ok_or_else(|| {
                    Error::OutOfRange(format!("block {id} of '{}', {} written", var.name, blocks.len()))
                })
                .and_then(value)
        };

        if var.shape_id == ShapeId::GlobalValue {
            return match selection {
                Some(Selection::WriteBlock(id)) => pick(*id as u64).map(|v| vec![v]),
                _ => pick(0).map(|v| vec![v]),
            };
        }

        let n = blocks.len() as u64;
        match selection {
            None => blocks.iter().map(value).collect(),
            Some(Selection::WriteBlock(id)) => pick(*id as u64).map(|v| vec![v]),
            Some(Selection::BoundingBox(region)) => {
                if !region.is_within(&[n]) {
                    return Err(Error::OutOfRange(format!(
                        "selection {region:?} outside [{n}] of '{}'",
                        var.name
                    )));
                }
                (region.start[0]..region.start[0] + region.count[0])
                    .map(pick)
                    .collect()
            }
            Some(Selection::Points(points)) => points
                .iter()
                .map(|p| match p.as_slice() {
                    [i] if *i < n => pick(*i),
                    _ => Err(Error::OutOfRange(format!("point {p:?} outside [{n}]"))),
                })
                .collect(),
        }
    }

    fn read_array<T: Element>(
        &self,
        var: &VariableIndex,
        step: u64,
        blocks: &[BlockRecord],
        desc: &VariableDesc,
    ) -> Result<Vec<T>> {
        let local = var.shape_id == ShapeId::LocalArray;
        let shape = var.shape_at(step);
        let memory = desc.memory_selection.as_ref();

        let by_id = |id: u32| {
            blocks.iter().find(|b| b.block_id == id).ok_or_else(|| {
                Error::OutOfRange(format!(
                    "block {id} of '{}' at step {step}, {} written",
                    var.name,
                    blocks.len()
                ))
            })
        };

        match &desc.selection {
            None if local => {
                let block = by_id(0)?;
                self.read_box(&[block], &block_region(block), memory)
            }
            None => {
                let all: Vec<&BlockRecord> = blocks.iter().collect();
                self.read_box(&all, &Region::whole(&shape), memory)
            }
            Some(Selection::WriteBlock(id)) => {
                let block = by_id(*id)?;
                self.read_box(&[block], &block_region(block), memory)
            }
            Some(Selection::BoundingBox(_) | Selection::Points(_)) if local => {
                Err(Error::invalid(format!(
                    "local array '{}' can only be read by block",
                    var.name
                )))
            }
            Some(Selection::BoundingBox(region)) => {
                if !region.is_within(&shape) {
                    return Err(Error::OutOfRange(format!(
                        "selection {region:?} outside shape {shape:?} of '{}'",
                        var.name
                    )));
                }
                let all: Vec<&BlockRecord> = blocks.iter().collect();
                self.read_box(&all, region, memory)
            }
            Some(Selection::Points(points)) => {
                let mut out = Vec::with_capacity(points.len());
                for point in points {
                    let one = Region::new(point.clone(), vec![1; point.len()]);
                    if !one.is_within(&shape) {
                        return Err(Error::OutOfRange(format!(
                            "point {point:?} outside shape {shape:?} of '{}'",
                            var.name
                        )));
                    }
                    // the last holder in merged order wins, as in box reads
                    let holder: Vec<&BlockRecord> = blocks
                        .iter()
                        .rev()
                        .find(|b| block_region(b).contains_point(point))
                        .into_iter()
                        .collect();
                    out.extend(self.read_box::<T>(&holder, &one, None)?);
                }
                Ok(out)
            }
        }
    }

    /// Assemble `region` from the intersecting blocks
    fn read_box<T: Element>(
        &self,
        blocks: &[&BlockRecord],
        region: &Region,
        memory: Option<&Region>,
    ) -> Result<Vec<T>> {
        let ndims = region.ndims();
        let (dst_dims, dst_origin) = match memory {
            Some(m) => {
                let fits = m.ndims() == ndims
                    && m.start.len() == ndims
                    && (0..ndims).all(|d| {
                        m.start[d]
                            .checked_add(region.count[d])
                            .is_some_and(|e| e <= m.count[d])
                    });
                if !fits {
                    return Err(Error::invalid(format!(
                        "memory selection {m:?} cannot hold a box of {:?}",
                        region.count
                    )));
                }
                (m.count.clone(), m.start.clone())
            }
            None => (region.count.clone(), vec![0; ndims]),
        };

        let total = usize::try_from(checked_element_count(&dst_dims)?)
            .map_err(|_| FormatError::ArraySizeOverflow)?;
        let mut out = vec![T::default(); total];

        let overlaps: Vec<(&BlockRecord, Region)> = blocks
            .iter()
            .filter_map(|&b| block_region(b).intersect(region).map(|o| (b, o)))
            .collect();
        if overlaps.is_empty() {
            return Ok(out);
        }

        let elem = T::size_bytes();
        let fetch = |(block, overlap): &(&BlockRecord, Region)| self.fetch(block, overlap, elem);
        let fetched = match &self.pool {
            Some(pool) if overlaps.len() > 1 => {
                pool.install(|| overlaps.par_iter().map(fetch).collect::<Result<Vec<_>>>())?
            }
            _ => overlaps.iter().map(fetch).collect::<Result<Vec<_>>>()?,
        };

        let dst = T::as_bytes_mut(&mut out)
            .ok_or_else(|| Error::invalid("array reads need a fixed-size element type"))?;
        for ((block, overlap), (bytes, base)) in overlaps.iter().zip(&fetched) {
            let src_origin = overlap.relative_to(&block.start)?;
            let dst_at: Vec<u64> = overlap
                .relative_to(&region.start)?
                .iter()
                .zip(&dst_origin)
                .map(|(r, o)| r + o)
                .collect();
            copy_region(
                bytes,
                View::new(&block.count, &src_origin).with_base(*base),
                dst,
                View::new(&dst_dims, &dst_at),
                &overlap.count,
                elem,
            )?;
        }
        Ok(out)
    }

    /// Bytes of `block` covering `overlap`, with the linear element index of
    /// their first byte
    fn fetch(&self, block: &BlockRecord, overlap: &Region, elem: usize) -> Result<(Bytes, u64)> {
        if let Some(chain) = &block.operator {
            let stored =
                self.source
                    .read_at(block.subfile, block.payload_offset, block.payload_length)?;
            let raw = self
                .operators
                .decode_chain(chain, &stored, block.raw_length as usize)?;
            return Ok((Bytes::from(raw), 0));
        }

        let src_origin = overlap.relative_to(&block.start)?;
        let range = covering_range(&block.count, &src_origin, &overlap.count);
        let elem = elem as u64;
        if range.end * elem > block.payload_length {
            return Err(FormatError::CorruptedData.into());
        }
        trace!(
            "'{}' block {}: elements {range:?} from subfile {}",
            block.name,
            block.block_id,
            block.subfile
        );
        let bytes = self.source.read_at(
            block.subfile,
            block.payload_offset + range.start * elem,
            (range.end - range.start) * elem,
        )?;
        Ok((bytes, range.start))
    }

    /// Characteristics of every block of `name` at `step`
    pub fn blocks_info<T: Element>(&self, name: &str, step: u64) -> Result<Vec<BlockSummary<T>>> {
        let var = self.lookup::<T>(name)?;
        let Some(blocks) = var.steps.get(&step) else {
            return match var.last_step() {
                Some(last) if step > last => Err(Error::OutOfRange(format!(
                    "step {step} of '{name}', last is {last}"
                ))),
                _ => Ok(Vec::new()),
            };
        };
        blocks
            .iter()
            .map(|b| {
                Ok(BlockSummary {
                    block_id: b.block_id,
                    rank: b.rank,
                    start: b.start.clone(),
                    count: b.count.clone(),
                    min: first_decoded(&b.min)?,
                    max: first_decoded(&b.max)?,
                    value: first_decoded(&b.value)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpio_core::StepMarker;

    fn block(name: &str, rank: u32, start: u64, values: &[f64]) -> BlockRecord {
        BlockRecord {
            name: name.to_string(),
            shape_id: Some(ShapeId::GlobalArray),
            data_type: Some(DataType::F64),
            rank,
            shape: vec![10],
            start: vec![start],
            count: vec![values.len() as u64],
            subfile: rank,
            payload_offset: 0,
            payload_length: (values.len() * 8) as u64,
            raw_length: (values.len() * 8) as u64,
            ..Default::default()
        }
    }

    fn chunk(step: u64, blocks: &[BlockRecord]) -> Vec<u8> {
        let mut buf = Vec::new();
        ChunkHeader {
            step,
            rank_count: 1,
            block_count: blocks.len() as u32,
            variable_count: 1,
            attribute_count: 0,
        }
        .encode(&mut buf);
        for b in blocks {
            b.encode(&mut buf).unwrap();
        }
        StepMarker::default().encode(&mut buf);
        buf
    }

    fn tiled() -> Deserializer {
        let left: Vec<f64> = (0..5).map(f64::from).collect();
        let right: Vec<f64> = (5..10).map(f64::from).collect();
        let mut index = MetadataIndex::new();
        index
            .add_chunk(&chunk(0, &[block("x", 0, 0, &left), block("x", 1, 5, &right)]))
            .unwrap();
        let payloads = StreamPayloads::new(vec![
            Bytes::from(f64::as_bytes(&left).unwrap().to_vec()),
            Bytes::from(f64::as_bytes(&right).unwrap().to_vec()),
        ]);
        Deserializer::new(
            index,
            Box::new(payloads),
            Arc::new(OperatorRegistry::with_defaults()),
            1,
        )
        .unwrap()
    }

    fn desc(selection: Option<Selection>) -> VariableDesc {
        let mut d = VariableDesc::new("x", DataType::F64, &[10], &[0], &[10], false).unwrap();
        d.selection = selection;
        d
    }

    #[test]
    fn test_stitches_blocks() {
        let de = tiled();
        let all: Vec<f64> = de.read(&desc(None), None).unwrap();
        assert_eq!(all, (0..10).map(f64::from).collect::<Vec<_>>());

        let middle = Selection::BoundingBox(Region::new([3], [4]));
        let part: Vec<f64> = de.read(&desc(Some(middle)), Some(0)).unwrap();
        assert_eq!(part, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_points_and_blocks() {
        let de = tiled();
        let pts = Selection::Points(vec![vec![9], vec![0], vec![5]]);
        assert_eq!(de.read::<f64>(&desc(Some(pts)), None).unwrap(), vec![9.0, 0.0, 5.0]);

        let second = Selection::WriteBlock(1);
        assert_eq!(
            de.read::<f64>(&desc(Some(second)), None).unwrap(),
            vec![5.0, 6.0, 7.0, 8.0, 9.0]
        );
        let missing = Selection::WriteBlock(2);
        assert!(matches!(
            de.read::<f64>(&desc(Some(missing)), None),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_overlapping_blocks_last_writer_wins() {
        let first: Vec<f64> = (0..6).map(|i| 100.0 + f64::from(i)).collect();
        let second: Vec<f64> = (0..6).map(|i| 200.0 + f64::from(i)).collect();
        let mut index = MetadataIndex::new();
        index
            .add_chunk(&chunk(0, &[block("x", 0, 0, &first), block("x", 1, 4, &second)]))
            .unwrap();
        let payloads = StreamPayloads::new(vec![
            Bytes::from(f64::as_bytes(&first).unwrap().to_vec()),
            Bytes::from(f64::as_bytes(&second).unwrap().to_vec()),
        ]);
        let de = Deserializer::new(
            index,
            Box::new(payloads),
            Arc::new(OperatorRegistry::with_defaults()),
            1,
        )
        .unwrap();

        let boxed = Selection::BoundingBox(Region::new([4], [2]));
        let pts = Selection::Points(vec![vec![4], vec![5], vec![3]]);
        assert_eq!(de.read::<f64>(&desc(Some(boxed)), None).unwrap(), vec![200.0, 201.0]);
        assert_eq!(
            de.read::<f64>(&desc(Some(pts)), None).unwrap(),
            vec![200.0, 201.0, 103.0]
        );
    }

    #[test]
    fn test_memory_selection_places_box() {
        let de = tiled();
        let mut d = desc(Some(Selection::BoundingBox(Region::new([4], [2]))));
        d.memory_selection = Some(Region::new([1], [4]));
        assert_eq!(de.read::<f64>(&d, None).unwrap(), vec![0.0, 4.0, 5.0, 0.0]);
    }

    #[test]
    fn test_read_errors() {
        let de = tiled();
        assert!(matches!(
            de.read::<f32>(&desc(None), None),
            Err(Error::TypeMismatch { .. })
        ));
        let outside = Selection::BoundingBox(Region::new([8], [4]));
        assert!(matches!(
            de.read::<f64>(&desc(Some(outside)), None),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(de.read::<f64>(&desc(None), Some(3)), Err(Error::OutOfRange(_))));

        let mut steps = desc(None);
        steps.step_selection = Some((0, 2));
        assert!(matches!(de.read::<f64>(&steps, None), Err(Error::OutOfRange(_))));

        let mut other = desc(None);
        other.name = "y".into();
        assert!(matches!(de.read::<f64>(&other, None), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_joined_blocks_are_stacked() {
        let mut index = MetadataIndex::new();
        let joined = |rank, rows| BlockRecord {
            name: "table".into(),
            shape_id: Some(ShapeId::JoinedArray),
            data_type: Some(DataType::I32),
            rank,
            shape: vec![JOINED_DIM, 3],
            start: vec![0, 0],
            count: vec![rows, 3],
            ..Default::default()
        };
        index.add_chunk(&chunk(0, &[joined(0, 2), joined(1, 4)])).unwrap();

        let var = index.variable("table").unwrap();
        assert_eq!(var.shape_at(0), vec![6, 3]);
        let blocks = &var.steps[&0];
        assert_eq!(blocks[1].start, vec![2, 0]);
        assert_eq!(blocks[1].block_id, 1);
    }

    #[test]
    fn test_joined_block_without_shape_is_corrupt() {
        let mut index = MetadataIndex::new();
        let first = BlockRecord {
            name: "table".into(),
            shape_id: Some(ShapeId::JoinedArray),
            data_type: Some(DataType::I32),
            shape: vec![JOINED_DIM, 3],
            start: vec![0, 0],
            count: vec![2, 3],
            ..Default::default()
        };
        let shapeless = BlockRecord {
            rank: 1,
            shape: Vec::new(),
            ..first.clone()
        };
        assert!(matches!(
            index.add_chunk(&chunk(0, &[first, shapeless])),
            Err(Error::Format(FormatError::CorruptedData))
        ));
    }
}
