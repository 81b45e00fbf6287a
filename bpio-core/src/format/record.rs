//! Metadata records
//!
//! The metadata stream of a writer rank is a sequence of tagged records:
//! one block record per Put-ed block, attribute records for newly defined
//! attributes and a step marker closing each step. The aggregator prefixes
//! the per-rank streams of a step with a [`ChunkHeader`] to form the merged
//! chunk that lands in the metadata file.
//!
//! Every variable-length record starts with `tag u8 | body_length u32` so a
//! reader can skip records it does not understand.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::constants::{record, MAX_DIMS};
use super::cursor::{ByteReader, ByteWriter};
use super::header::{DataType, ShapeId};
use crate::error::{FormatError, Result};

/// Byte position of the subfile index inside an encoded block record
pub const BLOCK_SUBFILE_POS: usize = 5;
/// Byte position of the payload offset inside an encoded block record
pub const BLOCK_OFFSET_POS: usize = 9;

/// Characteristics of one serialized block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockRecord {
    pub name: String,
    pub shape_id: Option<ShapeId>,
    pub data_type: Option<DataType>,
    pub step: u64,
    /// Writer rank that produced the block
    pub rank: u32,
    /// Position of the block among all blocks of the variable in the step
    pub block_id: u32,
    pub shape: Vec<u64>,
    pub start: Vec<u64>,
    pub count: Vec<u64>,
    /// Data subfile holding the payload
    pub subfile: u32,
    /// Absolute offset of the payload inside the subfile
    pub payload_offset: u64,
    /// Stored payload length (after operators)
    pub payload_length: u64,
    /// Payload length before operators
    pub raw_length: u64,
    /// Encoded minimum element, empty when statistics are off
    pub min: Vec<u8>,
    pub max: Vec<u8>,
    /// Operator applied to the payload, if any
    pub operator: Option<String>,
    /// Inline value for single-value variables
    pub value: Vec<u8>,
}

impl BlockRecord {
    pub fn shape_id(&self) -> Result<ShapeId> {
        self.shape_id.ok_or(FormatError::UnknownShapeId)
    }

    pub fn data_type(&self) -> Result<DataType> {
        self.data_type.ok_or(FormatError::UnknownDataType)
    }

    /// Number of elements in the block
    pub fn element_count(&self) -> u64 {
        self.count.iter().product()
    }

    /// Append the encoded record, returning its start position
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let ndims = u8::try_from(self.count.len()).map_err(|_| FormatError::ArraySizeOverflow)?;
        if self.count.len() > MAX_DIMS
            || self.start.len() != self.count.len()
            || (!self.shape.is_empty() && self.shape.len() != self.count.len())
        {
            return Err(FormatError::InvalidRange);
        }

        let mut w = ByteWriter::new(buf);
        let start = w.position();
        w.put_u8(record::BLOCK);
        let len_slot = w.reserve_u32();
        w.put_u32(self.subfile);
        w.put_u64(self.payload_offset);
        w.put_u64(self.payload_length);
        w.put_u64(self.raw_length);
        w.put_u8(self.shape_id()? as u8);
        w.put_u8(self.data_type()?.to_u8());
        w.put_u64(self.step);
        w.put_u32(self.rank);
        w.put_u32(self.block_id);
        w.put_name(&self.name)?;
        w.put_u8(ndims);
        w.put_u8(!self.shape.is_empty() as u8);
        w.put_dims(&self.shape);
        w.put_dims(&self.start);
        w.put_dims(&self.count);
        w.put_blob(&self.min)?;
        w.put_blob(&self.max)?;
        w.put_name(self.operator.as_deref().unwrap_or(""))?;
        w.put_blob(&self.value)?;

        let body = w.position() - len_slot - 4;
        let body = u32::try_from(body).map_err(|_| FormatError::ArraySizeOverflow)?;
        w.patch_u32(len_slot, body);
        Ok(start)
    }

    fn decode_body(r: &mut ByteReader<'_>) -> Result<Self> {
        let subfile = r.u32()?;
        let payload_offset = r.u64()?;
        let payload_length = r.u64()?;
        let raw_length = r.u64()?;
        let shape_id = ShapeId::from_u8(r.u8()?).ok_or(FormatError::UnknownShapeId)?;
        let data_type = DataType::from_u8(r.u8()?).ok_or(FormatError::UnknownDataType)?;
        let step = r.u64()?;
        let rank = r.u32()?;
        let block_id = r.u32()?;
        let name = r.name()?.to_string();
        let ndims = r.u8()? as usize;
        if ndims > MAX_DIMS {
            return Err(FormatError::CorruptedData);
        }
        let has_shape = r.u8()? != 0;
        let shape = if has_shape { r.dims(ndims)? } else { Vec::new() };
        let start = r.dims(ndims)?;
        let count = r.dims(ndims)?;
        let min = r.blob()?.to_vec();
        let max = r.blob()?.to_vec();
        let operator = match r.name()? {
            "" => None,
            op => Some(op.to_string()),
        };
        let value = r.blob()?.to_vec();

        Ok(Self {
            name,
            shape_id: Some(shape_id),
            data_type: Some(data_type),
            step,
            rank,
            block_id,
            shape,
            start,
            count,
            subfile,
            payload_offset,
            payload_length,
            raw_length,
            min,
            max,
            operator,
            value,
        })
    }
}

/// Relocate an encoded block record after its payload moved
///
/// `record_pos` is the value returned by [`BlockRecord::encode`].
pub fn patch_block_location(
    buf: &mut [u8],
    record_pos: usize,
    subfile: u32,
    offset_delta: i64,
) -> Result<()> {
    let sub_at = record_pos + BLOCK_SUBFILE_POS;
    let off_at = record_pos + BLOCK_OFFSET_POS;
    if buf.get(record_pos) != Some(&record::BLOCK) || off_at + 8 > buf.len() {
        return Err(FormatError::IndexOutOfBounds);
    }

    buf[sub_at..sub_at + 4].copy_from_slice(&subfile.to_le_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off_at..off_at + 8]);
    let offset = u64::from_le_bytes(raw)
        .checked_add_signed(offset_delta)
        .ok_or(FormatError::ArraySizeOverflow)?;
    buf[off_at..off_at + 8].copy_from_slice(&offset.to_le_bytes());
    Ok(())
}

/// Definition of a global attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRecord {
    pub name: String,
    pub data_type: DataType,
    /// Defined as an array rather than a single value
    pub is_array: bool,
    pub element_count: u32,
    /// Encoded elements
    pub value: Vec<u8>,
}

impl AttributeRecord {
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut w = ByteWriter::new(buf);
        w.put_u8(record::ATTRIBUTE);
        let len_slot = w.reserve_u32();
        w.put_u8(self.data_type.to_u8());
        w.put_name(&self.name)?;
        w.put_u8(self.is_array as u8);
        w.put_u32(self.element_count);
        w.put_blob(&self.value)?;

        let body = u32::try_from(w.position() - len_slot - 4)
            .map_err(|_| FormatError::ArraySizeOverflow)?;
        w.patch_u32(len_slot, body);
        Ok(())
    }

    fn decode_body(r: &mut ByteReader<'_>) -> Result<Self> {
        let data_type = DataType::from_u8(r.u8()?).ok_or(FormatError::UnknownDataType)?;
        Ok(Self {
            data_type,
            name: r.name()?.to_string(),
            is_array: r.u8()? != 0,
            element_count: r.u32()?,
            value: r.blob()?.to_vec(),
        })
    }
}

/// Boundary marker closing one rank's records for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepMarker {
    pub step: u64,
    pub variable_count: u32,
    pub block_count: u32,
    /// Position of the step's first record relative to the rank's stream
    pub metadata_start: u64,
    pub metadata_length: u64,
}

impl StepMarker {
    pub const SIZE: usize = 1 + 8 + 4 + 4 + 8 + 8;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut w = ByteWriter::new(buf);
        w.put_u8(record::STEP_END);
        w.put_u64(self.step);
        w.put_u32(self.variable_count);
        w.put_u32(self.block_count);
        w.put_u64(self.metadata_start);
        w.put_u64(self.metadata_length);
    }

    fn decode_body(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            step: r.u64()?,
            variable_count: r.u32()?,
            block_count: r.u32()?,
            metadata_start: r.u64()?,
            metadata_length: r.u64()?,
        })
    }
}

/// Header of a merged step chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkHeader {
    pub step: u64,
    pub rank_count: u32,
    pub block_count: u32,
    pub variable_count: u32,
    pub attribute_count: u32,
}

impl ChunkHeader {
    pub const SIZE: usize = 1 + 8 + 4 * 4;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut w = ByteWriter::new(buf);
        w.put_u8(record::CHUNK);
        w.put_u64(self.step);
        w.put_u32(self.rank_count);
        w.put_u32(self.block_count);
        w.put_u32(self.variable_count);
        w.put_u32(self.attribute_count);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        if r.u8()? != record::CHUNK {
            return Err(FormatError::CorruptedData);
        }
        Ok(Self {
            step: r.u64()?,
            rank_count: r.u32()?,
            block_count: r.u32()?,
            variable_count: r.u32()?,
            attribute_count: r.u32()?,
        })
    }
}

/// A decoded metadata record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Block(BlockRecord),
    Attribute(AttributeRecord),
    StepEnd(StepMarker),
}

impl Record {
    /// Decode the next record
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        match r.u8()? {
            record::STEP_END => StepMarker::decode_body(r).map(Record::StepEnd),
            tag @ (record::BLOCK | record::ATTRIBUTE) => {
                let len = r.u32()? as usize;
                let mut body = ByteReader::new(r.take(len)?);
                if tag == record::BLOCK {
                    BlockRecord::decode_body(&mut body).map(Record::Block)
                } else {
                    AttributeRecord::decode_body(&mut body).map(Record::Attribute)
                }
            }
            _ => Err(FormatError::UnknownRecord),
        }
    }
}

/// Iterator over the records of a metadata stream
pub struct RecordIter<'a> {
    reader: ByteReader<'a>,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: ByteReader::new(data),
            failed: false,
        }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_empty() {
            return None;
        }
        let item = Record::decode(&mut self.reader);
        self.failed = item.is_err();
        Some(item)
    }
}
