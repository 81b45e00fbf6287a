//! Writer-side serializer
//!
//! Turns the Put calls of a step into a payload buffer and a metadata
//! buffer holding one block record per block. Payload positions are
//! absolute; blocks whose bytes are still buffered are tracked so the
//! aggregator can relocate them once it knows where the bytes landed.

use std::sync::Arc;

use bpio_core::{AttributeRecord, BlockRecord, Element, ShapeId, StepMarker};
use hashbrown::{HashMap, HashSet};
use log::trace;

use crate::buffer::{BufferPolicy, PayloadBuffer, Reserve};
use crate::error::{Error, Result};
use crate::operator::{BlockInfo, OperatorRegistry, CHAIN_SEPARATOR};
use crate::variable::VariableDesc;

/// Outcome of a Put against the payload buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Buffered,
    /// The buffer must be spilled before the block fits; nothing was written
    NeedsSpill,
}

/// Per-rank serializer state
#[derive(Debug)]
pub struct Serializer {
    rank: u32,
    stats_level: u32,
    data: PayloadBuffer,
    metadata: Vec<u8>,
    operators: Arc<OperatorRegistry>,
    step: u64,
    in_step: bool,
    /// Metadata position where the current step's records begin
    step_start: usize,
    step_variables: HashSet<String>,
    step_blocks: u32,
    block_ids: HashMap<String, u32>,
    /// Metadata positions of blocks whose payload is still buffered
    unplaced: Vec<usize>,
}

impl Serializer {
    pub fn new(
        rank: u32,
        policy: BufferPolicy,
        data_base: u64,
        stats_level: u32,
        operators: Arc<OperatorRegistry>,
    ) -> Self {
        Self {
            rank,
            stats_level,
            data: PayloadBuffer::new(policy, data_base),
            metadata: Vec::new(),
            operators,
            step: 0,
            in_step: false,
            step_start: 0,
            step_variables: HashSet::new(),
            step_blocks: 0,
            block_ids: HashMap::new(),
            unplaced: Vec::new(),
        }
    }

    pub fn begin_step(&mut self, step: u64) {
        self.step = step;
        self.in_step = true;
        self.step_start = self.metadata.len();
        self.step_variables.clear();
        self.step_blocks = 0;
        self.block_ids.clear();
    }

    pub fn in_step(&self) -> bool {
        self.in_step
    }

    /// Serialize one block of `values` for the current step
    pub fn put<T: Element>(&mut self, desc: &VariableDesc, values: &[T]) -> Result<PutOutcome> {
        if !self.in_step {
            return Err(Error::invalid(format!(
                "put of '{}' outside of a step",
                desc.name
            )));
        }
        let expected = desc.put_element_count();
        if values.len() as u64 != expected {
            return Err(Error::invalid(format!(
                "put of '{}' supplies {} elements, the selection needs {expected}",
                desc.name,
                values.len()
            )));
        }

        let mut record = BlockRecord {
            name: desc.name.clone(),
            shape_id: Some(desc.shape_id),
            data_type: Some(T::DATA_TYPE),
            step: self.step,
            rank: self.rank,
            block_id: self.block_ids.get(&desc.name).copied().unwrap_or(0),
            ..Default::default()
        };
        if self.stats_level > 0 {
            if let Some((min, max)) = T::min_max(values) {
                T::encode(&[min], &mut record.min);
                T::encode(&[max], &mut record.max);
            }
        }

        if desc.is_single_value() {
            T::encode(values, &mut record.value);
        } else {
            desc.check_block()?;
            let count = desc.block_count();
            let start = desc.block_start();
            record.start = if start.is_empty() {
                vec![0; count.len()]
            } else {
                start
            };
            if desc.shape_id != ShapeId::LocalArray {
                record.shape = desc.shape.clone();
            }

            let raw = T::as_bytes(values).ok_or_else(|| {
                Error::invalid(format!("'{}': element type has no fixed size", desc.name))
            })?;
            let (payload, chain) = self.apply_operations(desc, raw, &count)?;
            record.count = count;

            if self.data.reserve(payload.len())? == Reserve::Spill {
                return Ok(PutOutcome::NeedsSpill);
            }
            record.payload_offset = self.data.position();
            record.payload_length = payload.len() as u64;
            record.raw_length = raw.len() as u64;
            record.operator = chain;
            self.data.extend(&payload);
        }

        let pos = record.encode(&mut self.metadata)?;
        if record.payload_length > 0 {
            self.unplaced.push(pos);
        }
        trace!(
            "rank {} step {}: block {} of '{}' at {} ({} bytes)",
            self.rank,
            self.step,
            record.block_id,
            desc.name,
            record.payload_offset,
            record.payload_length
        );

        *self.block_ids.entry(desc.name.clone()).or_insert(0) += 1;
        self.step_variables.insert(desc.name.clone());
        self.step_blocks += 1;
        Ok(PutOutcome::Buffered)
    }

    /// Run the variable's operator chain, returning the payload and chain name
    fn apply_operations(
        &self,
        desc: &VariableDesc,
        raw: &[u8],
        count: &[u64],
    ) -> Result<(Vec<u8>, Option<String>)> {
        if desc.operations.is_empty() {
            return Ok((raw.to_vec(), None));
        }
        let mut current = raw.to_vec();
        let mut names = Vec::with_capacity(desc.operations.len());
        for op in &desc.operations {
            let operator = self.operators.get(&op.operator)?;
            let info = BlockInfo {
                data_type: desc.data_type,
                count,
                params: &op.params,
            };
            current = operator.compress(&current, &info)?;
            names.push(operator.name().to_string());
        }
        Ok((current, Some(names.join(&CHAIN_SEPARATOR.to_string()))))
    }

    /// Record a newly defined attribute in the current step
    pub fn put_attribute(&mut self, record: &AttributeRecord) -> Result<()> {
        record.encode(&mut self.metadata)?;
        Ok(())
    }

    /// Close the step with a boundary marker
    pub fn end_step(&mut self) -> StepMarker {
        let marker = StepMarker {
            step: self.step,
            variable_count: self.step_variables.len() as u32,
            block_count: self.step_blocks,
            metadata_start: self.step_start as u64,
            metadata_length: (self.metadata.len() - self.step_start) as u64,
        };
        marker.encode(&mut self.metadata);
        self.in_step = false;
        marker
    }

    /// Buffered payload and the absolute position of its first byte
    pub fn take_payload(&mut self) -> (Vec<u8>, u64) {
        let start = self.data.base();
        (self.data.take(), start)
    }

    /// Point every buffered block at its final subfile location
    pub fn relocate(&mut self, subfile: u32, delta: i64) -> Result<()> {
        for pos in self.unplaced.drain(..) {
            bpio_core::patch_block_location(&mut self.metadata, pos, subfile, delta)?;
        }
        Ok(())
    }

    /// Hand out the metadata of all closed steps
    pub fn take_metadata(&mut self) -> Result<Vec<u8>> {
        if self.in_step || !self.unplaced.is_empty() {
            return Err(Error::invalid(
                "metadata taken while blocks are still unplaced",
            ));
        }
        self.step_start = 0;
        Ok(std::mem::take(&mut self.metadata))
    }

    pub fn buffered_payload(&self) -> usize {
        self.data.len()
    }

    /// Restart absolute positions, used by stream writers after each step
    pub fn reset_data_base(&mut self, base: u64) {
        self.data.reset_base(base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpio_core::{DataType, Record, RecordIter};

    fn serializer(max: u64) -> Serializer {
        let policy = BufferPolicy {
            max_size: max,
            ..BufferPolicy::default()
        };
        Serializer::new(0, policy, 64, 1, Arc::new(OperatorRegistry::with_defaults()))
    }

    fn array(name: &str, shape: u64, start: u64, count: u64) -> VariableDesc {
        VariableDesc::new(name, DataType::F32, &[shape], &[start], &[count], true).unwrap()
    }

    #[test]
    fn test_block_records_and_marker() {
        let mut s = serializer(u64::MAX);
        let nx = VariableDesc::new("Nx", DataType::U64, &[], &[], &[], true).unwrap();
        let floats = array("bpFloats", 10, 0, 10);
        let data: Vec<f32> = (0..10).map(|v| v as f32).collect();

        s.begin_step(0);
        assert_eq!(s.put(&nx, &[10u64]).unwrap(), PutOutcome::Buffered);
        assert_eq!(s.put(&floats, &data).unwrap(), PutOutcome::Buffered);
        let marker = s.end_step();
        assert_eq!(marker.variable_count, 2);
        assert_eq!(marker.block_count, 2);

        s.relocate(0, 0).unwrap();
        let meta = s.take_metadata().unwrap();
        let records: Vec<Record> = RecordIter::new(&meta).collect::<bpio_core::Result<_>>().unwrap();
        assert_eq!(records.len(), 3);
        match &records[1] {
            Record::Block(b) => {
                assert_eq!(b.payload_offset, 64);
                assert_eq!(b.payload_length, 40);
                assert_eq!(f32::decode(&b.max).unwrap(), vec![9.0]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let (payload, start) = s.take_payload();
        assert_eq!(start, 64);
        assert_eq!(payload.len(), 40);
    }

    #[test]
    fn test_wrong_element_count() {
        let mut s = serializer(u64::MAX);
        s.begin_step(0);
        let err = s.put(&array("x", 10, 0, 5), &[1.0f32; 4]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_spill_request_leaves_no_trace() {
        let mut s = serializer(48);
        s.begin_step(0);
        let v = array("x", 8, 0, 8);
        assert_eq!(s.put(&v, &[0f32; 8]).unwrap(), PutOutcome::Buffered);
        assert_eq!(s.put(&v, &[1f32; 8]).unwrap(), PutOutcome::NeedsSpill);
        assert_eq!(s.buffered_payload(), 32);

        let (payload, start) = s.take_payload();
        assert_eq!((payload.len(), start), (32, 64));
        s.relocate(0, 0).unwrap();
        assert_eq!(s.put(&v, &[1f32; 8]).unwrap(), PutOutcome::Buffered);
        s.end_step();
        s.relocate(0, 0).unwrap();

        let meta = s.take_metadata().unwrap();
        let blocks: Vec<BlockRecord> = RecordIter::new(&meta)
            .filter_map(|r| match r.unwrap() {
                Record::Block(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].block_id, 1);
        assert_eq!(blocks[1].payload_offset, 96);
    }
}
