//! Variable and attribute descriptors
//!
//! Descriptors live in the [`Io`](crate::Io) catalog behind a shared lock;
//! [`Variable<T>`] is a typed handle onto one of them. The element type is
//! checked once when the handle is created, so every later operation can
//! rely on the runtime tag matching `T`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bpio_core::validation::validate_dims;
use bpio_core::{AttributeRecord, DataType, Element, Region, Selection, ShapeId};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// An operator attached to a variable, applied before buffering
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub operator: String,
    pub params: HashMap<String, String>,
}

/// Untyped variable descriptor
#[derive(Debug, Clone)]
pub struct VariableDesc {
    pub name: String,
    pub data_type: DataType,
    pub shape_id: ShapeId,
    pub shape: Vec<u64>,
    pub start: Vec<u64>,
    pub count: Vec<u64>,
    pub constant_dims: bool,
    pub operations: Vec<Operation>,
    /// What a read targets; `None` selects the documented default
    pub selection: Option<Selection>,
    /// `(first step, number of steps)` for random-access reads
    pub step_selection: Option<(u64, u64)>,
    /// Placement of the selection inside a larger destination buffer
    pub memory_selection: Option<Region>,
    /// Number of steps known for this variable (reader side)
    pub available_steps: u64,
}

impl VariableDesc {
    pub fn new(
        name: &str,
        data_type: DataType,
        shape: &[u64],
        start: &[u64],
        count: &[u64],
        constant_dims: bool,
    ) -> Result<Self> {
        validate_dims(shape, start, count).map_err(|e| {
            Error::invalid(format!(
                "variable '{name}': {e} (shape {shape:?}, start {start:?}, count {count:?})"
            ))
        })?;
        let shape_id = ShapeId::classify(shape, count);
        if data_type.is_variable_sized() && !shape_id.is_single_value() {
            return Err(Error::invalid(format!(
                "variable '{name}': string variables must be single values"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            data_type,
            shape_id,
            shape: shape.to_vec(),
            start: start.to_vec(),
            count: count.to_vec(),
            constant_dims,
            operations: Vec::new(),
            selection: None,
            step_selection: None,
            memory_selection: None,
            available_steps: 0,
        })
    }

    pub fn is_single_value(&self) -> bool {
        self.shape_id.is_single_value()
    }

    /// Count of the block contributed by a writer, whole shape when unset
    pub fn block_count(&self) -> Vec<u64> {
        if self.count.is_empty() && self.shape_id == ShapeId::GlobalArray {
            self.shape.clone()
        } else {
            self.count.clone()
        }
    }

    /// Start of the block contributed by a writer
    pub fn block_start(&self) -> Vec<u64> {
        match self.shape_id {
            ShapeId::GlobalArray | ShapeId::JoinedArray if self.start.is_empty() => {
                vec![0; self.shape.len()]
            }
            _ => self.start.clone(),
        }
    }

    /// Check that the block a writer contributes lies inside the shape
    pub(crate) fn check_block(&self) -> Result<()> {
        if !matches!(self.shape_id, ShapeId::GlobalArray | ShapeId::JoinedArray) {
            return Ok(());
        }
        let (start, count) = (self.block_start(), self.block_count());
        validate_dims(&self.shape, &start, &count).map_err(|e| {
            Error::invalid(format!(
                "variable '{}': block start {start:?} count {count:?} outside shape {:?}: {e}",
                self.name, self.shape
            ))
        })
    }

    /// Number of elements a writer must supply
    pub fn put_element_count(&self) -> u64 {
        if self.is_single_value() {
            1
        } else {
            self.block_count().iter().product()
        }
    }
}

/// Typed handle onto a catalog entry
pub struct Variable<T> {
    desc: Arc<RwLock<VariableDesc>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Variable<T> {
    fn clone(&self) -> Self {
        Self {
            desc: Arc::clone(&self.desc),
            _marker: PhantomData,
        }
    }
}

impl<T: Element> fmt::Debug for Variable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = self.desc.read();
        f.debug_struct("Variable")
            .field("name", &desc.name)
            .field("type", &desc.data_type)
            .field("shape", &desc.shape)
            .finish()
    }
}

impl<T: Element> Variable<T> {
    /// Wrap a descriptor, checking the element type
    pub(crate) fn from_desc(desc: Arc<RwLock<VariableDesc>>) -> Result<Self> {
        let stored = desc.read().data_type;
        if stored != T::DATA_TYPE {
            return Err(Error::TypeMismatch {
                name: desc.read().name.clone(),
                requested: T::DATA_TYPE,
                stored,
            });
        }
        Ok(Self {
            desc,
            _marker: PhantomData,
        })
    }

    pub(crate) fn desc(&self) -> &Arc<RwLock<VariableDesc>> {
        &self.desc
    }

    /// Snapshot of the descriptor
    pub fn descriptor(&self) -> VariableDesc {
        self.desc.read().clone()
    }

    pub fn name(&self) -> String {
        self.desc.read().name.clone()
    }

    pub fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    pub fn shape_id(&self) -> ShapeId {
        self.desc.read().shape_id
    }

    /// Global shape; for local values this is `[number of writers]`
    pub fn shape(&self) -> Vec<u64> {
        self.desc.read().shape.clone()
    }

    pub fn start(&self) -> Vec<u64> {
        self.desc.read().start.clone()
    }

    pub fn count(&self) -> Vec<u64> {
        self.desc.read().count.clone()
    }

    /// Number of steps available to a reader
    pub fn steps(&self) -> u64 {
        self.desc.read().available_steps
    }

    /// Change the global shape of a variable without constant dims
    pub fn set_shape(&self, shape: &[u64]) -> Result<()> {
        let mut desc = self.desc.write();
        if desc.constant_dims {
            return Err(Error::invalid(format!(
                "variable '{}' has constant dimensions",
                desc.name
            )));
        }
        if desc.shape.len() != shape.len() {
            return Err(Error::invalid(format!(
                "variable '{}': shape rank {} does not match {}",
                desc.name,
                shape.len(),
                desc.shape.len()
            )));
        }
        let previous = std::mem::replace(&mut desc.shape, shape.to_vec());
        if let Err(err) = desc.check_block() {
            desc.shape = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Set the box to write (writer) or read (reader)
    pub fn set_selection(&self, start: &[u64], count: &[u64]) -> Result<()> {
        let mut desc = self.desc.write();
        if start.len() != count.len() {
            return Err(Error::invalid(format!(
                "variable '{}': selection start and count ranks differ",
                desc.name
            )));
        }
        if desc.constant_dims && (desc.start != start || desc.count != count) {
            return Err(Error::invalid(format!(
                "variable '{}' has constant dimensions",
                desc.name
            )));
        }
        if !desc.shape.is_empty()
            && desc.shape_id != ShapeId::LocalValue
            && desc.shape.len() != start.len()
        {
            return Err(Error::invalid(format!(
                "variable '{}': selection rank {} does not match shape rank {}",
                desc.name,
                start.len(),
                desc.shape.len()
            )));
        }
        if matches!(
            desc.shape_id,
            ShapeId::GlobalArray | ShapeId::LocalArray | ShapeId::JoinedArray
        ) {
            desc.start = start.to_vec();
            desc.count = count.to_vec();
        }
        desc.selection = Some(Selection::BoundingBox(Region::new(start, count)));
        Ok(())
    }

    /// Read a single block as it was written
    pub fn set_block_selection(&self, block_id: u32) {
        self.desc.write().selection = Some(Selection::WriteBlock(block_id));
    }

    /// Read individual global coordinates
    pub fn set_point_selection(&self, points: Vec<Vec<u64>>) -> Result<()> {
        let mut desc = self.desc.write();
        let rank = desc.shape.len();
        if let Some(bad) = points.iter().find(|p| p.len() != rank) {
            return Err(Error::invalid(format!(
                "variable '{}': point {bad:?} does not have rank {rank}",
                desc.name
            )));
        }
        desc.selection = Some(Selection::Points(points));
        Ok(())
    }

    /// Restrict reads to `count` steps starting at `start`
    pub fn set_step_selection(&self, start: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Err(Error::invalid("step selection must cover at least one step"));
        }
        self.desc.write().step_selection = Some((start, count));
        Ok(())
    }

    /// Place the selection at `start` inside a destination of extent `count`
    pub fn set_memory_selection(&self, start: &[u64], count: &[u64]) -> Result<()> {
        if start.len() != count.len() {
            return Err(Error::invalid("memory selection start and count ranks differ"));
        }
        self.desc.write().memory_selection = Some(Region::new(start, count));
        Ok(())
    }

    /// Drop selection, step selection and memory selection
    pub fn clear_selections(&self) {
        let mut desc = self.desc.write();
        desc.selection = None;
        desc.step_selection = None;
        desc.memory_selection = None;
    }

    /// Attach an operator applied to every block before buffering
    pub fn add_operation(&self, operator: &str, params: &[(&str, &str)]) -> usize {
        let mut desc = self.desc.write();
        desc.operations.push(Operation {
            operator: operator.to_ascii_lowercase(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
        });
        desc.operations.len() - 1
    }
}

/// Untyped attribute descriptor, value kept encoded
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDesc {
    pub name: String,
    pub data_type: DataType,
    pub is_array: bool,
    pub element_count: u32,
    pub value: Vec<u8>,
}

impl AttributeDesc {
    pub(crate) fn to_record(&self) -> AttributeRecord {
        AttributeRecord {
            name: self.name.clone(),
            data_type: self.data_type,
            is_array: self.is_array,
            element_count: self.element_count,
            value: self.value.clone(),
        }
    }
}

impl From<&AttributeRecord> for AttributeDesc {
    fn from(record: &AttributeRecord) -> Self {
        Self {
            name: record.name.clone(),
            data_type: record.data_type,
            is_array: record.is_array,
            element_count: record.element_count,
            value: record.value.clone(),
        }
    }
}

/// A decoded attribute
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute<T> {
    pub name: String,
    pub values: Vec<T>,
    pub is_array: bool,
}

impl<T: Element> Attribute<T> {
    pub(crate) fn from_desc(desc: &AttributeDesc) -> Result<Self> {
        if desc.data_type != T::DATA_TYPE {
            return Err(Error::TypeMismatch {
                name: desc.name.clone(),
                requested: T::DATA_TYPE,
                stored: desc.data_type,
            });
        }
        Ok(Self {
            name: desc.name.clone(),
            values: T::decode(&desc.value)?,
            is_array: desc.is_array,
        })
    }

    /// First value; attributes always hold at least one element
    pub fn value(&self) -> Option<&T> {
        self.values.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle<T: Element>(desc: VariableDesc) -> Result<Variable<T>> {
        Variable::from_desc(Arc::new(RwLock::new(desc)))
    }

    #[test]
    fn test_classification_from_define() {
        let d = VariableDesc::new("Nx", DataType::U64, &[], &[], &[], true).unwrap();
        assert_eq!(d.shape_id, ShapeId::GlobalValue);
        assert_eq!(d.put_element_count(), 1);

        let d = VariableDesc::new("T", DataType::F64, &[10, 4], &[5, 0], &[5, 4], true).unwrap();
        assert_eq!(d.shape_id, ShapeId::GlobalArray);
        assert_eq!(d.put_element_count(), 20);
    }

    #[test]
    fn test_define_rejects_out_of_shape_block() {
        let err = VariableDesc::new("T", DataType::F32, &[10], &[8], &[5], true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = VariableDesc::new("s", DataType::String, &[], &[], &[3], true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_handle_type_checked() {
        let desc = VariableDesc::new("x", DataType::F64, &[4], &[0], &[4], false).unwrap();
        assert!(handle::<f64>(desc.clone()).is_ok());
        match handle::<f32>(desc) {
            Err(Error::TypeMismatch {
                requested, stored, ..
            }) => {
                assert_eq!(requested, DataType::F32);
                assert_eq!(stored, DataType::F64);
            }
            other => panic!("expected type mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_constant_dims_are_fixed() {
        let desc = VariableDesc::new("x", DataType::I32, &[8], &[0], &[4], true).unwrap();
        let var = handle::<i32>(desc).unwrap();
        assert!(var.set_shape(&[16]).is_err());
        assert!(var.set_selection(&[4], &[4]).is_err());
        assert!(var.set_selection(&[0], &[4]).is_ok());
    }

    #[test]
    fn test_block_must_stay_inside_shape() {
        let desc = VariableDesc::new("v", DataType::F64, &[10], &[0], &[10], false).unwrap();
        let var = handle::<f64>(desc).unwrap();
        var.set_selection(&[8], &[5]).unwrap();
        assert!(matches!(var.desc().read().check_block(), Err(Error::InvalidArgument(_))));

        var.set_selection(&[6], &[4]).unwrap();
        assert!(var.desc().read().check_block().is_ok());
        assert!(matches!(var.set_shape(&[8]), Err(Error::InvalidArgument(_))));
        assert_eq!(var.shape(), vec![10]);
        assert!(var.set_shape(&[12]).is_ok());
    }
}
