//! Variable and attribute catalog
//!
//! An [`Io`] groups the variables and attributes one component writes or
//! reads, together with the engine kind and the parameter map engines are
//! configured from. Handles are cheap to clone and share one catalog.

use std::str::FromStr;
use std::sync::Arc;

use bpio_core::format::constants::MAX_NAME_LENGTH;
use bpio_core::{AttributeRecord, Element, ShapeId};
use hashbrown::{HashMap, HashSet};
use log::debug;
use parking_lot::RwLock;

use crate::comm::{Comm, SelfComm};
use crate::deserializer::MetadataIndex;
use crate::engine::stream::StreamHub;
use crate::engine::{Engine, Mode};
use crate::error::{Error, Result};
use crate::operator::OperatorRegistry;
use crate::params::EngineParams;
use crate::variable::{Attribute, AttributeDesc, Variable, VariableDesc};

/// Engine implementation an [`Io`] opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// Binary-pack dataset on disk
    #[default]
    BpFile,
    /// In-process step stream
    Stream,
}

impl FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bpfile" | "bp4" | "bp" | "file" => Ok(EngineKind::BpFile),
            "stream" | "sst" | "dataman" | "inline" => Ok(EngineKind::Stream),
            _ => Err(Error::invalid(format!("unknown engine type '{s}'"))),
        }
    }
}

struct IoInner {
    name: String,
    debug_mode: bool,
    engine: RwLock<EngineKind>,
    params: RwLock<HashMap<String, String>>,
    variables: RwLock<HashMap<String, Arc<RwLock<VariableDesc>>>>,
    /// Definition order is the order attributes are written in
    attributes: RwLock<Vec<AttributeDesc>>,
    operators: Arc<OperatorRegistry>,
    hub: Arc<StreamHub>,
}

#[derive(Clone)]
pub struct Io {
    inner: Arc<IoInner>,
}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Io")
            .field("name", &self.inner.name)
            .field("engine", &*self.inner.engine.read())
            .field("variables", &self.inner.variables.read().len())
            .field("attributes", &self.inner.attributes.read().len())
            .finish()
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(Error::invalid(format!(
            "{kind} name must have 1 to {MAX_NAME_LENGTH} bytes"
        )));
    }
    Ok(())
}

impl Io {
    pub(crate) fn new(
        name: &str,
        debug_mode: bool,
        operators: Arc<OperatorRegistry>,
        hub: Arc<StreamHub>,
    ) -> Self {
        Self {
            inner: Arc::new(IoInner {
                name: name.to_string(),
                debug_mode,
                engine: RwLock::new(EngineKind::default()),
                params: RwLock::new(HashMap::new()),
                variables: RwLock::new(HashMap::new()),
                attributes: RwLock::new(Vec::new()),
                operators,
                hub,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Select the engine by name, e.g. `"BPFile"` or `"SST"`
    pub fn set_engine(&self, kind: &str) -> Result<()> {
        self.set_engine_kind(kind.parse()?);
        Ok(())
    }

    pub fn set_engine_kind(&self, kind: EngineKind) {
        *self.inner.engine.write() = kind;
    }

    pub fn engine_kind(&self) -> EngineKind {
        *self.inner.engine.read()
    }

    pub fn set_parameter(&self, key: &str, value: &str) {
        self.inner
            .params
            .write()
            .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    pub fn set_parameters<K, V>(&self, params: impl IntoIterator<Item = (K, V)>)
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in params {
            self.set_parameter(key.as_ref(), value.as_ref());
        }
    }

    /// Parameter map with lower-cased keys
    pub fn parameters(&self) -> HashMap<String, String> {
        self.inner.params.read().clone()
    }

    pub fn clear_parameters(&self) {
        self.inner.params.write().clear();
    }

    /// Typed engine parameters, validated
    pub fn engine_params(&self) -> Result<EngineParams> {
        EngineParams::from_map(&self.inner.params.read())
    }

    /// Define a variable; `shape`, `start` and `count` determine its
    /// [`ShapeId`]
    pub fn define_variable<T: Element>(
        &self,
        name: &str,
        shape: &[u64],
        start: &[u64],
        count: &[u64],
        constant_dims: bool,
    ) -> Result<Variable<T>> {
        check_name("variable", name)?;
        let mut variables = self.inner.variables.write();
        if let Some(existing) = variables.get(name) {
            if self.inner.debug_mode {
                return Err(Error::AlreadyDefined {
                    kind: "variable",
                    name: name.to_string(),
                });
            }
            return Variable::from_desc(Arc::clone(existing));
        }
        let desc = VariableDesc::new(name, T::DATA_TYPE, shape, start, count, constant_dims)?;
        debug!(
            "io '{}': defined {:?} '{name}' of {}",
            self.inner.name, desc.shape_id, T::DATA_TYPE
        );
        let desc = Arc::new(RwLock::new(desc));
        variables.insert(name.to_string(), Arc::clone(&desc));
        Variable::from_desc(desc)
    }

    /// Handle onto a defined variable, `None` when there is none
    pub fn inquire_variable<T: Element>(&self, name: &str) -> Result<Option<Variable<T>>> {
        match self.inner.variables.read().get(name) {
            Some(desc) => Variable::from_desc(Arc::clone(desc)).map(Some),
            None => Ok(None),
        }
    }

    pub fn remove_variable(&self, name: &str) -> bool {
        self.inner.variables.write().remove(name).is_some()
    }

    pub fn remove_all_variables(&self) {
        self.inner.variables.write().clear();
    }

    /// Snapshot of every variable, sorted by name
    pub fn available_variables(&self) -> Vec<VariableDesc> {
        let mut out: Vec<VariableDesc> = self
            .inner
            .variables
            .read()
            .values()
            .map(|d| d.read().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn insert_attribute(&self, desc: AttributeDesc) -> Result<()> {
        check_name("attribute", &desc.name)?;
        let mut attributes = self.inner.attributes.write();
        if attributes.iter().any(|a| a.name == desc.name) {
            return Err(Error::AlreadyDefined {
                kind: "attribute",
                name: desc.name,
            });
        }
        attributes.push(desc);
        Ok(())
    }

    pub fn define_attribute<T: Element>(&self, name: &str, value: T) -> Result<Attribute<T>> {
        let mut encoded = Vec::new();
        T::encode(std::slice::from_ref(&value), &mut encoded);
        self.insert_attribute(AttributeDesc {
            name: name.to_string(),
            data_type: T::DATA_TYPE,
            is_array: false,
            element_count: 1,
            value: encoded,
        })?;
        Ok(Attribute {
            name: name.to_string(),
            values: vec![value],
            is_array: false,
        })
    }

    pub fn define_attribute_array<T: Element>(&self, name: &str, values: &[T]) -> Result<Attribute<T>> {
        if values.is_empty() {
            return Err(Error::invalid(format!("attribute '{name}' has no values")));
        }
        let count = u32::try_from(values.len())
            .map_err(|_| Error::invalid(format!("attribute '{name}' has too many values")))?;
        let mut encoded = Vec::new();
        T::encode(values, &mut encoded);
        self.insert_attribute(AttributeDesc {
            name: name.to_string(),
            data_type: T::DATA_TYPE,
            is_array: true,
            element_count: count,
            value: encoded,
        })?;
        Ok(Attribute {
            name: name.to_string(),
            values: values.to_vec(),
            is_array: true,
        })
    }

    pub fn inquire_attribute<T: Element>(&self, name: &str) -> Result<Option<Attribute<T>>> {
        match self.inner.attributes.read().iter().find(|a| a.name == name) {
            Some(desc) => Attribute::from_desc(desc).map(Some),
            None => Ok(None),
        }
    }

    /// Every attribute, sorted by name
    pub fn available_attributes(&self) -> Vec<AttributeDesc> {
        let mut out = self.inner.attributes.read().clone();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn remove_attribute(&self, name: &str) -> bool {
        let mut attributes = self.inner.attributes.write();
        let before = attributes.len();
        attributes.retain(|a| a.name != name);
        attributes.len() != before
    }

    /// Open an engine on a single-process communicator
    pub fn open(&self, name: &str, mode: Mode) -> Result<Engine> {
        self.open_with_comm(name, mode, Box::new(SelfComm))
    }

    /// Open an engine; collective over `comm` for writers
    pub fn open_with_comm(&self, name: &str, mode: Mode, comm: Box<dyn Comm>) -> Result<Engine> {
        Engine::open(self, name, mode, comm)
    }

    pub(crate) fn operators(&self) -> Arc<OperatorRegistry> {
        Arc::clone(&self.inner.operators)
    }

    pub(crate) fn hub(&self) -> Arc<StreamHub> {
        Arc::clone(&self.inner.hub)
    }

    /// Attributes not yet in `written`, in definition order; marks them written
    pub(crate) fn new_attribute_records(
        &self,
        written: &mut HashSet<String>,
    ) -> Vec<AttributeRecord> {
        self.inner
            .attributes
            .read()
            .iter()
            .filter(|a| written.insert(a.name.clone()))
            .map(AttributeDesc::to_record)
            .collect()
    }

    /// Make what a reader found visible through the catalog. Shapes are
    /// those at `step`, or at a variable's first step when there is none.
    pub(crate) fn register_from_index(&self, index: &MetadataIndex, step: Option<u64>) {
        let mut variables = self.inner.variables.write();
        for var in index.variables() {
            let at = step
                .filter(|s| var.steps.contains_key(s))
                .or_else(|| var.steps.keys().next().copied());
            let Some(at) = at else { continue };
            let shape = var.shape_at(at);
            let count = match var.shape_id {
                ShapeId::LocalArray => var
                    .steps
                    .get(&at)
                    .and_then(|blocks| blocks.first())
                    .map(|b| b.count.clone())
                    .unwrap_or_default(),
                ShapeId::GlobalValue | ShapeId::LocalValue => Vec::new(),
                _ => shape.clone(),
            };
            let available_steps = var.steps.len() as u64;

            if let Some(existing) = variables.get(&var.name) {
                let mut desc = existing.write();
                if desc.data_type != var.data_type {
                    continue;
                }
                desc.shape_id = var.shape_id;
                desc.shape = shape;
                if desc.selection.is_none() {
                    desc.start = vec![0; count.len()];
                    desc.count = count;
                }
                desc.available_steps = available_steps;
                continue;
            }
            let desc = VariableDesc {
                name: var.name.clone(),
                data_type: var.data_type,
                shape_id: var.shape_id,
                shape,
                start: vec![0; count.len()],
                count,
                constant_dims: false,
                operations: Vec::new(),
                selection: None,
                step_selection: None,
                memory_selection: None,
                available_steps,
            };
            variables.insert(var.name.clone(), Arc::new(RwLock::new(desc)));
        }
        drop(variables);

        // the first definition of an attribute wins
        let mut attributes = self.inner.attributes.write();
        for record in index.attributes() {
            if !attributes.iter().any(|a| a.name == record.name) {
                attributes.push(AttributeDesc::from(record));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpio_core::DataType;

    fn io(debug_mode: bool) -> Io {
        Io::new(
            "test",
            debug_mode,
            Arc::new(OperatorRegistry::with_defaults()),
            Arc::new(StreamHub::new()),
        )
    }

    #[test]
    fn test_engine_kind_names() {
        assert_eq!("BP4".parse::<EngineKind>().unwrap(), EngineKind::BpFile);
        assert_eq!("sst".parse::<EngineKind>().unwrap(), EngineKind::Stream);
        assert_eq!("Inline".parse::<EngineKind>().unwrap(), EngineKind::Stream);
        assert!("hdf5".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_redefinition_depends_on_debug_mode() {
        let strict = io(true);
        strict.define_variable::<f32>("x", &[4], &[0], &[4], true).unwrap();
        assert!(matches!(
            strict.define_variable::<f32>("x", &[4], &[0], &[4], true),
            Err(Error::AlreadyDefined { .. })
        ));

        let lenient = io(false);
        lenient.define_variable::<f32>("x", &[4], &[0], &[4], true).unwrap();
        assert!(lenient.define_variable::<f32>("x", &[8], &[0], &[8], true).is_ok());
        assert!(matches!(
            lenient.define_variable::<f64>("x", &[4], &[0], &[4], true),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_inquire_and_remove() {
        let io = io(true);
        assert!(io.inquire_variable::<i32>("missing").unwrap().is_none());
        io.define_variable::<i32>("b", &[], &[], &[], false).unwrap();
        io.define_variable::<i32>("a", &[2], &[0], &[2], false).unwrap();
        let names: Vec<String> = io.available_variables().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(io.inquire_variable::<u8>("a").is_err());
        assert!(io.remove_variable("a"));
        assert!(!io.remove_variable("a"));
    }

    #[test]
    fn test_attributes_defined_once() {
        let io = io(false);
        io.define_attribute("units", String::from("K")).unwrap();
        io.define_attribute_array("bounds", &[0.5f64, 1.5]).unwrap();
        assert!(matches!(
            io.define_attribute("units", String::from("C")),
            Err(Error::AlreadyDefined { .. })
        ));
        let bounds = io.inquire_attribute::<f64>("bounds").unwrap().unwrap();
        assert_eq!(bounds.values, [0.5, 1.5]);
        assert!(bounds.is_array);
        assert_eq!(io.available_attributes()[0].data_type, DataType::F64);
    }

    #[test]
    fn test_new_attribute_records_survive_removal() {
        let io = io(false);
        let mut written = HashSet::new();
        io.define_attribute("a", 1i32).unwrap();
        io.define_attribute("b", 2i32).unwrap();
        assert_eq!(io.new_attribute_records(&mut written).len(), 2);
        assert!(io.new_attribute_records(&mut written).is_empty());

        assert!(io.remove_attribute("a"));
        io.define_attribute("c", 3i32).unwrap();
        let fresh: Vec<String> = io
            .new_attribute_records(&mut written)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(fresh, ["c"]);
    }

    #[test]
    fn test_parameters_case_insensitive() {
        let io = io(false);
        io.set_parameters([("FlushStepsCount", "3"), ("SomethingElse", "x")]);
        assert_eq!(io.parameters()["flushstepscount"], "3");
        assert_eq!(io.engine_params().unwrap().flush_steps_count, 3);
    }
}
