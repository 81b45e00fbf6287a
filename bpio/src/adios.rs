//! Library context
//!
//! [`Adios`] owns everything that would otherwise be process global: the
//! named [`Io`] catalogs, the operator registry and the hub in-process
//! streams are exchanged through. Clones share the same context, so a
//! writer and a reader on different threads see the same streams.

use std::sync::Arc;

use hashbrown::HashMap;
use log::debug;
use parking_lot::RwLock;

use crate::engine::stream::StreamHub;
use crate::error::{Error, Result};
use crate::io::Io;
use crate::operator::{Operator, OperatorRegistry};

#[derive(Debug, Clone, Copy, Default)]
pub struct AdiosConfig {
    /// Reject redefinitions instead of returning the existing handle
    pub debug_mode: bool,
}

struct AdiosInner {
    config: AdiosConfig,
    ios: RwLock<HashMap<String, Io>>,
    operators: Arc<OperatorRegistry>,
    hub: Arc<StreamHub>,
}

#[derive(Clone)]
pub struct Adios {
    inner: Arc<AdiosInner>,
}

impl std::fmt::Debug for Adios {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adios")
            .field("config", &self.inner.config)
            .field("ios", &self.inner.ios.read().len())
            .finish()
    }
}

impl Default for Adios {
    fn default() -> Self {
        Self::new(AdiosConfig::default())
    }
}

impl Adios {
    pub fn new(config: AdiosConfig) -> Self {
        Self {
            inner: Arc::new(AdiosInner {
                config,
                ios: RwLock::new(HashMap::new()),
                operators: Arc::new(OperatorRegistry::with_defaults()),
                hub: Arc::new(StreamHub::new()),
            }),
        }
    }

    pub fn config(&self) -> AdiosConfig {
        self.inner.config
    }

    /// Create a new, empty catalog
    pub fn declare_io(&self, name: &str) -> Result<Io> {
        let mut ios = self.inner.ios.write();
        if ios.contains_key(name) {
            return Err(Error::AlreadyDefined {
                kind: "io",
                name: name.to_string(),
            });
        }
        let io = Io::new(
            name,
            self.inner.config.debug_mode,
            Arc::clone(&self.inner.operators),
            Arc::clone(&self.inner.hub),
        );
        ios.insert(name.to_string(), io.clone());
        debug!("declared io '{name}'");
        Ok(io)
    }

    /// Catalog declared earlier under `name`
    pub fn at_io(&self, name: &str) -> Result<Io> {
        self.inner
            .ios
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("io '{name}'")))
    }

    pub fn remove_io(&self, name: &str) -> bool {
        self.inner.ios.write().remove(name).is_some()
    }

    /// Make a custom operator available to every catalog
    pub fn register_operator(&self, operator: Arc<dyn Operator>) {
        self.inner.operators.register(operator);
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.inner.operators
    }
}
