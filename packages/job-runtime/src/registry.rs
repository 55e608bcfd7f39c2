//! The job registry: authoritative catalog of definitions for a process.
//!
//! Read-mostly. Readers take an `Arc` snapshot of the whole catalog without
//! blocking writers; a writer swaps the catalog under the write lock only.
//! The dispatcher caches the definition snapshot at lease acquisition, so
//! in-flight runs keep executing under the definition they were dispatched
//! with across reloads.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::definition::JobDefinition;
use crate::error::RegistryError;

pub type Catalog = Arc<BTreeMap<String, Arc<JobDefinition>>>;

#[derive(Debug)]
pub struct JobRegistry {
    catalog: RwLock<Catalog>,
    /// Bumped on every reload; the dispatcher reseeds its schedule heap.
    version: watch::Sender<u64>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            catalog: RwLock::new(Arc::new(BTreeMap::new())),
            version,
        }
    }

    /// Build a registry from a full catalog, validating every definition and
    /// reporting all problems at once.
    pub fn from_definitions(
        definitions: Vec<JobDefinition>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.install(definitions)?;
        Ok(registry)
    }

    /// Add one definition to the current catalog.
    pub fn register(&self, definition: JobDefinition) -> Result<(), RegistryError> {
        definition
            .validate()
            .map_err(|reason| RegistryError::InvalidDefinition {
                name: definition.name.clone(),
                reason,
            })?;

        let mut guard = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateName(definition.name));
        }

        let mut next = (**guard).clone();
        next.insert(definition.name.clone(), Arc::new(definition));
        *guard = Arc::new(next);
        drop(guard);

        self.version.send_modify(|v| *v += 1);
        Ok(())
    }

    /// Atomically replace the catalog. In-flight runs continue under the
    /// definitions they were dispatched with.
    pub fn reload(&self, definitions: Vec<JobDefinition>) -> Result<(), RegistryError> {
        self.install(definitions)
    }

    fn install(&self, definitions: Vec<JobDefinition>) -> Result<(), RegistryError> {
        let mut problems = Vec::new();
        let mut next: BTreeMap<String, Arc<JobDefinition>> = BTreeMap::new();

        for definition in definitions {
            if let Err(reason) = definition.validate() {
                problems.push(format!("{}: {reason}", definition.name));
                continue;
            }
            if next.contains_key(&definition.name) {
                problems.push(format!("{}: duplicate job name", definition.name));
                continue;
            }
            next.insert(definition.name.clone(), Arc::new(definition));
        }

        if !problems.is_empty() {
            return Err(RegistryError::InvalidCatalog { problems });
        }

        let mut guard = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(next);
        drop(guard);

        self.version.send_modify(|v| *v += 1);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<JobDefinition>, RegistryError> {
        self.snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownJob(name.to_string()))
    }

    /// Snapshot ordered by name.
    pub fn list(&self) -> Vec<Arc<JobDefinition>> {
        self.snapshot().values().cloned().collect()
    }

    /// Consistent view of the whole catalog; cheap to take and hold.
    pub fn snapshot(&self) -> Catalog {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reload notifications for the dispatcher.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
