use crate::mapping::Mapping;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Source of named mappings.
///
/// The mapping-file loader lives outside the engine; it hands parsed
/// mappings to the engine through this seam.
pub trait MappingRepository: Send + Sync {
    fn list(&self) -> Vec<String>;
    fn get(&self, name: &str) -> Option<Arc<Mapping>>;
}

/// Repository backed by a plain map, filled once at construction.
#[derive(Default)]
pub struct InMemoryRepository {
    mappings: BTreeMap<String, Arc<Mapping>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping under its own name, replacing any previous one.
    pub fn insert(&mut self, mapping: Mapping) {
        self.mappings
            .insert(mapping.name.clone(), Arc::new(mapping));
    }
}

impl MappingRepository for InMemoryRepository {
    fn list(&self) -> Vec<String> {
        self.mappings.keys().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<Arc<Mapping>> {
        self.mappings.get(name).cloned()
    }
}
