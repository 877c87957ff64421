use crate::error::AppError;
use std::collections::HashMap;
use std::sync::RwLock;

/// Persisted key-value state used by per-device collaborators.
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    fn set(&self, key: &str, value: String) -> Result<(), AppError>;
    /// Keep only entries for which `keep(key, value)` is true; returns how
    /// many were removed.
    fn retain(&self, keep: &mut dyn FnMut(&str, &str) -> bool) -> Result<usize, AppError>;
}

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| AppError::Store("memory store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), AppError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AppError::Store("memory store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn retain(&self, keep: &mut dyn FnMut(&str, &str) -> bool) -> Result<usize, AppError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AppError::Store("memory store lock poisoned".to_string()))?;
        let before = entries.len();
        entries.retain(|key, value| keep(key.as_str(), value.as_str()));
        Ok(before - entries.len())
    }
}
