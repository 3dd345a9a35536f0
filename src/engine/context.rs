use std::collections::HashMap;

use crate::core::{CapabilityId, Value};
use crate::error::ContextError;

/// Write-once store of resolved capability outputs.
///
/// Only the scheduler writes here, once per succeeded node, and it reads from
/// here when assembling a dependent's input. Each key has exactly one
/// producer in a plan, so a second write is always an orchestration bug.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    outputs: HashMap<CapabilityId, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: CapabilityId, value: Value) -> Result<(), ContextError> {
        if self.outputs.contains_key(&key) {
            return Err(ContextError::DuplicateWrite(key));
        }

        self.outputs.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&Value, ContextError> {
        self.outputs
            .get(key)
            .ok_or_else(|| ContextError::KeyNotReady(key.into()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.outputs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}
