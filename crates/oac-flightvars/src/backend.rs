use std::collections::HashMap;
use std::mem::discriminant;
use std::sync::{PoisonError, RwLock};

use oac_proto::{VariableId, VariableValue};
use thiserror::Error;
use tokio::sync::broadcast;

const CHANGE_QUEUE_DEPTH: usize = 256;

/// A variable changed value. `origin` is the server session that wrote it,
/// if the write came from a client.
#[derive(Debug, Clone, PartialEq)]
pub struct VarChange {
    pub var: VariableId,
    pub value: VariableValue,
    pub origin: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("no such variable {0}")]
    NoSuchVariable(VariableId),

    #[error("variable {var} holds {expected} values, got {got}")]
    TypeMismatch {
        var: VariableId,
        expected: &'static str,
        got: &'static str,
    },
}

/// Where the server reads and writes variable values.
pub trait VariableBackend: Send + Sync + 'static {
    fn contains(&self, var: &VariableId) -> bool;
    fn get(&self, var: &VariableId) -> Option<VariableValue>;
    fn set(&self, var: &VariableId, value: VariableValue, origin: Option<u64>) -> Result<(), BackendError>;
    /// Stream of every accepted `set`.
    fn watch(&self) -> broadcast::Receiver<VarChange>;
}

/// Variable table kept in process memory.
pub struct MemoryBackend {
    vars: RwLock<HashMap<VariableId, VariableValue>>,
    changes: broadcast::Sender<VarChange>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_QUEUE_DEPTH);
        Self { vars: RwLock::new(HashMap::new()), changes }
    }

    pub fn with_vars<I: IntoIterator<Item = (VariableId, VariableValue)>>(vars: I) -> Self {
        let backend = Self::new();
        for (var, value) in vars {
            backend.define(var, value);
        }
        backend
    }

    /// Adds or replaces a variable without notifying watchers.
    pub fn define(&self, var: VariableId, value: VariableValue) {
        self.vars.write().unwrap_or_else(PoisonError::into_inner).insert(var, value);
    }

    pub fn len(&self) -> usize {
        self.vars.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VariableBackend for MemoryBackend {
    fn contains(&self, var: &VariableId) -> bool {
        self.vars.read().unwrap_or_else(PoisonError::into_inner).contains_key(var)
    }

    fn get(&self, var: &VariableId) -> Option<VariableValue> {
        self.vars.read().unwrap_or_else(PoisonError::into_inner).get(var).copied()
    }

    fn set(&self, var: &VariableId, value: VariableValue, origin: Option<u64>) -> Result<(), BackendError> {
        {
            let mut vars = self.vars.write().unwrap_or_else(PoisonError::into_inner);
            let slot = vars.get_mut(var).ok_or_else(|| BackendError::NoSuchVariable(var.clone()))?;
            if discriminant(slot) != discriminant(&value) {
                return Err(BackendError::TypeMismatch {
                    var: var.clone(),
                    expected: slot.type_name(),
                    got: value.type_name(),
                });
            }
            *slot = value;
        }
        // nobody listening is fine
        let _ = self.changes.send(VarChange { var: var.clone(), value, origin });
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<VarChange> {
        self.changes.subscribe()
    }
}
