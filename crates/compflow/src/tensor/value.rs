//! Shared result buffers handed to callers of forward/backward.
//!
//! A [`Value`] is a cheaply clonable handle onto one tensor slot. The evaluator keeps a
//! [`WeakValue`] for every slot it hands out and erases the live ones before the next
//! evaluation, so a stale handle reports [`UsageError::ErasedValue`] instead of showing data
//! from a later round.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, Weak};

use crate::error::{Result, UsageError};
use crate::tensor::{Shape, Tensor};

#[derive(Debug)]
struct ValueSlot {
    tensor: RwLock<Option<Tensor>>,
}

#[derive(Debug, Clone)]
pub struct Value {
    slot: Arc<ValueSlot>,
}

impl Value {
    pub fn new(tensor: Tensor) -> Self {
        Value {
            slot: Arc::new(ValueSlot {
                tensor: RwLock::new(Some(tensor)),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Tensor>> {
        self.slot.tensor.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the current tensor.
    pub fn tensor(&self) -> Result<Tensor> {
        self.read().clone().ok_or_else(|| UsageError::ErasedValue.into())
    }

    /// Runs `f` against the tensor without copying it.
    pub fn with_tensor<R>(&self, f: impl FnOnce(&Tensor) -> R) -> Result<R> {
        match self.read().as_ref() {
            Some(tensor) => Ok(f(tensor)),
            None => Err(UsageError::ErasedValue.into()),
        }
    }

    pub fn shape(&self) -> Result<Shape> {
        self.with_tensor(|tensor| tensor.shape().clone())
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.with_tensor(Tensor::to_f64_vec)
    }

    pub fn is_erased(&self) -> bool {
        self.read().is_none()
    }

    /// Drops the contents; subsequent reads fail until the slot is written again.
    pub fn erase(&self) {
        *self
            .slot
            .tensor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub(crate) fn replace(&self, tensor: Tensor) {
        *self
            .slot
            .tensor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(tensor);
    }

    pub fn downgrade(&self) -> WeakValue {
        WeakValue {
            slot: Arc::downgrade(&self.slot),
        }
    }

    /// Identity comparison: `true` when both handles refer to the same slot.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

/// Non-owning reference to a [`Value`] slot.
#[derive(Debug, Clone)]
pub struct WeakValue {
    slot: Weak<ValueSlot>,
}

impl WeakValue {
    pub fn upgrade(&self) -> Option<Value> {
        self.slot.upgrade().map(|slot| Value { slot })
    }

    /// Erases the slot if any strong handle still exists. Returns whether it did.
    pub fn erase(&self) -> bool {
        match self.upgrade() {
            Some(value) => {
                value.erase();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    #[test]
    fn erased_value_reports_usage_error() {
        let value = Value::new(Tensor::scalar(3.0));
        let weak = value.downgrade();
        assert!(weak.erase());
        assert!(value.is_erased());
        assert!(matches!(
            value.tensor(),
            Err(GraphError::Usage(UsageError::ErasedValue))
        ));
    }

    #[test]
    fn weak_erase_skips_dropped_values() {
        let weak = Value::new(Tensor::scalar(1.0)).downgrade();
        assert!(!weak.erase());
        assert!(weak.upgrade().is_none());
    }
}
