// Temporary Key Generator - per-manager placeholder keys for unsaved entities
// Numeric keys count down from -1 so they can never collide with server identities.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use crate::core::data_value::{DataType, DataValue};
use crate::core::entity_key::EntityKey;
use crate::error::{AppError, AppResult};

/// Pluggable temporary key capability. Uniqueness is only required within
/// the owning manager.
pub trait KeyGenerator: Send + Sync {
    fn generate_temp_key_value(&mut self, entity_type: &str, data_type: DataType)
        -> AppResult<DataValue>;

    /// Record an externally produced temporary key (import remapping).
    fn register_temp_key(&mut self, key: EntityKey);

    fn is_temp_key(&self, key: &EntityKey) -> bool;

    fn remove_temp_key(&mut self, key: &EntityKey) -> bool;

    fn temp_keys(&self) -> Vec<EntityKey>;

    fn clear(&mut self);
}

#[derive(Debug)]
pub struct TempKeyGenerator {
    next_number: AtomicI64,
    temp_keys: HashSet<EntityKey>,
}

impl TempKeyGenerator {
    pub fn new() -> Self {
        Self {
            next_number: AtomicI64::new(-1),
            temp_keys: HashSet::new(),
        }
    }

    fn next_number(&self) -> i64 {
        self.next_number.fetch_sub(1, Ordering::Relaxed)
    }
}

impl Default for TempKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyGenerator for TempKeyGenerator {
    fn generate_temp_key_value(
        &mut self,
        entity_type: &str,
        data_type: DataType,
    ) -> AppResult<DataValue> {
        let value = match data_type {
            dt if dt.is_integer() => DataValue::Int(self.next_number()),
            dt if dt.is_numeric() => DataValue::Float(self.next_number() as f64),
            DataType::String => DataValue::String(format!("K_{}", self.next_number())),
            DataType::Guid => DataValue::Guid(Uuid::new_v4()),
            other => {
                return Err(AppError::InvalidOperation(format!(
                    "Cannot generate a temporary key of type {} for {}",
                    other, entity_type
                )))
            }
        };
        self.temp_keys
            .insert(EntityKey::new(entity_type, vec![value.clone()]));
        Ok(value)
    }

    fn register_temp_key(&mut self, key: EntityKey) {
        self.temp_keys.insert(key);
    }

    fn is_temp_key(&self, key: &EntityKey) -> bool {
        self.temp_keys.contains(key)
    }

    fn remove_temp_key(&mut self, key: &EntityKey) -> bool {
        self.temp_keys.remove(key)
    }

    fn temp_keys(&self) -> Vec<EntityKey> {
        self.temp_keys.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.temp_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_keys_count_down() {
        let mut generator = TempKeyGenerator::new();
        let a = generator
            .generate_temp_key_value("Order", DataType::Int32)
            .unwrap();
        let b = generator
            .generate_temp_key_value("Order", DataType::Int32)
            .unwrap();
        assert_eq!(a, DataValue::Int(-1));
        assert_eq!(b, DataValue::Int(-2));
        assert!(generator.is_temp_key(&EntityKey::single("Order", -1)));
        assert!(!generator.is_temp_key(&EntityKey::single("Customer", -1)));
    }

    #[test]
    fn test_string_and_guid_keys() {
        let mut generator = TempKeyGenerator::new();
        let s = generator
            .generate_temp_key_value("Region", DataType::String)
            .unwrap();
        assert_eq!(s, DataValue::String("K_-1".into()));
        let g = generator
            .generate_temp_key_value("Territory", DataType::Guid)
            .unwrap();
        assert!(matches!(g, DataValue::Guid(_)));
        assert_eq!(generator.temp_keys().len(), 2);
        assert!(generator
            .generate_temp_key_value("Shift", DataType::DateTime)
            .is_err());
    }

    #[test]
    fn test_remove_temp_key() {
        let mut generator = TempKeyGenerator::new();
        let v = generator
            .generate_temp_key_value("Order", DataType::Int64)
            .unwrap();
        let key = EntityKey::new("Order", vec![v]);
        assert!(generator.remove_temp_key(&key));
        assert!(!generator.is_temp_key(&key));
    }
}
