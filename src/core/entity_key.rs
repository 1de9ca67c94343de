// Entity Key - composite identity of a cached entity

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::core::data_value::DataValue;

const DELIMITER: char = '|';
const ESCAPE: char = '\\';

/// Immutable (entity type, key values) pair.
///
/// Equality and hashing go through the key string, so numerically equal
/// values (`1` vs `1.0`) and equal instants compare equal regardless of how
/// they were produced.
#[derive(Debug, Clone)]
pub struct EntityKey {
    entity_type: String,
    values: Vec<DataValue>,
    key_string: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, values: Vec<DataValue>) -> Self {
        let key_string = Self::create_key_string(&values);
        Self {
            entity_type: entity_type.into(),
            values,
            key_string,
        }
    }

    pub fn single(entity_type: impl Into<String>, value: impl Into<DataValue>) -> Self {
        Self::new(entity_type, vec![value.into()])
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn values(&self) -> &[DataValue] {
        &self.values
    }

    /// Delimiter-joined value list. Components escape the delimiter and the
    /// escape character so no component can fake a boundary.
    pub fn key_string(&self) -> &str {
        &self.key_string
    }

    /// True when no component carries a value (parent keys whose foreign
    /// keys have not been set yet).
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(DataValue::is_empty)
    }

    pub fn create_key_string(values: &[DataValue]) -> String {
        let mut out = String::new();
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                out.push(DELIMITER);
            }
            for c in value.key_component().chars() {
                if c == DELIMITER || c == ESCAPE {
                    out.push(ESCAPE);
                }
                out.push(c);
            }
        }
        out
    }

    /// Key string qualified by type; unique across groups.
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.entity_type, self.key_string)
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type && self.key_string == other.key_string
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_type.hash(state);
        self.key_string.hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.entity_type, self.key_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_value_equality() {
        let a = EntityKey::new("Order", vec![DataValue::Int(1), "x".into()]);
        let b = EntityKey::new("Order", vec![DataValue::Float(1.0), "x".into()]);
        assert_eq!(a, b);
        assert_ne!(a, EntityKey::new("Customer", vec![DataValue::Int(1), "x".into()]));

        let when = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            EntityKey::single("Shift", when),
            EntityKey::single("Shift", DataValue::DateTime(when))
        );
    }

    #[test]
    fn test_delimiter_cannot_collide() {
        let joined = EntityKey::new("T", vec!["a|b".into()]);
        let split = EntityKey::new("T", vec!["a".into(), "b".into()]);
        assert_ne!(joined.key_string(), split.key_string());

        let escaped = EntityKey::new("T", vec!["a\\".into(), "b".into()]);
        let other = EntityKey::new("T", vec!["a\\|b".into()]);
        assert_ne!(escaped.key_string(), other.key_string());
    }

    #[test]
    fn test_empty_parent_key() {
        assert!(EntityKey::new("Customer", vec![DataValue::Null]).is_empty());
        assert!(!EntityKey::single("Customer", 0).is_empty());
    }
}
