//! Content-addressable surrogate keys
//!
//! A key is the first eight bytes (big-endian, signed) of the SHA-256 digest of
//! the compact JSON document `[entity, [[name, canonical_text], ...]]`, built
//! from the entity's identifying values after canonicalization. Nulls appear as
//! JSON `null`.

use genflow_common::{CoercionError, Value};
use sha2::{Digest, Sha256};

use crate::error::SchemaError;
use crate::schema::{KeyPart, Schema};

/// Canonicalize `values` (aligned with `parts`) and hash them into a key
pub fn compute_key(entity: &str, parts: &[KeyPart], values: &[Value]) -> Result<i64, CoercionError> {
    let mut fields: Vec<(&str, Option<String>)> = Vec::with_capacity(parts.len());
    for (part, value) in parts.iter().zip(values) {
        let canonical = part.ty.coerce(value, part.strict)?;
        fields.push((part.name.as_str(), canonical.canonical_text()));
    }
    Ok(hash_fields(entity, &fields))
}

fn hash_fields(entity: &str, fields: &[(&str, Option<String>)]) -> i64 {
    // serializing plain strings and options into a Vec cannot fail
    let document = serde_json::to_vec(&(entity, fields)).unwrap_or_default();
    let digest = Sha256::digest(&document);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

/// Key layout of one entity, resolved once per load
#[derive(Debug, Clone)]
pub struct KeyLayout {
    entity: String,
    parts: Vec<KeyPart>,
}

impl KeyLayout {
    pub fn new(schema: &Schema, entity: &str) -> Result<Self, SchemaError> {
        Ok(Self {
            entity: entity.to_string(),
            parts: schema.key_parts(entity)?,
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn key(&self, values: &[Value]) -> Result<i64, CoercionError> {
        compute_key(&self.entity, &self.parts, values)
    }

    /// Keys for `len` rows given one column per key part
    pub fn keys(&self, columns: &[Vec<Value>], len: usize) -> Result<Vec<Value>, CoercionError> {
        let mut row = Vec::with_capacity(columns.len());
        (0..len)
            .map(|i| {
                row.clear();
                row.extend(columns.iter().map(|c| c[i].clone()));
                self.key(&row).map(Value::Int)
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use genflow_common::SqlType;
    use proptest::prelude::*;

    use super::*;

    fn int_part(strict: bool) -> Vec<KeyPart> {
        vec![KeyPart {
            name: "col_int".into(),
            ty: SqlType::Int,
            strict,
        }]
    }

    const PARENT_ONE: i64 = -5220010288091357104;

    #[test]
    fn test_documented_key_for_parent_one() {
        let parts = int_part(false);
        assert_eq!(compute_key("parent", &parts, &[Value::Int(1)]).unwrap(), PARENT_ONE);
        assert_eq!(compute_key("parent", &parts, &["1".into()]).unwrap(), PARENT_ONE);
        assert_eq!(compute_key("parent", &parts, &[" 1 ".into()]).unwrap(), PARENT_ONE);
        assert_eq!(compute_key("parent", &parts, &[Value::Bool(true)]).unwrap(), PARENT_ONE);
        assert_eq!(compute_key("parent", &parts, &[Value::Double(1.0)]).unwrap(), PARENT_ONE);
        assert_eq!(PARENT_ONE.to_string(), "-5220010288091357104");
    }

    #[test]
    fn test_strict_int_rejects_bool() {
        let err = compute_key("parent", &int_part(true), &[Value::Bool(true)]).unwrap_err();
        assert_eq!(err.target, "Int");
        assert_eq!(compute_key("parent", &int_part(true), &[Value::Int(1)]).unwrap(), PARENT_ONE);
    }

    #[test]
    fn test_uncoercible_value_fails() {
        assert!(compute_key("parent", &int_part(false), &["one".into()]).is_err());
    }

    #[test]
    fn test_entity_name_matters() {
        let parts = int_part(false);
        assert_ne!(
            compute_key("parent", &parts, &[Value::Int(1)]).unwrap(),
            compute_key("child", &parts, &[Value::Int(1)]).unwrap()
        );
    }

    #[test]
    fn test_null_differs_from_text_null() {
        let parts = vec![KeyPart {
            name: "name".into(),
            ty: SqlType::Text,
            strict: false,
        }];
        assert_ne!(
            compute_key("e", &parts, &[Value::Null]).unwrap(),
            compute_key("e", &parts, &["null".into()]).unwrap()
        );
    }

    #[test]
    fn test_ten_thousand_distinct_keys() {
        let parts = int_part(false);
        let keys: HashSet<i64> = (0..10_000)
            .map(|i| compute_key("parent", &parts, &[Value::Int(i)]).unwrap())
            .collect();
        assert_eq!(keys.len(), 10_000);
    }

    #[test]
    fn test_layout_keys_for_batch() {
        let schema = crate::schema::tests::sample_schema();
        let layout = KeyLayout::new(&schema, "parent").unwrap();
        let keys = layout.keys(&[vec![Value::Int(1), Value::Int(2)]], 2).unwrap();
        assert_eq!(keys, vec![Value::Int(PARENT_ONE), Value::Int(-1640688002432293191)]);
    }

    proptest! {
        #[test]
        fn prop_int_and_numeric_string_agree(n in any::<i64>()) {
            let parts = int_part(false);
            let a = compute_key("parent", &parts, &[Value::Int(n)]).unwrap();
            let b = compute_key("parent", &parts, &[Value::Text(n.to_string())]).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
