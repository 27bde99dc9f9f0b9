//! Structured facts: bitemporal entity/attribute/value assertions with deterministic identity.
//! Grounded on `database/index.rs`'s `BTreeIndex` (ordered lookups over a typed key) for the
//! entity/fact ordering, generalized from a single-field index to the entity-attribute-value
//! shape the fact store needs.

use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::errors::WaxError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FactValue {
    Text(String),
    Bool(bool),
    Integer(i64),
    Double(f64),
    Timestamp(i64),
}

impl FactValue {
    /// Rejects NaN/Infinity and canonicalizes `-0.0` to `+0.0` so identical facts always hash
    /// identically regardless of how the double was produced.
    pub fn validated(self) -> Result<Self, WaxError> {
        if let FactValue::Double(d) = self {
            if !d.is_finite() {
                return Err(WaxError::encoding("fact value double must be finite"));
            }
            let canonical = if d == 0.0 { 0.0 } else { d };
            return Ok(FactValue::Double(canonical));
        }
        Ok(self)
    }

    fn identity_bytes(&self) -> Vec<u8> {
        match self {
            FactValue::Text(s) => format!("T:{s}").into_bytes(),
            FactValue::Bool(b) => format!("B:{b}").into_bytes(),
            FactValue::Integer(i) => format!("I:{i}").into_bytes(),
            FactValue::Double(d) => format!("D:{:?}", d.to_bits()).into_bytes(),
            FactValue::Timestamp(t) => format!("S:{t}").into_bytes(),
        }
    }
}

/// A bitemporal assertion: `valid_from`/`valid_to` describe when the fact was true in the
/// world; `asserted_at` (implicit via insertion order into `FactStore`) describes when Wax
/// learned it. `valid_to = None` means "still true as of the latest known state".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: [u8; 32],
    pub entity_id: String,
    pub attribute: String,
    pub value: FactValue,
    pub valid_from: i64,
    pub valid_to: Option<i64>,
    pub source_frame_id: Option<u64>,
    pub retracted: bool,
}

fn fact_identity(entity_id: &str, attribute: &str, value: &FactValue, valid_from: i64) -> [u8; 32] {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(entity_id.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(attribute.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&value.identity_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&valid_from.to_be_bytes());
    checksum::digest(&bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: String,
    pub display_name: String,
}

#[derive(Default)]
pub struct StructuredStore {
    entities: std::collections::BTreeMap<String, Entity>,
    /// Keyed by `(entity_id, attribute)` for fast attribute lookups; each bucket is time-ordered
    /// by `valid_from` so `facts_as_of` can binary-search the boundary.
    facts: std::collections::BTreeMap<(String, String), Vec<Fact>>,
}

impl StructuredStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_entity(&mut self, id: impl Into<String>, kind: impl Into<String>, display_name: impl Into<String>) {
        let id = id.into();
        self.entities.insert(id.clone(), Entity { id, kind: kind.into(), display_name: display_name.into() });
    }

    #[must_use]
    pub fn resolve_entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    #[must_use]
    pub fn resolve_entities(&self, kind: Option<&str>) -> Vec<&Entity> {
        self.entities.values().filter(|e| kind.is_none_or(|k| e.kind == k)).collect()
    }

    /// Inserts a fully-formed fact as-is, bypassing the open/close bookkeeping `assert_fact`
    /// does — used only to rehydrate a store from persisted bytes.
    pub fn insert_raw_fact(&mut self, fact: Fact) {
        let key = (fact.entity_id.clone(), fact.attribute.clone());
        let bucket = self.facts.entry(key).or_default();
        bucket.push(fact);
        bucket.sort_by_key(|f| f.valid_from);
    }

    /// Asserts a new fact, closing out any currently-open fact for the same entity+attribute
    /// (setting its `valid_to` to this fact's `valid_from`) unless the values are identical.
    pub fn assert_fact(
        &mut self,
        entity_id: impl Into<String>,
        attribute: impl Into<String>,
        value: FactValue,
        valid_from: i64,
        source_frame_id: Option<u64>,
    ) -> Result<[u8; 32], WaxError> {
        let value = value.validated()?;
        let entity_id = entity_id.into();
        let attribute = attribute.into();
        let key = (entity_id.clone(), attribute.clone());
        let id = fact_identity(&entity_id, &attribute, &value, valid_from);

        let bucket = self.facts.entry(key).or_default();
        if let Some(open) = bucket.iter_mut().find(|f| f.valid_to.is_none() && !f.retracted) {
            if open.value == value {
                return Ok(open.id);
            }
            open.valid_to = Some(valid_from);
        }
        bucket.push(Fact { id, entity_id, attribute, value, valid_from, valid_to: None, source_frame_id, retracted: false });
        bucket.sort_by_key(|f| f.valid_from);
        Ok(id)
    }

    pub fn retract_fact(&mut self, fact_id: [u8; 32]) -> Result<(), WaxError> {
        for bucket in self.facts.values_mut() {
            if let Some(fact) = bucket.iter_mut().find(|f| f.id == fact_id) {
                fact.retracted = true;
                return Ok(());
            }
        }
        Err(WaxError::encoding("fact id not found for retraction"))
    }

    /// Every fact ever asserted, retracted or historical included — used for full persistence,
    /// not for answering queries (use `facts` for that).
    #[must_use]
    pub fn all_facts(&self) -> Vec<&Fact> {
        self.facts.values().flat_map(|bucket| bucket.iter()).collect()
    }

    /// All non-retracted facts for an entity (optionally filtered by attribute), as of
    /// `as_of_ms` if given, else the currently-open fact per attribute.
    #[must_use]
    pub fn facts(&self, entity_id: &str, attribute: Option<&str>, as_of_ms: Option<i64>) -> Vec<&Fact> {
        self.facts
            .iter()
            .filter(|((eid, attr), _)| eid == entity_id && attribute.is_none_or(|a| a == attr))
            .flat_map(|(_, bucket)| bucket.iter())
            .filter(|f| !f.retracted)
            .filter(|f| match as_of_ms {
                Some(t) => f.valid_from <= t && f.valid_to.is_none_or(|end| t < end),
                None => f.valid_to.is_none(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasserting_same_value_is_idempotent() {
        let mut store = StructuredStore::new();
        let id1 = store.assert_fact("agent:1", "status", FactValue::Text("active".into()), 100, None).unwrap();
        let id2 = store.assert_fact("agent:1", "status", FactValue::Text("active".into()), 200, None).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn reasserting_different_value_closes_previous_fact() {
        let mut store = StructuredStore::new();
        store.assert_fact("agent:1", "status", FactValue::Text("active".into()), 100, None).unwrap();
        store.assert_fact("agent:1", "status", FactValue::Text("idle".into()), 200, None).unwrap();
        let at_150 = store.facts("agent:1", Some("status"), Some(150));
        assert_eq!(at_150.len(), 1);
        assert_eq!(at_150[0].value, FactValue::Text("active".into()));
        let current = store.facts("agent:1", Some("status"), None);
        assert_eq!(current[0].value, FactValue::Text("idle".into()));
    }

    #[test]
    fn non_finite_double_is_rejected() {
        let mut store = StructuredStore::new();
        let err = store.assert_fact("agent:1", "score", FactValue::Double(f64::NAN), 0, None);
        assert!(err.is_err());
    }

    #[test]
    fn negative_zero_canonicalizes_to_positive_zero() {
        let a = FactValue::Double(-0.0).validated().unwrap();
        let b = FactValue::Double(0.0).validated().unwrap();
        assert_eq!(a.identity_bytes(), b.identity_bytes());
    }

    #[test]
    fn retract_hides_fact_from_current_view() {
        let mut store = StructuredStore::new();
        let id = store.assert_fact("agent:1", "status", FactValue::Text("active".into()), 100, None).unwrap();
        store.retract_fact(id).unwrap();
        assert!(store.facts("agent:1", Some("status"), None).is_empty());
    }
}
