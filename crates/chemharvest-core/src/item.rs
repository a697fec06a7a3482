//! Work items and completion records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of one unit of work, unique within a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Build an id from several identifying column values.
    ///
    /// Encoded as a JSON array so `("a,b", "c")` and `("a", "b,c")` stay distinct.
    pub fn composite<S: AsRef<str>>(parts: &[S]) -> Self {
        let values = parts
            .iter()
            .map(|p| serde_json::Value::String(p.as_ref().to_string()))
            .collect();
        Self(serde_json::Value::Array(values).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric view, for integer-keyed sources (e.g. compound ids)
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for ItemId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<i64> for ItemId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

/// One unit of remote work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem<P> {
    pub id: ItemId,
    /// Opaque input needed to perform the work
    pub payload: P,
}

impl<P> WorkItem<P> {
    pub fn new(id: impl Into<ItemId>, payload: P) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Durable result of one successfully completed item (one JSONL line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord<R> {
    pub id: ItemId,
    pub result: R,
    pub completed_at: DateTime<Utc>,
}

impl<R> CompletionRecord<R> {
    pub fn now(id: ItemId, result: R) -> Self {
        Self {
            id,
            result,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ids_are_decimal() {
        assert_eq!(ItemId::from(42u64).as_str(), "42");
        assert_eq!(ItemId::from(-7i64).as_str(), "-7");
        assert_eq!(ItemId::from(42u64).as_u64(), Some(42));
        assert_eq!(ItemId::from("abc").as_u64(), None);
    }

    #[test]
    fn composite_ids_do_not_collide() {
        let a = ItemId::composite(&["a,b", "c"]);
        let b = ItemId::composite(&["a", "b,c"]);
        assert_ne!(a, b);
        assert_eq!(ItemId::composite(&["x", "1"]).as_str(), r#"["x","1"]"#);
    }

    #[test]
    fn record_serializes_id_as_string() {
        let rec = CompletionRecord::now(ItemId::from(5u64), serde_json::json!({"k": 1}));
        let line = serde_json::to_string(&rec).unwrap();
        assert!(line.starts_with(r#"{"id":"5","result":{"k":1}"#));
        let back: CompletionRecord<serde_json::Value> = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, rec.id);
    }
}
