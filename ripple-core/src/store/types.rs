//! Store Types
//!
//! The request and row shapes spoken by [`StoreClient`](super::StoreClient).
//! Rows are addressed by a `(partition, range)` pair and carry a flat map of
//! JSON attributes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute map of a stored row (key fields excluded).
pub type Attributes = serde_json::Map<String, Value>;

/// Primary key of a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: String,
    pub range: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, range: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            range: range.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.partition, self.range)
    }
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub key: ItemKey,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Item {
    pub fn new(key: ItemKey, attributes: Attributes) -> Self {
        Self { key, attributes }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(field.into(), value);
        self
    }
}

/// What a condition expects of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expected {
    Equals(Value),
    Absent,
}

/// Field-level precondition on a conditional write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub expected: Expected,
}

impl Condition {
    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            expected: Expected::Equals(value),
        }
    }

    pub fn absent(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            expected: Expected::Absent,
        }
    }

    /// Condition asserting the field still holds `old` (absent when `None`).
    pub fn unchanged(field: impl Into<String>, old: Option<&Value>) -> Self {
        match old {
            Some(value) => Self::equals(field, value.clone()),
            None => Self::absent(field),
        }
    }

    /// Evaluate against the current attributes of a row (`None` if missing).
    pub fn holds(&self, current: Option<&Attributes>) -> bool {
        let value = current.and_then(|attrs| attrs.get(&self.field));
        match (&self.expected, value) {
            (Expected::Absent, None) => true,
            (Expected::Absent, Some(_)) => false,
            (Expected::Equals(expected), Some(actual)) => expected == actual,
            (Expected::Equals(_), None) => false,
        }
    }
}

/// Conditional set/remove of attributes on one row. Creates the row if it
/// does not exist and the conditions allow it.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub key: ItemKey,
    pub set: Attributes,
    pub remove: Vec<String>,
    pub conditions: Vec<Condition>,
}

impl UpdateRequest {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            set: Attributes::new(),
            remove: Vec::new(),
            conditions: Vec::new(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set.insert(field.into(), value);
        self
    }

    pub fn remove(mut self, field: impl Into<String>) -> Self {
        self.remove.push(field.into());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// Operation accepted by a batch write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Item),
    Delete(ItemKey),
}

impl WriteOp {
    pub fn key(&self) -> &ItemKey {
        match self {
            WriteOp::Put(item) => &item.key,
            WriteOp::Delete(key) => key,
        }
    }
}

/// Operation accepted by a multi-item transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactOp {
    Put {
        item: Item,
        conditions: Vec<Condition>,
    },
    Delete {
        key: ItemKey,
        conditions: Vec<Condition>,
    },
    Update(UpdateRequest),
    ConditionCheck {
        key: ItemKey,
        conditions: Vec<Condition>,
    },
}

impl TransactOp {
    pub fn key(&self) -> &ItemKey {
        match self {
            TransactOp::Put { item, .. } => &item.key,
            TransactOp::Delete { key, .. } | TransactOp::ConditionCheck { key, .. } => key,
            TransactOp::Update(request) => &request.key,
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        match self {
            TransactOp::Put { conditions, .. }
            | TransactOp::Delete { conditions, .. }
            | TransactOp::ConditionCheck { conditions, .. } => conditions,
            TransactOp::Update(request) => &request.conditions,
        }
    }
}

impl From<WriteOp> for TransactOp {
    fn from(op: WriteOp) -> Self {
        match op {
            WriteOp::Put(item) => TransactOp::Put {
                item,
                conditions: Vec::new(),
            },
            WriteOp::Delete(key) => TransactOp::Delete {
                key,
                conditions: Vec::new(),
            },
        }
    }
}

/// Which key a query selects on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryIndex {
    /// All rows of one partition.
    Partition(String),
    /// All rows with one range key, across partitions (secondary index).
    Range(String),
}

/// A single-index query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub index: QueryIndex,
    /// Prefix filter on the other half of the key.
    pub begins_with: Option<String>,
    /// Attributes to return; empty returns everything.
    pub projection: Vec<String>,
}

impl Query {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            index: QueryIndex::Partition(partition.into()),
            begins_with: None,
            projection: Vec::new(),
        }
    }

    pub fn range(range: impl Into<String>) -> Self {
        Self {
            index: QueryIndex::Range(range.into()),
            begins_with: None,
            projection: Vec::new(),
        }
    }

    pub fn begins_with(mut self, prefix: impl Into<String>) -> Self {
        self.begins_with = Some(prefix.into());
        self
    }

    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a row key is selected by this query.
    pub fn selects(&self, key: &ItemKey) -> bool {
        let (fixed, other) = match &self.index {
            QueryIndex::Partition(partition) => (partition == &key.partition, &key.range),
            QueryIndex::Range(range) => (range == &key.range, &key.partition),
        };
        fixed
            && self
                .begins_with
                .as_deref()
                .map_or(true, |prefix| other.starts_with(prefix))
    }
}

/// Restrict attributes to `projection`; an empty projection keeps them all.
pub fn project(attributes: &Attributes, projection: &[String]) -> Attributes {
    if projection.is_empty() {
        return attributes.clone();
    }
    projection
        .iter()
        .filter_map(|field| {
            attributes
                .get(field)
                .map(|value| (field.clone(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn conditions_compare_field_values() {
        let current = attrs(json!({ "value": true }));
        assert!(Condition::equals("value", json!(true)).holds(Some(&current)));
        assert!(!Condition::equals("value", json!(false)).holds(Some(&current)));
        assert!(!Condition::absent("value").holds(Some(&current)));
        assert!(Condition::absent("other").holds(Some(&current)));
        assert!(Condition::absent("value").holds(None));
        assert!(!Condition::equals("value", json!(true)).holds(None));
    }

    #[test]
    fn query_selects_by_index_and_prefix() {
        let key = ItemKey::new("COMPUTED#active", "Graph::Descent");
        assert!(Query::partition("COMPUTED#active").selects(&key));
        assert!(Query::partition("COMPUTED#active")
            .begins_with("Graph::")
            .selects(&key));
        assert!(!Query::partition("COMPUTED#active")
            .begins_with("Meta::")
            .selects(&key));
        assert!(Query::range("Graph::Descent")
            .begins_with("COMPUTED#")
            .selects(&key));
        assert!(!Query::range("Graph::Ancestry").selects(&key));
    }

    #[test]
    fn projection_keeps_requested_fields() {
        let all = attrs(json!({ "src": "a", "value": 1, "dependencies": {} }));
        let projected = project(&all, &["value".to_string(), "missing".to_string()]);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("value"), Some(&json!(1)));
        assert_eq!(project(&all, &[]).len(), 3);
    }
}
