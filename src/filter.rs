//! Typed store filters produced by the query translator.
//!
//! Evaluation follows document-store conventions: a dotted path traverses
//! arrays implicitly, a condition on an array field matches when the array
//! itself or any of its elements match, and `$ne`/`$nin` hold when no value
//! matches (including when the field is absent).

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use crate::document::{format_date, parse_date, values_at, ID_FIELD};
use crate::error::{DbError, Result};
use crate::ids::DocId;

/// Right-hand side of a condition, already coerced to the field's type.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Value(Value),
    Id(DocId),
    Date(DateTime<Utc>),
}

impl Operand {
    pub fn to_value(&self) -> Value {
        match self {
            Operand::Value(v) => v.clone(),
            Operand::Id(id) => id.to_value(),
            Operand::Date(d) => Value::String(format_date(d)),
        }
    }

    fn is_null(&self) -> bool {
        matches!(self, Operand::Value(Value::Null))
    }

    fn equals(&self, candidate: &Value) -> bool {
        match self {
            Operand::Id(id) => candidate.as_str().and_then(|s| DocId::parse(s).ok()).as_ref() == Some(id),
            Operand::Date(date) => candidate.as_str().and_then(parse_date).as_ref() == Some(date),
            Operand::Value(Value::Number(n)) => match (candidate.as_f64(), n.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            Operand::Value(v) => candidate == v,
        }
    }

    /// Ordering of `candidate` relative to this operand, when comparable.
    fn compare(&self, candidate: &Value) -> Option<Ordering> {
        match self {
            Operand::Id(id) => {
                let other = DocId::parse(candidate.as_str()?).ok()?;
                Some(other.cmp(id))
            }
            Operand::Date(date) => Some(parse_date(candidate.as_str()?)?.cmp(date)),
            Operand::Value(v) => compare_values(candidate, v),
        }
    }
}

/// Ordering between two JSON scalars of the same kind.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct RegexMatch {
    pub pattern: String,
    pub case_insensitive: bool,
    compiled: Regex,
}

impl RegexMatch {
    pub fn new(pattern: &str, case_insensitive: bool) -> Result<Self> {
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| DbError::validation("invalid_query_value", format!("Invalid pattern {}: {}", pattern, e)))?;
        Ok(Self {
            pattern: pattern.to_string(),
            case_insensitive,
            compiled,
        })
    }

    pub fn is_match(&self, value: &Value) -> bool {
        value.as_str().map_or(false, |s| self.compiled.is_match(s))
    }
}

impl PartialEq for RegexMatch {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.case_insensitive == other.case_insensitive
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(Operand),
    Ne(Operand),
    Gt(Operand),
    Gte(Operand),
    Lt(Operand),
    Lte(Operand),
    In(Vec<Operand>),
    Nin(Vec<Operand>),
    Regex(RegexMatch),
    ElemMatch(Box<Filter>),
    Exists(bool),
}

/// Store filter tree. A `Field` with an empty path targets the value under
/// test itself (used inside `ElemMatch` over scalar arrays).
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Field { path: String, conditions: Vec<Condition> },
}

impl Default for Filter {
    fn default() -> Self {
        Filter::All
    }
}

/// Values reachable at a path, with array fields also contributing their
/// elements.
fn candidates<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for &value in values {
        out.push(value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

impl Condition {
    fn matches(&self, values: &[&Value]) -> bool {
        let cands = candidates(values);
        match self {
            Condition::Eq(op) => (op.is_null() && values.is_empty()) || cands.iter().any(|c| op.equals(c)),
            Condition::Ne(op) => !Condition::Eq(op.clone()).matches(values),
            Condition::Gt(op) => cands.iter().any(|c| op.compare(c) == Some(Ordering::Greater)),
            Condition::Gte(op) => cands
                .iter()
                .any(|c| matches!(op.compare(c), Some(Ordering::Greater | Ordering::Equal))),
            Condition::Lt(op) => cands.iter().any(|c| op.compare(c) == Some(Ordering::Less)),
            Condition::Lte(op) => cands
                .iter()
                .any(|c| matches!(op.compare(c), Some(Ordering::Less | Ordering::Equal))),
            Condition::In(ops) => ops
                .iter()
                .any(|op| (op.is_null() && values.is_empty()) || cands.iter().any(|c| op.equals(c))),
            Condition::Nin(ops) => !Condition::In(ops.clone()).matches(values),
            Condition::Regex(re) => cands.iter().any(|c| re.is_match(c)),
            Condition::ElemMatch(filter) => values.iter().any(|v| match v {
                Value::Array(items) => items.iter().any(|item| filter.matches(item)),
                _ => false,
            }),
            Condition::Exists(expected) => !values.is_empty() == *expected,
        }
    }

    fn render(&self, out: &mut Map<String, Value>) {
        let list = |ops: &[Operand]| Value::Array(ops.iter().map(Operand::to_value).collect());
        let (key, value) = match self {
            Condition::Eq(op) => ("$eq", op.to_value()),
            Condition::Ne(op) => ("$ne", op.to_value()),
            Condition::Gt(op) => ("$gt", op.to_value()),
            Condition::Gte(op) => ("$gte", op.to_value()),
            Condition::Lt(op) => ("$lt", op.to_value()),
            Condition::Lte(op) => ("$lte", op.to_value()),
            Condition::In(ops) => ("$in", list(ops.as_slice())),
            Condition::Nin(ops) => ("$nin", list(ops.as_slice())),
            Condition::Regex(re) if re.case_insensitive => ("$rexi", Value::String(re.pattern.clone())),
            Condition::Regex(re) => ("$rex", Value::String(re.pattern.clone())),
            Condition::ElemMatch(filter) => ("$elemMatch", filter.to_query()),
            Condition::Exists(b) => ("$exists", Value::Bool(*b)),
        };
        out.insert(key.to_string(), value);
    }
}

impl Filter {
    pub fn field(path: impl Into<String>, condition: Condition) -> Self {
        Filter::Field {
            path: path.into(),
            conditions: vec![condition],
        }
    }

    pub fn id_eq(id: DocId) -> Self {
        Filter::field(ID_FIELD, Condition::Eq(Operand::Id(id)))
    }

    pub fn id_in(ids: &[DocId]) -> Self {
        Filter::field(ID_FIELD, Condition::In(ids.iter().copied().map(Operand::Id).collect()))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Filter::All)
    }

    /// Conjunction, collapsing `All` operands.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut list), Filter::And(more)) => {
                list.extend(more);
                Filter::And(list)
            }
            (Filter::And(mut list), f) => {
                list.push(f);
                Filter::And(list)
            }
            (f, g) => Filter::And(vec![f, g]),
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::And(list) => list.iter().all(|f| f.matches(doc)),
            Filter::Or(list) => list.iter().any(|f| f.matches(doc)),
            Filter::Field { path, conditions } => {
                let values = values_at(doc, path);
                conditions.iter().all(|c| c.matches(&values))
            }
        }
    }

    /// Render back to query-language JSON, e.g. for forwarding to a peer.
    pub fn to_query(&self) -> Value {
        match self {
            Filter::All => Value::Object(Map::new()),
            Filter::And(list) => {
                let mut out = Map::new();
                out.insert("$and".into(), Value::Array(list.iter().map(Filter::to_query).collect()));
                Value::Object(out)
            }
            Filter::Or(list) => {
                let mut out = Map::new();
                out.insert("$or".into(), Value::Array(list.iter().map(Filter::to_query).collect()));
                Value::Object(out)
            }
            Filter::Field { path, conditions } => {
                let mut ops = Map::new();
                for condition in conditions {
                    condition.render(&mut ops);
                }
                if path.is_empty() {
                    return Value::Object(ops);
                }
                let mut out = Map::new();
                out.insert(path.clone(), Value::Object(ops));
                Value::Object(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eq(path: &str, v: Value) -> Filter {
        Filter::field(path, Condition::Eq(Operand::Value(v)))
    }

    #[test]
    fn test_array_traversal_and_negation() {
        let doc = json!({"tags": ["a", "b"], "contacts": [{"name": "x"}, {"name": "y"}], "n": 5});
        assert!(eq("tags", json!("a")).matches(&doc));
        assert!(eq("tags", json!(["a", "b"])).matches(&doc));
        assert!(eq("contacts.name", json!("y")).matches(&doc));
        assert!(!Filter::field("tags", Condition::Ne(Operand::Value(json!("a")))).matches(&doc));
        assert!(Filter::field("missing", Condition::Ne(Operand::Value(json!(1)))).matches(&doc));
        assert!(eq("missing", Value::Null).matches(&doc));
        assert!(Filter::field("n", Condition::Gt(Operand::Value(json!(4.5)))).matches(&doc));
        assert!(!Filter::field("n", Condition::Lt(Operand::Value(json!("9")))).matches(&doc));
        assert!(Filter::field("missing", Condition::Exists(false)).matches(&doc));
    }

    #[test]
    fn test_id_and_date_operands() {
        let id = DocId::new();
        let doc = json!({"_id": id.to_string(), "at": "2024-05-01T10:00:00.000Z"});
        assert!(Filter::id_eq(id).matches(&doc));
        assert!(!Filter::id_eq(DocId::new()).matches(&doc));
        let date = parse_date("2024-04-01T00:00:00Z").unwrap();
        assert!(Filter::field("at", Condition::Gt(Operand::Date(date))).matches(&doc));
        assert!(Filter::id_in(&[DocId::new(), id]).matches(&doc));
    }

    #[test]
    fn test_elem_match_and_regex() {
        let doc = json!({"notes": [{"text": "Hello", "n": 1}, {"text": "bye", "n": 2}], "scores": [1, 8]});
        let inner = eq("text", json!("bye")).and(Filter::field("n", Condition::Eq(Operand::Value(json!(2)))));
        assert!(Filter::field("notes", Condition::ElemMatch(Box::new(inner))).matches(&doc));
        let cross = eq("text", json!("bye")).and(Filter::field("n", Condition::Eq(Operand::Value(json!(1)))));
        assert!(!Filter::field("notes", Condition::ElemMatch(Box::new(cross))).matches(&doc));
        let scalar = Filter::field("", Condition::Gt(Operand::Value(json!(5))));
        assert!(Filter::field("scores", Condition::ElemMatch(Box::new(scalar))).matches(&doc));

        let re = RegexMatch::new("^hel", true).unwrap();
        assert!(Filter::field("notes.text", Condition::Regex(re)).matches(&doc));
        assert!(RegexMatch::new("(", false).is_err());
    }

    #[test]
    fn test_and_collapses_and_renders() {
        let f = Filter::All.and(eq("a", json!(1))).and(eq("b", json!(2)));
        assert_eq!(f.to_query(), json!({"$and": [{"a": {"$eq": 1}}, {"b": {"$eq": 2}}]}));
        assert_eq!(Filter::All.to_query(), json!({}));
    }
}
