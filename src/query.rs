//! Query-language translation.
//!
//! Turns the constrained query JSON accepted by the API into a typed
//! [`Filter`], coercing operands by the target field's schema type and
//! substituting `env.<name>` references from a caller-supplied environment.
//!
//! ```text
//! {"name": "x"}                         equality
//! {"count": {"$gt": 5}}                 ordered comparison
//! {"dueAt": {"$gtDate": "2024-01-01"}}  comparison coerced to date
//! {"id": {"$not": "<uuid>"}}            `id` rewritten to `_id`, coerced
//! {"$or": [{...}, {...}]}               boolean composition
//! ```

use serde_json::{Map, Value};

use crate::document::{parse_date, ID_FIELD};
use crate::error::{DbError, Result};
use crate::filter::{Condition, Filter, Operand, RegexMatch};
use crate::ids::DocId;
use crate::schema::{FlatNode, FlatSchema, LeafNode, PropertyType};

/// Variables visible to `env.<name>` operands.
pub type Env = Map<String, Value>;

const OPERATORS: &[&str] = &[
    "eq", "ne", "not", "gt", "gte", "lt", "lte", "in", "nin", "exists", "regex", "rex", "rexi",
    "inProp", "elMatch", "elemMatch", "gtDate", "gteDate", "ltDate", "lteDate",
];

fn invalid_operator(op: &str) -> DbError {
    DbError::validation("invalid_query_operator", format!("Unsupported query operator {}", op))
}

fn invalid_value(path: &str, operand: &Value) -> DbError {
    DbError::validation(
        "invalid_query_value",
        format!("Invalid value {} for {}", operand, path),
    )
}

/// Operator-object detection: every key is an operator, `$`-prefixed or bare.
fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map
            .keys()
            .all(|k| k.starts_with('$') || OPERATORS.contains(&k.as_str()))
}

/// Replace an `env.<name>` operand with its environment value. Unknown names
/// are left as the literal reference.
fn substitute(operand: &Value, env: &Env) -> Value {
    if let Some(name) = operand.as_str().and_then(|s| s.strip_prefix("env.")) {
        if let Some(value) = env.get(name) {
            return value.clone();
        }
    }
    operand.clone()
}

/// Schema node for a query path. Numeric segments (array positions) are
/// ignored for the lookup.
fn lookup<'a>(schema: &'a FlatSchema, path: &str) -> Option<&'a FlatNode> {
    schema.get(path).or_else(|| {
        let stripped: Vec<&str> = path
            .split('.')
            .filter(|seg| seg.parse::<usize>().is_err())
            .collect();
        schema.get(&stripped.join("."))
    })
}

#[derive(Clone, Copy)]
enum Coercion {
    None,
    Id,
    Date,
}

fn coercion_for(leaf: Option<&LeafNode>) -> Coercion {
    match leaf {
        Some(l) if l.holds_ids() => Coercion::Id,
        Some(l) if l.kind == PropertyType::Date || l.item_type == Some(PropertyType::Date) => Coercion::Date,
        _ => Coercion::None,
    }
}

fn coerce(path: &str, operand: &Value, coercion: Coercion) -> Result<Operand> {
    match (coercion, operand) {
        (Coercion::Id, Value::String(s)) => DocId::parse(s)
            .map(Operand::Id)
            .map_err(|_| invalid_value(path, operand)),
        (Coercion::Date, Value::String(s)) => parse_date(s)
            .or_else(|| {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| d.and_utc())
            })
            .map(Operand::Date)
            .ok_or_else(|| invalid_value(path, operand)),
        _ => Ok(Operand::Value(operand.clone())),
    }
}

fn coerce_list(path: &str, operand: &Value, coercion: Coercion) -> Result<Vec<Operand>> {
    match operand {
        Value::Array(items) => items.iter().map(|i| coerce(path, i, coercion)).collect(),
        other => Err(invalid_value(path, other)),
    }
}

fn pattern(path: &str, operand: &Value, case_insensitive: bool) -> Result<Condition> {
    let text = operand.as_str().ok_or_else(|| invalid_value(path, operand))?;
    Ok(Condition::Regex(RegexMatch::new(text, case_insensitive)?))
}

fn condition(
    path: &str,
    operator: &str,
    operand: &Value,
    node: Option<&FlatNode>,
    env: &Env,
) -> Result<Condition> {
    let operand = substitute(operand, env);
    let leaf = node.map(|n| &n.leaf);
    let coercion = coercion_for(leaf);
    let op = operator.strip_prefix('$').unwrap_or(operator);

    Ok(match op {
        "eq" => Condition::Eq(coerce(path, &operand, coercion)?),
        "ne" | "not" => Condition::Ne(coerce(path, &operand, coercion)?),
        "gt" => Condition::Gt(coerce(path, &operand, coercion)?),
        "gte" => Condition::Gte(coerce(path, &operand, coercion)?),
        "lt" => Condition::Lt(coerce(path, &operand, coercion)?),
        "lte" => Condition::Lte(coerce(path, &operand, coercion)?),
        "gtDate" => Condition::Gt(coerce(path, &operand, Coercion::Date)?),
        "gteDate" => Condition::Gte(coerce(path, &operand, Coercion::Date)?),
        "ltDate" => Condition::Lt(coerce(path, &operand, Coercion::Date)?),
        "lteDate" => Condition::Lte(coerce(path, &operand, Coercion::Date)?),
        "in" => Condition::In(coerce_list(path, &operand, coercion)?),
        "nin" => Condition::Nin(coerce_list(path, &operand, coercion)?),
        "exists" => match operand {
            Value::Bool(b) => Condition::Exists(b),
            other => return Err(invalid_value(path, &other)),
        },
        "rex" | "regex" | "inProp" => pattern(path, &operand, false)?,
        "rexi" => pattern(path, &operand, true)?,
        "elMatch" | "elemMatch" => Condition::ElemMatch(Box::new(elem_match(path, &operand, node, env)?)),
        _ => return Err(invalid_operator(operator)),
    })
}

/// Translate an `$elemMatch` payload. Arrays of objects are matched against
/// their element schema; arrays of scalars take an operator object that
/// applies to each element.
fn elem_match(path: &str, operand: &Value, node: Option<&FlatNode>, env: &Env) -> Result<Filter> {
    let map = operand.as_object().ok_or_else(|| invalid_value(path, operand))?;
    if let Some(sub_schema) = node.and_then(|n| n.sub_schema.as_ref()) {
        return parse_query(operand, env, sub_schema);
    }
    if is_operator_object(map) {
        let item = node.map(|n| {
            let mut leaf = n.leaf.clone();
            if let Some(item_type) = leaf.item_type {
                leaf.kind = item_type;
            }
            FlatNode { leaf, sub_schema: None }
        });
        let conditions = map
            .iter()
            .map(|(op, value)| condition(path, op, value, item.as_ref(), env))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Filter::Field {
            path: String::new(),
            conditions,
        });
    }
    parse_query(operand, env, &FlatSchema::default())
}

fn field_filter(property: &str, command: &Value, env: &Env, schema: &FlatSchema) -> Result<Filter> {
    let id_node;
    let (path, node) = if (property == "id" && !schema.contains("id")) || property == ID_FIELD {
        id_node = FlatNode {
            leaf: LeafNode::new(PropertyType::Id),
            sub_schema: None,
        };
        (ID_FIELD, Some(&id_node))
    } else {
        (property, lookup(schema, property))
    };

    let conditions = match command {
        Value::Object(map) if is_operator_object(map) => map
            .iter()
            .map(|(op, operand)| condition(path, op, operand, node, env))
            .collect::<Result<Vec<_>>>()?,
        literal => vec![condition(path, "$eq", literal, node, env)?],
    };

    Ok(Filter::Field {
        path: path.to_string(),
        conditions,
    })
}

fn compose(key: &str, command: &Value, env: &Env, schema: &FlatSchema) -> Result<Vec<Filter>> {
    match command {
        Value::Array(items) => items.iter().map(|q| parse_query(q, env, schema)).collect(),
        other => Err(DbError::validation(
            "invalid_query",
            format!("{} expects an array, got {}", key, other),
        )),
    }
}

/// Translate a query document into a store filter.
///
/// `env` provides `env.<name>` substitutions, `schema` the flattened schema
/// of the target collection (used for operand coercion).
pub fn parse_query(query: &Value, env: &Env, schema: &FlatSchema) -> Result<Filter> {
    let map = match query {
        Value::Null => return Ok(Filter::All),
        Value::Object(map) => map,
        other => {
            return Err(DbError::validation(
                "invalid_query",
                format!("Query must be an object, got {}", other),
            ))
        }
    };

    let mut filters = Vec::new();
    for (key, command) in map {
        match key.as_str() {
            "__crPath" => continue,
            "$or" => {
                let list = compose(key, command, env, schema)?;
                if !list.is_empty() {
                    filters.push(Filter::Or(list));
                }
            }
            "$and" => {
                let list = compose(key, command, env, schema)?;
                if !list.is_empty() {
                    filters.push(Filter::And(list));
                }
            }
            op if op.starts_with('$') => return Err(invalid_operator(op)),
            property => filters.push(field_filter(property, command, env, schema)?),
        }
    }

    Ok(match filters.len() {
        0 => Filter::All,
        1 => filters.remove(0),
        _ => Filter::And(filters),
    })
}
