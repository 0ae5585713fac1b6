//! Query language: typed AST, parser and per-record evaluation.
//!
//! A query is a JSON mapping from dotted field names to matchers. A matcher
//! is either a literal (equality, with list-contains implied for list-valued
//! fields) or a mapping of `$`-operators. Top-level keys are implicitly
//! AND-combined; `$and`, `$or` and `$not` compose sub-queries.
//!
//! Parsing validates the whole tree eagerly: unknown operators, bad operand
//! shapes and invalid `$regex` patterns are reported as [`QueryError`]s
//! before any record is touched. Operator mappings the engine does not
//! recognize are offered to the registered custom query handlers and, when
//! claimed, deferred to the post-filter pass.

use crate::error::{QueryError, Result};
use crate::handler::HandlerRegistry;
use core_store::{compare_values, values_eq, MetadataRecord};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// One `$`-operator applied to a field value.
#[derive(Debug, Clone)]
pub enum OpMatcher {
    Eq(Value),
    Ne(Value),
    Contains(Value),
    In(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Exists(bool),
    Regex(Regex),
}

/// Matcher attached to a single field.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Literal value: equality, with list-contains when the field value is a
    /// list and the operand is a scalar. A literal *list* operand requires
    /// whole-value equality.
    Literal(Value),
    /// Conjunction of operator terms.
    Ops(Vec<OpMatcher>),
}

/// One top-level clause of a query.
#[derive(Debug, Clone)]
pub enum Clause {
    Field { field: String, matcher: Matcher },
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
    /// Claimed by a registered custom handler; applied in the post-filter
    /// pass over the materialized candidate list.
    Custom { field: String, value: Value },
}

/// A parsed query: implicit AND over its clauses.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub clauses: Vec<Clause>,
}

/// Parse a JSON query tree, consulting `handlers` for operator mappings the
/// engine does not recognize.
pub fn parse_query(value: &Value, handlers: &HandlerRegistry) -> Result<Query> {
    let Value::Object(map) = value else {
        return Err(QueryError::Malformed(
            "query must be a JSON object".to_string(),
        ));
    };

    let mut clauses = Vec::new();
    for (key, value) in map {
        match key.as_str() {
            "$and" => clauses.push(Clause::And(parse_subqueries(key, value, handlers)?)),
            "$or" => clauses.push(Clause::Or(parse_subqueries(key, value, handlers)?)),
            "$not" => clauses.push(Clause::Not(Box::new(parse_query(value, handlers)?))),
            key if key.starts_with('$') => {
                return Err(QueryError::UnknownOperator(key.to_string()));
            }
            field => clauses.push(parse_field_clause(field, value, handlers)?),
        }
    }

    Ok(Query { clauses })
}

fn parse_subqueries(
    operator: &str,
    value: &Value,
    handlers: &HandlerRegistry,
) -> Result<Vec<Query>> {
    let Value::Array(items) = value else {
        return Err(QueryError::InvalidOperand {
            operator: operator.to_string(),
            message: "operand must be a list of sub-queries".to_string(),
        });
    };
    items
        .iter()
        .map(|item| parse_query(item, handlers))
        .collect()
}

fn parse_field_clause(field: &str, value: &Value, handlers: &HandlerRegistry) -> Result<Clause> {
    // A mapping whose keys all start with `$` is an operator term; any other
    // value (including mappings with plain keys) is a literal operand.
    let map = match value {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
        _ => {
            return Ok(Clause::Field {
                field: field.to_string(),
                matcher: Matcher::Literal(value.clone()),
            });
        }
    };

    let mut ops = Vec::with_capacity(map.len());
    for (op, operand) in map {
        match parse_operator(op, operand) {
            Ok(matcher) => ops.push(matcher),
            Err(err @ QueryError::UnknownOperator(_)) => {
                // Give registered custom handlers first refusal on operators
                // the engine does not know.
                if handlers.find(field, value).is_some() {
                    return Ok(Clause::Custom {
                        field: field.to_string(),
                        value: value.clone(),
                    });
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(Clause::Field {
        field: field.to_string(),
        matcher: Matcher::Ops(ops),
    })
}

fn parse_operator(op: &str, operand: &Value) -> Result<OpMatcher> {
    match op {
        "$eq" => Ok(OpMatcher::Eq(operand.clone())),
        "$ne" => Ok(OpMatcher::Ne(operand.clone())),
        "$contains" => Ok(OpMatcher::Contains(operand.clone())),
        "$in" => match operand {
            Value::Array(items) => Ok(OpMatcher::In(items.clone())),
            _ => Err(QueryError::InvalidOperand {
                operator: "$in".to_string(),
                message: "operand must be a list".to_string(),
            }),
        },
        "$gt" => Ok(OpMatcher::Gt(operand.clone())),
        "$gte" => Ok(OpMatcher::Gte(operand.clone())),
        "$lt" => Ok(OpMatcher::Lt(operand.clone())),
        "$lte" => Ok(OpMatcher::Lte(operand.clone())),
        "$exists" => match operand {
            Value::Bool(b) => Ok(OpMatcher::Exists(*b)),
            _ => Err(QueryError::InvalidOperand {
                operator: "$exists".to_string(),
                message: "operand must be a boolean".to_string(),
            }),
        },
        "$regex" => match operand {
            Value::String(pattern) => Regex::new(pattern)
                .map(OpMatcher::Regex)
                .map_err(|err| QueryError::InvalidRegex(err.to_string())),
            _ => Err(QueryError::InvalidOperand {
                operator: "$regex".to_string(),
                message: "operand must be a string pattern".to_string(),
            }),
        },
        other => Err(QueryError::UnknownOperator(other.to_string())),
    }
}

/// Evaluate a parsed query against one record. `Custom` clauses are treated
/// as satisfied here; they are applied separately over the candidate list.
pub fn eval_query(query: &Query, record: &MetadataRecord) -> bool {
    query.clauses.iter().all(|clause| match clause {
        Clause::Field { field, matcher } => eval_matcher(matcher, record.field(field).as_ref()),
        Clause::And(queries) => queries.iter().all(|q| eval_query(q, record)),
        Clause::Or(queries) => queries.iter().any(|q| eval_query(q, record)),
        Clause::Not(query) => !eval_query(query, record),
        Clause::Custom { .. } => true,
    })
}

fn eval_matcher(matcher: &Matcher, value: Option<&Value>) -> bool {
    match matcher {
        Matcher::Literal(operand) => value.is_some_and(|v| eval_eq(v, operand)),
        Matcher::Ops(ops) => ops.iter().all(|op| eval_op(op, value)),
    }
}

fn eval_op(op: &OpMatcher, value: Option<&Value>) -> bool {
    // A missing field fails every matcher except $exists.
    let Some(value) = value else {
        return matches!(op, OpMatcher::Exists(false));
    };

    match op {
        OpMatcher::Eq(operand) => eval_eq(value, operand),
        OpMatcher::Ne(operand) => !eval_eq(value, operand),
        OpMatcher::Contains(operand) => match (value, operand) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), operand) => items.iter().any(|item| values_eq(item, operand)),
            _ => false,
        },
        OpMatcher::In(operands) => match value {
            Value::Array(items) => items
                .iter()
                .any(|item| operands.iter().any(|op| values_eq(item, op))),
            scalar => operands.iter().any(|op| values_eq(scalar, op)),
        },
        OpMatcher::Gt(operand) => compare_values(value, operand) == Some(Ordering::Greater),
        OpMatcher::Gte(operand) => matches!(
            compare_values(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        OpMatcher::Lt(operand) => compare_values(value, operand) == Some(Ordering::Less),
        OpMatcher::Lte(operand) => matches!(
            compare_values(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        OpMatcher::Exists(expected) => *expected,
        OpMatcher::Regex(regex) => match value {
            Value::String(s) => regex.is_match(s),
            _ => false,
        },
    }
}

/// Equality with implied list-contains: a scalar operand matches a list
/// value element-wise; a list operand requires whole-value equality.
fn eval_eq(value: &Value, operand: &Value) -> bool {
    match (value, operand) {
        (Value::Array(_), Value::Array(_)) => values_eq(value, operand),
        (Value::Array(items), operand) => items.iter().any(|item| values_eq(item, operand)),
        _ => values_eq(value, operand),
    }
}
