// Flow conditions - guards on sequence flows leaving diverging gateways

//! # Flow Conditions
//!
//! A [`FlowCondition`] decides whether a sequence flow may be followed. It is
//! evaluated when the flow's source is a diverging exclusive, inclusive or
//! complex gateway, against the variables of the running instance.
//!
//! ## Rust Learning Notes:
//!
//! ### Tagged Union with Serde
//! `#[serde(tag = "type")]` gives flat JSON objects with a discriminator:
//! `{"type": "VarGreaterThan", "name": "x", "value": 3.0}`.
//!
//! ### Box for Recursion
//! `Not` holds a `Box<FlowCondition>`; without the box the enum would have
//! infinite size. `And`/`Or` hold a `Vec`, which is already heap allocated.
//!
//! ### Trait Seam for Variable Lookup
//! Conditions are model data and must not depend on the engine. They read
//! variables through the small [`VariableSource`] trait, which the engine's
//! variable store implements.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::expression::{compare_values, Expression};
use super::variable::Value;
use crate::{Result, ThresherError};

/// Read access to instance variables
pub trait VariableSource {
    /// Current value of `name`, or `None` when the variable does not exist
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl VariableSource for std::collections::HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Guard attached to a sequence flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowCondition {
    /// The variable exists, whatever its value
    VarExists { name: String },

    /// The variable equals a literal after coercion
    ///
    /// Example: `{"type": "VarEquals", "name": "status", "value": "open"}`
    VarEquals { name: String, value: serde_json::Value },

    /// Numeric comparison against a threshold
    VarGreaterThan { name: String, value: f64 },

    VarLessThan { name: String, value: f64 },

    /// Case-sensitive substring match on the string form
    VarContains { name: String, substring: String },

    /// All nested conditions hold; empty is true
    And { conditions: Vec<FlowCondition> },

    /// At least one nested condition holds; empty is false
    Or { conditions: Vec<FlowCondition> },

    Not { condition: Box<FlowCondition> },

    /// Expression source such as `x > 3 && status == "open"`
    Expression { source: String },
}

impl FlowCondition {
    /// Shorthand for an expression condition
    pub fn expr<S: Into<String>>(source: S) -> Self {
        FlowCondition::Expression {
            source: source.into(),
        }
    }

    /// Parse expression sources so malformed conditions fail at model time
    pub fn validate(&self) -> Result<()> {
        match self {
            FlowCondition::Expression { source } => Expression::parse(source).map(|_| ()),
            FlowCondition::And { conditions } | FlowCondition::Or { conditions } => {
                conditions.iter().try_for_each(|c| c.validate())
            }
            FlowCondition::Not { condition } => condition.validate(),
            _ => Ok(()),
        }
    }

    /// Evaluate against the instance variables
    ///
    /// Any variable the condition needs but cannot find is an error, except
    /// for `VarExists` which reports absence as `false`.
    pub fn evaluate<S: VariableSource + ?Sized>(&self, vars: &S) -> Result<bool> {
        let fetch = |name: &str| {
            vars.lookup(name)
                .ok_or_else(|| ThresherError::VariableNotFound(name.to_string()))
        };

        match self {
            FlowCondition::VarExists { name } => Ok(vars.lookup(name).is_some()),
            FlowCondition::VarEquals { name, value } => {
                let expected = json_to_value(value)?;
                let ord = compare_values(&fetch(name)?, &expected)?;
                Ok(ord == Some(Ordering::Equal))
            }
            FlowCondition::VarGreaterThan { name, value } => {
                Ok(fetch(name)?.as_float()? > *value)
            }
            FlowCondition::VarLessThan { name, value } => Ok(fetch(name)?.as_float()? < *value),
            FlowCondition::VarContains { name, substring } => {
                let v = fetch(name)?;
                Ok(v.as_string(super::variable::DEFAULT_PRECISION).contains(substring.as_str()))
            }
            FlowCondition::And { conditions } => {
                for c in conditions {
                    if !c.evaluate(vars)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FlowCondition::Or { conditions } => {
                for c in conditions {
                    if c.evaluate(vars)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FlowCondition::Not { condition } => Ok(!condition.evaluate(vars)?),
            FlowCondition::Expression { source } => Expression::parse(source)?.evaluate(&fetch),
        }
    }
}

impl std::fmt::Display for FlowCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowCondition::VarExists { name } => write!(f, "exists({})", name),
            FlowCondition::VarEquals { name, value } => write!(f, "{} == {}", name, value),
            FlowCondition::VarGreaterThan { name, value } => write!(f, "{} > {}", name, value),
            FlowCondition::VarLessThan { name, value } => write!(f, "{} < {}", name, value),
            FlowCondition::VarContains { name, substring } => {
                write!(f, "{} contains {:?}", name, substring)
            }
            FlowCondition::And { conditions } => write!(f, "and[{}]", conditions.len()),
            FlowCondition::Or { conditions } => write!(f, "or[{}]", conditions.len()),
            FlowCondition::Not { condition } => write!(f, "not({})", condition),
            FlowCondition::Expression { source } => write!(f, "{}", source),
        }
    }
}

fn json_to_value(v: &serde_json::Value) -> Result<Value> {
    match v {
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Int(i)),
            None => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| ThresherError::Message(format!("unsupported number {}", n))),
        },
        other => Err(ThresherError::Message(format!(
            "condition literal must be a scalar, got {}",
            other
        ))),
    }
}
