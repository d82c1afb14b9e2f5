//! Scene gating conditions.
//!
//! A [`Condition`] is an OR of AND-clauses. Each clause maps variable names to
//! the value they must hold:
//!
//! ```json
//! [{"env": "prod", "region": "eu"}, {"force": "true"}]
//! ```
//!
//! passes when (`env == prod` and `region == eu`) or `force == true`. A
//! variable missing from the var set fails its clause; it never errors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::types::Vars;

/// OR-of-ANDs boolean gate over named variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition(pub Vec<BTreeMap<String, String>>);

impl Condition {
    /// A condition from a list of clauses.
    pub fn new(clauses: Vec<BTreeMap<String, String>>) -> Self {
        Self(clauses)
    }

    /// Convenience constructor for a single clause.
    pub fn clause<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let clause = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self(vec![clause])
    }

    /// Returns true when there are no clauses.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluates the condition against `vars`.
    ///
    /// The result is the OR across all clauses, so an empty condition
    /// evaluates to `false`. Call sites that gate execution use [`permits`],
    /// which treats an empty condition as "no gate".
    ///
    /// [`permits`]: Condition::permits
    pub fn evaluate(&self, vars: &Vars) -> bool {
        self.0.iter().any(|clause| {
            clause
                .iter()
                .all(|(name, expected)| vars.get(name) == Some(expected.as_str()))
        })
    }

    /// Gate check: an empty condition lets execution proceed.
    pub fn permits(&self, vars: &Vars) -> bool {
        self.is_empty() || self.evaluate(vars)
    }

    /// Rejects clauses that can never be satisfied because they name no variable.
    pub fn validate(&self) -> Result<()> {
        for (i, clause) in self.0.iter().enumerate() {
            if clause.is_empty() {
                return Err(EngineError::config(format!("condition clause {} is empty", i)));
            }
            if clause.keys().any(|name| name.trim().is_empty()) {
                return Err(EngineError::config(format!(
                    "condition clause {} names an empty variable",
                    i
                )));
            }
        }
        Ok(())
    }
}
