//! Condition and assignment expressions.
//!
//! A small expression language evaluated against the flow state:
//! literals, field paths (`score`, `state.user.name`, `items[0]`),
//! boolean logic, comparisons, membership, arithmetic and the `len()` /
//! `exists()` builtins. Evaluation is pure; nothing outside the state map
//! is reachable.

mod eval;
mod lexer;
mod parser;

use serde_json::{Map, Value};

use crewflow_core::error::ExprError;

pub use eval::is_truthy;
pub use parser::{BinaryOp, Expr, UnaryOp};

impl Expr {
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        parser::parse(src)
    }

    pub fn evaluate(&self, state: &Map<String, Value>) -> Result<Value, ExprError> {
        eval::evaluate(self, state)
    }

    pub fn evaluate_bool(&self, state: &Map<String, Value>) -> Result<bool, ExprError> {
        self.evaluate(state).map(|v| is_truthy(&v))
    }
}

/// Parse and evaluate `src` as a condition.
pub fn evaluate_condition(src: &str, state: &Map<String, Value>) -> Result<bool, ExprError> {
    Expr::parse(src)?.evaluate_bool(state)
}
