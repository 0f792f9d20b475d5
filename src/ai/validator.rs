//! Read-only guard for model-generated SQL.
//!
//! The check works on the parsed syntax tree: a statement is accepted only if
//! it is a single query and nothing inside it is a statement of another kind.
//! Keywords inside string literals therefore never matter.

use serde::Serialize;
use sqlparser::ast::{Query, SetExpr, Statement, Visit, Visitor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_safe: bool,
    pub reason: Option<String>,
    pub normalized_sql: Option<String>,
}

impl ValidationResult {
    fn safe(normalized_sql: String) -> Self {
        Self {
            is_safe: true,
            reason: None,
            normalized_sql: Some(normalized_sql),
        }
    }

    fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            reason: Some(reason.into()),
            normalized_sql: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlSafetyValidator;

impl SqlSafetyValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, sql: &str) -> ValidationResult {
        let sql = sql.trim();
        if sql.is_empty() {
            return ValidationResult::unsafe_because("Empty SQL");
        }

        let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
            Ok(statements) => statements,
            Err(e) => return ValidationResult::unsafe_because(format!("SQL parse error: {}", e)),
        };

        if statements.len() != 1 {
            return ValidationResult::unsafe_because(format!(
                "Expected 1 statement, got {}. Multiple statements are not allowed.",
                statements.len()
            ));
        }

        let statement = &statements[0];
        if !matches!(statement, Statement::Query(_)) {
            return ValidationResult::unsafe_because(format!(
                "Only SELECT queries are allowed, got: {}",
                statement_kind(statement)
            ));
        }

        let mut guard = ReadOnlyGuard;
        if let ControlFlow::Break(reason) = statement.visit(&mut guard) {
            return ValidationResult::unsafe_because(reason);
        }

        let normalized = statement.to_string();
        debug!("Validated SQL: {}", normalized);
        ValidationResult::safe(normalized)
    }
}

/// Walks every node below the root and stops at the first construct that
/// could write or lock.
struct ReadOnlyGuard;

impl Visitor for ReadOnlyGuard {
    type Break = String;

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        match statement {
            Statement::Query(_) => ControlFlow::Continue(()),
            other => ControlFlow::Break(format!(
                "Query contains forbidden operation: {}",
                statement_kind(other)
            )),
        }
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            return ControlFlow::Break("Query contains forbidden operation: row locking".to_string());
        }
        if selects_into(&query.body) {
            return ControlFlow::Break("Query contains forbidden operation: SELECT INTO".to_string());
        }
        ControlFlow::Continue(())
    }
}

fn selects_into(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::SetOperation { left, right, .. } => selects_into(left) || selects_into(right),
        // nested queries are visited on their own
        _ => false,
    }
}

// "Insert(Insert { .. })" -> "Insert", "Drop { .. }" -> "Drop"
fn statement_kind(statement: &Statement) -> String {
    let debug = format!("{:?}", statement);
    debug
        .split(|c: char| !c.is_alphanumeric())
        .next()
        .unwrap_or("Unknown")
        .to_string()
}
