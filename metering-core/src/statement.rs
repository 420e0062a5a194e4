//! Structured statement construction.
//!
//! Caller-controlled values never become statement text: they are bound as
//! positional `?` arguments. Names that must appear as bare identifiers go
//! through [`Identifier`], which only admits `[A-Za-z0-9_]+`.

use std::fmt::{Display, Formatter};
use serde::Serialize;
use crate::error::{MeterError, Result};

/// A bound statement argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    String(String),
    Int(i64),
    Float(f64),
}

impl SqlValue {
    /// Renders the value as a ClickHouse literal.
    pub fn to_literal(&self) -> Result<String> {
        match self {
            SqlValue::String(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\\' => out.push_str("\\\\"),
                        '\'' => out.push_str("\\'"),
                        _ => out.push(c),
                    }
                }
                out.push('\'');
                Ok(out)
            }
            SqlValue::Int(i) => Ok(i.to_string()),
            SqlValue::Float(f) if f.is_finite() => Ok(f.to_string()),
            SqlValue::Float(f) => Err(MeterError::invalid_input(format!("non-finite numeric argument: {}", f))),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::String(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::String(value.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float(value)
    }
}

/// A name that is safe to place in statement text as-is.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Validates `name` against `^[A-Za-z0-9_]+$`.
    pub fn new(name: &str) -> Result<Self> {
        if Self::is_valid(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(MeterError::invalid_input(format!(
                "invalid column name: {:?}. Only alphanumeric characters and underscores are allowed",
                name
            )))
        }
    }

    /// Builds an identifier by replacing every character outside
    /// `[A-Za-z0-9_]` with `_`. Never fails.
    pub fn sanitized(name: &str) -> Self {
        let sanitized = sanitize(name);
        if sanitized.is_empty() {
            Self("_".to_string())
        } else {
            Self(sanitized)
        }
    }

    pub fn is_valid(name: &str) -> bool {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Backtick-quoted form, safe for names that start with a digit or
    /// collide with a keyword.
    pub fn quoted(&self) -> String {
        format!("`{}`", self.0)
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replaces every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Statement text with `?` placeholders and its positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self { sql: sql.into(), args }
    }

    /// Substitutes every placeholder outside of quoted literals with its
    /// argument rendered as an escaped literal, for transports that only
    /// accept plain statement text.
    pub fn render(&self) -> Result<String> {
        let mut out = String::with_capacity(self.sql.len() + self.args.len() * 8);
        let mut args = self.args.iter();
        let mut in_quote = false;
        let mut escaped = false;

        for c in self.sql.chars() {
            if in_quote {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '\'' {
                    in_quote = false;
                }
                continue;
            }
            match c {
                '\'' => {
                    in_quote = true;
                    out.push(c);
                }
                '?' => {
                    let arg = args.next().ok_or_else(|| {
                        MeterError::internal(format!(
                            "statement has more placeholders than its {} arguments",
                            self.args.len()
                        ))
                    })?;
                    out.push_str(&arg.to_literal()?);
                }
                _ => out.push(c),
            }
        }

        if args.next().is_some() {
            return Err(MeterError::internal(format!(
                "statement has fewer placeholders than its {} arguments",
                self.args.len()
            )));
        }
        Ok(out)
    }
}

/// Builds a `SELECT` whose expressions come from fixed templates and
/// validated identifiers, and whose values are always bound.
#[derive(Debug, Default)]
pub struct SelectBuilder {
    columns: Vec<String>,
    column_args: Vec<SqlValue>,
    from: String,
    conditions: Vec<String>,
    condition_args: Vec<SqlValue>,
    group_by: Vec<String>,
    having: Vec<String>,
    order_by: Vec<String>,
}

impl SelectBuilder {
    pub fn new(from: &Identifier) -> Self {
        Self {
            from: from.to_string(),
            ..Self::default()
        }
    }

    pub fn column(&mut self, expr: impl Into<String>) -> &mut Self {
        self.columns.push(expr.into());
        self
    }

    /// Adds a column expression whose placeholders bind `args` in order.
    pub fn column_with_args(&mut self, expr: impl Into<String>, args: Vec<SqlValue>) -> &mut Self {
        self.columns.push(expr.into());
        self.column_args.extend(args);
        self
    }

    /// Adds a condition; conditions are AND-combined.
    pub fn condition(&mut self, expr: impl Into<String>, args: Vec<SqlValue>) -> &mut Self {
        self.conditions.push(expr.into());
        self.condition_args.extend(args);
        self
    }

    /// Adds `column = ?` for a single value or an OR-group for several.
    pub fn any_of(&mut self, column: &Identifier, values: &[String]) -> &mut Self {
        match values {
            [] => self,
            [value] => self.condition(format!("{} = ?", column.quoted()), vec![value.into()]),
            _ => {
                let alternatives = vec![format!("{} = ?", column.quoted()); values.len()];
                let args = values.iter().map(SqlValue::from).collect();
                self.condition(format!("({})", alternatives.join(" OR ")), args)
            }
        }
    }

    pub fn group_by(&mut self, column: impl Into<String>) -> &mut Self {
        self.group_by.push(column.into());
        self
    }

    /// Adds a condition on aggregated rows; conditions are AND-combined.
    pub fn having(&mut self, expr: impl Into<String>) -> &mut Self {
        self.having.push(expr.into());
        self
    }

    pub fn order_by(&mut self, column: impl Into<String>) -> &mut Self {
        self.order_by.push(column.into());
        self
    }

    pub fn build(self) -> Statement {
        let mut sql = format!("SELECT {}\nFROM {}", self.columns.join(", "), self.from);
        if !self.conditions.is_empty() {
            sql.push_str(&format!("\nWHERE {}", self.conditions.join(" AND ")));
        }
        if !self.group_by.is_empty() {
            sql.push_str(&format!("\nGROUP BY {}", self.group_by.join(", ")));
        }
        if !self.having.is_empty() {
            sql.push_str(&format!("\nHAVING {}", self.having.join(" AND ")));
        }
        if !self.order_by.is_empty() {
            sql.push_str(&format!("\nORDER BY {}", self.order_by.join(", ")));
        }

        let mut args = self.column_args;
        args.extend(self.condition_args);
        Statement { sql, args }
    }
}
