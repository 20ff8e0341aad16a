//! Host query predicates
//!
//! A query is a list of statements joined by `and`:
//!
//! ```text
//! hostname ~^ "web-" and tags.role = "frontend" and /free.Memory.Free < 1000
//! ```
//!
//! Supported fields are `hostname`, `tags.<key>` and metric paths (anything
//! else, typically starting with `/`). Hostnames accept `=`, `!=` and the
//! regex family `~` `~*` `!~` `!~*` plus prefix match `~^`. The prefix match
//! has no negated form: `!~^` is rejected, write `!~ ^prefix` instead. Tags
//! accept `=` and `!=`. Metric paths compare numerically with `= != > >= < <=`.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use super::error::{StorageError, StorageResult};
use crate::HostSnapshot;

static STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*([A-Za-z0-9_./\-]+)\s*(!~\*|!~\^|!~|~\*|~\^|~|>=|<=|!=|=|>|<)\s*(.+?)\s*$"#)
        .expect("statement pattern is a valid regex")
});

static AND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+and\s+").expect("conjunction pattern is a valid regex")
});

#[derive(Debug, Clone)]
enum Statement {
    HostnameEquals { value: String, negate: bool },
    HostnamePrefix(String),
    HostnameRegex { pattern: Regex, negate: bool },
    Tag { key: String, value: String, negate: bool },
    Metric { path: String, op: NumericOp, value: f64 },
}

#[derive(Debug, Clone, Copy)]
enum NumericOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl NumericOp {
    fn apply(self, observed: f64, expected: f64) -> bool {
        match self {
            NumericOp::Eq => observed == expected,
            NumericOp::Ne => observed != expected,
            NumericOp::Gt => observed > expected,
            NumericOp::Ge => observed >= expected,
            NumericOp::Lt => observed < expected,
            NumericOp::Le => observed <= expected,
        }
    }
}

/// Parsed host query. The empty query matches every host.
#[derive(Debug, Clone, Default)]
pub struct HostQuery {
    statements: Vec<Statement>,
}

impl HostQuery {
    pub fn parse(input: &str) -> StorageResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::default());
        }

        let statements = AND
            .split(input)
            .filter(|statement| !statement.trim().is_empty())
            .map(parse_statement)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Self { statements })
    }

    pub fn matches(&self, host: &HostSnapshot) -> bool {
        self.statements.iter().all(|statement| match statement {
            Statement::HostnameEquals { value, negate } => (host.hostname == *value) != *negate,
            Statement::HostnamePrefix(prefix) => host.hostname.starts_with(prefix.as_str()),
            Statement::HostnameRegex { pattern, negate } => pattern.is_match(&host.hostname) != *negate,
            Statement::Tag { key, value, negate } => {
                (host.tags.get(key).map(String::as_str) == Some(value.as_str())) != *negate
            }
            Statement::Metric { path, op, value } => host
                .metric(path)
                .is_some_and(|observed| op.apply(observed, *value)),
        })
    }
}

fn parse_statement(raw: &str) -> StorageResult<Statement> {
    let captures = STATEMENT
        .captures(raw)
        .ok_or_else(|| StorageError::InvalidQuery(format!("unrecognised statement {raw:?}")))?;

    let field = &captures[1];
    let operator = &captures[2];
    let value = strip_quotes(&captures[3]);

    if field.eq_ignore_ascii_case("hostname") {
        return match operator {
            "=" => Ok(Statement::HostnameEquals { value, negate: false }),
            "!=" => Ok(Statement::HostnameEquals { value, negate: true }),
            "~^" => Ok(Statement::HostnamePrefix(value)),
            "~" | "~*" | "!~" | "!~*" => {
                let pattern = RegexBuilder::new(&value)
                    .case_insensitive(operator.ends_with('*'))
                    .build()
                    .map_err(|e| StorageError::InvalidQuery(e.to_string()))?;
                Ok(Statement::HostnameRegex {
                    pattern,
                    negate: operator.starts_with('!'),
                })
            }
            other => Err(StorageError::InvalidQuery(format!(
                "operator {other} is not supported for hostname"
            ))),
        };
    }

    if let Some(key) = field
        .strip_prefix("tags.")
        .or_else(|| field.strip_prefix("Tags."))
    {
        return match operator {
            "=" | "!=" => Ok(Statement::Tag {
                key: key.to_string(),
                value,
                negate: operator == "!=",
            }),
            other => Err(StorageError::InvalidQuery(format!(
                "operator {other} is not supported for tags"
            ))),
        };
    }

    let op = match operator {
        "=" => NumericOp::Eq,
        "!=" => NumericOp::Ne,
        ">" => NumericOp::Gt,
        ">=" => NumericOp::Ge,
        "<" => NumericOp::Lt,
        "<=" => NumericOp::Le,
        other => {
            return Err(StorageError::InvalidQuery(format!(
                "operator {other} is not supported for metrics"
            )));
        }
    };
    let value = value
        .parse::<f64>()
        .map_err(|_| StorageError::InvalidQuery(format!("{value:?} is not a number")))?;

    Ok(Statement::Metric {
        path: field.to_string(),
        op,
        value,
    })
}

fn strip_quotes(value: &str) -> String {
    value.trim().trim_matches(|c| c == '"' || c == '\'').to_string()
}

/// Full-text match used by log searches: every whitespace separated term
/// must occur in `line`, ignoring case.
pub fn full_text_matches(line: &str, search: &str) -> bool {
    let line = line.to_lowercase();
    search
        .split_whitespace()
        .all(|term| line.contains(&term.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostSnapshot {
        HostSnapshot::new("web-01.example.com")
            .with_tag("role", "frontend")
            .with_metric("/free.Memory.Free", 512)
    }

    #[test]
    fn test_empty_query_matches_everything() {
        assert!(HostQuery::parse("  ").unwrap().matches(&host()));
    }

    #[test]
    fn test_hostname_operators() {
        let host = host();
        assert!(HostQuery::parse(r#"hostname = "web-01.example.com""#).unwrap().matches(&host));
        assert!(HostQuery::parse("hostname ~^ web-").unwrap().matches(&host));
        assert!(HostQuery::parse("hostname ~* WEB-\\d+").unwrap().matches(&host));
        assert!(!HostQuery::parse("hostname ~ WEB").unwrap().matches(&host));
        assert!(HostQuery::parse("hostname !~ ^db-").unwrap().matches(&host));
    }

    #[test]
    fn test_negated_prefix_is_rejected() {
        let err = HostQuery::parse("hostname !~^ web-").unwrap_err();
        assert!(err.to_string().contains("!~^"), "{err}");

        let query = HostQuery::parse("hostname !~ ^web-").unwrap();
        assert!(!query.matches(&host()));
        assert!(query.matches(&HostSnapshot::new("db-01")));
    }

    #[test]
    fn test_conjunction_of_tag_and_metric() {
        let host = host();
        let query = HostQuery::parse(r#"tags.role = "frontend" AND /free.Memory.Free < 1000"#).unwrap();
        assert!(query.matches(&host));

        let query = HostQuery::parse("tags.role = 'frontend' and /free.Memory.Free > 1000").unwrap();
        assert!(!query.matches(&host));
    }

    #[test]
    fn test_missing_metric_never_matches() {
        let query = HostQuery::parse("/load.1m >= 0").unwrap();
        assert!(!query.matches(&host()));
    }

    #[test]
    fn test_invalid_statements_are_rejected() {
        assert!(HostQuery::parse("hostname").is_err());
        assert!(HostQuery::parse("tags.role > 3").is_err());
        assert!(HostQuery::parse("/load.1m > high").is_err());
    }

    #[test]
    fn test_full_text_requires_every_term() {
        assert!(full_text_matches("ERROR: disk /dev/sda1 full", "error full"));
        assert!(!full_text_matches("ERROR: disk /dev/sda1 full", "error memory"));
    }
}
