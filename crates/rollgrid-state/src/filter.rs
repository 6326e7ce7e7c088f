//! Target filter language: a small RSQL/FIQL subset.
//!
//! ```text
//! updatestatus==pending;(attribute.region==eu*,name=in=(a,b))
//! ```
//!
//! `;` is AND and binds tighter than `,` (OR). Parentheses group. String
//! comparisons are case-insensitive and `*` is a wildcard for `==`/`!=`.
//! Numeric fields (`assignedds`, `installedds`, `createdat`) compare as
//! numbers.

use std::cmp::Ordering;
use std::collections::HashSet;

use regex::Regex;
use thiserror::Error;

use crate::types::{Target, TargetId};

/// Structured parse failure with the byte position it was detected at.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason} at position {position}")]
pub struct FilterError {
    pub position: usize,
    pub reason: FilterErrorReason,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterErrorReason {
    #[error("empty expression")]
    Empty,
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("unknown operator '{0}'")]
    BadOperator(String),
    #[error("unbalanced parenthesis")]
    Unbalanced,
    #[error("invalid value '{0}'")]
    BadValue(String),
    #[error("unexpected input '{0}'")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    ControllerId,
    Name,
    Description,
    UpdateStatus,
    AssignedDs,
    InstalledDs,
    CreatedAt,
    Attribute(String),
}

impl Field {
    fn parse(raw: &str) -> Option<Self> {
        let lower = raw.to_ascii_lowercase();
        let field = match lower.as_str() {
            "id" | "controllerid" => Field::ControllerId,
            "name" => Field::Name,
            "description" => Field::Description,
            "updatestatus" => Field::UpdateStatus,
            "assignedds" => Field::AssignedDs,
            "installedds" => Field::InstalledDs,
            "createdat" => Field::CreatedAt,
            _ => {
                let key = lower.strip_prefix("attribute.")?;
                if key.is_empty() {
                    return None;
                }
                // Attribute keys keep their original case.
                Field::Attribute(raw["attribute.".len()..].to_string())
            }
        };
        Some(field)
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Field::AssignedDs | Field::InstalledDs | Field::CreatedAt
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Out,
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Wildcard(Regex),
    Number(u64),
}

impl Value {
    fn parse(field: &Field, raw: &str, allow_wildcard: bool) -> Result<Self, FilterErrorReason> {
        if field.is_numeric() {
            return raw
                .parse::<u64>()
                .map(Value::Number)
                .map_err(|_| FilterErrorReason::BadValue(raw.to_string()));
        }
        if allow_wildcard && raw.contains('*') {
            let pattern = raw
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let regex = Regex::new(&format!("(?i)^{pattern}$"))
                .map_err(|_| FilterErrorReason::BadValue(raw.to_string()))?;
            return Ok(Value::Wildcard(regex));
        }
        Ok(Value::Text(raw.to_lowercase()))
    }

    fn matches(&self, actual: &FieldValue) -> bool {
        self.compare(actual) == Some(Ordering::Equal)
    }

    /// Ordering of the actual value against this one; `None` when they are
    /// not comparable (missing value, wildcard used for ordering).
    fn compare(&self, actual: &FieldValue) -> Option<Ordering> {
        match (self, actual) {
            (Value::Number(expected), FieldValue::Number(Some(n))) => Some(n.cmp(expected)),
            (Value::Text(expected), FieldValue::Text(Some(s))) => {
                Some(s.to_lowercase().as_str().cmp(expected.as_str()))
            }
            (Value::Wildcard(regex), FieldValue::Text(Some(s))) => {
                regex.is_match(s).then_some(Ordering::Equal)
            }
            _ => None,
        }
    }
}

enum FieldValue<'a> {
    Text(Option<&'a str>),
    Number(Option<u64>),
}

fn field_value<'a>(target: &'a Target, field: &Field) -> FieldValue<'a> {
    match field {
        Field::ControllerId => FieldValue::Text(Some(&target.controller_id)),
        Field::Name => FieldValue::Text(Some(&target.name)),
        Field::Description => FieldValue::Text(Some(&target.description)),
        Field::UpdateStatus => FieldValue::Text(Some(target.update_status.as_str())),
        Field::AssignedDs => FieldValue::Number(target.assigned_ds),
        Field::InstalledDs => FieldValue::Number(target.installed_ds),
        Field::CreatedAt => FieldValue::Number(Some(target.audit.created_at)),
        Field::Attribute(key) => FieldValue::Text(target.attributes.get(key).map(String::as_str)),
    }
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Compare {
        field: Field,
        op: Op,
        values: Vec<Value>,
    },
}

impl Node {
    fn matches(&self, target: &Target) -> bool {
        match self {
            Node::And(nodes) => nodes.iter().all(|n| n.matches(target)),
            Node::Or(nodes) => nodes.iter().any(|n| n.matches(target)),
            Node::Compare { field, op, values } => {
                let actual = field_value(target, field);
                match op {
                    Op::Eq => values[0].matches(&actual),
                    Op::Ne => !values[0].matches(&actual),
                    Op::In => values.iter().any(|v| v.matches(&actual)),
                    Op::Out => !values.iter().any(|v| v.matches(&actual)),
                    Op::Lt => values[0].compare(&actual) == Some(Ordering::Less),
                    Op::Le => matches!(
                        values[0].compare(&actual),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    Op::Gt => values[0].compare(&actual) == Some(Ordering::Greater),
                    Op::Ge => matches!(
                        values[0].compare(&actual),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                }
            }
        }
    }
}

/// A parsed target filter expression.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    source: String,
    root: Node,
}

impl TargetFilter {
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let mut parser = Parser { input, pos: 0 };
        parser.skip_ws();
        if parser.at_end() {
            return Err(parser.error(FilterErrorReason::Empty));
        }
        let root = parser.parse_or()?;
        parser.skip_ws();
        if !parser.at_end() {
            let rest = &input[parser.pos..];
            let reason = if rest.starts_with(')') {
                FilterErrorReason::Unbalanced
            } else {
                FilterErrorReason::Unexpected(rest.to_string())
            };
            return Err(parser.error(reason));
        }
        Ok(Self {
            source: input.to_string(),
            root,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, target: &Target) -> bool {
        self.root.matches(target)
    }
}

/// A side-effect-free target selection.
#[derive(Debug, Clone, Copy)]
pub struct TargetQuery<'a> {
    pub filter: &'a TargetFilter,
    /// Additional filter every selected target has to match as well.
    pub narrow: Option<&'a TargetFilter>,
    /// Targets that are never returned, e.g. already claimed ones.
    pub exclude: Option<&'a HashSet<TargetId>>,
    /// Only targets created at or before this time.
    pub created_until: Option<u64>,
}

impl<'a> TargetQuery<'a> {
    pub fn new(filter: &'a TargetFilter) -> Self {
        Self {
            filter,
            narrow: None,
            exclude: None,
            created_until: None,
        }
    }

    pub fn narrowed_by(mut self, narrow: Option<&'a TargetFilter>) -> Self {
        self.narrow = narrow;
        self
    }

    pub fn excluding(mut self, exclude: &'a HashSet<TargetId>) -> Self {
        self.exclude = Some(exclude);
        self
    }

    pub fn created_until(mut self, until: u64) -> Self {
        self.created_until = Some(until);
        self
    }

    pub fn accepts(&self, target: &Target) -> bool {
        if target.deleted {
            return false;
        }
        if let Some(until) = self.created_until
            && target.audit.created_at > until
        {
            return false;
        }
        if let Some(exclude) = self.exclude
            && exclude.contains(&target.controller_id)
        {
            return false;
        }
        self.filter.matches(target) && self.narrow.is_none_or(|n| n.matches(target))
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: FilterErrorReason) -> FilterError {
        FilterError {
            position: self.pos,
            reason,
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Node, FilterError> {
        let mut nodes = vec![self.parse_and()?];
        while self.eat(',') {
            nodes.push(self.parse_and()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            Node::Or(nodes)
        })
    }

    fn parse_and(&mut self) -> Result<Node, FilterError> {
        let mut nodes = vec![self.parse_term()?];
        while self.eat(';') {
            nodes.push(self.parse_term()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            Node::And(nodes)
        })
    }

    fn parse_term(&mut self) -> Result<Node, FilterError> {
        self.skip_ws();
        if self.eat('(') {
            let node = self.parse_or()?;
            if !self.eat(')') {
                return Err(self.error(FilterErrorReason::Unbalanced));
            }
            return Ok(node);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, FilterError> {
        self.skip_ws();
        let start = self.pos;
        let name_len = self
            .rest()
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'))
            .unwrap_or(self.rest().len());
        if name_len == 0 {
            let reason = match self.peek() {
                None => FilterErrorReason::Empty,
                Some(')') => FilterErrorReason::Unbalanced,
                Some(_) => FilterErrorReason::Unexpected(self.rest().to_string()),
            };
            return Err(self.error(reason));
        }
        let raw_field = &self.input[start..start + name_len];
        let field = Field::parse(raw_field).ok_or(FilterError {
            position: start,
            reason: FilterErrorReason::UnknownField(raw_field.to_string()),
        })?;
        self.pos += name_len;
        self.skip_ws();

        let op = self.parse_operator()?;
        self.skip_ws();

        let value_start = self.pos;
        let raw_values = if matches!(op, Op::In | Op::Out) {
            if !self.eat('(') {
                return Err(self.error(FilterErrorReason::Unexpected(self.rest().to_string())));
            }
            let mut values = vec![self.parse_value()?];
            while self.eat(',') {
                values.push(self.parse_value()?);
            }
            if !self.eat(')') {
                return Err(self.error(FilterErrorReason::Unbalanced));
            }
            values
        } else {
            vec![self.parse_value()?]
        };

        let allow_wildcard = matches!(op, Op::Eq | Op::Ne | Op::In | Op::Out);
        let values = raw_values
            .iter()
            .map(|raw| Value::parse(&field, raw, allow_wildcard))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| FilterError {
                position: value_start,
                reason,
            })?;
        Ok(Node::Compare { field, op, values })
    }

    fn parse_operator(&mut self) -> Result<Op, FilterError> {
        const OPERATORS: [(&str, Op); 8] = [
            ("==", Op::Eq),
            ("!=", Op::Ne),
            ("=lt=", Op::Lt),
            ("=le=", Op::Le),
            ("=gt=", Op::Gt),
            ("=ge=", Op::Ge),
            ("=in=", Op::In),
            ("=out=", Op::Out),
        ];
        let rest = self.rest();
        for (token, op) in OPERATORS {
            if rest
                .as_bytes()
                .get(..token.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(token.as_bytes()))
            {
                self.pos += token.len();
                return Ok(op);
            }
        }
        let shown: String = rest.chars().take(5).collect();
        Err(self.error(FilterErrorReason::BadOperator(shown)))
    }

    fn parse_value(&mut self) -> Result<String, FilterError> {
        self.skip_ws();
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                let body_start = self.pos + 1;
                let Some(len) = self.input[body_start..].find(quote) else {
                    return Err(self.error(FilterErrorReason::BadValue(self.rest().to_string())));
                };
                self.pos = body_start + len + 1;
                Ok(self.input[body_start..body_start + len].to_string())
            }
            _ => {
                let len = self
                    .rest()
                    .find(|c: char| matches!(c, ';' | ',' | '(' | ')' | '"' | '\'') || c.is_whitespace())
                    .unwrap_or(self.rest().len());
                if len == 0 {
                    return Err(self.error(FilterErrorReason::BadValue(String::new())));
                }
                let value = self.rest()[..len].to_string();
                self.pos += len;
                Ok(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, status: crate::types::UpdateStatus) -> Target {
        let mut t = Target::new(id, "test", 100);
        t.update_status = status;
        t
    }

    #[test]
    fn equality_is_case_insensitive() {
        let filter = TargetFilter::parse("name==Device-1").unwrap();
        let t = Target::new("device-1", "test", 0);
        assert!(filter.matches(&t));
        assert!(!filter.matches(&Target::new("device-2", "test", 0)));
    }

    #[test]
    fn wildcard_matches_prefix() {
        let filter = TargetFilter::parse("id==edge-*").unwrap();
        assert!(filter.matches(&Target::new("EDGE-17", "test", 0)));
        assert!(!filter.matches(&Target::new("core-1", "test", 0)));

        let negated = TargetFilter::parse("id!=edge-*").unwrap();
        assert!(negated.matches(&Target::new("core-1", "test", 0)));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        use crate::types::UpdateStatus;
        // a;b,c == (a;b),c
        let filter = TargetFilter::parse("id==x;updatestatus==error,id==y").unwrap();
        assert!(filter.matches(&target("y", UpdateStatus::Registered)));
        assert!(filter.matches(&target("x", UpdateStatus::Error)));
        assert!(!filter.matches(&target("x", UpdateStatus::Registered)));

        let grouped = TargetFilter::parse("id==x;(updatestatus==error,id==y)").unwrap();
        assert!(!grouped.matches(&target("y", UpdateStatus::Registered)));
    }

    #[test]
    fn in_and_out_lists() {
        let filter = TargetFilter::parse("attribute.region=in=(eu, 'us-east')").unwrap();
        let eu = Target::new("a", "test", 0).with_attribute("region", "EU");
        let us = Target::new("b", "test", 0).with_attribute("region", "us-east");
        let ap = Target::new("c", "test", 0).with_attribute("region", "ap");
        let none = Target::new("d", "test", 0);
        assert!(filter.matches(&eu));
        assert!(filter.matches(&us));
        assert!(!filter.matches(&ap));
        assert!(!filter.matches(&none));

        let out = TargetFilter::parse("attribute.region=out=(eu)").unwrap();
        assert!(out.matches(&ap));
        assert!(out.matches(&none));
    }

    #[test]
    fn numeric_comparisons() {
        let filter = TargetFilter::parse("createdat=le=100;installedds=gt=2").unwrap();
        let mut t = Target::new("a", "test", 100);
        t.installed_ds = Some(3);
        assert!(filter.matches(&t));
        t.installed_ds = Some(2);
        assert!(!filter.matches(&t));
        t.installed_ds = None;
        assert!(!filter.matches(&t));
    }

    #[test]
    fn quoted_values_keep_reserved_characters() {
        let filter = TargetFilter::parse("description==\"rack 4; shelf (b)\"").unwrap();
        let mut t = Target::new("a", "test", 0);
        t.description = "Rack 4; Shelf (B)".to_string();
        assert!(filter.matches(&t));
    }

    #[test]
    fn errors_carry_position_and_reason() {
        let err = TargetFilter::parse("").unwrap_err();
        assert_eq!(err.reason, FilterErrorReason::Empty);

        let err = TargetFilter::parse("name==a;colour==red").unwrap_err();
        assert_eq!(err.position, 8);
        assert_eq!(err.reason, FilterErrorReason::UnknownField("colour".into()));

        let err = TargetFilter::parse("name=~a").unwrap_err();
        assert!(matches!(err.reason, FilterErrorReason::BadOperator(_)));

        let err = TargetFilter::parse("(name==a").unwrap_err();
        assert_eq!(err.reason, FilterErrorReason::Unbalanced);

        let err = TargetFilter::parse("name==a)").unwrap_err();
        assert_eq!(err.reason, FilterErrorReason::Unbalanced);

        let err = TargetFilter::parse("assignedds==abc").unwrap_err();
        assert_eq!(err.reason, FilterErrorReason::BadValue("abc".into()));
    }

    #[test]
    fn query_applies_exclusion_cutoff_and_soft_delete() {
        let filter = TargetFilter::parse("id==*").unwrap();
        let mut claimed = HashSet::new();
        claimed.insert("a".to_string());
        let query = TargetQuery::new(&filter)
            .excluding(&claimed)
            .created_until(50);

        assert!(!query.accepts(&Target::new("a", "test", 10)));
        assert!(query.accepts(&Target::new("b", "test", 50)));
        assert!(!query.accepts(&Target::new("c", "test", 51)));

        let mut deleted = Target::new("d", "test", 10);
        deleted.deleted = true;
        assert!(!query.accepts(&deleted));
    }

    #[test]
    fn narrowing_filter_must_match_too() {
        let base = TargetFilter::parse("id==*").unwrap();
        let narrow = TargetFilter::parse("attribute.tier==gold").unwrap();
        let query = TargetQuery::new(&base).narrowed_by(Some(&narrow));
        assert!(query.accepts(&Target::new("a", "test", 0).with_attribute("tier", "gold")));
        assert!(!query.accepts(&Target::new("b", "test", 0)));
    }

    #[test]
    fn non_ascii_input_is_a_parse_error() {
        for input in ["name日x", "name=日=x", "名前==x", "id==dev;日"] {
            assert!(TargetFilter::parse(input).is_err(), "{input}");
        }
        let err = TargetFilter::parse("name日x").unwrap_err();
        assert_eq!(err.position, 4);
        assert!(matches!(err.reason, FilterErrorReason::BadOperator(ref shown) if shown == "日x"));

        let filter = TargetFilter::parse("name==日本-*").unwrap();
        assert!(filter.matches(&Target::new("日本-01", "test", 0)));
    }
}
