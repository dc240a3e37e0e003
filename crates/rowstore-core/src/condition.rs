//! Search conditions and their evaluation
//!
//! A condition is either a simple comparison of one field against a bound, or
//! an AND/OR node over child conditions. Malformed conditions are rejected at
//! construction with `StoreError::Condition`.
//!
//! Text form, used by `parse` and `Display`:
//!
//! ```text
//! name EQ alice
//! AND(age GTE 18; OR(city EQ Oslo; city EQ Bergen))
//! nickname EQ null
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::value::{IndexKey, Row, Value};

/// Comparison of a simple condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimpleKind {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    Not,
}

impl SimpleKind {
    pub const ALL: [SimpleKind; 7] = [
        SimpleKind::Eq,
        SimpleKind::Lt,
        SimpleKind::Lte,
        SimpleKind::Gt,
        SimpleKind::Gte,
        SimpleKind::Like,
        SimpleKind::Not,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            SimpleKind::Eq => "EQ",
            SimpleKind::Lt => "LT",
            SimpleKind::Lte => "LTE",
            SimpleKind::Gt => "GT",
            SimpleKind::Gte => "GTE",
            SimpleKind::Like => "LIKE",
            SimpleKind::Not => "NOT",
        }
    }

    /// Kinds that accept a null bound.
    pub fn allows_null(&self) -> bool {
        matches!(self, SimpleKind::Eq | SimpleKind::Not)
    }
}

/// Combinator of a complex condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplexKind {
    And,
    Or,
}

impl ComplexKind {
    pub fn token(&self) -> &'static str {
        match self {
            ComplexKind::And => "AND",
            ComplexKind::Or => "OR",
        }
    }
}

/// `field <kind> value`; a `None` value is the null bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleCondition<K = Value> {
    kind: SimpleKind,
    field: String,
    value: Option<K>,
}

impl<K: IndexKey> SimpleCondition<K> {
    /// Validate and build a simple condition.
    pub fn new(kind: SimpleKind, field: impl Into<String>, value: Option<K>) -> StoreResult<Self> {
        let field = field.into();
        if field.trim().is_empty() {
            return Err(StoreError::Condition("empty field name".into()));
        }
        match &value {
            Some(bound) if kind == SimpleKind::Like && bound.as_text().is_none() => {
                return Err(StoreError::Condition(format!(
                    "incompatible types: LIKE needs a string value, got {:?} for field {}",
                    bound, field
                )));
            }
            None if !kind.allows_null() => {
                return Err(StoreError::Condition(format!(
                    "null values allowed only for EQ and NOT, field {}",
                    field
                )));
            }
            _ => {}
        }
        Ok(Self { kind, field, value })
    }

    pub fn kind(&self) -> SimpleKind {
        self.kind
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> Option<&K> {
        self.value.as_ref()
    }

    /// Same comparison against a bound of another key type.
    pub fn map_value<U: IndexKey>(&self, map: impl FnOnce(&K) -> U) -> StoreResult<SimpleCondition<U>> {
        SimpleCondition::new(self.kind, self.field.clone(), self.value.as_ref().map(map))
    }
}

/// AND/OR over a non-empty list of conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexCondition {
    kind: ComplexKind,
    conditions: Vec<Condition>,
}

impl ComplexCondition {
    pub fn new(kind: ComplexKind, conditions: Vec<Condition>) -> StoreResult<Self> {
        if conditions.is_empty() {
            return Err(StoreError::Condition(format!("{} condition without inner conditions", kind.token())));
        }
        Ok(Self { kind, conditions })
    }

    pub fn kind(&self) -> ComplexKind {
        self.kind
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

/// Condition tree over row values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Simple(SimpleCondition),
    Complex(ComplexCondition),
}

impl Condition {
    pub fn simple(kind: SimpleKind, field: impl Into<String>, value: impl Into<Value>) -> StoreResult<Self> {
        SimpleCondition::new(kind, field, Some(value.into())).map(Condition::Simple)
    }

    /// `field EQ null` or `field NOT null`.
    pub fn null(kind: SimpleKind, field: impl Into<String>) -> StoreResult<Self> {
        SimpleCondition::new(kind, field, None).map(Condition::Simple)
    }

    pub fn and(conditions: Vec<Condition>) -> StoreResult<Self> {
        ComplexCondition::new(ComplexKind::And, conditions).map(Condition::Complex)
    }

    pub fn or(conditions: Vec<Condition>) -> StoreResult<Self> {
        ComplexCondition::new(ComplexKind::Or, conditions).map(Condition::Complex)
    }

    /// Every field name the condition mentions.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Simple(simple) => out.push(simple.field()),
            Condition::Complex(complex) => {
                for inner in complex.conditions() {
                    inner.collect_fields(out);
                }
            }
        }
    }

    /// Parse the text form. Blank input means "no condition".
    ///
    /// `resolve(field, text)` converts a bound to a typed value; it is where
    /// unknown fields and badly typed bounds get rejected.
    pub fn parse<F>(input: &str, resolve: &F) -> StoreResult<Option<Condition>>
    where
        F: Fn(&str, &str) -> StoreResult<Value>,
    {
        let formatted: String = input.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        let formatted = formatted.trim();
        if formatted.is_empty() {
            return Ok(None);
        }
        parse_condition(formatted, resolve).map(Some)
    }
}

fn parse_condition<F>(input: &str, resolve: &F) -> StoreResult<Condition>
where
    F: Fn(&str, &str) -> StoreResult<Value>,
{
    if let Some(open) = input.find('(') {
        let head = input[..open].trim();
        let kind = if head.eq_ignore_ascii_case("AND") {
            Some(ComplexKind::And)
        } else if head.eq_ignore_ascii_case("OR") {
            Some(ComplexKind::Or)
        } else {
            None
        };
        if let Some(kind) = kind {
            let close = input
                .rfind(')')
                .filter(|close| *close > open)
                .ok_or_else(|| StoreError::Condition(format!("cannot find ) for {} condition: {}", kind.token(), input)))?;
            if !input[close + 1..].trim().is_empty() {
                return Err(StoreError::Condition(format!("unexpected text after ): {}", input)));
            }
            let mut conditions = Vec::new();
            for part in split_top_level(&input[open + 1..close])? {
                let part = part.trim();
                if part.is_empty() {
                    return Err(StoreError::Condition(format!("empty inner condition in {}", input)));
                }
                conditions.push(parse_condition(part, resolve)?);
            }
            return ComplexCondition::new(kind, conditions).map(Condition::Complex);
        }
    }
    parse_simple(input, resolve)
}

fn split_top_level(input: &str) -> StoreResult<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;
    for (i, ch) in input.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ';' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 {
            break;
        }
    }
    if depth != 0 {
        return Err(StoreError::Condition(format!("wrong brackets number for {}", input)));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_simple<F>(input: &str, resolve: &F) -> StoreResult<Condition>
where
    F: Fn(&str, &str) -> StoreResult<Value>,
{
    let padded = format!(" {} ", input);
    let mut sign: Option<(usize, SimpleKind)> = None;
    for kind in SimpleKind::ALL {
        let needle = format!(" {} ", kind.token());
        if let Some(pos) = padded.find(&needle) {
            if sign.map_or(true, |(best, _)| pos < best) {
                sign = Some((pos, kind));
            }
        }
    }
    let (pos, kind) = sign.ok_or_else(|| StoreError::Condition(format!("no comparison found in '{}'", input)))?;
    let field = padded[..pos].trim();
    let text = padded[pos + kind.token().len() + 2..].trim();
    let value = if text == "null" {
        None
    } else {
        if field.is_empty() {
            return Err(StoreError::Condition("empty field name".into()));
        }
        Some(resolve(field, text)?)
    };
    SimpleCondition::new(kind, field, value).map(Condition::Simple)
}

impl<K: fmt::Display> fmt::Display for SimpleCondition<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{} {} {}", self.field, self.kind.token(), value),
            None => write!(f, "{} {} null", self.field, self.kind.token()),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Simple(simple) => fmt::Display::fmt(simple, f),
            Condition::Complex(complex) => {
                write!(f, "{}(", complex.kind.token())?;
                for (i, inner) in complex.conditions.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}", inner)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Evaluates one simple condition against one (possibly null) value.
pub trait ConditionEvaluator<K>: Send + Sync {
    fn check(&self, value: Option<&K>, condition: &SimpleCondition<K>) -> bool;
}

/// Comparison semantics used by every keeper and by full scans.
///
/// Nulls: `null EQ null` and `x NOT null` hold, `null NOT x` holds, every
/// other comparison involving a null is false. LIKE is substring containment.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardEvaluator;

impl<K: IndexKey> ConditionEvaluator<K> for StandardEvaluator {
    fn check(&self, value: Option<&K>, condition: &SimpleCondition<K>) -> bool {
        let kind = condition.kind();
        let (value, bound) = match (value, condition.value()) {
            (None, None) => return kind == SimpleKind::Eq,
            (None, Some(_)) | (Some(_), None) => return kind == SimpleKind::Not,
            (Some(value), Some(bound)) => (value, bound),
        };
        match kind {
            SimpleKind::Like => match (value.as_text(), bound.as_text()) {
                (Some(value), Some(bound)) => value.contains(bound),
                _ => false,
            },
            SimpleKind::Eq => value == bound,
            SimpleKind::Not => value != bound,
            SimpleKind::Gt => value > bound,
            SimpleKind::Gte => value >= bound,
            SimpleKind::Lt => value < bound,
            SimpleKind::Lte => value <= bound,
        }
    }
}

impl StandardEvaluator {
    /// Full evaluation of a condition tree against a row.
    pub fn matches(&self, row: &Row, condition: &Condition) -> bool {
        match condition {
            Condition::Simple(simple) => self.check(row.get(simple.field()), simple),
            Condition::Complex(complex) => match complex.kind() {
                ComplexKind::And => complex.conditions().iter().all(|inner| self.matches(row, inner)),
                ComplexKind::Or => complex.conditions().iter().any(|inner| self.matches(row, inner)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(field: &str, text: &str) -> StoreResult<Value> {
        match field {
            "age" => text.parse::<i64>().map(Value::Int).map_err(|e| StoreError::field(field, e.to_string())),
            "name" | "city" => Ok(Value::from(text)),
            _ => Err(StoreError::field(field, "unknown field")),
        }
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(Condition::simple(SimpleKind::Eq, "  ", 1), Err(StoreError::Condition(_))));
        assert!(matches!(Condition::simple(SimpleKind::Like, "age", 1), Err(StoreError::Condition(_))));
        assert!(matches!(Condition::and(vec![]), Err(StoreError::Condition(_))));
        assert!(matches!(Condition::null(SimpleKind::Gt, "age"), Err(StoreError::Condition(_))));
        assert!(Condition::null(SimpleKind::Not, "age").is_ok());
        assert!(Condition::simple(SimpleKind::Like, "name", "a").is_ok());
    }

    #[test]
    fn test_null_semantics() {
        let eval = StandardEvaluator;
        let eq_null = SimpleCondition::<Value>::new(SimpleKind::Eq, "f", None).unwrap();
        let not_null = SimpleCondition::<Value>::new(SimpleKind::Not, "f", None).unwrap();
        let eq_one = SimpleCondition::new(SimpleKind::Eq, "f", Some(Value::Int(1))).unwrap();
        let not_one = SimpleCondition::new(SimpleKind::Not, "f", Some(Value::Int(1))).unwrap();
        let gt_one = SimpleCondition::new(SimpleKind::Gt, "f", Some(Value::Int(1))).unwrap();

        assert!(eval.check(None, &eq_null));
        assert!(!eval.check(None, &not_null));
        assert!(!eval.check(None, &eq_one));
        assert!(eval.check(None, &not_one));
        assert!(!eval.check(None, &gt_one));
        assert!(eval.check(Some(&Value::Int(5)), &not_null));
        assert!(!eval.check(Some(&Value::Int(5)), &eq_null));
    }

    #[test]
    fn test_comparisons_and_like() {
        let eval = StandardEvaluator;
        let check = |kind, value: Value, bound: Value| {
            eval.check(Some(&value), &SimpleCondition::new(kind, "f", Some(bound)).unwrap())
        };
        assert!(check(SimpleKind::Gte, Value::Int(3), Value::Int(3)));
        assert!(!check(SimpleKind::Gt, Value::Int(3), Value::Int(3)));
        assert!(check(SimpleKind::Lt, Value::Int(2), Value::Float(2.5)));
        assert!(check(SimpleKind::Like, "hello".into(), "ell".into()));
        assert!(!check(SimpleKind::Like, Value::Int(12), "1".into()));
        assert!(check(SimpleKind::Not, "a".into(), "b".into()));
    }

    #[test]
    fn test_row_matching() {
        let eval = StandardEvaluator;
        let row = Row::with_id(1).set("name", "ann").set("age", 30);
        let adult = Condition::simple(SimpleKind::Gte, "age", 18).unwrap();
        let bob = Condition::simple(SimpleKind::Eq, "name", "bob").unwrap();
        assert!(eval.matches(&row, &Condition::or(vec![adult.clone(), bob.clone()]).unwrap()));
        assert!(!eval.matches(&row, &Condition::and(vec![adult, bob]).unwrap()));
        assert!(eval.matches(&row, &Condition::null(SimpleKind::Eq, "city").unwrap()));
    }

    #[test]
    fn test_parse_simple_and_null() {
        let cond = Condition::parse("age GTE 18", &resolve).unwrap().unwrap();
        assert_eq!(cond, Condition::simple(SimpleKind::Gte, "age", 18).unwrap());

        let cond = Condition::parse("name EQ null", &resolve).unwrap().unwrap();
        assert_eq!(cond, Condition::null(SimpleKind::Eq, "name").unwrap());

        let cond = Condition::parse("name LIKE new york", &resolve).unwrap().unwrap();
        assert_eq!(cond, Condition::simple(SimpleKind::Like, "name", "new york").unwrap());

        assert_eq!(Condition::parse("  \r\n", &resolve).unwrap(), None);
    }

    #[test]
    fn test_parse_nested() {
        let text = "AND(age GT 18; OR(city EQ Oslo; city EQ Bergen))";
        let cond = Condition::parse(text, &resolve).unwrap().unwrap();
        let expected = Condition::and(vec![
            Condition::simple(SimpleKind::Gt, "age", 18).unwrap(),
            Condition::or(vec![
                Condition::simple(SimpleKind::Eq, "city", "Oslo").unwrap(),
                Condition::simple(SimpleKind::Eq, "city", "Bergen").unwrap(),
            ])
            .unwrap(),
        ])
        .unwrap();
        assert_eq!(cond, expected);
        assert_eq!(Condition::parse(&cond.to_string(), &resolve).unwrap().unwrap(), cond);
        assert_eq!(cond.fields(), vec!["age", "city", "city"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Condition::parse("AND(age GT 1; age LT 5", &resolve), Err(StoreError::Condition(_))));
        assert!(matches!(Condition::parse("OR(age GT 1;;age LT 5)", &resolve), Err(StoreError::Condition(_))));
        assert!(matches!(Condition::parse("age ~ 5", &resolve), Err(StoreError::Condition(_))));
        assert!(matches!(Condition::parse("height EQ 5", &resolve), Err(StoreError::Field { .. })));
        assert!(matches!(Condition::parse("age LIKE 5", &resolve), Err(StoreError::Condition(_))));
    }
}
