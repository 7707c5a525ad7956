//! Typed task parameters and their canonical serialization.
//!
//! The identity of a task instance is a pure function of its task name and
//! bound parameter values, never of call order or object identity. To make
//! that hold across runs, every parameter type has exactly one canonical
//! textual form, and parameter sets render as `name=value` pairs joined in
//! lexicographic name order.
//!
//! Canonical forms:
//! * string — verbatim, with `\` `,` `=` `[` `]` escaped by a backslash
//! * integer — base-10 with sign
//! * boolean — `true` / `false`
//! * date — ISO-8601 (`%Y-%m-%d`)
//! * list — `[item,item,...]` in the given order

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The declared type of a task parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Str,
    Int,
    Bool,
    Date,
    List,
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Date(NaiveDate),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Str(_) => ParamKind::Str,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Date(_) => ParamKind::Date,
            ParamValue::List(_) => ParamKind::List,
        }
    }

    pub(crate) fn canonical(&self, acc: &mut String) {
        match self {
            ParamValue::Str(text) => {
                for char in text.chars() {
                    if matches!(char, '\\' | ',' | '=' | '[' | ']') {
                        acc.push('\\');
                    }
                    acc.push(char);
                }
            }
            ParamValue::Int(int) => write!(acc, "{int}").unwrap(),
            ParamValue::Bool(bool) => acc.push_str(if *bool { "true" } else { "false" }),
            ParamValue::Date(date) => write!(acc, "{}", date.format("%Y-%m-%d")).unwrap(),
            ParamValue::List(items) => {
                acc.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        acc.push(',');
                    }
                    item.canonical(acc);
                }
                acc.push(']');
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value.into())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<NaiveDate> for ParamValue {
    fn from(value: NaiveDate) -> Self {
        ParamValue::Date(value)
    }
}

impl<T> From<Vec<T>> for ParamValue
where
    T: Into<ParamValue>,
{
    fn from(value: Vec<T>) -> Self {
        ParamValue::List(value.into_iter().map(Into::into).collect())
    }
}

/// Declaration of a single parameter on a task definition.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<ParamValue>,
}

/// An ordered mapping of parameter names to concrete values.
///
/// The map is kept sorted by name, which makes [`Params::canonical`] stable
/// regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a parameter, replacing any previous value under the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Chainable variant of [`Params::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Renders the canonical identity key of this parameter set.
    pub(crate) fn canonical(&self) -> String {
        let mut acc = String::new();

        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                acc.push(',');
            }
            acc.push_str(name);
            acc.push('=');
            value.canonical(&mut acc);
        }

        acc
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Params(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonical_sorted_by_name() {
        let a = Params::new().with("beta", 2).with("alpha", 1);
        let b = Params::new().with("alpha", 1).with("beta", 2);

        assert_eq!(a.canonical(), "alpha=1,beta=2");
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_canonical_date_iso() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 5).unwrap();
        let params = Params::new().with("since", date);

        assert_eq!(params.canonical(), "since=2020-01-05");
    }

    #[test]
    fn test_canonical_list_ordered() {
        let params = Params::new().with("symbols", vec!["msft", "aapl"]);

        assert_eq!(params.canonical(), "symbols=[msft,aapl]");
    }

    #[test]
    fn test_canonical_escapes_delimiters() {
        let tricky = Params::new().with("a", "1,b").with("b", "");
        let plain = Params::new().with("a", "1").with("b", "b");

        assert_eq!(tricky.canonical(), "a=1\\,b,b=");
        assert_ne!(tricky.canonical(), plain.canonical());
    }

    #[test]
    fn test_value_kind() {
        assert_eq!(ParamValue::from(true).kind(), ParamKind::Bool);
        assert_eq!(ParamValue::from(7i64).kind(), ParamKind::Int);
        assert_eq!(ParamValue::from("x").kind(), ParamKind::Str);
    }
}
