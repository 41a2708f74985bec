//! LDAP 风格的属性过滤器，以及由“类型 + 过滤器”折叠而成的查询键。
//!
//! 语法：`(key=value)`、`(key=*)`、`(key=pre*suf)`、`(key>=v)`、`(key<=v)`、
//! `(&...)`、`(|...)`、`(!...)`；值中的 `\`、`(`、`)`、`*` 用反斜杠转义。
use std::{
    cmp::Ordering,
    fmt::{self, Write as _},
    hash::{Hash, Hasher},
};

use serde_json::Value;

use crate::{
    error::{RegistryError, Result},
    service::{type_key, Attributes, OBJECT_CLASS},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Equals { key: String, value: String },
    Present(String),
    /// `parts` 由未转义的 `*` 切分；首段为前缀，末段为后缀（空串表示不限）。
    Substring { key: String, parts: Vec<String> },
    GreaterEq { key: String, value: String },
    LessEq { key: String, value: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn parse(src: &str) -> Result<Filter> {
        let mut p = Parser {
            src,
            chars: src.chars().collect(),
            pos: 0,
        };
        p.skip_ws();
        let f = p.filter()?;
        p.skip_ws();
        if p.pos != p.chars.len() {
            return Err(p.error("trailing input"));
        }
        Ok(f)
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Filter {
        Filter::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn present(key: impl Into<String>) -> Filter {
        Filter::Present(key.into())
    }

    /// `(objectClass=<type name of T>)`
    pub fn for_type<T: ?Sized + 'static>() -> Filter {
        Filter::eq(OBJECT_CLASS, type_key::<T>())
    }

    pub fn and(self, other: Filter) -> Filter {
        Filter::And(vec![self, other]).normalize()
    }

    pub fn matches(&self, attrs: &Attributes) -> bool {
        match self {
            Filter::Equals { key, value } => candidates(attrs, key).any(|c| c == *value),
            Filter::Present(key) => attrs.contains_key(key),
            Filter::Substring { key, parts } => candidates(attrs, key).any(|c| glob(&c, parts)),
            Filter::GreaterEq { key, value } => {
                candidates(attrs, key).any(|c| compare(&c, value) != Ordering::Less)
            }
            Filter::LessEq { key, value } => {
                candidates(attrs, key).any(|c| compare(&c, value) != Ordering::Greater)
            }
            Filter::And(items) => items.iter().all(|f| f.matches(attrs)),
            Filter::Or(items) => items.iter().any(|f| f.matches(attrs)),
            Filter::Not(inner) => !inner.matches(attrs),
        }
    }

    /// Canonical form: nested `&`/`|` flattened, operands sorted by text, duplicates dropped,
    /// double negation removed. Semantically equal queries normalize to the same text.
    pub fn normalize(self) -> Filter {
        match self {
            Filter::And(items) => merge(items, true),
            Filter::Or(items) => merge(items, false),
            Filter::Not(inner) => match inner.normalize() {
                Filter::Not(x) => *x,
                other => Filter::Not(Box::new(other)),
            },
            leaf => leaf,
        }
    }
}

fn merge(items: Vec<Filter>, is_and: bool) -> Filter {
    let mut flat = Vec::with_capacity(items.len());
    for f in items {
        match f.normalize() {
            Filter::And(sub) if is_and => flat.extend(sub),
            Filter::Or(sub) if !is_and => flat.extend(sub),
            other => flat.push(other),
        }
    }
    let mut keyed: Vec<(String, Filter)> = flat.into_iter().map(|f| (f.to_string(), f)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    let mut out: Vec<Filter> = keyed.into_iter().map(|(_, f)| f).collect();
    if out.len() == 1 {
        return out.remove(0);
    }
    if is_and {
        Filter::And(out)
    } else {
        Filter::Or(out)
    }
}

// 数组属性逐元素比较；对象与 null 不参与匹配
fn candidates<'a>(attrs: &'a Attributes, key: &str) -> impl Iterator<Item = String> + 'a {
    let mut out = Vec::new();
    if let Some(v) = attrs.get(key) {
        flatten(v, &mut out);
    }
    out.into_iter()
}

fn flatten(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => items.iter().for_each(|i| flatten(i, out)),
        Value::Null | Value::Object(_) => {}
    }
}

fn compare(actual: &str, wanted: &str) -> Ordering {
    match (actual.parse::<f64>(), wanted.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(wanted),
    }
}

fn glob(text: &str, parts: &[String]) -> bool {
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return false;
    };
    if !text.starts_with(first.as_str()) {
        return false;
    }
    let mut rest = &text[first.len()..];
    let middle = &parts[1..parts.len().saturating_sub(1)];
    for part in middle {
        match rest.find(part.as_str()) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    parts.len() < 2 || rest.ends_with(last.as_str())
}

fn escape(out: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    for c in s.chars() {
        if matches!(c, '\\' | '(' | ')' | '*') {
            out.write_char('\\')?;
        }
        out.write_char(c)?;
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equals { key, value } => {
                write!(f, "({key}=")?;
                escape(f, value)?;
                f.write_char(')')
            }
            Filter::Present(key) => write!(f, "({key}=*)"),
            Filter::Substring { key, parts } => {
                write!(f, "({key}=")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_char('*')?;
                    }
                    escape(f, part)?;
                }
                f.write_char(')')
            }
            Filter::GreaterEq { key, value } => {
                write!(f, "({key}>=")?;
                escape(f, value)?;
                f.write_char(')')
            }
            Filter::LessEq { key, value } => {
                write!(f, "({key}<=")?;
                escape(f, value)?;
                f.write_char(')')
            }
            Filter::And(items) | Filter::Or(items) => {
                f.write_str(if matches!(self, Filter::And(_)) { "(&" } else { "(|" })?;
                for item in items {
                    write!(f, "{item}")?;
                }
                f.write_char(')')
            }
            Filter::Not(inner) => write!(f, "(!{inner})"),
        }
    }
}

impl std::str::FromStr for Filter {
    type Err = RegistryError;
    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

struct Parser<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &'static str) -> RegistryError {
        RegistryError::InvalidFilter {
            filter: self.src.to_string(),
            position: self.pos,
            reason,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else if c == '(' {
            Err(self.error("expected `(`"))
        } else {
            Err(self.error("expected `)`"))
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.expect('(')?;
        self.skip_ws();
        let f = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.operands()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.operands()?)
            }
            Some('!') => {
                self.pos += 1;
                self.skip_ws();
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.skip_ws();
        self.expect(')')?;
        Ok(f)
    }

    fn operands(&mut self) -> Result<Vec<Filter>> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some('(') {
                break;
            }
            items.push(self.filter()?);
        }
        if items.is_empty() {
            return Err(self.error("operator without operands"));
        }
        Ok(items)
    }

    fn item(&mut self) -> Result<Filter> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '<' | '>' | '~' | '(' | ')') {
                break;
            }
            self.pos += 1;
        }
        let key: String = self.chars[start..self.pos].iter().collect();
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(self.error("missing attribute name"));
        }
        let op = match self.peek() {
            Some('=') => '=',
            Some(c @ ('<' | '>')) => {
                self.pos += 1;
                if self.peek() != Some('=') {
                    return Err(self.error("expected `=` after comparison"));
                }
                c
            }
            Some('~') => return Err(self.error("approximate match is not supported")),
            _ => return Err(self.error("expected operator")),
        };
        self.pos += 1;
        let parts = self.value()?;
        match op {
            '=' if parts.len() == 2 && parts.iter().all(String::is_empty) => Ok(Filter::Present(key)),
            '=' if parts.len() == 1 => Ok(Filter::Equals {
                key,
                value: parts.into_iter().next().unwrap_or_default(),
            }),
            '=' => Ok(Filter::Substring { key, parts }),
            _ if parts.len() > 1 => Err(self.error("wildcard not allowed in comparison")),
            '>' => Ok(Filter::GreaterEq {
                key,
                value: parts.into_iter().next().unwrap_or_default(),
            }),
            _ => Ok(Filter::LessEq {
                key,
                value: parts.into_iter().next().unwrap_or_default(),
            }),
        }
    }

    fn value(&mut self) -> Result<Vec<String>> {
        let mut parts = vec![String::new()];
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated value")),
                Some(')') => break,
                Some('(') => return Err(self.error("unescaped `(` in value")),
                Some('\\') => {
                    self.pos += 1;
                    let Some(c) = self.peek() else {
                        return Err(self.error("dangling escape"));
                    };
                    if let Some(last) = parts.last_mut() {
                        last.push(c);
                    }
                    self.pos += 1;
                }
                Some('*') => {
                    parts.push(String::new());
                    self.pos += 1;
                }
                Some(c) => {
                    if let Some(last) = parts.last_mut() {
                        last.push(c);
                    }
                    self.pos += 1;
                }
            }
        }
        Ok(parts)
    }
}

/// Key of one ranked collection: an optional type constraint folded together with an optional
/// filter into a single normalized filter. Equality and hashing use the canonical text.
#[derive(Clone, Debug)]
pub struct QueryKey {
    filter: Option<Filter>,
    canonical: String,
}

impl QueryKey {
    pub fn new(type_name: Option<&str>, filter: Option<Filter>) -> Self {
        let folded = match (type_name, filter) {
            (Some(t), Some(f)) => Some(Filter::And(vec![Filter::eq(OBJECT_CLASS, t), f])),
            (Some(t), None) => Some(Filter::eq(OBJECT_CLASS, t)),
            (None, f) => f,
        };
        Self::from_filter(folded)
    }

    pub fn of<T: ?Sized + 'static>(filter: Option<Filter>) -> Self {
        Self::new(Some(type_key::<T>()), filter)
    }

    pub fn all() -> Self {
        Self::from_filter(None)
    }

    pub fn from_filter(filter: Option<Filter>) -> Self {
        let filter = filter.map(Filter::normalize);
        let canonical = filter
            .as_ref()
            .map_or_else(|| "*".to_string(), ToString::to_string);
        Self { filter, canonical }
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn matches(&self, attrs: &Attributes) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(attrs))
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}
impl Eq for QueryKey {}
impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}
