// Expression nodes for filter, order-by and select clauses
// `toupper(substring(Name,0,3))` parses into a tree of literals, property paths and function calls.

use chrono::{Datelike, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::core::data_value::{DataType, DataValue, PropertySource};
use crate::ent_framework::ent_schema::MetadataStore;
use crate::error::{AppError, AppResult};
use crate::infrastructure::cache::Cache;

static PAREN_GROUP_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\([^()]*\)").expect("paren group pattern is valid"));
static STRING_LITERAL_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*""#).expect("string literal pattern is valid")
});
static IDENTIFIER_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-z_][\w.$/]*$").expect("identifier pattern is valid"));
static NUMBER_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?\d+(\.\d+)?([eE][+-]?\d+)?$").expect("number pattern is valid"));

static PARSE_CACHE: Lazy<Mutex<Cache<String, Arc<FnNode>>>> =
    Lazy::new(|| Mutex::new(Cache::new(256)));

/// Result type of every function the compiler knows.
fn function_result_type(name: &str) -> Option<DataType> {
    match name {
        "toupper" | "tolower" | "substring" | "trim" | "concat" | "replace" => {
            Some(DataType::String)
        }
        "substringof" | "startswith" | "endswith" => Some(DataType::Boolean),
        "length" | "indexof" | "round" | "ceiling" | "floor" | "second" | "minute" | "hour"
        | "day" | "month" | "year" => Some(DataType::Int32),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Literal(DataValue),
    /// Dotted property path.
    Property(String),
    Function { name: String, args: Vec<FnNode> },
}

/// Parsed nodes are shared across managers through the parse cache, so
/// they carry no metadata-dependent state.
#[derive(Debug, Clone, PartialEq)]
pub struct FnNode {
    kind: NodeKind,
}

impl FnNode {
    fn new(kind: NodeKind) -> Self {
        Self { kind }
    }

    pub fn literal(value: impl Into<DataValue>) -> Self {
        Self::new(NodeKind::Literal(value.into()))
    }

    pub fn property(path: &str) -> Self {
        Self::new(NodeKind::Property(path.replace('/', ".")))
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Parse through the shared expression cache.
    pub fn parse(source: &str) -> AppResult<Arc<FnNode>> {
        let key = source.trim().to_string();
        match PARSE_CACHE.lock() {
            Ok(mut cache) => {
                if let Some(node) = cache.get(&key) {
                    return Ok(node.clone());
                }
                let node = Arc::new(Self::parse_uncached(&key)?);
                cache.insert(key, node.clone());
                Ok(node)
            }
            Err(_) => {
                warn!("expression cache lock poisoned; parsing without cache");
                Ok(Arc::new(Self::parse_uncached(&key)?))
            }
        }
    }

    pub fn set_cache_capacity(capacity: usize) {
        if let Ok(mut cache) = PARSE_CACHE.lock() {
            cache.resize(capacity);
        }
    }

    /// Quoted strings become `@sN` placeholders and innermost parenthesised
    /// groups become `:N` tokens, repeatedly, before the tree is built.
    pub fn parse_uncached(source: &str) -> AppResult<FnNode> {
        let source = source.trim();
        if source.is_empty() {
            return Err(AppError::QueryParse("empty expression".to_string()));
        }
        let mut strings = Vec::new();
        let mut text = String::new();
        let mut last = 0;
        for m in STRING_LITERAL_RX.find_iter(source) {
            text.push_str(&source[last..m.start()]);
            let raw = m.as_str();
            let quote = &raw[..1];
            let inner = raw[1..raw.len() - 1].replace(&format!("{}{}", quote, quote), quote);
            text.push_str(&format!("@s{}", strings.len()));
            strings.push(inner);
            last = m.end();
        }
        text.push_str(&source[last..]);

        let mut groups: Vec<String> = Vec::new();
        while let Some(m) = PAREN_GROUP_RX.find(&text) {
            let group = m.as_str().to_string();
            let range = m.range();
            text.replace_range(range, &format!(":{}", groups.len()));
            groups.push(group);
        }
        if text.contains('(') || text.contains(')') {
            return Err(AppError::QueryParse(format!(
                "unbalanced parentheses in '{}'",
                source
            )));
        }
        Self::build(&text, &groups, &strings, source)
    }

    fn build(part: &str, groups: &[String], strings: &[String], source: &str) -> AppResult<FnNode> {
        let part = part.trim();
        if let Some((name, index)) = part.split_once(':') {
            let index: usize = index
                .trim()
                .parse()
                .map_err(|_| AppError::QueryParse(format!("malformed expression '{}'", source)))?;
            let group = groups
                .get(index)
                .ok_or_else(|| AppError::QueryParse(format!("malformed expression '{}'", source)))?;
            let inner = &group[1..group.len() - 1];
            let args = if inner.trim().is_empty() {
                Vec::new()
            } else {
                inner
                    .split(',')
                    .map(|arg| Self::build(arg, groups, strings, source))
                    .collect::<AppResult<Vec<_>>>()?
            };
            let name = name.trim().to_lowercase();
            if name.is_empty() {
                let mut args = args;
                return match (args.pop(), args.is_empty()) {
                    (Some(only), true) => Ok(only),
                    _ => Err(AppError::QueryParse(format!(
                        "unexpected argument list in '{}'",
                        source
                    ))),
                };
            }
            if function_result_type(&name).is_none() {
                return Err(AppError::QueryParse(format!(
                    "unknown function '{}' in '{}'",
                    name, source
                )));
            }
            return Ok(Self::new(NodeKind::Function { name, args }));
        }
        if let Some(index) = part.strip_prefix("@s") {
            if let Some(s) = index.parse::<usize>().ok().and_then(|i| strings.get(i)) {
                return Ok(Self::literal(s.clone()));
            }
        }
        if NUMBER_RX.is_match(part) {
            return Ok(match part.parse::<i64>() {
                Ok(i) => Self::literal(i),
                Err(_) => Self::literal(part.parse::<f64>().map_err(|_| {
                    AppError::QueryParse(format!("invalid number '{}'", part))
                })?),
            });
        }
        match part.to_lowercase().as_str() {
            "true" => return Ok(Self::literal(true)),
            "false" => return Ok(Self::literal(false)),
            "null" => return Ok(Self::new(NodeKind::Literal(DataValue::Null))),
            _ => {}
        }
        if IDENTIFIER_RX.is_match(part) {
            return Ok(Self::property(part));
        }
        Err(AppError::QueryParse(format!(
            "cannot parse '{}' in '{}'",
            part, source
        )))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, NodeKind::Literal(_))
    }

    /// Every property path the expression reads.
    pub fn property_paths(&self) -> Vec<String> {
        match &self.kind {
            NodeKind::Literal(_) => Vec::new(),
            NodeKind::Property(path) => vec![path.clone()],
            NodeKind::Function { args, .. } => args.iter().flat_map(|a| a.property_paths()).collect(),
        }
    }

    /// Resolve the node's data type against an entity type.
    /// Unresolvable property paths are errors.
    pub fn data_type(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<DataType> {
        let dt = match &self.kind {
            NodeKind::Literal(v) => DataType::from_value(v),
            NodeKind::Property(path) => {
                let resolved = metadata.resolve_property_path(entity_type, path)?;
                resolved.data_type.ok_or_else(|| {
                    AppError::QueryParse(format!(
                        "'{}' is a navigation property, not a data property",
                        path
                    ))
                })?
            }
            NodeKind::Function { name, args } => {
                for arg in args {
                    arg.data_type(entity_type, metadata)?;
                }
                function_result_type(name)
                    .ok_or_else(|| AppError::QueryParse(format!("unknown function '{}'", name)))?
            }
        };
        Ok(dt)
    }

    pub fn validate(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<()> {
        self.data_type(entity_type, metadata).map(|_| ())
    }

    /// Wire rendering: property paths use `/`, literals are typed.
    pub fn to_odata(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<String> {
        self.validate(entity_type, metadata)?;
        match &self.kind {
            NodeKind::Literal(v) => DataType::from_value(v).fmt_odata(v),
            NodeKind::Property(path) => Ok(path.replace('.', "/")),
            NodeKind::Function { name, args } => {
                let rendered = args
                    .iter()
                    .map(|a| a.to_odata(entity_type, metadata))
                    .collect::<AppResult<Vec<_>>>()?;
                Ok(format!("{}({})", name, rendered.join(",")))
            }
        }
    }

    /// Local evaluation; type mismatches and missing values yield `Null`.
    pub fn evaluate(&self, source: &dyn PropertySource) -> DataValue {
        match &self.kind {
            NodeKind::Literal(v) => v.clone(),
            NodeKind::Property(path) => source.value_at(path),
            NodeKind::Function { name, args } => {
                let values: Vec<DataValue> = args.iter().map(|a| a.evaluate(source)).collect();
                apply_function(name, &values)
            }
        }
    }
}

fn apply_function(name: &str, args: &[DataValue]) -> DataValue {
    let text = |i: usize| args.get(i).and_then(DataValue::as_str);
    let number = |i: usize| args.get(i).and_then(DataValue::as_f64);
    let date = |i: usize| match args.get(i) {
        Some(DataValue::DateTime(d)) => Some(*d),
        _ => None,
    };
    let result = match name {
        "toupper" => text(0).map(|s| DataValue::String(s.to_uppercase())),
        "tolower" => text(0).map(|s| DataValue::String(s.to_lowercase())),
        "trim" => text(0).map(|s| DataValue::String(s.trim().to_string())),
        "length" => text(0).map(|s| DataValue::Int(s.chars().count() as i64)),
        "substring" => text(0).map(|s| {
            let start = number(1).unwrap_or(0.0).max(0.0) as usize;
            let chars = s.chars().skip(start);
            DataValue::String(match number(2) {
                Some(len) => chars.take(len.max(0.0) as usize).collect(),
                None => chars.collect(),
            })
        }),
        "substringof" => match (text(0), text(1)) {
            (Some(find), Some(s)) => Some(DataValue::Bool(s.contains(find))),
            _ => None,
        },
        "startswith" => match (text(0), text(1)) {
            (Some(s), Some(prefix)) => Some(DataValue::Bool(s.starts_with(prefix))),
            _ => None,
        },
        "endswith" => match (text(0), text(1)) {
            (Some(s), Some(suffix)) => Some(DataValue::Bool(s.ends_with(suffix))),
            _ => None,
        },
        "indexof" => match (text(0), text(1)) {
            (Some(s), Some(find)) => Some(DataValue::Int(
                s.find(find)
                    .map(|byte_ix| s[..byte_ix].chars().count() as i64)
                    .unwrap_or(-1),
            )),
            _ => None,
        },
        "concat" => match (args.first(), args.get(1)) {
            (Some(a), Some(b)) if !a.is_null() && !b.is_null() => {
                Some(DataValue::String(format!("{}{}", a, b)))
            }
            _ => None,
        },
        "replace" => match (text(0), text(1), text(2)) {
            (Some(s), Some(find), Some(with)) => Some(DataValue::String(s.replace(find, with))),
            _ => None,
        },
        "round" => number(0).map(|n| DataValue::Int(n.round() as i64)),
        "ceiling" => number(0).map(|n| DataValue::Int(n.ceil() as i64)),
        "floor" => number(0).map(|n| DataValue::Int(n.floor() as i64)),
        "second" => date(0).map(|d| DataValue::Int(d.second() as i64)),
        "minute" => date(0).map(|d| DataValue::Int(d.minute() as i64)),
        "hour" => date(0).map(|d| DataValue::Int(d.hour() as i64)),
        "day" => date(0).map(|d| DataValue::Int(d.day() as i64)),
        "month" => date(0).map(|d| DataValue::Int(d.month() as i64)),
        "year" => date(0).map(|d| DataValue::Int(d.year() as i64)),
        _ => None,
    };
    result.unwrap_or(DataValue::Null)
}
