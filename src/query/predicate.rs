// Filter predicates
// Simple (expression, operator, value) or composite (and / or / not), rendered either
// as a wire fragment or as a local closure.

use std::fmt;
use std::sync::Arc;

use crate::config::LocalQueryComparisonOptions;
use crate::core::data_value::{DataType, DataValue, PropertySource};
use crate::ent_framework::ent_schema::MetadataStore;
use crate::error::{AppError, AppResult};
use crate::query::fn_node::{FnNode, NodeKind};

pub type PredicateFn = Arc<dyn Fn(&dyn PropertySource) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
}

impl FilterOp {
    /// Accepts the wire names, symbolic aliases and common spellings.
    pub fn from_name(name: &str) -> AppResult<Self> {
        let op = match name.trim().to_lowercase().as_str() {
            "eq" | "==" | "equals" => FilterOp::Equals,
            "ne" | "!=" | "notequals" => FilterOp::NotEquals,
            "gt" | ">" | "greaterthan" => FilterOp::GreaterThan,
            "lt" | "<" | "lessthan" => FilterOp::LessThan,
            "ge" | ">=" | "greaterthanorequal" => FilterOp::GreaterThanOrEqual,
            "le" | "<=" | "lessthanorequal" => FilterOp::LessThanOrEqual,
            "substringof" | "contains" => FilterOp::Contains,
            "startswith" => FilterOp::StartsWith,
            "endswith" => FilterOp::EndsWith,
            other => {
                return Err(AppError::QueryParse(format!(
                    "unknown filter operator '{}'",
                    other
                )))
            }
        };
        Ok(op)
    }

    pub fn odata(&self) -> &'static str {
        match self {
            FilterOp::Equals => "eq",
            FilterOp::NotEquals => "ne",
            FilterOp::GreaterThan => "gt",
            FilterOp::LessThan => "lt",
            FilterOp::GreaterThanOrEqual => "ge",
            FilterOp::LessThanOrEqual => "le",
            FilterOp::Contains => "substringof",
            FilterOp::StartsWith => "startswith",
            FilterOp::EndsWith => "endswith",
        }
    }

    fn is_string_op(&self) -> bool {
        matches!(
            self,
            FilterOp::Contains | FilterOp::StartsWith | FilterOp::EndsWith
        )
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.odata())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOp {
    And,
    Or,
    Not,
}

impl BooleanOp {
    pub fn odata(&self) -> &'static str {
        match self {
            BooleanOp::And => "and",
            BooleanOp::Or => "or",
            BooleanOp::Not => "not",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Simple {
        expr: Arc<FnNode>,
        op: FilterOp,
        value: Arc<FnNode>,
    },
    Composite {
        op: BooleanOp,
        predicates: Vec<Predicate>,
    },
}

impl Predicate {
    /// `expr op literal`, e.g. `("Name", "startsWith", "Fo")`.
    pub fn create(expr: &str, op: &str, value: impl Into<DataValue>) -> AppResult<Self> {
        Ok(Predicate::Simple {
            expr: FnNode::parse(expr)?,
            op: FilterOp::from_name(op)?,
            value: Arc::new(FnNode::literal(value)),
        })
    }

    /// `expr op other_expr`, both sides parsed as expressions.
    pub fn compare(expr: &str, op: &str, other: &str) -> AppResult<Self> {
        Ok(Predicate::Simple {
            expr: FnNode::parse(expr)?,
            op: FilterOp::from_name(op)?,
            value: FnNode::parse(other)?,
        })
    }

    pub fn all(predicates: Vec<Predicate>) -> Self {
        Predicate::Composite {
            op: BooleanOp::And,
            predicates,
        }
    }

    pub fn any(predicates: Vec<Predicate>) -> Self {
        Predicate::Composite {
            op: BooleanOp::Or,
            predicates,
        }
    }

    pub fn and(&self, other: Predicate) -> Self {
        self.combine(BooleanOp::And, other)
    }

    pub fn or(&self, other: Predicate) -> Self {
        self.combine(BooleanOp::Or, other)
    }

    pub fn not(&self) -> Self {
        Predicate::Composite {
            op: BooleanOp::Not,
            predicates: vec![self.clone()],
        }
    }

    fn combine(&self, op: BooleanOp, other: Predicate) -> Self {
        let mut predicates = match self {
            Predicate::Composite {
                op: existing,
                predicates,
            } if *existing == op => predicates.clone(),
            _ => vec![self.clone()],
        };
        predicates.push(other);
        Predicate::Composite { op, predicates }
    }

    pub fn validate(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<()> {
        match self {
            Predicate::Simple { expr, op, value } => {
                let dt = expr.data_type(entity_type, metadata)?;
                value.validate(entity_type, metadata)?;
                if op.is_string_op() && dt != DataType::String {
                    return Err(AppError::QueryParse(format!(
                        "'{}' requires a string expression, got {}",
                        op, dt
                    )));
                }
                Ok(())
            }
            Predicate::Composite { op, predicates } => {
                if predicates.is_empty() {
                    return Err(AppError::QueryParse(format!(
                        "'{}' needs at least one predicate",
                        op.odata()
                    )));
                }
                if *op == BooleanOp::Not && predicates.len() != 1 {
                    return Err(AppError::QueryParse(
                        "'not' takes exactly one predicate".to_string(),
                    ));
                }
                predicates
                    .iter()
                    .try_for_each(|p| p.validate(entity_type, metadata))
            }
        }
    }

    pub fn to_odata_fragment(&self, entity_type: &str, metadata: &MetadataStore) -> AppResult<String> {
        self.validate(entity_type, metadata)?;
        match self {
            Predicate::Simple { expr, op, value } => {
                let lhs = expr.to_odata(entity_type, metadata)?;
                let rhs = match value.kind() {
                    NodeKind::Literal(v) => {
                        expr.data_type(entity_type, metadata)?.fmt_odata(v)?
                    }
                    _ => value.to_odata(entity_type, metadata)?,
                };
                Ok(match op {
                    FilterOp::Contains => format!("substringof({},{}) eq true", rhs, lhs),
                    FilterOp::StartsWith | FilterOp::EndsWith => {
                        format!("{}({},{}) eq true", op.odata(), lhs, rhs)
                    }
                    _ => format!("{} {} {}", lhs, op.odata(), rhs),
                })
            }
            Predicate::Composite { op, predicates } => {
                let parts = predicates
                    .iter()
                    .map(|p| p.to_odata_fragment(entity_type, metadata))
                    .collect::<AppResult<Vec<_>>>()?;
                Ok(match (op, parts.as_slice()) {
                    (BooleanOp::Not, [only]) => format!("not ({})", only),
                    (_, [only]) => only.clone(),
                    _ => format!("({})", parts.join(&format!(") {} (", op.odata()))),
                })
            }
        }
    }

    /// Local evaluator honoring the string comparison policy.
    pub fn to_function(
        &self,
        entity_type: &str,
        metadata: &MetadataStore,
        options: &LocalQueryComparisonOptions,
    ) -> AppResult<PredicateFn> {
        self.validate(entity_type, metadata)?;
        match self {
            Predicate::Simple { expr, op, value } => {
                let dt = expr.data_type(entity_type, metadata)?;
                let expr = expr.clone();
                let value = value.clone();
                let op = *op;
                let options = *options;
                let literal = match value.kind() {
                    NodeKind::Literal(v) => Some(dt.comparable(v.clone())),
                    _ => None,
                };
                Ok(Arc::new(move |source: &dyn PropertySource| {
                    let lhs = dt.comparable(expr.evaluate(source));
                    let rhs = match &literal {
                        Some(v) => v.clone(),
                        None => dt.comparable(value.evaluate(source)),
                    };
                    compare_values(op, lhs, rhs, &options)
                }))
            }
            Predicate::Composite { op, predicates } => {
                let fns = predicates
                    .iter()
                    .map(|p| p.to_function(entity_type, metadata, options))
                    .collect::<AppResult<Vec<_>>>()?;
                let op = *op;
                Ok(Arc::new(move |source: &dyn PropertySource| match op {
                    BooleanOp::And => fns.iter().all(|f| f(source)),
                    BooleanOp::Or => fns.iter().any(|f| f(source)),
                    BooleanOp::Not => !fns.iter().all(|f| f(source)),
                }))
            }
        }
    }
}

fn normalize_string(
    value: DataValue,
    op: FilterOp,
    options: &LocalQueryComparisonOptions,
) -> DataValue {
    match value {
        DataValue::String(s) => {
            let s = if options.is_case_sensitive {
                s
            } else {
                s.to_lowercase()
            };
            let trims = options.uses_sql92_compliant_string_comparison
                && matches!(op, FilterOp::Equals | FilterOp::NotEquals);
            DataValue::String(if trims { s.trim_end().to_string() } else { s })
        }
        other => other,
    }
}

fn compare_values(
    op: FilterOp,
    lhs: DataValue,
    rhs: DataValue,
    options: &LocalQueryComparisonOptions,
) -> bool {
    let lhs = normalize_string(lhs, op, options);
    let rhs = normalize_string(rhs, op, options);
    match op {
        FilterOp::Equals => lhs.loosely_equals(&rhs),
        FilterOp::NotEquals => !lhs.loosely_equals(&rhs),
        FilterOp::Contains | FilterOp::StartsWith | FilterOp::EndsWith => {
            match (lhs.as_str(), rhs.as_str()) {
                (Some(l), Some(r)) => match op {
                    FilterOp::Contains => l.contains(r),
                    FilterOp::StartsWith => l.starts_with(r),
                    _ => l.ends_with(r),
                },
                _ => false,
            }
        }
        _ => {
            if lhs.is_null() || rhs.is_null() {
                return false;
            }
            match lhs.compare(&rhs) {
                Some(ordering) => match op {
                    FilterOp::GreaterThan => ordering.is_gt(),
                    FilterOp::LessThan => ordering.is_lt(),
                    FilterOp::GreaterThanOrEqual => ordering.is_ge(),
                    _ => ordering.is_le(),
                },
                None => false,
            }
        }
    }
}
