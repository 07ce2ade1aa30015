//! Metadata filters for vector search.
//!
//! A [`Filter`] is an equality predicate on one metadata field, or a
//! disjunction of filters. The SQLite vector index compiles filters into its
//! `WHERE` clause so that top-K is taken from the permitted rows only, never
//! trimmed after the fact.
//!
//! Identifier comparison uses canonical text: a filter on `"1"` matches a
//! stored `1` and vice versa. Booleans and floats compare by type.

use crate::error::RagError;
use crate::models::{keys, Metadata, MetadataValue};

const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: MetadataValue },
    Or(Vec<Filter>),
}

/// A positional SQL parameter produced by [`Filter::to_sql`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<MetadataValue>) -> Self {
        Filter::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Records that are the contact itself or belong to it.
    pub fn identity_scope(contact_id: &str) -> Self {
        Filter::or(vec![
            Filter::eq(keys::HS_OBJECT_ID, contact_id),
            Filter::eq(keys::ASSOCIATED_CONTACT_ID, contact_id),
        ])
    }

    /// Check field names and structure against the supported grammar:
    /// fields are `[A-Za-z_][A-Za-z0-9_]*`, disjunctions are non-empty and
    /// nest at most eight levels deep.
    pub fn validate(&self) -> Result<(), RagError> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<(), RagError> {
        if depth > MAX_DEPTH {
            return Err(RagError::InvalidFilter(format!(
                "nesting deeper than {} levels",
                MAX_DEPTH
            )));
        }
        match self {
            Filter::Eq { field, value } => {
                if !is_valid_field(field) {
                    return Err(RagError::InvalidFilter(format!(
                        "field name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                        field
                    )));
                }
                if let MetadataValue::Float(x) = value {
                    if !x.is_finite() {
                        return Err(RagError::InvalidFilter(format!(
                            "non-finite value for '{}'",
                            field
                        )));
                    }
                }
                Ok(())
            }
            Filter::Or(children) => {
                if children.is_empty() {
                    return Err(RagError::InvalidFilter("empty OR".to_string()));
                }
                children.iter().try_for_each(|c| c.validate_at(depth + 1))
            }
        }
    }

    /// Evaluate against in-memory metadata with the same semantics as the
    /// compiled SQL.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Filter::Eq { field, value } => metadata
                .get(field)
                .map(|stored| values_equal(stored, value))
                .unwrap_or(false),
            Filter::Or(children) => children.iter().any(|c| c.matches(metadata)),
        }
    }

    /// Compile into a boolean SQL expression over `column`, a JSON text
    /// column. Appends positional parameters to `params` in placeholder order.
    ///
    /// Field names reach SQLite only as bound JSON paths, never as SQL text.
    pub(crate) fn to_sql(&self, column: &str, params: &mut Vec<SqlParam>) -> String {
        match self {
            Filter::Eq { field, value } => {
                let path = format!("$.{}", field);
                let (types, extracted, param) = match value {
                    MetadataValue::Bool(b) => (
                        "'true', 'false'",
                        format!("json_extract({}, ?)", column),
                        SqlParam::Int(i64::from(*b)),
                    ),
                    MetadataValue::Float(x) => (
                        "'real'",
                        format!("json_extract({}, ?)", column),
                        SqlParam::Float(*x),
                    ),
                    MetadataValue::Int(_) | MetadataValue::Text(_) => (
                        "'text', 'integer'",
                        format!("CAST(json_extract({}, ?) AS TEXT)", column),
                        SqlParam::Text(value.key_text().unwrap_or_default()),
                    ),
                };
                params.push(SqlParam::Text(path.clone()));
                params.push(SqlParam::Text(path));
                params.push(param);
                format!(
                    "(json_type({}, ?) IN ({}) AND {} = ?)",
                    column, types, extracted
                )
            }
            Filter::Or(children) => {
                let parts: Vec<String> = children
                    .iter()
                    .map(|c| c.to_sql(column, params))
                    .collect();
                format!("({})", parts.join(" OR "))
            }
        }
    }
}

fn values_equal(stored: &MetadataValue, wanted: &MetadataValue) -> bool {
    match (stored, wanted) {
        (MetadataValue::Bool(a), MetadataValue::Bool(b)) => a == b,
        (MetadataValue::Float(a), MetadataValue::Float(b)) => a == b,
        (a, b) => match (a.key_text(), b.key_text()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn is_valid_field(field: &str) -> bool {
    let mut chars = field.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
