//! Engine-independent query vocabulary.
//!
//! Every type here is an immutable description. Nothing in this module talks
//! to a store: a [`Dialect`] renders the description for one backend, and the
//! backend executes the rendering.

mod json;
mod pseudo;

pub use json::JsonDialect;
pub use pseudo::PseudoDialect;

use serde_json::{Map, Value};

/// Name of the identity field every document carries.
pub const ID_FIELD: &str = "_id";

/// Predicate over a document (or over an array element, inside `ElemMatch`).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// True iff at least one element of the array field satisfies the inner filter.
    /// Field names inside the inner filter are relative to the element.
    ElemMatch(String, Box<Filter>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::All
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    pub fn elem_match(array_field: impl Into<String>, element: Filter) -> Self {
        Filter::ElemMatch(array_field.into(), Box::new(element))
    }

    /// Rewrite every field reference as `prefix.field`.
    ///
    /// Used once an array has been flattened and its element lives under the
    /// array's own field name.
    pub fn prefixed(&self, prefix: &str) -> Filter {
        let join = |field: &str| format!("{prefix}.{field}");
        match self {
            Filter::All => Filter::All,
            Filter::Eq(f, v) => Filter::Eq(join(f), v.clone()),
            Filter::Ne(f, v) => Filter::Ne(join(f), v.clone()),
            Filter::Lt(f, v) => Filter::Lt(join(f), v.clone()),
            Filter::Lte(f, v) => Filter::Lte(join(f), v.clone()),
            Filter::Gt(f, v) => Filter::Gt(join(f), v.clone()),
            Filter::Gte(f, v) => Filter::Gte(join(f), v.clone()),
            Filter::And(fs) => Filter::And(fs.iter().map(|f| f.prefixed(prefix)).collect()),
            Filter::Or(fs) => Filter::Or(fs.iter().map(|f| f.prefixed(prefix)).collect()),
            Filter::Not(f) => Filter::Not(Box::new(f.prefixed(prefix))),
            Filter::ElemMatch(f, inner) => Filter::ElemMatch(join(f), inner.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub direction: Direction,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }

    pub fn prefixed(&self, prefix: &str) -> Sort {
        Sort {
            field: format!("{prefix}.{}", self.field),
            direction: self.direction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Identity plus one named field.
    Field(String),
    /// Identity only.
    IdOnly,
}

impl Projection {
    pub fn field(name: impl Into<String>) -> Self {
        Projection::Field(name.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Set(String, Value),
    /// Set every top-level field of the given document.
    SetDocument(Map<String, Value>),
    /// Append a value to an array field, creating the array if missing.
    Push(String, Value),
}

impl Update {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Update::Set(field.into(), value.into())
    }

    pub fn set_document(document: Map<String, Value>) -> Self {
        Update::SetDocument(document)
    }

    pub fn push(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Update::Push(field.into(), value.into())
    }

    /// Unpack a push into its `(field, value)` pair.
    pub fn as_push(&self) -> Option<(&str, &Value)> {
        match self {
            Update::Push(field, value) => Some((field.as_str(), value)),
            _ => None,
        }
    }
}

/// One step of an aggregation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// One row per (document, element of `array`), the element replacing the array.
    Flatten { array: String },
    Filter(Filter),
    Sort(Sort),
    Limit(u64),
    /// Group rows by identity, keeping the first row as a snapshot and
    /// collecting `array` back from the surviving rows in order.
    Regroup { array: String },
    /// Overlay the rebuilt `array` onto the snapshot, yielding one document per parent.
    Merge { array: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Flatten `array_field` across all documents, keep elements matching
    /// `element_filter`, order them, keep at most `limit` elements in total
    /// (zero or `None` keeps all), and regroup the survivors per parent.
    ///
    /// Regrouping loses the order between parents, so when a sort is given
    /// it is applied a second time to the regrouped documents.
    pub fn array_flatten_filter_limit(
        array_field: &str,
        element_filter: &Filter,
        limit: Option<u64>,
        sort: Option<&Sort>,
    ) -> Self {
        let array = array_field.to_string();
        let mut stages = vec![
            Stage::Flatten { array: array.clone() },
            Stage::Filter(element_filter.prefixed(array_field)),
        ];
        if let Some(sort) = sort {
            stages.push(Stage::Sort(sort.prefixed(array_field)));
        }
        if let Some(n) = limit.filter(|n| *n > 0) {
            stages.push(Stage::Limit(n));
        }
        stages.push(Stage::Regroup { array: array.clone() });
        stages.push(Stage::Merge { array });
        if let Some(sort) = sort {
            stages.push(Stage::Sort(sort.prefixed(array_field)));
        }
        Self { stages }
    }
}

/// Renders the algebra for one backend.
pub trait Dialect {
    type Filter;
    type Sort;
    type Projection;
    type Update;
    type Pipeline;

    fn render_filter(&self, filter: &Filter) -> Self::Filter;
    fn render_sort(&self, sort: &Sort) -> Self::Sort;
    fn render_projection(&self, projection: &Projection) -> Self::Projection;
    fn render_update(&self, update: &Update) -> Self::Update;
    fn render_pipeline(&self, pipeline: &Pipeline) -> Self::Pipeline;
}
