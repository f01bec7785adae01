//! Chained filters over the top-level entries of a store.
//!
//! A [`Query`] is a plain value: every chaining call returns a new builder and
//! nothing is recorded on the store until a terminal call (`show`, `items`,
//! `to_json`) takes a snapshot and runs the filters against it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::engine::persistence;
use crate::engine::store::Arkivist;
use crate::{Document, Result};

/// Whether a filter keeps or drops the entries it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Match,
    Exclude,
}

/// A single predicate applied to every entry of the working set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, rename = "op")]
    pub operation: Operation,
    #[serde(default)]
    pub keyword: Value,
    /// Equality only. When false, text, sequences and mappings are searched
    /// for the keyword instead.
    #[serde(default)]
    pub exact: bool,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_case_sensitive() -> bool {
    true
}

impl Filter {
    /// A filter keeping entries that contain `keyword`.
    pub fn matching(keyword: impl Into<Value>) -> Self {
        Self {
            operation: Operation::Match,
            keyword: keyword.into(),
            exact: false,
            case_sensitive: true,
        }
    }

    /// A filter dropping entries that contain `keyword`.
    pub fn excluding(keyword: impl Into<Value>) -> Self {
        Self { operation: Operation::Exclude, ..Self::matching(keyword) }
    }

    /// Compares for equality instead of containment.
    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    /// When false, text is compared case-insensitively.
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Evaluates the filter against an extracted value. `None` stands for an
    /// absent child and compares like `null`.
    pub fn evaluate(&self, value: Option<&Value>) -> bool {
        let value = value.unwrap_or(&Value::Null);

        let folded;
        let (keyword, value) = match (&self.keyword, value) {
            (Value::String(k), Value::String(v)) if !self.case_sensitive => {
                folded = (Value::String(k.to_lowercase()), Value::String(v.to_lowercase()));
                (&folded.0, &folded.1)
            }
            _ => (&self.keyword, value),
        };

        let mut found = loose_eq(keyword, value);
        if !self.exact {
            match value {
                Value::String(text) => {
                    found = keyword.as_str().map_or(false, |k| text.contains(k));
                }
                Value::Array(items) => {
                    found = items.iter().any(|item| loose_eq(keyword, item));
                }
                Value::Object(map) => {
                    found = keyword.as_str().map_or(false, |k| map.contains_key(k));
                }
                _ => {}
            }
        }

        match self.operation {
            Operation::Match => found,
            Operation::Exclude => !found,
        }
    }
}

/// JSON equality where numbers compare by value, so `1 == 1.0`.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_f64() || y.is_f64() => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| loose_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, a)| y.get(k).map_or(false, |b| loose_eq(a, b)))
        }
        _ => a == b,
    }
}

#[derive(Debug, Clone)]
struct Step {
    child: Option<String>,
    filter: Filter,
}

/// Applies one filter to `collection`, keeping insertion order.
pub fn apply(collection: &Document, child: Option<&str>, filter: &Filter) -> Document {
    collection
        .iter()
        .filter(|(_, data)| {
            let value = match child {
                Some(child) => data.as_object().and_then(|o| o.get(child)),
                None => Some(*data),
            };
            filter.evaluate(value)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A query under construction against one store.
#[derive(Debug, Clone)]
pub struct Query<'a> {
    store: &'a Arkivist,
    child: Option<String>,
    steps: Vec<Step>,
    sort: Option<bool>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(store: &'a Arkivist) -> Self {
        Self { store, child: None, steps: Vec::new(), sort: None }
    }

    /// Projects every filter added after this call onto `value[child]`.
    pub fn child(mut self, child: impl Into<String>) -> Self {
        self.child = Some(child.into());
        self
    }

    /// Adds a filter. Filters are combined with AND, in order.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.steps.push(Step { child: self.child.clone(), filter });
        self
    }

    /// Keeps entries equal to `keyword`.
    pub fn equals(self, keyword: impl Into<Value>) -> Self {
        self.filter(Filter::matching(keyword).exact(true))
    }

    /// Keeps entries containing `keyword`.
    pub fn contains(self, keyword: impl Into<Value>) -> Self {
        self.filter(Filter::matching(keyword))
    }

    /// Drops entries containing `keyword`.
    pub fn exclude(self, keyword: impl Into<Value>) -> Self {
        self.filter(Filter::excluding(keyword))
    }

    /// Keeps entries matching `keyword` with explicit comparison flags.
    pub fn matching(self, keyword: impl Into<Value>, exact: bool, case_sensitive: bool) -> Self {
        self.filter(Filter::matching(keyword).exact(exact).case_sensitive(case_sensitive))
    }

    /// Drops entries matching `keyword` with explicit comparison flags.
    pub fn excluding(self, keyword: impl Into<Value>, exact: bool, case_sensitive: bool) -> Self {
        self.filter(Filter::excluding(keyword).exact(exact).case_sensitive(case_sensitive))
    }

    /// Orders the result by key.
    pub fn sorted(mut self, reverse: bool) -> Self {
        self.sort = Some(reverse);
        self
    }

    fn run(self) -> Document {
        let mut matches = self.store.snapshot();
        for step in &self.steps {
            matches = apply(&matches, step.child.as_deref(), &step.filter);
        }
        match self.sort {
            Some(reverse) => persistence::sorted(&matches, reverse),
            None => matches,
        }
    }

    /// Materializes the matches as a mapping.
    pub fn show(self) -> Document {
        self.run()
    }

    /// Materializes the matches as `(key, value)` pairs.
    pub fn items(self) -> Vec<(String, Value)> {
        self.run().into_iter().collect()
    }

    /// Materializes the matches as JSON text, indented like the store file.
    pub fn to_json(self) -> Result<String> {
        let indent = self.store.options().indent;
        persistence::to_json_string(&self.run(), indent)
    }
}

/// Serializable description of a query, used by the CLI and the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default)]
    pub child: Option<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: bool,
    #[serde(default)]
    pub reverse: bool,
}

impl QuerySpec {
    pub fn build<'a>(&self, store: &'a Arkivist) -> Query<'a> {
        let mut query = store.query();
        if let Some(child) = &self.child {
            query = query.child(child.clone());
        }
        for filter in &self.filters {
            query = query.filter(filter.clone());
        }
        if self.sort {
            query = query.sorted(self.reverse);
        }
        query
    }
}
