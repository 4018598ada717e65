//! Query criteria over the top-level fields of a record body

use serde_json::Value;
use std::cmp::Ordering;

use super::Record;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Filters, ordering and pagination for `select_*`, `count` and `delete_all`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryCriteria {
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub from_index: usize,
    pub max_results: Option<usize>,
}

impl QueryCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn ne(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Ne(field.to_string(), value.into()));
        self
    }

    pub fn lt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(field.to_string(), value.into()));
        self
    }

    pub fn lte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lte(field.to_string(), value.into()));
        self
    }

    pub fn gt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gt(field.to_string(), value.into()));
        self
    }

    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(field.to_string(), value.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(mut self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.filters.push(Filter::In(
            field.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn is_null(mut self, field: &str) -> Self {
        self.filters.push(Filter::IsNull(field.to_string()));
        self
    }

    pub fn not_null(mut self, field: &str) -> Self {
        self.filters.push(Filter::NotNull(field.to_string()));
        self
    }

    pub fn order_by_asc(mut self, field: &str) -> Self {
        self.order_by.push(OrderBy {
            field: field.to_string(),
            direction: SortDirection::Ascending,
        });
        self
    }

    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order_by.push(OrderBy {
            field: field.to_string(),
            direction: SortDirection::Descending,
        });
        self
    }

    pub fn from_index(mut self, from_index: usize) -> Self {
        self.from_index = from_index;
        self
    }

    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Whether a record body satisfies every filter
    pub fn matches(&self, body: &Value) -> bool {
        self.filters.iter().all(|filter| filter_matches(filter, body))
    }

    /// Sort by the requested fields (record id breaks ties), then paginate
    pub fn apply(&self, mut records: Vec<Record>) -> Vec<Record> {
        records.sort_by(|a, b| {
            for order in &self.order_by {
                let ordering = compare_values(field(&a.body, &order.field), field(&b.body, &order.field));
                let ordering = match order.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.id.cmp(&b.id)
        });

        let limit = self.max_results.unwrap_or(usize::MAX);
        records.into_iter().skip(self.from_index).take(limit).collect()
    }
}

fn field<'a>(body: &'a Value, name: &str) -> &'a Value {
    body.get(name).unwrap_or(&Value::Null)
}

fn filter_matches(filter: &Filter, body: &Value) -> bool {
    match filter {
        Filter::Eq(name, expected) => values_equal(field(body, name), expected),
        Filter::Ne(name, expected) => !values_equal(field(body, name), expected),
        Filter::Lt(name, bound) => ranged(field(body, name), bound, |o| o == Ordering::Less),
        Filter::Lte(name, bound) => ranged(field(body, name), bound, |o| o != Ordering::Greater),
        Filter::Gt(name, bound) => ranged(field(body, name), bound, |o| o == Ordering::Greater),
        Filter::Gte(name, bound) => ranged(field(body, name), bound, |o| o != Ordering::Less),
        Filter::In(name, candidates) => {
            let actual = field(body, name);
            candidates.iter().any(|candidate| values_equal(actual, candidate))
        }
        Filter::IsNull(name) => field(body, name).is_null(),
        Filter::NotNull(name) => !field(body, name).is_null(),
    }
}

// Null never satisfies a range filter
fn ranged(actual: &Value, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    if actual.is_null() || bound.is_null() {
        return false;
    }
    accept(compare_values(actual, bound))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order on JSON values: null first, numbers numerically, strings lexically
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
