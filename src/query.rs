use std::cmp::Ordering;

use crate::model::{FieldPath, MutableDocument, ResourcePath};
use crate::value::{compare_values, FieldValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FieldValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FieldValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    pub fn matches(&self, doc: &MutableDocument) -> bool {
        match doc.field(&self.field) {
            Some(value) => self.evaluate(value),
            // Missing fields only satisfy inequality with null semantics.
            None => matches!(self.op, FilterOperator::NotEqual) && !self.value.is_null(),
        }
    }

    fn evaluate(&self, value: &FieldValue) -> bool {
        match self.op {
            FilterOperator::Equal => value == &self.value,
            FilterOperator::NotEqual => value != &self.value && !value.is_null(),
            FilterOperator::LessThan => self.compare_same_type(value) == Some(Ordering::Less),
            FilterOperator::LessThanOrEqual => matches!(
                self.compare_same_type(value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::GreaterThan => self.compare_same_type(value) == Some(Ordering::Greater),
            FilterOperator::GreaterThanOrEqual => matches!(
                self.compare_same_type(value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::ArrayContains => match value.kind() {
                ValueKind::Array(array) => array.values().contains(&self.value),
                _ => false,
            },
            FilterOperator::ArrayContainsAny => match (value.kind(), self.value.kind()) {
                (ValueKind::Array(array), ValueKind::Array(needles)) => needles
                    .values()
                    .iter()
                    .any(|needle| array.values().contains(needle)),
                _ => false,
            },
            FilterOperator::In => match self.value.kind() {
                ValueKind::Array(values) => values.values().contains(value),
                _ => false,
            },
            FilterOperator::NotIn => match self.value.kind() {
                ValueKind::Array(values) => {
                    !value.is_null() && !values.values().contains(value)
                }
                _ => false,
            },
        }
    }

    /// Range operators only match values of the same type rank.
    fn compare_same_type(&self, value: &FieldValue) -> Option<Ordering> {
        let comparable = matches!(
            (value.kind(), self.value.kind()),
            (ValueKind::Boolean(_), ValueKind::Boolean(_))
                | (
                    ValueKind::Integer(_) | ValueKind::Double(_),
                    ValueKind::Integer(_) | ValueKind::Double(_)
                )
                | (ValueKind::Timestamp(_), ValueKind::Timestamp(_))
                | (ValueKind::String(_), ValueKind::String(_))
                | (ValueKind::Bytes(_), ValueKind::Bytes(_))
        );
        comparable.then(|| compare_values(value, &self.value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn reversed(&self) -> Self {
        Self {
            field: self.field.clone(),
            direction: match self.direction {
                Direction::Ascending => Direction::Descending,
                Direction::Descending => Direction::Ascending,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

/// Cursor bounding a query's result range along its ordering.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FieldValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FieldValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    pub fn position(&self) -> &[FieldValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }
}

/// A query over one collection (or collection group), with filters, explicit
/// ordering, optional limit and optional cursors.
///
/// An implicit ordering on the document key is always appended so results are
/// totally ordered.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<i32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(group: impl Into<String>) -> Self {
        Self {
            path: ResourcePath::root(),
            collection_group: Some(group.into()),
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<i32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    /// Explicit orderings plus the implicit key tiebreak, which inherits the
    /// direction of the last explicit ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if !order_by.iter().any(|o| o.field().is_key_path()) {
            let direction = order_by
                .last()
                .map(|o| o.direction())
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::key_path(), direction));
        }
        order_by
    }

    /// The server-executable form of a `limit-to-last` query: orderings are
    /// reversed and it runs as `limit-to-first`; callers flip the result
    /// order back afterwards.
    pub fn as_limit_to_first_for_server(&self) -> Query {
        if !self.has_limit_to_last() {
            return self.clone();
        }
        let mut flipped = self.clone();
        flipped.explicit_order_by = self
            .explicit_order_by
            .iter()
            .map(OrderBy::reversed)
            .collect();
        flipped.limit_type = LimitType::First;
        // Cursors swap roles and flip inclusivity when the order reverses.
        flipped.start_at = self
            .end_at
            .clone()
            .map(|b| Bound::new(b.position, b.inclusive));
        flipped.end_at = self
            .start_at
            .clone()
            .map(|b| Bound::new(b.position, b.inclusive));
        flipped
    }

    /// Whether the document belongs to this query's result set, considering
    /// path, filters and bounds (but not the limit).
    pub fn matches(&self, doc: &MutableDocument) -> bool {
        if !doc.is_found_document() {
            return false;
        }
        if !self.matches_path(doc) {
            return false;
        }
        if !self.filters.iter().all(|filter| filter.matches(doc)) {
            return false;
        }
        self.matches_bounds(doc)
    }

    fn matches_path(&self, doc: &MutableDocument) -> bool {
        match &self.collection_group {
            Some(group) => {
                doc.key().collection_id() == group
                    && self.path.is_prefix_of(&doc.key().collection_path())
            }
            None => doc.key().collection_path() == self.path,
        }
    }

    fn matches_bounds(&self, doc: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            let ordering = compare_doc_to_bound(doc, bound, &order_by);
            let before_start = if bound.inclusive() {
                ordering == Ordering::Less
            } else {
                ordering != Ordering::Greater
            };
            if before_start {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            let ordering = compare_doc_to_bound(doc, bound, &order_by);
            let after_end = if bound.inclusive() {
                ordering == Ordering::Greater
            } else {
                ordering != Ordering::Less
            };
            if after_end {
                return false;
            }
        }
        true
    }

    /// Total order over documents along this query's normalized ordering.
    pub fn comparator(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = if order.field().is_key_path() {
                left.key().cmp(right.key())
            } else {
                let left_value = left.field(order.field());
                let right_value = right.field(order.field());
                match (left_value, right_value) {
                    (Some(l), Some(r)) => compare_values(l, r),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                }
            };
            let ordering = match order.direction() {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable identity used to share one target between identical listens.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&format!(
                "{}{:?}{:?},",
                filter.field().canonical_string(),
                filter.op(),
                filter.value().kind()
            ));
        }
        id.push_str("|ob:");
        for order in self.normalized_order_by() {
            id.push_str(&order.field().canonical_string());
            id.push(match order.direction() {
                Direction::Ascending => 'a',
                Direction::Descending => 'd',
            });
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!(
                "|l:{}{}",
                limit,
                match self.limit_type {
                    LimitType::First => "f",
                    LimitType::Last => "l",
                }
            ));
        }
        if let Some(bound) = &self.start_at {
            id.push_str(&format!("|sa:{}{:?}", bound.inclusive(), bound.position()));
        }
        if let Some(bound) = &self.end_at {
            id.push_str(&format!("|ea:{}{:?}", bound.inclusive(), bound.position()));
        }
        id
    }
}

fn compare_doc_to_bound(doc: &MutableDocument, bound: &Bound, order_by: &[OrderBy]) -> Ordering {
    for (index, order) in order_by.iter().enumerate() {
        let Some(bound_value) = bound.position().get(index) else {
            break;
        };
        let doc_value = if order.field().is_key_path() {
            FieldValue::from_string(doc.key().path().canonical_string())
        } else {
            doc.field(order.field()).cloned().unwrap_or_else(FieldValue::null)
        };
        let mut ordering = compare_values(&doc_value, bound_value);
        if order.direction() == Direction::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
