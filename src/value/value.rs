use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::Timestamp;
use crate::value::{ArrayValue, MapValue};

/// A single typed field value.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(Vec<u8>),
    Array(ArrayValue),
    Map(MapValue),
}

impl FieldValue {
    pub fn null() -> Self {
        Self { kind: ValueKind::Null }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: Vec<u8>) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_array(values: Vec<FieldValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(fields)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }
}

fn type_order(kind: &ValueKind) -> u8 {
    match kind {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::String(_) => 4,
        ValueKind::Bytes(_) => 5,
        ValueKind::Array(_) => 6,
        ValueKind::Map(_) => 7,
    }
}

/// Total order over all field values, used by query ordering.
///
/// Values of different types compare by a fixed type rank; integers and
/// doubles share the numeric rank and compare numerically.
pub fn compare_values(left: &FieldValue, right: &FieldValue) -> Ordering {
    let (l, r) = (left.kind(), right.kind());
    let rank = type_order(l).cmp(&type_order(r));
    if rank != Ordering::Equal {
        return rank;
    }

    match (l, r) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Double(a), ValueKind::Double(b)) => total_double_cmp(*a, *b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => total_double_cmp(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => total_double_cmp(*a, *b as f64),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (av, bv) in a.values().iter().zip(b.values().iter()) {
                let ordering = compare_values(av, bv);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            let mut left_entries = a.fields().iter();
            let mut right_entries = b.fields().iter();
            loop {
                match (left_entries.next(), right_entries.next()) {
                    (Some((lk, lv)), Some((rk, rv))) => {
                        let key_ordering = lk.cmp(rk);
                        if key_ordering != Ordering::Equal {
                            return key_ordering;
                        }
                        let value_ordering = compare_values(lv, rv);
                        if value_ordering != Ordering::Equal {
                            return value_ordering;
                        }
                    }
                    (Some(_), None) => return Ordering::Greater,
                    (None, Some(_)) => return Ordering::Less,
                    (None, None) => return Ordering::Equal,
                }
            }
        }
        _ => Ordering::Equal,
    }
}

fn total_double_cmp(a: f64, b: f64) -> Ordering {
    // NaN sorts before every other number so the order stays total.
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ranks_are_totally_ordered() {
        let values = [
            FieldValue::null(),
            FieldValue::from_bool(true),
            FieldValue::from_integer(7),
            FieldValue::from_timestamp(Timestamp::new(1, 0)),
            FieldValue::from_string("x"),
            FieldValue::from_bytes(vec![1]),
            FieldValue::from_array(vec![]),
            FieldValue::from_map(BTreeMap::new()),
        ];
        for window in values.windows(2) {
            assert_eq!(compare_values(&window[0], &window[1]), Ordering::Less);
        }
    }

    #[test]
    fn integers_and_doubles_compare_numerically() {
        assert_eq!(
            compare_values(&FieldValue::from_integer(2), &FieldValue::from_double(2.5)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&FieldValue::from_double(3.0), &FieldValue::from_integer(3)),
            Ordering::Equal
        );
    }

    #[test]
    fn arrays_compare_elementwise_then_by_length() {
        let short = FieldValue::from_array(vec![FieldValue::from_integer(1)]);
        let long = FieldValue::from_array(vec![
            FieldValue::from_integer(1),
            FieldValue::from_integer(2),
        ]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
    }
}
