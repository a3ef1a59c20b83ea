//! Change detection against the last stored snapshot.

use crate::types::{FieldValue, Regression, StatField, StatFields, StatSnapshot};

/// What to do with an incoming capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Something changed, or there is nothing to compare against.
    Persist,
    /// Monotonic fields went backwards. Persist with these markers.
    Anomaly(Vec<Regression>),
    /// Identical to the last snapshot.
    Discard,
}

impl Decision {
    pub fn should_persist(&self) -> bool {
        !matches!(self, Decision::Discard)
    }
}

/// Compares captures field by field: integers exactly, floats within an
/// absolute epsilon.
#[derive(Clone, Copy, Debug)]
pub struct ChangeDetector {
    epsilon: f64,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(1e-4)
    }
}

impl ChangeDetector {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon: epsilon.abs(),
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn evaluate(&self, last: Option<&StatSnapshot>, incoming: &StatFields) -> Decision {
        let Some(last) = last else {
            return Decision::Persist;
        };

        let regressions = regressions(&last.fields, incoming);
        if !regressions.is_empty() {
            return Decision::Anomaly(regressions);
        }

        if self.changed_fields(&last.fields, incoming).is_empty() {
            Decision::Discard
        } else {
            Decision::Persist
        }
    }

    pub fn should_persist(&self, last: Option<&StatSnapshot>, incoming: &StatFields) -> bool {
        self.evaluate(last, incoming).should_persist()
    }

    /// Fields whose values differ between two captures.
    pub fn changed_fields(&self, a: &StatFields, b: &StatFields) -> Vec<StatField> {
        StatField::ALL
            .into_iter()
            .filter(|field| !self.same(a.get(*field), b.get(*field)))
            .collect()
    }

    fn same(&self, a: FieldValue, b: FieldValue) -> bool {
        match (a, b) {
            (FieldValue::Int(a), FieldValue::Int(b)) => a == b,
            (FieldValue::Float(a), FieldValue::Float(b)) => (a - b).abs() <= self.epsilon,
            _ => false,
        }
    }
}

fn regressions(previous: &StatFields, current: &StatFields) -> Vec<Regression> {
    StatField::ALL
        .into_iter()
        .filter(|field| field.is_monotonic())
        .filter_map(|field| match (previous.get(field), current.get(field)) {
            (FieldValue::Int(before), FieldValue::Int(after)) if after < before => {
                Some(Regression {
                    field,
                    previous: before,
                    current: after,
                })
            }
            _ => None,
        })
        .collect()
}
