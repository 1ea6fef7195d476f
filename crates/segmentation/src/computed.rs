//! User properties: derived per-user attributes computed from traits and
//! track events.

use std::collections::BTreeSet;

use audience_core::types::{value_at_path, UserEvent, UserSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::definition::DefinitionError;
use crate::evaluator::{window_start, EvaluationError};
use crate::predicates::as_number;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserPropertyDefinition {
    /// The individual's own id.
    Id,
    Trait {
        path: String,
    },
    /// Property of the most recent matching event.
    Performed {
        event: String,
        path: String,
    },
    /// Property of the earliest matching event.
    FirstPerformed {
        event: String,
        path: String,
    },
    Count {
        event: String,
        #[serde(default)]
        within_seconds: Option<u64>,
    },
    Sum {
        event: String,
        property: String,
        #[serde(default)]
        within_seconds: Option<u64>,
    },
    Average {
        event: String,
        property: String,
        #[serde(default)]
        within_seconds: Option<u64>,
    },
    Min {
        event: String,
        property: String,
        #[serde(default)]
        within_seconds: Option<u64>,
    },
    Max {
        event: String,
        property: String,
        #[serde(default)]
        within_seconds: Option<u64>,
    },
    UniqueCount {
        event: String,
        property: String,
        #[serde(default)]
        within_seconds: Option<u64>,
    },
}

impl UserPropertyDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let (event, field) = match self {
            UserPropertyDefinition::Id => return Ok(()),
            UserPropertyDefinition::Trait { path } => {
                return non_empty(path, "path");
            }
            UserPropertyDefinition::Performed { event, path }
            | UserPropertyDefinition::FirstPerformed { event, path } => (event, ("path", path)),
            UserPropertyDefinition::Count { event, .. } => return non_empty(event, "event"),
            UserPropertyDefinition::Sum { event, property, .. }
            | UserPropertyDefinition::Average { event, property, .. }
            | UserPropertyDefinition::Min { event, property, .. }
            | UserPropertyDefinition::Max { event, property, .. }
            | UserPropertyDefinition::UniqueCount { event, property, .. } => {
                (event, ("property", property))
            }
        };
        non_empty(event, "event")?;
        non_empty(field.1, field.0)
    }

    /// Whether the value can change with the passage of time alone.
    pub fn depends_on_time(&self) -> bool {
        match self {
            UserPropertyDefinition::Id
            | UserPropertyDefinition::Trait { .. }
            | UserPropertyDefinition::Performed { .. }
            | UserPropertyDefinition::FirstPerformed { .. } => false,
            UserPropertyDefinition::Count { within_seconds, .. }
            | UserPropertyDefinition::Sum { within_seconds, .. }
            | UserPropertyDefinition::Average { within_seconds, .. }
            | UserPropertyDefinition::Min { within_seconds, .. }
            | UserPropertyDefinition::Max { within_seconds, .. }
            | UserPropertyDefinition::UniqueCount { within_seconds, .. } => within_seconds.is_some(),
        }
    }
}

fn non_empty(value: &str, field: &'static str) -> Result<(), DefinitionError> {
    if value.is_empty() {
        Err(DefinitionError::EmptyField(field))
    } else {
        Ok(())
    }
}

/// Computes the property for one individual. `Ok(None)` means the property
/// has no value for them.
pub fn evaluate_user_property(
    definition: &UserPropertyDefinition,
    snapshot: &UserSnapshot,
) -> Result<Option<serde_json::Value>, EvaluationError> {
    let value = match definition {
        UserPropertyDefinition::Id => Some(json!(snapshot.user_id)),
        UserPropertyDefinition::Trait { path } => present(snapshot.trait_value(path)),
        UserPropertyDefinition::Performed { event, path } => matching(snapshot, event, None)
            .rev()
            .find_map(|e| present(value_at_path(&e.properties, path))),
        UserPropertyDefinition::FirstPerformed { event, path } => {
            matching(snapshot, event, None).find_map(|e| present(value_at_path(&e.properties, path)))
        }
        UserPropertyDefinition::Count {
            event,
            within_seconds,
        } => Some(json!(matching(snapshot, event, *within_seconds).count())),
        UserPropertyDefinition::Sum {
            event,
            property,
            within_seconds,
        } => {
            let values = numeric_values(snapshot, event, property, *within_seconds)?;
            Some(finite(values.iter().sum::<f64>(), event, property)?)
        }
        UserPropertyDefinition::Average {
            event,
            property,
            within_seconds,
        } => {
            let values = numeric_values(snapshot, event, property, *within_seconds)?;
            if values.is_empty() {
                None
            } else {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                Some(finite(mean, event, property)?)
            }
        }
        UserPropertyDefinition::Min {
            event,
            property,
            within_seconds,
        } => numeric_values(snapshot, event, property, *within_seconds)?
            .into_iter()
            .reduce(f64::min)
            .map(|v| finite(v, event, property))
            .transpose()?,
        UserPropertyDefinition::Max {
            event,
            property,
            within_seconds,
        } => numeric_values(snapshot, event, property, *within_seconds)?
            .into_iter()
            .reduce(f64::max)
            .map(|v| finite(v, event, property))
            .transpose()?,
        UserPropertyDefinition::UniqueCount {
            event,
            property,
            within_seconds,
        } => {
            let distinct: BTreeSet<String> = matching(snapshot, event, *within_seconds)
                .filter_map(|e| present(value_at_path(&e.properties, property)))
                .map(|v| v.to_string())
                .collect();
            Some(json!(distinct.len()))
        }
    };
    Ok(value)
}

/// JSON has no encoding for infinities, so an aggregate that overflows is an
/// evaluation error rather than a silent `null`.
fn finite(value: f64, event: &str, property: &str) -> Result<serde_json::Value, EvaluationError> {
    serde_json::Number::from_f64(value)
        .map(serde_json::Value::Number)
        .ok_or_else(|| EvaluationError::NonFinite {
            event: event.to_string(),
            property: property.to_string(),
        })
}

fn present(value: Option<&serde_json::Value>) -> Option<serde_json::Value> {
    value.filter(|v| !v.is_null()).cloned()
}

fn matching<'a>(
    snapshot: &'a UserSnapshot,
    event: &'a str,
    within_seconds: Option<u64>,
) -> impl DoubleEndedIterator<Item = &'a UserEvent> + 'a {
    let cutoff = window_start(snapshot.as_of, within_seconds);
    let as_of = snapshot.as_of;
    snapshot.events.iter().filter(move |e| {
        e.event.as_deref() == Some(event)
            && cutoff.map_or(true, |c| e.event_time >= c && e.event_time <= as_of)
    })
}

/// Numeric values of `property` across matching events. Missing values are
/// skipped; present non-numeric values are an error.
fn numeric_values(
    snapshot: &UserSnapshot,
    event: &str,
    property: &str,
    within_seconds: Option<u64>,
) -> Result<Vec<f64>, EvaluationError> {
    let mut values = Vec::new();
    for e in matching(snapshot, event, within_seconds) {
        let Some(raw) = present(value_at_path(&e.properties, property)) else {
            continue;
        };
        let number = as_number(&raw).ok_or_else(|| EvaluationError::NonNumeric {
            event: event.to_string(),
            property: property.to_string(),
            value: raw.to_string(),
        })?;
        values.push(number);
    }
    Ok(values)
}
