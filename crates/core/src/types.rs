use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of computed property a definition or assignment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Segment,
    UserProperty,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Segment => "segment",
            ResourceKind::UserProperty => "user_property",
        }
    }
}

/// Pipeline step whose completed windows are recorded as periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComputedPropertyStep {
    ComputeAssignments,
}

impl ComputedPropertyStep {
    pub const ALL: [ComputedPropertyStep; 1] = [ComputedPropertyStep::ComputeAssignments];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputedPropertyStep::ComputeAssignments => "ComputeAssignments",
        }
    }
}

impl std::fmt::Display for ComputedPropertyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Carries traits in `properties`.
    Identify,
    /// Carries a named event and its properties.
    Track,
}

/// A single row of the append-only event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub message_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// When the event happened according to the sender.
    pub event_time: DateTime<Utc>,
    /// When the event landed in the store. Recompute windows are bounded on
    /// this column so late-arriving events are never skipped.
    pub received_at: DateTime<Utc>,
}

impl UserEvent {
    pub fn identify(
        workspace_id: Uuid,
        user_id: impl Into<String>,
        traits: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            workspace_id,
            user_id: user_id.into(),
            event_type: EventType::Identify,
            event: None,
            properties: into_object(traits),
            event_time: at,
            received_at: at,
        }
    }

    pub fn track(
        workspace_id: Uuid,
        user_id: impl Into<String>,
        event: impl Into<String>,
        properties: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            workspace_id,
            user_id: user_id.into(),
            event_type: EventType::Track,
            event: Some(event.into()),
            properties: into_object(properties),
            event_time: at,
            received_at: at,
        }
    }
}

fn into_object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// Everything known about one individual up to `as_of`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub user_id: String,
    pub traits: serde_json::Map<String, serde_json::Value>,
    /// Track events, ascending by event time.
    pub events: Vec<UserEvent>,
    pub as_of: DateTime<Utc>,
    pub max_event_time: Option<DateTime<Utc>>,
}

impl UserSnapshot {
    pub fn empty(user_id: impl Into<String>, as_of: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            traits: serde_json::Map::new(),
            events: Vec::new(),
            as_of,
            max_event_time: None,
        }
    }

    /// Folds a user's events into a snapshot. Events received after `as_of`
    /// are ignored; identify traits are shallow-merged in event-time order.
    pub fn from_events<'a>(
        user_id: impl Into<String>,
        events: impl IntoIterator<Item = &'a UserEvent>,
        as_of: DateTime<Utc>,
    ) -> Self {
        let mut visible: Vec<&UserEvent> = events
            .into_iter()
            .filter(|e| e.received_at <= as_of)
            .collect();
        visible.sort_by(|a, b| {
            a.event_time
                .cmp(&b.event_time)
                .then(a.received_at.cmp(&b.received_at))
        });

        let mut snapshot = Self::empty(user_id, as_of);
        for event in visible {
            snapshot.max_event_time = snapshot.max_event_time.max(Some(event.event_time));
            match event.event_type {
                EventType::Identify => {
                    for (key, value) in &event.properties {
                        snapshot.traits.insert(key.clone(), value.clone());
                    }
                }
                EventType::Track => snapshot.events.push(event.clone()),
            }
        }
        snapshot
    }

    /// Resolves a dot-separated path (`"address.city"`) against the traits.
    pub fn trait_value(&self, path: &str) -> Option<&serde_json::Value> {
        value_at_path(&self.traits, path)
    }
}

/// Walks a dot-separated path through nested JSON objects.
pub fn value_at_path<'a>(
    root: &'a serde_json::Map<String, serde_json::Value>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
