use crate::rpc::BatchOpResult;
use crate::value::Value;

/// Origin of a property change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum ChangeSource {
    /// Direct caller write through the engine API.
    Api,
    /// Detected by the monitor loop while diffing snapshots.
    Monitor,
}

/// Broadcast event emitted on the subscription bus.
///
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ChangeEvent {
    PropertyChanged {
        name: String,
        old_value: Option<Value>,
        new_value: Value,
        timestamp_ms: u64,
        source: ChangeSource,
    },
    PropertyFreezeChanged {
        name: String,
        frozen: bool,
        timestamp_ms: u64,
    },
    MapperLoaded {
        name: String,
        timestamp_ms: u64,
    },
    BatchCompleted {
        results: Vec<BatchOpResult>,
        success_count: usize,
        total: usize,
        timestamp_ms: u64,
    },
    ValidationFailed {
        name: String,
        rule: String,
        message: String,
        value: Value,
        timestamp_ms: u64,
    },
    /// Synthetic event emitted once when the emulator channel comes back
    /// after a streak of transport failures.
    ConnectionRestored {
        failures: u64,
        timestamp_ms: u64,
    },
    /// Final event delivered to every subscriber before queues close.
    Shutdown {
        timestamp_ms: u64,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::PropertyChanged { .. } => EventKind::PropertyChanged,
            ChangeEvent::PropertyFreezeChanged { .. } => EventKind::PropertyFreezeChanged,
            ChangeEvent::MapperLoaded { .. } => EventKind::MapperLoaded,
            ChangeEvent::BatchCompleted { .. } => EventKind::BatchCompleted,
            ChangeEvent::ValidationFailed { .. } => EventKind::ValidationFailed,
            ChangeEvent::ConnectionRestored { .. } => EventKind::ConnectionRestored,
            ChangeEvent::Shutdown { .. } => EventKind::Shutdown,
        }
    }

    /// Property the event concerns, if it concerns exactly one.
    pub fn property_name(&self) -> Option<&str> {
        match self {
            ChangeEvent::PropertyChanged { name, .. }
            | ChangeEvent::PropertyFreezeChanged { name, .. }
            | ChangeEvent::ValidationFailed { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            ChangeEvent::PropertyChanged { timestamp_ms, .. }
            | ChangeEvent::PropertyFreezeChanged { timestamp_ms, .. }
            | ChangeEvent::MapperLoaded { timestamp_ms, .. }
            | ChangeEvent::BatchCompleted { timestamp_ms, .. }
            | ChangeEvent::ValidationFailed { timestamp_ms, .. }
            | ChangeEvent::ConnectionRestored { timestamp_ms, .. }
            | ChangeEvent::Shutdown { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}

/// Discriminant of [`ChangeEvent`], used by kind filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum EventKind {
    PropertyChanged,
    PropertyFreezeChanged,
    MapperLoaded,
    BatchCompleted,
    ValidationFailed,
    ConnectionRestored,
    Shutdown,
}

/// Per-subscriber event filter.
///
/// `Shutdown` always passes; a subscriber must observe its stream closing.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum SubscriptionFilter {
    All,
    Properties(Vec<String>),
    Kinds(Vec<EventKind>),
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.kind() == EventKind::Shutdown {
            return true;
        }
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Properties(names) => event
                .property_name()
                .is_some_and(|name| names.iter().any(|n| n == name)),
            SubscriptionFilter::Kinds(kinds) => kinds.contains(&event.kind()),
        }
    }
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        SubscriptionFilter::All
    }
}
