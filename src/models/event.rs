// Event definitions - triggers that start or resume process execution

use serde::{Deserialize, Serialize};

use super::identity::Id;

/// What fires an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventTrigger {
    /// No trigger, e.g. a plain start event
    None,
    /// Arrival of the named message
    Message { message: String },
    /// Broadcast signal by name
    Signal { signal: String },
    /// Timer expression kept as text; the engine does not schedule timers
    Timer { expression: String },
}

/// Event definition attached to an event node
///
/// The engine root routes external events by definition id: propagating an
/// id reaches every event processor registered for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub id: Id,
    pub trigger: EventTrigger,
}

impl EventDefinition {
    pub fn new(trigger: EventTrigger) -> Self {
        EventDefinition {
            id: Id::new(),
            trigger,
        }
    }

    pub fn message<S: Into<String>>(message: S) -> Self {
        Self::new(EventTrigger::Message {
            message: message.into(),
        })
    }

    pub fn signal<S: Into<String>>(signal: S) -> Self {
        Self::new(EventTrigger::Signal {
            signal: signal.into(),
        })
    }
}

/// Position of an event in the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    IntermediateCatch,
    IntermediateThrow,
    End,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Start => "start_event",
            EventKind::IntermediateCatch => "intermediate_catch_event",
            EventKind::IntermediateThrow => "intermediate_throw_event",
            EventKind::End => "end_event",
        };
        write!(f, "{}", s)
    }
}
