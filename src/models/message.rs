// Message definitions - named payloads exchanged through the message bus

//! # Messages
//!
//! A [`Message`] is declared on a process and instantiated when a send task
//! puts it on the bus or a receive task takes it off. Its JSON form is the
//! canonical envelope understood by every Thresher instance:
//!
//! ```text
//! { "id": "<uuid>", "name": "<message-name>", "direction": 1|2|3,
//!   "vars": [ { "optional": false, "variable": { "name": ..., "var_type": ...,
//!               "precision": ..., "value": { "int": .., "bool": .., "string": ..,
//!                                            "float": .., "time": .. } } } ] }
//! ```

use serde::{Deserialize, Serialize};

use super::data::ItemDefinition;
use super::identity::Id;
use super::variable::Variable;
use crate::{Result, ThresherError};

/// Message direction bitmask: 1 incoming, 2 outgoing, 3 both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageDirection {
    Incoming = 1,
    Outgoing = 2,
    Bidirectional = 3,
}

impl MessageDirection {
    pub fn is_incoming(&self) -> bool {
        (*self as u8) & (MessageDirection::Incoming as u8) != 0
    }

    pub fn is_outgoing(&self) -> bool {
        (*self as u8) & (MessageDirection::Outgoing as u8) != 0
    }
}

impl From<MessageDirection> for u8 {
    fn from(d: MessageDirection) -> u8 {
        d as u8
    }
}

impl TryFrom<u8> for MessageDirection {
    type Error = ThresherError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(MessageDirection::Incoming),
            2 => Ok(MessageDirection::Outgoing),
            3 => Ok(MessageDirection::Bidirectional),
            other => Err(ThresherError::Message(format!("invalid direction flags {}", other))),
        }
    }
}

/// Lifecycle of a message instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    #[default]
    Created,
    Sent,
    Received,
}

/// A payload variable and whether the message may omit it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageVariable {
    pub optional: bool,
    pub variable: Variable,
}

impl MessageVariable {
    pub fn required(variable: Variable) -> Self {
        MessageVariable {
            optional: false,
            variable,
        }
    }

    pub fn optional(variable: Variable) -> Self {
        MessageVariable {
            optional: true,
            variable,
        }
    }

    pub fn name(&self) -> &str {
        &self.variable.name
    }
}

/// Named message with an ordered payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Id,
    pub name: String,
    pub direction: MessageDirection,
    pub vars: Vec<MessageVariable>,
    #[serde(skip)]
    pub state: MessageState,
    #[serde(skip)]
    pub item: ItemDefinition,
}

impl Message {
    /// Declare a message; the variables carry types and placeholder values
    pub fn new<S: Into<String>>(name: S, direction: MessageDirection, vars: Vec<MessageVariable>) -> Self {
        Message {
            id: Id::new(),
            name: name.into(),
            direction,
            vars,
            state: MessageState::Created,
            item: ItemDefinition::default(),
        }
    }

    pub fn var(&self, name: &str) -> Option<&MessageVariable> {
        self.vars.iter().find(|v| v.name() == name)
    }

    /// Check the definition: named, unique variable names
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ThresherError::structural("message without a name"));
        }
        let mut seen = std::collections::HashSet::new();
        for v in &self.vars {
            if v.name().is_empty() {
                return Err(ThresherError::structural(format!(
                    "message '{}' has a variable without a name",
                    self.name
                )));
            }
            if !seen.insert(v.name()) {
                return Err(ThresherError::DuplicateName {
                    kind: "message variable",
                    name: v.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Fresh outgoing instance of this definition carrying `vars`
    pub fn outgoing(&self, vars: Vec<MessageVariable>) -> Message {
        Message {
            id: Id::new(),
            name: self.name.clone(),
            direction: MessageDirection::Outgoing,
            vars,
            state: MessageState::Sent,
            item: self.item.clone(),
        }
    }

    /// Marshal to the canonical JSON envelope
    pub fn to_envelope(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Unmarshal a canonical JSON envelope; the result is in state `Received`
    pub fn from_envelope(body: &[u8]) -> Result<Message> {
        let mut msg: Message = serde_json::from_slice(body)?;
        msg.state = MessageState::Received;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn letter() -> Message {
        Message::new(
            "letter_X",
            MessageDirection::Bidirectional,
            vec![
                MessageVariable::required(Variable::int("x", 42)),
                MessageVariable::required(Variable::float("rate", 0.125).with_precision(3)),
                MessageVariable::optional(Variable::string("note", "hi")),
                MessageVariable::required(Variable::bool("urgent", true)),
                MessageVariable::required(Variable::time(
                    "sent_at",
                    Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 0).unwrap(),
                )),
            ],
        )
    }

    #[test]
    fn test_direction_flags() {
        assert!(MessageDirection::Incoming.is_incoming());
        assert!(!MessageDirection::Incoming.is_outgoing());
        assert!(MessageDirection::Bidirectional.is_incoming());
        assert!(MessageDirection::Bidirectional.is_outgoing());
        assert!(MessageDirection::try_from(0).is_err());
    }

    #[test]
    fn test_envelope_shape() {
        let msg = letter();
        let json: serde_json::Value = serde_json::from_slice(&msg.to_envelope().unwrap()).unwrap();
        assert_eq!(json["name"], "letter_X");
        assert_eq!(json["direction"], 3);
        assert_eq!(json["id"], msg.id.to_string());
        assert_eq!(json["vars"][0]["optional"], false);
        assert_eq!(json["vars"][0]["variable"]["var_type"], 0);
        assert_eq!(json["vars"][0]["variable"]["value"]["int"], 42);
        assert_eq!(json["vars"][4]["variable"]["value"]["time"], "2024-02-29T12:30:00Z");
        assert!(json.get("state").is_none());
    }

    #[test]
    fn test_envelope_round_trip() {
        let msg = letter();
        let back = Message::from_envelope(&msg.to_envelope().unwrap()).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.name, msg.name);
        assert_eq!(back.direction, msg.direction);
        assert_eq!(back.vars, msg.vars);
        assert_eq!(back.state, MessageState::Received);
    }

    #[test]
    fn test_validate_rejects_duplicate_vars() {
        let msg = Message::new(
            "dup",
            MessageDirection::Outgoing,
            vec![
                MessageVariable::required(Variable::int("a", 1)),
                MessageVariable::optional(Variable::int("a", 2)),
            ],
        );
        assert!(matches!(msg.validate(), Err(ThresherError::DuplicateName { .. })));
    }
}
