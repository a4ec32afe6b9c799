// Sequence flows - directed edges between nodes of one process

use serde::{Deserialize, Serialize};

use super::condition::FlowCondition;
use super::identity::Id;

/// Directed edge from `source` to `target`
///
/// Both ends reference nodes of the same process by id. The optional
/// condition only matters when the source is a diverging exclusive,
/// inclusive or complex gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: Id,
    #[serde(default)]
    pub name: String,
    pub source: Id,
    pub target: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<FlowCondition>,
}

impl SequenceFlow {
    pub fn new(source: Id, target: Id) -> Self {
        SequenceFlow {
            id: Id::new(),
            name: String::new(),
            source,
            target,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: FlowCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}
