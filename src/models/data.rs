// Item definitions and data sets - payload descriptors for tasks and messages

use serde::{Deserialize, Serialize};

use super::variable::VarType;

/// Whether an item describes a physical thing or information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Physical,
    #[default]
    Information,
}

/// Payload descriptor used by messages, data inputs, data outputs and properties
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemDefinition {
    pub kind: ItemKind,
    /// Free-form structure reference (type name, schema URI, ...)
    pub structure: String,
    pub is_collection: bool,
}

impl ItemDefinition {
    pub fn information<S: Into<String>>(structure: S) -> Self {
        ItemDefinition {
            kind: ItemKind::Information,
            structure: structure.into(),
            is_collection: false,
        }
    }
}

/// A named data input or output of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub var_type: VarType,
    #[serde(default)]
    pub item: ItemDefinition,
}

impl Parameter {
    pub fn new<S: Into<String>>(name: S, var_type: VarType) -> Self {
        Parameter {
            name: name.into(),
            var_type,
            item: ItemDefinition::default(),
        }
    }
}

/// Input and output sets a task declares
///
/// The engine checks inputs before a task runs and outputs after it ran;
/// see the data-linker capability in `engine::executor`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataSet {
    #[serde(default)]
    pub inputs: Vec<Parameter>,
    #[serde(default)]
    pub outputs: Vec<Parameter>,
}

impl DataSet {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}
