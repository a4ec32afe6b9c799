// Lanes - labelled groupings of nodes, nestable through child lane sets

use serde::{Deserialize, Serialize};

use super::identity::Id;

/// Named grouping of nodes
///
/// Lanes are metadata only; scheduling never looks at them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lane {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Id>,
    #[serde(default)]
    pub children: Vec<Lane>,
}

impl Lane {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Lane {
            id: Id::new(),
            name: name.into(),
            nodes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: Lane) -> Self {
        self.children.push(child);
        self
    }

    /// Depth-first iterator over this lane and all nested lanes
    pub fn walk(&self) -> Vec<&Lane> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut Lane> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(name))
    }

    pub fn contains(&self, node: Id) -> bool {
        self.walk().iter().any(|l| l.nodes.contains(&node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_includes_nested() {
        let lane = Lane::new("outer").with_child(Lane::new("inner").with_child(Lane::new("deep")));
        let names: Vec<_> = lane.walk().iter().map(|l| l.name.clone()).collect();
        assert_eq!(names, vec!["outer", "inner", "deep"]);
    }
}
