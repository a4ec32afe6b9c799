// Tokens - execution markers carried by tracks

//! # Tokens
//!
//! A [`Token`] marks a point of control flow inside an instance. Tracks carry
//! one token each; when a node fans out the token is split, when converging
//! tracks meet their tokens are joined. `prevs` records provenance: the ids
//! of every token this one descends from or absorbed.
//!
//! ## Rust Learning Notes:
//!
//! ### Consuming vs Borrowing `self`
//! `split` takes `&mut self` because it changes the parent's state and
//! returns fresh children by value. `join` borrows the other tokens mutably
//! so the caller keeps them (now inactive) for inspection.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::identity::Id;
use crate::{Result, ThresherError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Alive,
    Inactive,
    Consumed,
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenState::Alive => "alive",
            TokenState::Inactive => "inactive",
            TokenState::Consumed => "consumed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: Id,
    pub instance_id: Id,
    pub state: TokenState,
    #[serde(default)]
    pub prevs: HashSet<Id>,
}

impl Token {
    /// Fresh alive token owned by `instance_id`
    pub fn new(instance_id: Id) -> Self {
        Token {
            id: Id::new(),
            instance_id,
            state: TokenState::Alive,
            prevs: HashSet::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == TokenState::Alive
    }

    fn ensure_alive(&self, op: &str) -> Result<()> {
        if !self.is_alive() {
            return Err(ThresherError::Token(format!(
                "cannot {} token {} in state {}",
                op,
                self.id.last(8),
                self.state
            )));
        }
        Ok(())
    }

    /// Split into `n` alive children and deactivate this token
    ///
    /// Each child references the parent and inherits its provenance.
    /// `split(0)` deactivates the parent and returns nothing.
    pub fn split(&mut self, n: usize) -> Result<Vec<Token>> {
        self.ensure_alive("split")?;
        self.state = TokenState::Inactive;
        let children = (0..n)
            .map(|_| {
                let mut prevs = self.prevs.clone();
                prevs.insert(self.id);
                Token {
                    id: Id::new(),
                    instance_id: self.instance_id,
                    state: TokenState::Alive,
                    prevs,
                }
            })
            .collect();
        Ok(children)
    }

    /// Absorb `others`: they become inactive and their provenance is merged
    pub fn join(&mut self, others: &mut [Token]) -> Result<()> {
        self.ensure_alive("join")?;
        for other in others.iter() {
            other.ensure_alive("join")?;
            if other.id == self.id {
                return Err(ThresherError::Token(format!(
                    "token {} cannot join itself",
                    self.id.last(8)
                )));
            }
        }
        for other in others.iter_mut() {
            other.state = TokenState::Inactive;
            self.prevs.insert(other.id);
            self.prevs.extend(other.prevs.iter().copied());
        }
        Ok(())
    }

    /// Final state at an end event
    pub fn consume(&mut self) {
        self.state = TokenState::Consumed;
    }

    pub fn deactivate(&mut self) {
        if self.state == TokenState::Alive {
            self.state = TokenState::Inactive;
        }
    }
}
