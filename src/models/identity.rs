// Opaque identifiers for every model and engine object

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit identifier
///
/// Equality is bitwise. [`Id::EMPTY`] denotes absence; it never names a real
/// object. Displays in the hyphenated 16-byte form, and [`Id::last`] gives a
/// short suffix that keeps log lines readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(Uuid);

impl Id {
    /// The well-known empty identifier
    pub const EMPTY: Id = Id(Uuid::nil());

    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Id(Uuid::new_v4())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    /// Last `n` characters of the display form
    ///
    /// ```rust
    /// # use thresher::Id;
    /// let id = Id::new();
    /// assert_eq!(id.last(4).len(), 4);
    /// assert!(id.to_string().ends_with(&id.last(4)));
    /// ```
    pub fn last(&self, n: usize) -> String {
        let s = self.to_string();
        let start = s.len().saturating_sub(n);
        s[start..].to_string()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::EMPTY
    }
}

impl From<Uuid> for Id {
    fn from(u: Uuid) -> Self {
        Id(u)
    }
}

impl std::str::FromStr for Id {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Id)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
