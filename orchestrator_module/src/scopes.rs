//! OAuth scope names and the per-user grant set.

use std::collections::BTreeSet;

/// Read access to the user's mailbox.
pub const GMAIL_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
/// Read/write access to the user's calendar events.
pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.events";

/// Scopes whose presence makes a user eligible for background services.
pub const WORKER_SCOPES: &[&str] = &[GMAIL_SCOPE, CALENDAR_SCOPE];

/// Set of granted scope strings.
///
/// Grants are merged, never replaced: incremental authorization only adds to
/// the set, and the only way to shrink it is [`ScopeSet::revoke`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet {
    scopes: BTreeSet<String>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the space separated `scope` field of an OAuth token response.
    pub fn from_space_separated(raw: &str) -> Self {
        raw.split_whitespace().map(str::to_string).collect()
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    pub fn insert(&mut self, scope: impl Into<String>) -> bool {
        let scope = scope.into();
        let trimmed = scope.trim();
        if trimmed.is_empty() {
            return false;
        }
        self.scopes.insert(trimmed.to_string())
    }

    /// Union-merge `other` into this set. Returns the number of new scopes.
    pub fn merge(&mut self, other: &ScopeSet) -> usize {
        let before = self.scopes.len();
        self.scopes.extend(other.scopes.iter().cloned());
        self.scopes.len() - before
    }

    pub fn revoke(&mut self, scope: &str) -> bool {
        self.scopes.remove(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(String::as_str)
    }

    pub fn to_space_separated(&self) -> String {
        self.iter().collect::<Vec<_>>().join(" ")
    }
}

impl<S: Into<String>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = ScopeSet::new();
        for scope in iter {
            set.insert(scope);
        }
        set
    }
}
