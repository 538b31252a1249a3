use std::fmt;

use crate::store::ItemStatus;

/// A user- or system-requested move of a calendar item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Confirm,
    Reject,
    Complete,
    Dismiss,
}

impl Transition {
    pub const ALL: [Transition; 4] = [
        Transition::Confirm,
        Transition::Reject,
        Transition::Complete,
        Transition::Dismiss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Confirm => "confirm",
            Transition::Reject => "reject",
            Transition::Complete => "complete",
            Transition::Dismiss => "dismiss",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `transition` may be requested while an item is in `from`.
pub fn is_allowed(from: ItemStatus, transition: Transition) -> bool {
    use ItemStatus::*;
    use Transition::*;

    match (from, transition) {
        (Pending, Confirm | Reject | Dismiss) => true,
        (Confirmed | Synced, Complete | Dismiss) => true,
        (Pending | Confirmed | Synced, _) => false,
        (Rejected | Deleted | Dismissed | Completed, _) => false,
    }
}
