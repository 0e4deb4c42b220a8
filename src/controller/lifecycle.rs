//! Per-route lifecycle
//!
//! ```text
//! Pending -> Applying -> Active -> Superseded -> Removing -> Gone
//!    ^          |          |                        |
//!    +----------+          +-------> Removing       v
//!               v                                 Failed
//!             Failed
//! ```
//!
//! An Applying route that is not confirmed in time returns to Pending for
//! another attempt. A Superseded route returns to Active when its
//! replacement fails.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoutePhase {
    Pending,
    Applying,
    Active,
    Superseded,
    Removing,
    Gone,
    Failed,
}

impl RoutePhase {
    pub fn can_transition_to(self, next: RoutePhase) -> bool {
        use RoutePhase::*;
        matches!(
            (self, next),
            (Pending, Applying)
                | (Applying, Applying)
                | (Applying, Active)
                | (Applying, Pending)
                | (Applying, Failed)
                // in-place update of a serving route
                | (Active, Applying)
                | (Active, Superseded)
                | (Active, Removing)
                | (Superseded, Removing)
                | (Superseded, Active)
                | (Removing, Gone)
                | (Removing, Failed)
                | (Failed, Applying)
                | (Failed, Removing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoutePhase::Gone | RoutePhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoutePhase::Pending => "Pending",
            RoutePhase::Applying => "Applying",
            RoutePhase::Active => "Active",
            RoutePhase::Superseded => "Superseded",
            RoutePhase::Removing => "Removing",
            RoutePhase::Gone => "Gone",
            RoutePhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for RoutePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phases of every route touched by one pass, keyed by route id
#[derive(Clone, Debug, Default)]
pub struct RouteTracker {
    phases: BTreeMap<String, RoutePhase>,
}

impl RouteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a route at `phase`
    pub fn track(&mut self, id: &str, phase: RoutePhase) {
        self.phases.insert(id.to_string(), phase);
    }

    /// Move a route to `next`; illegal transitions are refused
    pub fn advance(&mut self, id: &str, next: RoutePhase) -> bool {
        let Some(current) = self.phases.get_mut(id) else {
            warn!("Transition to {} for untracked route {}", next, id);
            return false;
        };
        if !current.can_transition_to(next) {
            warn!("Refusing transition {} -> {} for route {}", current, next, id);
            return false;
        }
        debug!("Route {}: {} -> {}", id, current, next);
        *current = next;
        true
    }

    pub fn phase(&self, id: &str) -> Option<RoutePhase> {
        self.phases.get(id).copied()
    }

    pub fn in_phase(&self, phase: RoutePhase) -> Vec<&str> {
        self.phases
            .iter()
            .filter(|(_, p)| **p == phase)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn phases(&self) -> &BTreeMap<String, RoutePhase> {
        &self.phases
    }
}
