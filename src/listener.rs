//! The host-facing side of the bridge.
//!
//! The tracker reports every state change of the scope tree through an
//! [`ExecutionListener`]. For each scope the calls arrive in the order
//! `dynamically_registered?`, `started`, `report_entry*`, `finished`, and
//! every started scope is finished exactly once.

use crate::outcome::Outcome;
use crate::scope::{Scope, ScopeId};

/// Receiver of test lifecycle events.
pub trait ExecutionListener {
    /// A scope started executing.
    fn started(&mut self, scope: &Scope);

    /// A scope finished with the given outcome.
    fn finished(&mut self, scope: &Scope, outcome: &Outcome);

    /// A scope unknown before the session was added to the tree.
    fn dynamically_registered(&mut self, _scope: &Scope) {}

    /// Free-form metadata attached to a running scope.
    fn report_entry(&mut self, _scope: &Scope, _key: &str, _value: &str) {}
}

impl<L: ExecutionListener + ?Sized> ExecutionListener for &mut L {
    fn started(&mut self, scope: &Scope) {
        (**self).started(scope);
    }

    fn finished(&mut self, scope: &Scope, outcome: &Outcome) {
        (**self).finished(scope, outcome);
    }

    fn dynamically_registered(&mut self, scope: &Scope) {
        (**self).dynamically_registered(scope);
    }

    fn report_entry(&mut self, scope: &Scope, key: &str, value: &str) {
        (**self).report_entry(scope, key, value);
    }
}

impl<L: ExecutionListener> ExecutionListener for Option<L> {
    fn started(&mut self, scope: &Scope) {
        if let Some(l) = self {
            l.started(scope);
        }
    }

    fn finished(&mut self, scope: &Scope, outcome: &Outcome) {
        if let Some(l) = self {
            l.finished(scope, outcome);
        }
    }

    fn dynamically_registered(&mut self, scope: &Scope) {
        if let Some(l) = self {
            l.dynamically_registered(scope);
        }
    }

    fn report_entry(&mut self, scope: &Scope, key: &str, value: &str) {
        if let Some(l) = self {
            l.report_entry(scope, key, value);
        }
    }
}

/// Fans events out to two listeners, first `A` then `B`.
impl<A: ExecutionListener, B: ExecutionListener> ExecutionListener for (A, B) {
    fn started(&mut self, scope: &Scope) {
        self.0.started(scope);
        self.1.started(scope);
    }

    fn finished(&mut self, scope: &Scope, outcome: &Outcome) {
        self.0.finished(scope, outcome);
        self.1.finished(scope, outcome);
    }

    fn dynamically_registered(&mut self, scope: &Scope) {
        self.0.dynamically_registered(scope);
        self.1.dynamically_registered(scope);
    }

    fn report_entry(&mut self, scope: &Scope, key: &str, value: &str) {
        self.0.report_entry(scope, key, value);
        self.1.report_entry(scope, key, value);
    }
}

/// A lifecycle call as seen by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Registered(ScopeId),
    Started(ScopeId),
    Finished(ScopeId, Outcome),
    ReportEntry {
        scope: ScopeId,
        key: String,
        value: String,
    },
}

/// Records every event in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    pub events: Vec<LifecycleEvent>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the `started`/`finished` events.
    pub fn lifecycle(&self) -> Vec<&LifecycleEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::Started(_) | LifecycleEvent::Finished(..)))
            .collect()
    }

    /// Outcome a scope finished with, if it finished.
    pub fn outcome_of(&self, id: &ScopeId) -> Option<&Outcome> {
        self.events.iter().find_map(|e| match e {
            LifecycleEvent::Finished(scope, outcome) if scope == id => Some(outcome),
            _ => None,
        })
    }
}

impl ExecutionListener for RecordingListener {
    fn started(&mut self, scope: &Scope) {
        self.events.push(LifecycleEvent::Started(scope.id().clone()));
    }

    fn finished(&mut self, scope: &Scope, outcome: &Outcome) {
        self.events
            .push(LifecycleEvent::Finished(scope.id().clone(), outcome.clone()));
    }

    fn dynamically_registered(&mut self, scope: &Scope) {
        self.events.push(LifecycleEvent::Registered(scope.id().clone()));
    }

    fn report_entry(&mut self, scope: &Scope, key: &str, value: &str) {
        self.events.push(LifecycleEvent::ReportEntry {
            scope: scope.id().clone(),
            key: key.to_string(),
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeTree;

    #[test]
    fn test_pair_forwards_in_order() {
        let tree = ScopeTree::new();
        let mut pair = (RecordingListener::new(), Some(RecordingListener::new()));
        pair.started(tree.root());
        pair.finished(tree.root(), &Outcome::Success);

        assert_eq!(pair.0.events, pair.1.as_ref().unwrap().events);
        assert_eq!(
            pair.0.outcome_of(&ScopeId::Run),
            Some(&Outcome::Success)
        );
    }

    #[test]
    fn test_none_is_silent() {
        let tree = ScopeTree::new();
        let mut none: Option<RecordingListener> = None;
        none.started(tree.root());
        none.report_entry(tree.root(), "k", "v");
        assert!(none.is_none());
    }
}
