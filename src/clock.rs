//! Vector clocks over change authors.
use crate::id::ActorId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps each actor to the highest sequence number seen from it. Actors not
/// in the clock have an implied count of 0.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Clock(BTreeMap<ActorId, u64>);

impl Clock {
    /// Returns a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the associated counter for this actor.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.0.get(actor).copied().unwrap_or_default()
    }

    /// Raises the counter for this actor. Never lowers it.
    pub fn set(&mut self, actor: ActorId, seq: u64) {
        let counter = self.0.entry(actor).or_default();
        if seq > *counter {
            *counter = seq;
        }
    }

    /// Checks if `(actor, seq)` is covered.
    pub fn contains(&self, actor: &ActorId, seq: u64) -> bool {
        self.get(actor) >= seq
    }

    /// Checks if every entry of `self` is covered by `other`.
    pub fn le(&self, other: &Clock) -> bool {
        self.0.iter().all(|(actor, seq)| other.get(actor) >= *seq)
    }

    /// Merges with the other clock.
    pub fn union(&mut self, other: &Clock) {
        for (actor, seq) in &other.0 {
            self.set(actor.clone(), *seq);
        }
    }

    /// Drops the entry for this actor.
    pub fn remove(&mut self, actor: &ActorId) {
        self.0.remove(actor);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, u64)> {
        self.0.iter().map(|(actor, seq)| (actor, *seq))
    }
}

impl FromIterator<(ActorId, u64)> for Clock {
    fn from_iter<I: IntoIterator<Item = (ActorId, u64)>>(iter: I) -> Self {
        let mut clock = Clock::new();
        for (actor, seq) in iter {
            clock.set(actor, seq);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_clock() -> impl Strategy<Value = Clock> {
        prop::collection::btree_map("[a-c]", 1u64..5, 0..3).prop_map(|m| {
            m.into_iter()
                .map(|(actor, seq)| (ActorId::new(actor), seq))
                .collect()
        })
    }

    fn union(a: &Clock, b: &Clock) -> Clock {
        let mut a = a.clone();
        a.union(b);
        a
    }

    proptest! {
        #[test]
        fn union_idempotence(s1 in arb_clock()) {
            prop_assert_eq!(union(&s1, &s1), s1);
        }

        #[test]
        fn union_commutativity(s1 in arb_clock(), s2 in arb_clock()) {
            prop_assert_eq!(union(&s1, &s2), union(&s2, &s1));
        }

        #[test]
        fn union_upper_bound(s1 in arb_clock(), s2 in arb_clock()) {
            let u = union(&s1, &s2);
            prop_assert!(s1.le(&u));
            prop_assert!(s2.le(&u));
        }
    }

    #[test]
    fn set_never_lowers() {
        let mut clock = Clock::new();
        clock.set(ActorId::new("a"), 3);
        clock.set(ActorId::new("a"), 1);
        assert_eq!(clock.get(&ActorId::new("a")), 3);
    }
}
