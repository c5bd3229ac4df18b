// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted fabric and cluster rows, and the fabric lock rules.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::BTreeSet;
use std::fmt;
use strum::{Display, EnumString};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FabricId(pub i64);

impl fmt::Display for FabricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClusterId(pub i64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which kind of work currently holds a fabric.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockedFor {
    #[default]
    None,
    Switch,
    NonSwitch,
}

/// The kind of lock a dispatch asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Switch,
    NonSwitch,
}

impl LockKind {
    pub fn for_work(non_switch: bool) -> LockKind {
        if non_switch {
            LockKind::NonSwitch
        } else {
            LockKind::Switch
        }
    }
}

impl From<LockKind> for LockedFor {
    fn from(kind: LockKind) -> Self {
        match kind {
            LockKind::Switch => LockedFor::Switch,
            LockKind::NonSwitch => LockedFor::NonSwitch,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FabricLockRequest {
    Lock { kind: LockKind },
    Unlock,
}

/// Lock bookkeeping for one fabric.
///
/// Stores apply [`FabricLockState::apply`] inside whatever atomic section
/// they offer; the rules themselves live here so every store enforces the
/// same ones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricLockState {
    pub busy_clusters: Vec<ClusterId>,
    pub locked_for: LockedFor,
    pub lock_count: u32,
}

impl FabricLockState {
    /// Applies `request` for `cluster`. Returns false, leaving the state
    /// untouched, if the request is refused.
    pub fn apply(
        &mut self,
        cluster: ClusterId,
        request: FabricLockRequest,
    ) -> bool {
        match request {
            FabricLockRequest::Lock { kind } => self.try_lock(cluster, kind),
            FabricLockRequest::Unlock => self.release(cluster),
        }
    }

    pub fn try_lock(&mut self, cluster: ClusterId, kind: LockKind) -> bool {
        if self.busy_clusters.contains(&cluster)
            || self.locked_for == LockedFor::Switch
        {
            return false;
        }
        // Switch work needs the whole fabric to itself.
        if kind == LockKind::Switch
            && (self.locked_for != LockedFor::None || self.lock_count != 0)
        {
            return false;
        }
        self.busy_clusters.push(cluster);
        self.locked_for = kind.into();
        self.lock_count += 1;
        true
    }

    pub fn release(&mut self, cluster: ClusterId) -> bool {
        let Some(index) = self.busy_clusters.iter().position(|c| *c == cluster)
        else {
            return false;
        };
        self.busy_clusters.remove(index);
        if self.busy_clusters.is_empty() {
            self.locked_for = LockedFor::None;
        }
        self.lock_count = self.lock_count.saturating_sub(1);
        true
    }

    pub fn is_busy(&self) -> bool {
        !self.busy_clusters.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricRow {
    pub id: FabricId,
    pub hash: String,
    /// Set while switch work is pending for this fabric.
    pub do_switch: bool,
    pub lock: FabricLockState,
}

impl FabricRow {
    /// A row left behind by a run that died between taking and releasing
    /// the fabric: switch work flagged, nobody busy, yet a lock counted.
    pub fn is_stale(&self) -> bool {
        self.do_switch && !self.lock.is_busy() && self.lock.lock_count > 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRow {
    pub id: ClusterId,
    pub name: String,
    pub fabric_id: FabricId,
}

/// Computes the identity of a fabric from its switch hostnames.
///
/// The set is sorted and de-duplicated first, so the order the topology
/// lists switches in does not matter.
pub fn fabric_hash<I, S>(switches: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let switches: BTreeSet<String> =
        switches.into_iter().map(|s| s.as_ref().to_string()).collect();
    let mut hasher = Sha512::new();
    for (i, switch) in switches.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(switch.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::collection::size_range;
    use proptest::prelude::*;
    use test_strategy::{proptest, Arbitrary};

    #[test]
    fn switch_lock_needs_idle_fabric() {
        let mut state = FabricLockState::default();
        assert!(state.try_lock(ClusterId(1), LockKind::NonSwitch));
        assert!(state.try_lock(ClusterId(2), LockKind::NonSwitch));
        assert!(!state.try_lock(ClusterId(1), LockKind::NonSwitch));
        assert!(!state.try_lock(ClusterId(3), LockKind::Switch));
        assert_eq!(state.lock_count, 2);

        assert!(state.release(ClusterId(1)));
        assert_eq!(state.locked_for, LockedFor::NonSwitch);
        assert!(state.release(ClusterId(2)));
        assert_eq!(state.locked_for, LockedFor::None);
        assert!(!state.release(ClusterId(2)));

        assert!(state.try_lock(ClusterId(3), LockKind::Switch));
        assert!(!state.try_lock(ClusterId(1), LockKind::NonSwitch));
        assert!(!state.try_lock(ClusterId(4), LockKind::Switch));
    }

    #[test]
    fn stale_row_detection() {
        let mut row = FabricRow {
            id: FabricId(1),
            hash: String::new(),
            do_switch: true,
            lock: FabricLockState::default(),
        };
        assert!(!row.is_stale());
        row.lock.lock_count = 1;
        assert!(row.is_stale());
        row.lock.busy_clusters.push(ClusterId(7));
        assert!(!row.is_stale());
    }

    #[test]
    fn fabric_hash_ignores_order_and_duplicates() {
        let a = fabric_hash(["sw1.example.com", "sw2.example.com"]);
        let b = fabric_hash([
            "sw2.example.com",
            "sw1.example.com",
            "sw2.example.com",
        ]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        assert_ne!(a, fabric_hash(["sw1.example.com"]));
    }

    #[derive(Clone, Copy, Debug, Arbitrary)]
    enum Step {
        Lock(#[strategy(0..4i64)] i64, bool),
        Unlock(#[strategy(0..4i64)] i64),
    }

    #[proptest]
    fn never_locked_for_both_kinds(
        #[any(size_range(0..64).lift())] steps: Vec<Step>,
    ) {
        let mut state = FabricLockState::default();
        let mut holders: Vec<(ClusterId, LockKind)> = Vec::new();
        for step in steps {
            match step {
                Step::Lock(c, non_switch) => {
                    let kind = LockKind::for_work(non_switch);
                    if state.try_lock(ClusterId(c), kind) {
                        holders.push((ClusterId(c), kind));
                    }
                }
                Step::Unlock(c) => {
                    if state.release(ClusterId(c)) {
                        holders.retain(|(h, _)| *h != ClusterId(c));
                    }
                }
            }
            let switch = holders.iter().filter(|h| h.1 == LockKind::Switch);
            let non_switch =
                holders.iter().filter(|h| h.1 == LockKind::NonSwitch);
            let (switch, non_switch) = (switch.count(), non_switch.count());
            prop_assert!(switch == 0 || non_switch == 0);
            prop_assert!(switch <= 1);
            prop_assert_eq!(state.lock_count as usize, holders.len());
            prop_assert_eq!(state.busy_clusters.len(), holders.len());
        }
    }
}
