//! Server-side area-of-interest tracking.
//!
//! Every client-controlled entity owns a sorted set of the entities within
//! the AOI radius. Sets are only recomputed for entities that moved during
//! the tick; the old and new sets are diffed with a single linear merge.
//! Membership between two tracked entities is updated on both sides in the
//! same step, so if A sees B then B sees A after every recomputation.

use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;

use crate::error::ProtocolViolation;
use crate::spatial::SpatialIndex;
use crate::world::NetworkId;

/// Default AOI radius in world units.
pub const DEFAULT_AOI_RADIUS: f32 = 50.0;

// ---------------------------------------------------------------------------
// AoiDiff
// ---------------------------------------------------------------------------

/// A `recipient` must learn about (or forget) `subject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AoiPair {
    /// Tracked entity whose client receives the notification.
    pub recipient: NetworkId,
    /// Entity the notification is about.
    pub subject: NetworkId,
}

/// One lifecycle notification, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AoiEvent {
    /// `subject` left the recipient's AOI.
    Delete(AoiPair),
    /// `subject` entered the recipient's AOI.
    Init(AoiPair),
}

/// Net AOI changes accumulated over one tick.
///
/// An init and a delete for the same pair within one tick cancel out, so a
/// recipient never sees a spurious init followed by a delete (or the other
/// way round) for one handle. Pending notifications are indexed by pair;
/// a cancelled one leaves an empty slot behind to keep emission order.
#[derive(Debug, Clone, Default)]
pub struct AoiDiff {
    deletes: Vec<Option<AoiPair>>,
    inits: Vec<Option<AoiPair>>,
    pending: FxHashMap<AoiEvent, usize>,
}

impl AoiDiff {
    /// Creates an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `recipient` must forget `subject`.
    pub fn delete(&mut self, recipient: NetworkId, subject: NetworkId) {
        let pair = AoiPair { recipient, subject };
        if let Some(slot) = self.pending.remove(&AoiEvent::Init(pair)) {
            self.inits[slot] = None;
        } else if let Entry::Vacant(entry) = self.pending.entry(AoiEvent::Delete(pair)) {
            entry.insert(self.deletes.len());
            self.deletes.push(Some(pair));
        }
    }

    /// Records that `recipient` must learn about `subject`.
    pub fn init(&mut self, recipient: NetworkId, subject: NetworkId) {
        let pair = AoiPair { recipient, subject };
        if let Some(slot) = self.pending.remove(&AoiEvent::Delete(pair)) {
            self.deletes[slot] = None;
        } else if let Entry::Vacant(entry) = self.pending.entry(AoiEvent::Init(pair)) {
            entry.insert(self.inits.len());
            self.inits.push(Some(pair));
        }
    }

    /// Pending deletes, in recording order.
    pub fn deletes(&self) -> Vec<AoiPair> {
        self.deletes.iter().flatten().copied().collect()
    }

    /// Pending inits, in recording order.
    pub fn inits(&self) -> Vec<AoiPair> {
        self.inits.iter().flatten().copied().collect()
    }

    /// Number of pending notifications.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Every delete, then every init.
    pub fn into_events(self) -> impl Iterator<Item = AoiEvent> {
        self.deletes
            .into_iter()
            .flatten()
            .map(AoiEvent::Delete)
            .chain(self.inits.into_iter().flatten().map(AoiEvent::Init))
    }
}

// ---------------------------------------------------------------------------
// Set helpers
// ---------------------------------------------------------------------------

/// Linear merge of two sorted sets: returns `(old - new, new - old)`.
pub fn sorted_difference(old: &[NetworkId], new: &[NetworkId]) -> (Vec<NetworkId>, Vec<NetworkId>) {
    let mut left = Vec::new();
    let mut entered = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            std::cmp::Ordering::Less => {
                left.push(old[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                entered.push(new[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    left.extend_from_slice(&old[i..]);
    entered.extend_from_slice(&new[j..]);
    (left, entered)
}

// ---------------------------------------------------------------------------
// AoiTracker
// ---------------------------------------------------------------------------

/// Owns every tracked entity's AOI set, plus the reverse view: for each
/// subject, the sorted tracked entities whose set contains it.
#[derive(Debug, Clone)]
pub struct AoiTracker {
    radius: f32,
    sets: FxHashMap<NetworkId, Vec<NetworkId>>,
    observers: FxHashMap<NetworkId, Vec<NetworkId>>,
}

impl AoiTracker {
    /// Creates a tracker with the given radius.
    pub fn new(radius: f32) -> Self {
        Self {
            radius,
            sets: FxHashMap::default(),
            observers: FxHashMap::default(),
        }
    }

    /// AOI radius in world units.
    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Returns `true` if `id` owns an AOI set.
    pub fn is_tracked(&self, id: NetworkId) -> bool {
        self.sets.contains_key(&id)
    }

    /// Sorted AOI set of `id`.
    pub fn aoi_of(&self, id: NetworkId) -> Option<&[NetworkId]> {
        self.sets.get(&id).map(Vec::as_slice)
    }

    /// Tracked entities whose AOI contains `subject`, sorted.
    pub fn observers_of(&self, subject: NetworkId) -> Vec<NetworkId> {
        self.observers.get(&subject).cloned().unwrap_or_default()
    }

    /// Starts tracking `id` and computes its first AOI. Must be called
    /// before any other tracked entity can see `id`.
    pub fn add_tracked(
        &mut self,
        id: NetworkId,
        index: &dyn SpatialIndex,
        diff: &mut AoiDiff,
    ) -> Result<(), ProtocolViolation> {
        if self.sets.contains_key(&id) {
            return Ok(());
        }
        self.sets.insert(id, Vec::new());
        self.update_tracked(id, index, diff)
    }

    /// Re-evaluates AOI membership after `id` moved.
    pub fn entity_moved(
        &mut self,
        id: NetworkId,
        index: &dyn SpatialIndex,
        diff: &mut AoiDiff,
    ) -> Result<(), ProtocolViolation> {
        if self.sets.contains_key(&id) {
            self.update_tracked(id, index, diff)
        } else {
            self.update_untracked(id, index, diff)
        }
    }

    /// Drops `id` from every AOI set, notifying each observer.
    pub fn remove_entity(&mut self, id: NetworkId, diff: &mut AoiDiff) -> Result<(), ProtocolViolation> {
        if let Some(own) = self.sets.get(&id).cloned() {
            for subject in own {
                self.remove_member(id, subject)?;
                if self.remove_member(subject, id)? {
                    diff.delete(subject, id);
                }
            }
            self.sets.remove(&id);
        }
        for observer in self.observers_of(id) {
            if self.remove_member(observer, id)? {
                diff.delete(observer, id);
            }
        }
        self.observers.remove(&id);
        Ok(())
    }

    /// Adds `member` to the set of `observer`. Returns `false` when
    /// `observer` is not tracked.
    fn insert_member(&mut self, observer: NetworkId, member: NetworkId) -> Result<bool, ProtocolViolation> {
        let Some(set) = self.sets.get_mut(&observer) else {
            return Ok(false);
        };
        let Err(at) = set.binary_search(&member) else {
            return Err(ProtocolViolation::AoiDesync {
                observer,
                subject: member,
                detail: "already present",
            });
        };
        set.insert(at, member);
        let observers = self.observers.entry(member).or_default();
        if let Err(at) = observers.binary_search(&observer) {
            observers.insert(at, observer);
        }
        Ok(true)
    }

    /// Removes `member` from the set of `observer`. Returns `false` when
    /// `observer` is not tracked.
    fn remove_member(&mut self, observer: NetworkId, member: NetworkId) -> Result<bool, ProtocolViolation> {
        let Some(set) = self.sets.get_mut(&observer) else {
            return Ok(false);
        };
        let Ok(at) = set.binary_search(&member) else {
            return Err(ProtocolViolation::AoiDesync {
                observer,
                subject: member,
                detail: "missing",
            });
        };
        set.remove(at);
        if let Some(observers) = self.observers.get_mut(&member) {
            if let Ok(at) = observers.binary_search(&observer) {
                observers.remove(at);
            }
            if observers.is_empty() {
                self.observers.remove(&member);
            }
        }
        Ok(true)
    }

    fn update_tracked(
        &mut self,
        id: NetworkId,
        index: &dyn SpatialIndex,
        diff: &mut AoiDiff,
    ) -> Result<(), ProtocolViolation> {
        let Some(position) = index.position_of(id) else {
            return Ok(());
        };
        let mut current = index.entities_within(position, self.radius);
        current.retain(|e| *e != id);
        current.sort_unstable();
        current.dedup();

        let old = self.sets.get(&id).cloned().unwrap_or_default();
        let (left, entered) = sorted_difference(&old, &current);

        for subject in &left {
            self.remove_member(id, *subject)?;
            diff.delete(id, *subject);
            if self.remove_member(*subject, id)? {
                diff.delete(*subject, id);
            }
        }
        for subject in &entered {
            self.insert_member(id, *subject)?;
            diff.init(id, *subject);
            if self.insert_member(*subject, id)? {
                diff.init(*subject, id);
            }
        }

        if !left.is_empty() || !entered.is_empty() {
            tracing::trace!(
                entity = id.0,
                left = left.len(),
                entered = entered.len(),
                "AOI recomputed"
            );
        }
        Ok(())
    }

    fn update_untracked(
        &mut self,
        id: NetworkId,
        index: &dyn SpatialIndex,
        diff: &mut AoiDiff,
    ) -> Result<(), ProtocolViolation> {
        let Some(position) = index.position_of(id) else {
            return Ok(());
        };
        let mut now: Vec<NetworkId> = index
            .entities_within(position, self.radius)
            .into_iter()
            .filter(|e| *e != id && self.sets.contains_key(e))
            .collect();
        now.sort_unstable();
        now.dedup();
        let before = self.observers_of(id);
        let (left, entered) = sorted_difference(&before, &now);

        for observer in left {
            if self.remove_member(observer, id)? {
                diff.delete(observer, id);
            }
        }
        for observer in entered {
            if self.insert_member(observer, id)? {
                diff.init(observer, id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{Collision, Position};
    use crate::spatial::GridSpatialIndex;

    fn place(index: &mut GridSpatialIndex, id: u64, x: f32, y: f32) {
        index.update(
            NetworkId(id),
            Collision::default().bounds_at(Position::new(x, y, 0.0)),
        );
    }

    fn pair(recipient: u64, subject: u64) -> AoiPair {
        AoiPair {
            recipient: NetworkId(recipient),
            subject: NetworkId(subject),
        }
    }

    fn assert_symmetric(tracker: &AoiTracker) {
        for (a, set) in &tracker.sets {
            assert!(!set.contains(a), "entity {a:?} is in its own AOI");
            assert!(set.windows(2).all(|w| w[0] < w[1]), "AOI set not sorted");
            for b in set {
                if let Some(other) = tracker.aoi_of(*b) {
                    assert!(other.contains(a), "{a:?} sees {b:?} but not vice versa");
                }
            }
        }
        for (subject, observers) in &tracker.observers {
            let mut scanned: Vec<NetworkId> = tracker
                .sets
                .iter()
                .filter(|(_, set)| set.contains(subject))
                .map(|(id, _)| *id)
                .collect();
            scanned.sort_unstable();
            assert_eq!(observers, &scanned, "observer index of {subject:?} out of date");
        }
        let edges: usize = tracker.sets.values().map(Vec::len).sum();
        let reverse: usize = tracker.observers.values().map(Vec::len).sum();
        assert_eq!(edges, reverse);
    }

    #[test]
    fn test_diff_reinit_after_cancel_emits_once() {
        let mut diff = AoiDiff::new();
        diff.init(NetworkId(1), NetworkId(2));
        diff.delete(NetworkId(1), NetworkId(2));
        assert!(diff.is_empty());

        diff.init(NetworkId(1), NetworkId(2));
        diff.init(NetworkId(1), NetworkId(2));
        diff.delete(NetworkId(3), NetworkId(2));
        diff.delete(NetworkId(3), NetworkId(2));
        assert_eq!(diff.len(), 2);
        let events: Vec<_> = diff.into_events().collect();
        assert_eq!(events, vec![AoiEvent::Delete(pair(3, 2)), AoiEvent::Init(pair(1, 2))]);
    }

    #[test]
    fn test_diff_keeps_recording_order_around_cancelled_slots() {
        let mut diff = AoiDiff::new();
        diff.delete(NetworkId(1), NetworkId(5));
        diff.delete(NetworkId(1), NetworkId(6));
        diff.delete(NetworkId(1), NetworkId(7));
        diff.init(NetworkId(1), NetworkId(6));
        assert_eq!(diff.deletes(), &[pair(1, 5), pair(1, 7)]);
        assert!(diff.inits().is_empty());
    }

    #[test]
    fn test_observers_of_untracked_subject_follow_moves() {
        let mut index = GridSpatialIndex::new(16.0);
        let mut tracker = AoiTracker::new(50.0);
        let mut diff = AoiDiff::new();
        place(&mut index, 1, 0.0, 0.0);
        tracker.add_tracked(NetworkId(1), &index, &mut diff).unwrap();
        place(&mut index, 2, 100.0, 0.0);
        tracker.add_tracked(NetworkId(2), &index, &mut diff).unwrap();

        place(&mut index, 40, 30.0, 0.0);
        tracker.entity_moved(NetworkId(40), &index, &mut diff).unwrap();
        assert_eq!(tracker.observers_of(NetworkId(40)), vec![NetworkId(1)]);

        place(&mut index, 40, 70.0, 0.0);
        tracker.entity_moved(NetworkId(40), &index, &mut diff).unwrap();
        assert_eq!(tracker.observers_of(NetworkId(40)), vec![NetworkId(2)]);
        assert_symmetric(&tracker);

        let mut diff = AoiDiff::new();
        index.remove(NetworkId(40));
        tracker.remove_entity(NetworkId(40), &mut diff).unwrap();
        assert_eq!(diff.deletes(), &[pair(2, 40)]);
        assert!(tracker.observers_of(NetworkId(40)).is_empty());
        assert!(!tracker.observers.contains_key(&NetworkId(40)));
    }

    #[test]
    fn test_sorted_difference_both_directions() {
        let ids = |v: &[u64]| v.iter().map(|i| NetworkId(*i)).collect::<Vec<_>>();
        let (left, entered) = sorted_difference(&ids(&[1, 3, 5, 7]), &ids(&[2, 3, 7, 9]));
        assert_eq!(left, ids(&[1, 5]));
        assert_eq!(entered, ids(&[2, 9]));
    }

    #[test]
    fn test_entering_radius_emits_exactly_one_init_each_way() {
        let mut index = GridSpatialIndex::new(16.0);
        let mut tracker = AoiTracker::new(50.0);
        let mut diff = AoiDiff::new();

        place(&mut index, 1, 0.0, 0.0);
        tracker.add_tracked(NetworkId(1), &index, &mut diff).unwrap();
        place(&mut index, 2, 51.0, 0.0);
        tracker.add_tracked(NetworkId(2), &index, &mut diff).unwrap();
        assert!(diff.is_empty());

        place(&mut index, 2, 50.0, 0.0);
        tracker.entity_moved(NetworkId(2), &index, &mut diff).unwrap();

        assert!(diff.deletes().is_empty());
        assert_eq!(diff.inits(), &[pair(2, 1), pair(1, 2)]);
        assert_symmetric(&tracker);
    }

    #[test]
    fn test_leaving_radius_deletes_both_ways() {
        let mut index = GridSpatialIndex::new(16.0);
        let mut tracker = AoiTracker::new(50.0);
        let mut diff = AoiDiff::new();
        place(&mut index, 1, 0.0, 0.0);
        tracker.add_tracked(NetworkId(1), &index, &mut diff).unwrap();
        place(&mut index, 2, 10.0, 0.0);
        tracker.add_tracked(NetworkId(2), &index, &mut diff).unwrap();

        let mut diff = AoiDiff::new();
        place(&mut index, 1, -80.0, 0.0);
        tracker.entity_moved(NetworkId(1), &index, &mut diff).unwrap();
        assert_eq!(diff.deletes(), &[pair(1, 2), pair(2, 1)]);
        assert!(tracker.aoi_of(NetworkId(2)).unwrap().is_empty());
    }

    #[test]
    fn test_untracked_entity_only_notifies_observers() {
        let mut index = GridSpatialIndex::new(16.0);
        let mut tracker = AoiTracker::new(50.0);
        let mut diff = AoiDiff::new();
        place(&mut index, 1, 0.0, 0.0);
        tracker.add_tracked(NetworkId(1), &index, &mut diff).unwrap();

        place(&mut index, 40, 30.0, 0.0);
        tracker.entity_moved(NetworkId(40), &index, &mut diff).unwrap();
        assert_eq!(diff.inits(), &[pair(1, 40)]);
        assert!(!tracker.is_tracked(NetworkId(40)));
        assert_eq!(tracker.observers_of(NetworkId(40)), vec![NetworkId(1)]);
    }

    #[test]
    fn test_leave_and_return_in_one_tick_cancels() {
        let mut index = GridSpatialIndex::new(16.0);
        let mut tracker = AoiTracker::new(50.0);
        let mut diff = AoiDiff::new();
        place(&mut index, 1, 0.0, 0.0);
        tracker.add_tracked(NetworkId(1), &index, &mut diff).unwrap();
        place(&mut index, 2, 40.0, 0.0);
        tracker.add_tracked(NetworkId(2), &index, &mut diff).unwrap();

        let mut diff = AoiDiff::new();
        place(&mut index, 1, -20.0, 0.0);
        tracker.entity_moved(NetworkId(1), &index, &mut diff).unwrap();
        place(&mut index, 2, 25.0, 0.0);
        tracker.entity_moved(NetworkId(2), &index, &mut diff).unwrap();
        assert!(diff.is_empty());
        assert_symmetric(&tracker);
    }

    #[test]
    fn test_missing_member_is_desync() {
        let mut index = GridSpatialIndex::new(16.0);
        let mut tracker = AoiTracker::new(50.0);
        let mut diff = AoiDiff::new();
        place(&mut index, 1, 0.0, 0.0);
        tracker.add_tracked(NetworkId(1), &index, &mut diff).unwrap();
        place(&mut index, 2, 10.0, 0.0);
        tracker.add_tracked(NetworkId(2), &index, &mut diff).unwrap();

        tracker.sets.get_mut(&NetworkId(2)).unwrap().clear();
        place(&mut index, 1, 500.0, 0.0);
        let err = tracker
            .entity_moved(NetworkId(1), &index, &mut diff)
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::AoiDesync {
                observer: NetworkId(2),
                subject: NetworkId(1),
                detail: "missing",
            }
        );
    }

    #[test]
    fn test_remove_entity_notifies_every_observer() {
        let mut index = GridSpatialIndex::new(16.0);
        let mut tracker = AoiTracker::new(50.0);
        let mut diff = AoiDiff::new();
        for (id, x) in [(1, 0.0), (2, 5.0), (3, 10.0)] {
            place(&mut index, id, x, 0.0);
            tracker.add_tracked(NetworkId(id), &index, &mut diff).unwrap();
        }

        let mut diff = AoiDiff::new();
        index.remove(NetworkId(2));
        tracker.remove_entity(NetworkId(2), &mut diff).unwrap();
        assert_eq!(diff.deletes(), &[pair(1, 2), pair(3, 2)]);
        assert!(tracker.observers_of(NetworkId(2)).is_empty());
        assert_symmetric(&tracker);
    }

    #[test]
    fn test_symmetry_holds_under_random_walks() {
        let mut index = GridSpatialIndex::new(8.0);
        let mut tracker = AoiTracker::new(20.0);
        let mut diff = AoiDiff::new();
        let mut positions: Vec<(f32, f32)> = (0..12).map(|i| (i as f32 * 7.0, 0.0)).collect();
        for (i, (x, y)) in positions.iter().enumerate() {
            place(&mut index, i as u64, *x, *y);
            tracker.add_tracked(NetworkId(i as u64), &index, &mut diff).unwrap();
        }
        assert_symmetric(&tracker);

        // Deterministic LCG walk.
        let mut seed: u32 = 12345;
        let mut rand = move || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            ((seed >> 16) % 11) as f32 - 5.0
        };
        for _ in 0..200 {
            let mut diff = AoiDiff::new();
            for (i, pos) in positions.iter_mut().enumerate() {
                if i % 3 == 0 {
                    continue;
                }
                pos.0 += rand();
                pos.1 += rand();
                place(&mut index, i as u64, pos.0, pos.1);
                tracker.entity_moved(NetworkId(i as u64), &index, &mut diff).unwrap();
            }
            assert_symmetric(&tracker);
        }
    }
}
