//! Refcounted active-room presence tracking.
//!
//! A connection declares which peer's conversation it currently has open.
//! The send-message path consults this to stamp a new message read at
//! creation time instead of emitting a spurious unread badge.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory map of `(viewer, peer) -> refcount`.
///
/// Multiple connections of the same user may each hold the same pair, hence
/// a refcount rather than a boolean. Each connection actor owns its single
/// declared room and releases it through [`ActiveRooms::end_viewing`] on
/// room switch or close, so a pair can never leak or go negative.
#[derive(Debug, Clone, Default)]
pub struct ActiveRooms {
    pairs: Arc<DashMap<(i64, i64), usize>>,
}

impl ActiveRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// One more connection of `viewer` has the conversation with `peer` open.
    pub fn begin_viewing(&self, viewer: i64, peer: i64) {
        *self.pairs.entry((viewer, peer)).or_insert(0) += 1;
    }

    /// One connection stopped viewing the pair. Drops the entry at zero.
    pub fn end_viewing(&self, viewer: i64, peer: i64) {
        if let Entry::Occupied(mut entry) = self.pairs.entry((viewer, peer)) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    /// True iff at least one of `viewer`'s connections has `peer`'s
    /// conversation open right now.
    pub fn is_viewing(&self, viewer: i64, peer: i64) -> bool {
        self.pairs.get(&(viewer, peer)).is_some()
    }

    /// Number of tracked pairs, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_tracks_multiple_connections() {
        let rooms = ActiveRooms::new();
        rooms.begin_viewing(1, 2);
        rooms.begin_viewing(1, 2);
        assert!(rooms.is_viewing(1, 2));

        rooms.end_viewing(1, 2);
        assert!(rooms.is_viewing(1, 2), "second tab still viewing");

        rooms.end_viewing(1, 2);
        assert!(!rooms.is_viewing(1, 2));
        assert!(rooms.is_empty(), "entry dropped at zero");
    }

    #[test]
    fn viewing_is_directional() {
        let rooms = ActiveRooms::new();
        rooms.begin_viewing(1, 2);
        assert!(rooms.is_viewing(1, 2));
        assert!(!rooms.is_viewing(2, 1));
    }

    #[test]
    fn end_viewing_without_begin_is_harmless() {
        let rooms = ActiveRooms::new();
        rooms.end_viewing(1, 2);
        assert!(!rooms.is_viewing(1, 2));
        assert!(rooms.is_empty());
    }
}
