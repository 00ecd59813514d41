#![forbid(unsafe_code)]
//! Sparse snapshot-delta model.
//!
//! A list-snaps report describes, per `(write_snap, read_snap)` key, the
//! state of each image-relative byte interval of one object at each
//! requested snapshot boundary. The initial key `(NONE, NONE)` means
//! "state at or before the starting snapshot"; any other key means "the
//! object was written between `read_snap` and `write_snap`, read it at
//! `read_snap`".

use crate::SnapId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Translation from a source snapshot to its ordered destination
/// snapshots. The first entry is the destination snapshot corresponding
/// to the source snapshot; the remainder are the older destination
/// snapshots forming the snap context the batch is written under, newest
/// first.
pub type SnapMap = BTreeMap<SnapId, Vec<SnapId>>;

/// Key of one delta entry: the snapshot that first sees the change and
/// the snapshot to read the bytes at.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WriteReadSnapIds {
    pub write_snap: SnapId,
    pub read_snap: SnapId,
}

impl WriteReadSnapIds {
    /// The initial key: state at or before the starting snapshot.
    pub const INITIAL: Self = Self {
        write_snap: SnapId::NONE,
        read_snap: SnapId::NONE,
    };

    #[must_use]
    pub fn new(write_snap: SnapId, read_snap: SnapId) -> Self {
        Self {
            write_snap,
            read_snap,
        }
    }

    #[must_use]
    pub fn is_initial(self) -> bool {
        self == Self::INITIAL
    }
}

/// State of one delta interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentState {
    /// Bytes were written and can be read at the key's read snapshot.
    Data,
    /// Bytes were discarded (zeroed or truncated away).
    Zeroed,
    /// The region has never been materialized.
    Dne,
}

/// One image-relative interval of a delta entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaExtent {
    pub offset: u64,
    pub length: u64,
    pub state: ExtentState,
}

/// A full list-snaps report for one object: ordered, non-overlapping
/// intervals per `(write_snap, read_snap)` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    entries: BTreeMap<WriteReadSnapIds, Vec<DeltaExtent>>,
}

impl SnapshotDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record one interval under the given key, keeping the key's
    /// intervals sorted by offset. Intervals are expected not to overlap
    /// within a key; the report producer guarantees this.
    pub fn record(
        &mut self,
        key: WriteReadSnapIds,
        offset: u64,
        length: u64,
        state: ExtentState,
    ) {
        if length == 0 {
            return;
        }
        let extents = self.entries.entry(key).or_default();
        let at = extents.partition_point(|e| e.offset < offset);
        extents.insert(
            at,
            DeltaExtent {
                offset,
                length,
                state,
            },
        );
    }

    /// Iterate entries in ascending key order.
    pub fn entries(&self) -> impl Iterator<Item = (&WriteReadSnapIds, &[DeltaExtent])> {
        self.entries.iter().map(|(key, exts)| (key, exts.as_slice()))
    }

    #[must_use]
    pub fn get(&self, key: &WriteReadSnapIds) -> Option<&[DeltaExtent]> {
        self.entries.get(key).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_key() {
        assert!(WriteReadSnapIds::INITIAL.is_initial());
        assert!(!WriteReadSnapIds::new(SnapId(4), SnapId(4)).is_initial());
    }

    #[test]
    fn key_ordering_is_write_snap_major() {
        let a = WriteReadSnapIds::new(SnapId(1), SnapId(9));
        let b = WriteReadSnapIds::new(SnapId(2), SnapId(0));
        assert!(a < b);
        assert!(WriteReadSnapIds::INITIAL < a);
        assert!(b < WriteReadSnapIds::new(SnapId::HEAD, SnapId::HEAD));
    }

    #[test]
    fn record_keeps_offset_order() {
        let mut delta = SnapshotDelta::new();
        let key = WriteReadSnapIds::new(SnapId(4), SnapId(4));
        delta.record(key, 4096, 512, ExtentState::Data);
        delta.record(key, 0, 1024, ExtentState::Zeroed);
        delta.record(key, 8192, 100, ExtentState::Data);
        delta.record(key, 2048, 0, ExtentState::Data); // ignored

        let extents = delta.get(&key).unwrap();
        let offsets: Vec<u64> = extents.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 4096, 8192]);
        assert_eq!(extents[0].state, ExtentState::Zeroed);
    }

    #[test]
    fn entries_iterate_in_key_order() {
        let mut delta = SnapshotDelta::new();
        delta.record(
            WriteReadSnapIds::new(SnapId(7), SnapId(7)),
            0,
            1,
            ExtentState::Data,
        );
        delta.record(WriteReadSnapIds::INITIAL, 0, 1, ExtentState::Dne);

        let keys: Vec<WriteReadSnapIds> = delta.entries().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            vec![
                WriteReadSnapIds::INITIAL,
                WriteReadSnapIds::new(SnapId(7), SnapId(7))
            ]
        );
    }
}
