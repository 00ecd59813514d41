#![forbid(unsafe_code)]
//! In-memory reference backend.
//!
//! [`MemObjectStore`] models a snapshotted object store: each object has a
//! mutable head, a snapset sequence, and sealed clones. Writing under a
//! snap context whose sequence is ahead of the object's seals the
//! pre-write state as the clone covering the intervening snapshots, which
//! is exactly the mechanism the deep-copy engine relies on to lay down
//! history oldest-first. [`MemImageSource`] serves scripted list-snaps
//! reports and sparse per-snapshot reads; [`MemObjectMap`] records
//! object-map updates.

use crate::{
    ObjectMapState, ObjectMapUpdate, ObjectOpKind, ObjectOperation, ObjectWriter, SnapshotSource,
    SparseRead,
};
use asupersync::Cx;
use lamina_error::{LaminaError, Result};
use lamina_types::{ImageExtent, ObjectNumber, SnapId, SnapshotDelta};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::trace;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| LaminaError::Cancelled)
}

// ── Object store ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct MemObject {
    /// Current head bytes; `None` means the object does not exist.
    head: Option<Vec<u8>>,
    /// Highest snap-context sequence a write has carried.
    snapset_seq: u64,
    /// Sealed clones keyed by the sequence that sealed them. A clone at
    /// key `q` is the state visible to every snapshot in the gap below
    /// `q` not covered by an older clone.
    clones: BTreeMap<u64, Option<Vec<u8>>>,
}

impl MemObject {
    fn seal(&mut self, snap_seq: SnapId) {
        if snap_seq.0 > self.snapset_seq {
            self.clones.insert(snap_seq.0, self.head.clone());
            self.snapset_seq = snap_seq.0;
        }
    }

    fn state_at(&self, snap_id: SnapId) -> Option<Vec<u8>> {
        if snap_id.is_head() {
            return self.head.clone();
        }
        match self.clones.range(snap_id.0..).next() {
            Some((_, data)) => data.clone(),
            // unchanged since the snapshot: the head is the state
            None => self.head.clone(),
        }
    }
}

/// In-memory snapshotted object store.
#[derive(Debug, Default)]
pub struct MemObjectStore {
    objects: Mutex<BTreeMap<String, MemObject>>,
}

impl MemObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of one object as visible at `snap_id`; `None` if the object
    /// does not exist at that snapshot.
    #[must_use]
    pub fn object_at(&self, object_key: &str, snap_id: SnapId) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(object_key)
            .and_then(|obj| obj.state_at(snap_id))
    }

    #[must_use]
    pub fn snapset_seq(&self, object_key: &str) -> u64 {
        self.objects
            .lock()
            .get(object_key)
            .map_or(0, |obj| obj.snapset_seq)
    }

    /// Force an object's snapset sequence forward, as a concurrent writer
    /// racing this copy would.
    pub fn advance_snapset_seq(&self, object_key: &str, seq: u64) {
        let mut objects = self.objects.lock();
        let obj = objects.entry(object_key.to_string()).or_default();
        obj.snapset_seq = obj.snapset_seq.max(seq);
    }

    fn apply(obj: &mut MemObject, kind: &ObjectOpKind) -> Result<()> {
        match kind {
            ObjectOpKind::AssertSnapcSeqGt { .. } => Ok(()),
            ObjectOpKind::Create => {
                if obj.head.is_none() {
                    obj.head = Some(Vec::new());
                }
                Ok(())
            }
            ObjectOpKind::Write { offset, data } => {
                let head = obj.head.get_or_insert_with(Vec::new);
                let offset = usize::try_from(*offset).map_err(|_| {
                    LaminaError::Inconsistent("write offset overflows usize".to_owned())
                })?;
                let end = offset + data.len();
                if head.len() < end {
                    head.resize(end, 0);
                }
                head[offset..end].copy_from_slice(data);
                Ok(())
            }
            ObjectOpKind::Zero { offset, length } => {
                let Some(head) = obj.head.as_mut() else {
                    return Err(LaminaError::from_errno(
                        libc::ENOENT,
                        "zero on missing object",
                    ));
                };
                let start = usize::try_from(*offset).unwrap_or(usize::MAX).min(head.len());
                let end = usize::try_from(offset.saturating_add(*length))
                    .unwrap_or(usize::MAX)
                    .min(head.len());
                head[start..end].fill(0);
                Ok(())
            }
            ObjectOpKind::Truncate { offset } => {
                let Some(head) = obj.head.as_mut() else {
                    return Err(LaminaError::from_errno(
                        libc::ENOENT,
                        "truncate on missing object",
                    ));
                };
                let offset = usize::try_from(*offset).map_err(|_| {
                    LaminaError::Inconsistent("truncate offset overflows usize".to_owned())
                })?;
                head.resize(offset, 0);
                Ok(())
            }
            ObjectOpKind::Remove => {
                if obj.head.is_none() {
                    return Err(LaminaError::from_errno(
                        libc::ENOENT,
                        "remove on missing object",
                    ));
                }
                obj.head = None;
                Ok(())
            }
        }
    }
}

impl ObjectWriter for MemObjectStore {
    fn operate(
        &self,
        cx: &Cx,
        object_key: &str,
        op: &ObjectOperation,
        snap_seq: SnapId,
        snaps: &[SnapId],
    ) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut objects = self.objects.lock();
        let obj = objects.entry(object_key.to_string()).or_default();

        trace!(
            target: "lamina::store::mem",
            event = "operate",
            object_key,
            ops = op.len(),
            snap_seq = snap_seq.0,
            snaps = snaps.len()
        );

        for kind in op.ops() {
            if let ObjectOpKind::AssertSnapcSeqGt { seq } = kind {
                if seq.0 <= obj.snapset_seq {
                    return Err(LaminaError::from_errno(
                        libc::ERANGE,
                        format!(
                            "snapc seq {} not beyond snapset seq {}",
                            seq.0, obj.snapset_seq
                        ),
                    ));
                }
            }
        }

        let mut sealed = false;
        for kind in op.ops() {
            if matches!(kind, ObjectOpKind::AssertSnapcSeqGt { .. }) {
                continue;
            }
            if !sealed {
                obj.seal(snap_seq);
                sealed = true;
            }
            Self::apply(obj, kind)?;
        }
        Ok(())
    }
}

// ── Scripted source image ───────────────────────────────────────────────────

/// Sparse image-relative byte content: materialized segments only; gaps
/// are holes.
#[derive(Debug, Clone, Default)]
pub struct SparseImage {
    segments: BTreeMap<u64, Vec<u8>>,
}

impl SparseImage {
    /// Write `bytes` at `offset`, splitting any overlapped segments.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let end = offset + bytes.len() as u64;

        let mut touched: Vec<(u64, Vec<u8>)> = Vec::new();
        if let Some((&start, data)) = self.segments.range(..offset).next_back() {
            if start + data.len() as u64 > offset {
                touched.push((start, data.clone()));
            }
        }
        for (&start, data) in self.segments.range(offset..end) {
            touched.push((start, data.clone()));
        }
        for (start, data) in touched {
            self.segments.remove(&start);
            let seg_end = start + data.len() as u64;
            if start < offset {
                self.segments
                    .insert(start, data[..(offset - start) as usize].to_vec());
            }
            if seg_end > end {
                self.segments
                    .insert(end, data[(end - start) as usize..].to_vec());
            }
        }
        self.segments.insert(offset, bytes.to_vec());
    }

    /// Materialized pieces overlapping `[offset, offset + length)`, in
    /// ascending order.
    #[must_use]
    pub fn read_range(&self, offset: u64, length: u64) -> Vec<(u64, Vec<u8>)> {
        let end = offset.saturating_add(length);
        let mut out = Vec::new();

        let mut push_clipped = |start: u64, data: &[u8]| {
            let seg_end = start + data.len() as u64;
            let lo = start.max(offset);
            let hi = seg_end.min(end);
            if lo < hi {
                out.push((lo, data[(lo - start) as usize..(hi - start) as usize].to_vec()));
            }
        };

        if let Some((&start, data)) = self.segments.range(..offset).next_back() {
            push_clipped(start, data);
        }
        for (&start, data) in self.segments.range(offset..end) {
            push_clipped(start, data);
        }
        out
    }
}

/// Scripted source image: a canned list-snaps report plus per-snapshot
/// sparse content served to reads.
#[derive(Debug, Default)]
pub struct MemImageSource {
    delta: SnapshotDelta,
    snapshots: BTreeMap<SnapId, SparseImage>,
}

impl MemImageSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the report `list_snaps` will return.
    pub fn set_delta(&mut self, delta: SnapshotDelta) {
        self.delta = delta;
    }

    /// Write image-relative bytes into the content visible at `snap_id`.
    pub fn put(&mut self, snap_id: SnapId, offset: u64, bytes: &[u8]) {
        self.snapshots.entry(snap_id).or_default().write(offset, bytes);
    }

    /// Start `to`'s content as a copy of `from`'s.
    pub fn copy_snapshot(&mut self, from: SnapId, to: SnapId) {
        let image = self.snapshots.get(&from).cloned().unwrap_or_default();
        self.snapshots.insert(to, image);
    }
}

impl SnapshotSource for MemImageSource {
    fn list_snaps(
        &self,
        cx: &Cx,
        _extents: &[ImageExtent],
        snap_ids: &[SnapId],
        _flags: u32,
    ) -> Result<SnapshotDelta> {
        cx_checkpoint(cx)?;
        trace!(
            target: "lamina::store::mem",
            event = "list_snaps",
            snap_ids = snap_ids.len()
        );
        Ok(self.delta.clone())
    }

    fn read(
        &self,
        cx: &Cx,
        extents: &[ImageExtent],
        snap_id: SnapId,
        _read_flags: u32,
        _op_flags: u32,
    ) -> Result<SparseRead> {
        cx_checkpoint(cx)?;
        let image = self.snapshots.get(&snap_id).ok_or_else(|| {
            LaminaError::from_errno(libc::ENOENT, format!("no content at snap {snap_id}"))
        })?;

        let mut result = SparseRead::default();
        for extent in extents {
            for (offset, bytes) in image.read_range(extent.offset, extent.length) {
                result
                    .extent_map
                    .push(ImageExtent::new(offset, bytes.len() as u64));
                result.data.extend_from_slice(&bytes);
            }
        }
        Ok(result)
    }
}

// ── Recording object map ────────────────────────────────────────────────────

/// Object-map service that records every update it is asked to apply.
#[derive(Debug, Default)]
pub struct MemObjectMap {
    updates: Mutex<Vec<(SnapId, ObjectNumber, ObjectMapState)>>,
}

impl MemObjectMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn updates(&self) -> Vec<(SnapId, ObjectNumber, ObjectMapState)> {
        self.updates.lock().clone()
    }
}

impl ObjectMapUpdate for MemObjectMap {
    fn update(
        &self,
        snap_id: SnapId,
        object_number: ObjectNumber,
        state: ObjectMapState,
    ) -> Result<bool> {
        self.updates.lock().push((snap_id, object_number, state));
        // head updates are applied to the in-memory map, not dispatched
        Ok(!snap_id.is_head())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_types::{ExtentState, WriteReadSnapIds};

    fn cx() -> Cx {
        Cx::for_testing()
    }

    fn write_op(offset: u64, data: &[u8]) -> ObjectOperation {
        let mut op = ObjectOperation::new();
        op.write(offset, data.to_vec());
        op
    }

    #[test]
    fn write_then_read_head() {
        let store = MemObjectStore::new();
        store
            .operate(&cx(), "obj", &write_op(0, b"abc"), SnapId::NONE, &[])
            .unwrap();
        assert_eq!(store.object_at("obj", SnapId::HEAD).unwrap(), b"abc");
    }

    #[test]
    fn snap_context_write_seals_previous_state() {
        let store = MemObjectStore::new();
        store
            .operate(&cx(), "obj", &write_op(0, b"old"), SnapId::NONE, &[])
            .unwrap();
        // snapshot 5 exists; the next write carries its context and must
        // seal the pre-write state for it
        store
            .operate(&cx(), "obj", &write_op(0, b"new"), SnapId(5), &[SnapId(5)])
            .unwrap();

        assert_eq!(store.object_at("obj", SnapId(5)).unwrap(), b"old");
        assert_eq!(store.object_at("obj", SnapId::HEAD).unwrap(), b"new");
        assert_eq!(store.snapset_seq("obj"), 5);

        // a snapshot after the last sealed clone sees the head
        assert_eq!(store.object_at("obj", SnapId(9)).unwrap(), b"new");
        // a snapshot at or below the clone's seq sees the clone
        assert_eq!(store.object_at("obj", SnapId(3)).unwrap(), b"old");
    }

    #[test]
    fn remove_leaves_whiteout() {
        let store = MemObjectStore::new();
        store
            .operate(&cx(), "obj", &write_op(0, b"data"), SnapId::NONE, &[])
            .unwrap();
        let mut op = ObjectOperation::new();
        op.remove();
        store
            .operate(&cx(), "obj", &op, SnapId(7), &[SnapId(7)])
            .unwrap();

        assert_eq!(store.object_at("obj", SnapId(7)).unwrap(), b"data");
        assert!(store.object_at("obj", SnapId::HEAD).is_none());
        assert!(store.object_at("obj", SnapId(9)).is_none());
    }

    #[test]
    fn truncate_and_zero_semantics() {
        let store = MemObjectStore::new();
        store
            .operate(&cx(), "obj", &write_op(0, &[0xAA; 8]), SnapId::NONE, &[])
            .unwrap();

        let mut op = ObjectOperation::new();
        op.zero(2, 2);
        op.truncate(6);
        store.operate(&cx(), "obj", &op, SnapId::NONE, &[]).unwrap();
        assert_eq!(
            store.object_at("obj", SnapId::HEAD).unwrap(),
            vec![0xAA, 0xAA, 0, 0, 0xAA, 0xAA]
        );

        // truncate up extends with zeros
        let mut op = ObjectOperation::new();
        op.truncate(8);
        store.operate(&cx(), "obj", &op, SnapId::NONE, &[]).unwrap();
        assert_eq!(
            store.object_at("obj", SnapId::HEAD).unwrap(),
            vec![0xAA, 0xAA, 0, 0, 0xAA, 0xAA, 0, 0]
        );
    }

    #[test]
    fn mutations_on_missing_objects_fail_enoent() {
        let store = MemObjectStore::new();
        let mut op = ObjectOperation::new();
        op.remove();
        let err = store
            .operate(&cx(), "obj", &op, SnapId::NONE, &[])
            .unwrap_err();
        assert!(err.is_errno(libc::ENOENT));

        let mut op = ObjectOperation::new();
        op.truncate(16);
        let err = store
            .operate(&cx(), "obj", &op, SnapId::NONE, &[])
            .unwrap_err();
        assert!(err.is_errno(libc::ENOENT));
    }

    #[test]
    fn snapc_assertion_trips_erange() {
        let store = MemObjectStore::new();
        store.advance_snapset_seq("obj", 10);

        let mut op = ObjectOperation::new();
        op.assert_snapc_seq_gt(SnapId(10));
        op.write(0, b"x".to_vec());
        let err = store
            .operate(&cx(), "obj", &op, SnapId(10), &[SnapId(10)])
            .unwrap_err();
        assert!(err.is_errno(libc::ERANGE));
        // the batch must not have applied
        assert!(store.object_at("obj", SnapId::HEAD).is_none());

        let mut op = ObjectOperation::new();
        op.assert_snapc_seq_gt(SnapId(11));
        op.write(0, b"x".to_vec());
        store
            .operate(&cx(), "obj", &op, SnapId(11), &[SnapId(11)])
            .unwrap();
        assert_eq!(store.object_at("obj", SnapId::HEAD).unwrap(), b"x");
    }

    #[test]
    fn create_is_idempotent() {
        let store = MemObjectStore::new();
        let mut op = ObjectOperation::new();
        op.create();
        op.truncate(0);
        store.operate(&cx(), "obj", &op, SnapId::NONE, &[]).unwrap();
        assert_eq!(store.object_at("obj", SnapId::HEAD).unwrap(), Vec::<u8>::new());

        store
            .operate(&cx(), "obj", &write_op(0, b"keep"), SnapId::NONE, &[])
            .unwrap();
        let mut op = ObjectOperation::new();
        op.create();
        store.operate(&cx(), "obj", &op, SnapId::NONE, &[]).unwrap();
        assert_eq!(store.object_at("obj", SnapId::HEAD).unwrap(), b"keep");
    }

    #[test]
    fn sparse_image_write_and_read() {
        let mut image = SparseImage::default();
        image.write(100, b"hello");
        image.write(200, b"world");

        let pieces = image.read_range(0, 300);
        assert_eq!(
            pieces,
            vec![(100, b"hello".to_vec()), (200, b"world".to_vec())]
        );

        // clipping at both edges
        let pieces = image.read_range(102, 2);
        assert_eq!(pieces, vec![(102, b"ll".to_vec())]);

        // overwrite splits the underlying segment
        image.write(102, b"LL");
        let pieces = image.read_range(100, 5);
        assert_eq!(
            pieces,
            vec![
                (100, b"he".to_vec()),
                (102, b"LL".to_vec()),
                (104, b"o".to_vec())
            ]
        );
    }

    #[test]
    fn source_reads_are_sparse() {
        let mut source = MemImageSource::new();
        source.put(SnapId(4), 0, &[1, 2, 3, 4]);
        source.put(SnapId(4), 100, &[9, 9]);

        let read = source
            .read(
                &cx(),
                &[ImageExtent::new(0, 128)],
                SnapId(4),
                0,
                0,
            )
            .unwrap();
        assert_eq!(
            read.extent_map,
            vec![ImageExtent::new(0, 4), ImageExtent::new(100, 2)]
        );
        assert_eq!(read.data, vec![1, 2, 3, 4, 9, 9]);

        assert!(source
            .read(&cx(), &[ImageExtent::new(0, 8)], SnapId(5), 0, 0)
            .is_err());
    }

    #[test]
    fn scripted_delta_round_trips() {
        let mut source = MemImageSource::new();
        let mut delta = SnapshotDelta::new();
        delta.record(
            WriteReadSnapIds::new(SnapId(4), SnapId(4)),
            0,
            512,
            ExtentState::Data,
        );
        source.set_delta(delta.clone());

        let listed = source
            .list_snaps(&cx(), &[ImageExtent::new(0, 4096)], &[SnapId(4)], 0)
            .unwrap();
        assert_eq!(listed, delta);
    }

    #[test]
    fn object_map_records_and_reports_head_as_unsent() {
        let map = MemObjectMap::new();
        assert!(map
            .update(SnapId(4), ObjectNumber(1), ObjectMapState::Exists)
            .unwrap());
        assert!(!map
            .update(SnapId::HEAD, ObjectNumber(1), ObjectMapState::ExistsClean)
            .unwrap());
        assert_eq!(map.updates().len(), 2);
    }
}
