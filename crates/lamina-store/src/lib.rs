#![forbid(unsafe_code)]
//! Object-storage client contracts consumed by the deep-copy engine.
//!
//! Defines the traits the engine drives ([`SnapshotSource`],
//! [`ObjectWriter`], [`ObjectMapUpdate`]), the shared [`ImageCtx`] image
//! state, exclusive-lock operation tokens, and async-op accounting. The
//! [`mem`] module provides an in-memory snapshotted backend implementing
//! all of the contracts.

pub mod mem;

use lamina_error::{LaminaError, Result};
use lamina_types::{
    objects_for_size, ImageExtent, ImageLayout, ObjectNumber, SnapId, SnapshotDelta,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Flags and features ──────────────────────────────────────────────────────

/// Do not traverse into the parent image when building a list-snaps
/// report; parent handling is the caller's concern.
pub const LIST_SNAPS_FLAG_DISABLE_LIST_FROM_PARENT: u32 = 1 << 0;

/// Do not clip reads to the image's current head size; snapshots may be
/// larger than the head.
pub const READ_FLAG_DISABLE_CLIPPING: u32 = 1 << 0;

/// Advisory: access pattern is sequential.
pub const OP_FLAG_FADVISE_SEQUENTIAL: u32 = 1 << 0;
/// Advisory: data will not be re-read; skip caching.
pub const OP_FLAG_FADVISE_NOCACHE: u32 = 1 << 1;

/// Image records per-snapshot object existence in an object map.
pub const FEATURE_OBJECT_MAP: u64 = 1 << 0;
/// Image records clean object states to accelerate diffing.
pub const FEATURE_FAST_DIFF: u64 = 1 << 1;

// ── Object map ──────────────────────────────────────────────────────────────

/// Per-snapshot object existence state published to an image's object map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectMapState {
    Nonexistent,
    Exists,
    Pending,
    /// Exists and is unchanged since the previous snapshot (fast-diff).
    ExistsClean,
}

/// Object-map update service of a destination image.
pub trait ObjectMapUpdate: Send + Sync + fmt::Debug {
    /// Request an object-map update. Returns whether the update was
    /// dispatched to the backend; `false` is only legal for the head
    /// revision, whose map is maintained in memory.
    fn update(
        &self,
        snap_id: SnapId,
        object_number: ObjectNumber,
        state: ObjectMapState,
    ) -> Result<bool>;
}

// ── Read and write contracts ────────────────────────────────────────────────

/// Result of a sparse snapshot read: the extents that were materialized
/// (a subset of the requested extents) and their bytes, concatenated in
/// extent order.
#[derive(Debug, Clone, Default)]
pub struct SparseRead {
    pub extent_map: Vec<ImageExtent>,
    pub data: Vec<u8>,
}

/// Source-side data path of one image: list-snaps reports and sparse
/// snapshot reads over image-relative extents.
pub trait SnapshotSource: Send + Sync {
    fn list_snaps(
        &self,
        cx: &asupersync::Cx,
        extents: &[ImageExtent],
        snap_ids: &[SnapId],
        flags: u32,
    ) -> Result<SnapshotDelta>;

    fn read(
        &self,
        cx: &asupersync::Cx,
        extents: &[ImageExtent],
        snap_id: SnapId,
        read_flags: u32,
        op_flags: u32,
    ) -> Result<SparseRead>;
}

/// One step of a composable object mutation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOpKind {
    /// Fail the batch with `ERANGE` unless `seq` is strictly greater than
    /// the object's snapset sequence.
    AssertSnapcSeqGt { seq: SnapId },
    /// Ensure the object exists (non-exclusive).
    Create,
    Write { offset: u64, data: Vec<u8> },
    Zero { offset: u64, length: u64 },
    Truncate { offset: u64 },
    Remove,
}

/// An ordered mutation batch applied atomically to one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectOperation {
    ops: Vec<ObjectOpKind>,
}

impl ObjectOperation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn ops(&self) -> &[ObjectOpKind] {
        &self.ops
    }

    pub fn assert_snapc_seq_gt(&mut self, seq: SnapId) {
        self.ops.push(ObjectOpKind::AssertSnapcSeqGt { seq });
    }

    pub fn create(&mut self) {
        self.ops.push(ObjectOpKind::Create);
    }

    pub fn write(&mut self, offset: u64, data: Vec<u8>) {
        self.ops.push(ObjectOpKind::Write { offset, data });
    }

    pub fn zero(&mut self, offset: u64, length: u64) {
        self.ops.push(ObjectOpKind::Zero { offset, length });
    }

    pub fn truncate(&mut self, offset: u64) {
        self.ops.push(ObjectOpKind::Truncate { offset });
    }

    pub fn remove(&mut self) {
        self.ops.push(ObjectOpKind::Remove);
    }
}

/// Destination-side data path: apply a mutation batch to one object under
/// a snapshot context (`snap_seq` plus the snapshot ids it covers, newest
/// first). `SnapId::NONE` as `snap_seq` means no snapshot context.
pub trait ObjectWriter: Send + Sync {
    fn operate(
        &self,
        cx: &asupersync::Cx,
        object_key: &str,
        op: &ObjectOperation,
        snap_seq: SnapId,
        snaps: &[SnapId],
    ) -> Result<()>;
}

// ── Exclusive lock and async-op accounting ──────────────────────────────────

/// Exclusive-lock state of a destination image.
///
/// Mutating operations acquire an operation token via [`start_op`]; the
/// token is released on drop. Once the lock is lost, token acquisition
/// fails and the owner must surface the loss.
///
/// [`start_op`]: ExclusiveLock::start_op
#[derive(Debug, Default)]
pub struct ExclusiveLock {
    lost: Mutex<bool>,
    active_ops: AtomicUsize,
}

impl ExclusiveLock {
    /// A held lock.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate losing the lock to another owner: subsequent
    /// [`ExclusiveLock::start_op`] calls fail.
    pub fn release(&self) {
        *self.lost.lock() = true;
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        !*self.lost.lock()
    }

    #[must_use]
    pub fn active_ops(&self) -> usize {
        self.active_ops.load(Ordering::Acquire)
    }

    pub fn start_op(self: &Arc<Self>) -> Result<LockOpGuard> {
        let lost = self.lost.lock();
        if *lost {
            return Err(LaminaError::LostExclusiveLock);
        }
        self.active_ops.fetch_add(1, Ordering::AcqRel);
        drop(lost);
        Ok(LockOpGuard {
            lock: Arc::clone(self),
        })
    }
}

/// RAII operation token for an [`ExclusiveLock`].
#[derive(Debug)]
pub struct LockOpGuard {
    lock: Arc<ExclusiveLock>,
}

impl Drop for LockOpGuard {
    fn drop(&mut self) {
        self.lock.active_ops.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counts in-flight async operations against an image so teardown can
/// wait for quiescence.
#[derive(Debug, Default)]
pub struct AsyncOpTracker {
    active: AtomicUsize,
}

impl AsyncOpTracker {
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn start_op(self: &Arc<Self>) -> AsyncOpGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        AsyncOpGuard {
            tracker: Arc::clone(self),
        }
    }
}

/// RAII token for one in-flight async operation.
#[derive(Debug)]
pub struct AsyncOpGuard {
    tracker: Arc<AsyncOpTracker>,
}

impl Drop for AsyncOpGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Image context ───────────────────────────────────────────────────────────

/// Parent (clone origin) linkage of an image: per-snapshot byte overlap
/// with the parent.
#[derive(Debug, Clone, Default)]
pub struct ParentInfo {
    pub overlap: BTreeMap<SnapId, u64>,
}

/// Mutable image state guarded by the context's lock.
#[derive(Debug, Clone)]
pub struct ImageState {
    /// Snapshot this handle reads at (`HEAD` for a writable handle).
    pub snap_id: SnapId,
    /// Snapshot ids, ascending.
    pub snaps: Vec<SnapId>,
    /// Image size per snapshot, including `HEAD`.
    pub snap_sizes: BTreeMap<SnapId, u64>,
    pub parent: Option<ParentInfo>,
    pub features: u64,
    pub migrating: bool,
    pub exclusive_lock: Option<Arc<ExclusiveLock>>,
    pub object_map: Option<Arc<dyn ObjectMapUpdate>>,
}

impl Default for ImageState {
    fn default() -> Self {
        Self {
            snap_id: SnapId::HEAD,
            snaps: Vec::new(),
            snap_sizes: BTreeMap::new(),
            parent: None,
            features: 0,
            migrating: false,
            exclusive_lock: None,
            object_map: None,
        }
    }
}

/// Shared handle state for one open image.
///
/// The copy engine holds a non-owning reference and takes the state lock
/// only while inspecting mutable fields; guards are never held across a
/// store call.
#[derive(Debug)]
pub struct ImageCtx {
    name: String,
    object_prefix: String,
    layout: ImageLayout,
    state: RwLock<ImageState>,
    async_ops: Arc<AsyncOpTracker>,
}

impl ImageCtx {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        object_prefix: impl Into<String>,
        layout: ImageLayout,
        state: ImageState,
    ) -> Self {
        Self {
            name: name.into(),
            object_prefix: object_prefix.into(),
            layout,
            state: RwLock::new(state),
            async_ops: Arc::new(AsyncOpTracker::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Backing-store key of one object of this image.
    #[must_use]
    pub fn object_name(&self, object_number: ObjectNumber) -> String {
        format!("{}.{:016x}", self.object_prefix, object_number.0)
    }

    #[must_use]
    pub fn current_snap_id(&self) -> SnapId {
        self.state.read().snap_id
    }

    #[must_use]
    pub fn snaps(&self) -> Vec<SnapId> {
        self.state.read().snaps.clone()
    }

    /// Image size at a snapshot; unknown snapshots report zero.
    #[must_use]
    pub fn image_size(&self, snap_id: SnapId) -> u64 {
        self.state
            .read()
            .snap_sizes
            .get(&snap_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of backing objects the image has at a snapshot.
    #[must_use]
    pub fn object_count(&self, snap_id: SnapId) -> u64 {
        objects_for_size(&self.layout, self.image_size(snap_id))
    }

    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.state.read().parent.is_some()
    }

    /// Byte overlap with the parent image at a snapshot. Images without a
    /// parent report zero; a parented image with no overlap recorded for
    /// the snapshot fails the lookup.
    pub fn parent_overlap(&self, snap_id: SnapId) -> Result<u64> {
        let state = self.state.read();
        match &state.parent {
            None => Ok(0),
            Some(parent) => parent
                .overlap
                .get(&snap_id)
                .copied()
                .ok_or(LaminaError::InvalidSnapshot(snap_id.0)),
        }
    }

    #[must_use]
    pub fn test_features(&self, mask: u64) -> bool {
        self.state.read().features & mask == mask
    }

    #[must_use]
    pub fn is_migrating(&self) -> bool {
        self.state.read().migrating
    }

    #[must_use]
    pub fn exclusive_lock(&self) -> Option<Arc<ExclusiveLock>> {
        self.state.read().exclusive_lock.clone()
    }

    #[must_use]
    pub fn object_map(&self) -> Option<Arc<dyn ObjectMapUpdate>> {
        self.state.read().object_map.clone()
    }

    pub fn start_async_op(&self) -> AsyncOpGuard {
        self.async_ops.start_op()
    }

    #[must_use]
    pub fn active_async_ops(&self) -> usize {
        self.async_ops.active()
    }

    /// Mutate image state in place (snapshot table changes, lock loss).
    pub fn update_state(&self, f: impl FnOnce(&mut ImageState)) {
        f(&mut self.state.write());
    }
}

/// Clip `extents` to the first `overlap` bytes of the image, dropping
/// emptied entries. Returns the number of surviving bytes.
pub fn prune_parent_extents(extents: &mut Vec<ImageExtent>, overlap: u64) -> u64 {
    extents.retain_mut(|extent| {
        if extent.offset >= overlap {
            return false;
        }
        extent.length = extent.length.min(overlap - extent.offset);
        extent.length > 0
    });
    extents.iter().map(|e| e.length).sum()
}
