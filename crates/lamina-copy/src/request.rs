#![forbid(unsafe_code)]
//! The one-shot copy request: a five-phase state machine that executes
//! the plan against the source and destination stores.
//!
//! Phases run in a fixed order — list-snaps, reads in key order, write
//! batches in ascending source-snapshot order, object-map updates — and
//! any failure collapses straight to completion. The completion callback
//! fires exactly once with `0` on success or a negative errno; an empty
//! write plan completes with `-ENOENT`, which the image-level caller
//! treats as "nothing to copy for this object".

use crate::plan::{
    compute_object_may_exist, compute_read_ops, compute_zero_ops, dst_primary, merge_write_ops,
    CopyPlan, WriteOp,
};
use asupersync::Cx;
use lamina_error::{LaminaError, Result};
use lamina_store::{
    AsyncOpGuard, ImageCtx, LockOpGuard, ObjectOperation, ObjectWriter, SnapshotSource,
    FEATURE_OBJECT_MAP, LIST_SNAPS_FLAG_DISABLE_LIST_FROM_PARENT, OP_FLAG_FADVISE_NOCACHE,
    OP_FLAG_FADVISE_SEQUENTIAL, READ_FLAG_DISABLE_CLIPPING,
};
use lamina_types::{
    extent_to_file, ImageExtent, ObjectNumber, SnapId, SnapMap, SnapshotDelta, WriteReadSnapIds,
};
use tracing::{debug, error, trace};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| LaminaError::Cancelled)
}

/// Progress collaborator: observes bytes read from the source.
pub trait Handler: Send + Sync {
    fn handle_read(&self, bytes_read: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyState {
    ListSnaps,
    Read,
    Write,
    UpdateMap,
    Done,
}

/// Copies one destination object, across its full snapshot history, from
/// a source image into a destination image.
///
/// Single-use: construct, then [`send`](Self::send) once. The request
/// holds non-owning references to both image contexts and participates in
/// their locking only; lifetime management is the orchestrator's concern.
pub struct ObjectCopyRequest<'a> {
    src_source: &'a dyn SnapshotSource,
    src_ctx: &'a ImageCtx,
    dst_writer: &'a dyn ObjectWriter,
    dst_ctx: &'a ImageCtx,
    src_snap_id_start: SnapId,
    snap_map: &'a SnapMap,
    object_number: ObjectNumber,
    flatten: bool,
    handler: Option<&'a dyn Handler>,
    on_finish: Option<Box<dyn FnOnce(i32) + Send + 'a>>,

    state: CopyState,
    dst_object_key: String,
    image_extents: Vec<ImageExtent>,
    snapshot_delta: SnapshotDelta,
    plan: CopyPlan,
    src_op_guard: Option<AsyncOpGuard>,
}

impl<'a> ObjectCopyRequest<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src_source: &'a dyn SnapshotSource,
        src_ctx: &'a ImageCtx,
        dst_writer: &'a dyn ObjectWriter,
        dst_ctx: &'a ImageCtx,
        src_snap_id_start: SnapId,
        dst_snap_id_start: SnapId,
        snap_map: &'a SnapMap,
        object_number: ObjectNumber,
        flatten: bool,
        handler: Option<&'a dyn Handler>,
        on_finish: Box<dyn FnOnce(i32) + Send + 'a>,
    ) -> Self {
        debug_assert!(!snap_map.is_empty());
        let dst_object_key = dst_ctx.object_name(object_number);
        debug!(
            target: "lamina::copy",
            event = "request_created",
            dst_object_key = %dst_object_key,
            src_snap_id_start = %src_snap_id_start,
            dst_snap_id_start = %dst_snap_id_start,
            flatten
        );

        let src_op_guard = src_ctx.start_async_op();
        Self {
            src_source,
            src_ctx,
            dst_writer,
            dst_ctx,
            src_snap_id_start,
            snap_map,
            object_number,
            flatten,
            handler,
            on_finish: Some(on_finish),
            state: CopyState::ListSnaps,
            dst_object_key,
            image_extents: Vec::new(),
            snapshot_delta: SnapshotDelta::new(),
            plan: CopyPlan::default(),
            src_op_guard: Some(src_op_guard),
        }
    }

    /// Drive the request to completion. The completion callback is
    /// invoked exactly once: `0` on success, a negative errno otherwise.
    pub fn send(mut self, cx: &Cx) {
        let r = match self.execute(cx) {
            Ok(()) => 0,
            Err(LaminaError::NothingToCopy) => {
                debug!(
                    target: "lamina::copy",
                    event = "nothing_to_copy",
                    dst_object_key = %self.dst_object_key
                );
                -libc::ENOENT
            }
            Err(err) => -err.to_errno(),
        };
        self.finish(r);
    }

    fn execute(&mut self, cx: &Cx) -> Result<()> {
        while self.state != CopyState::Done {
            self.state = match self.state {
                CopyState::ListSnaps => {
                    self.send_list_snaps(cx)?;
                    CopyState::Read
                }
                CopyState::Read => {
                    self.send_reads(cx)?;
                    CopyState::Write
                }
                CopyState::Write => {
                    self.build_write_plan()?;
                    self.send_writes(cx)?;
                    CopyState::UpdateMap
                }
                CopyState::UpdateMap => {
                    self.send_object_map_updates(cx)?;
                    CopyState::Done
                }
                CopyState::Done => CopyState::Done,
            };
        }
        Ok(())
    }

    fn send_list_snaps(&mut self, cx: &Cx) -> Result<()> {
        // image extents are consistent across source and destination, so
        // compute them once
        self.image_extents = extent_to_file(
            self.dst_ctx.layout(),
            self.object_number,
            0,
            self.dst_ctx.layout().object_size(),
        );

        let mut snap_ids: Vec<SnapId> = Vec::with_capacity(1 + self.snap_map.len());
        snap_ids.push(self.src_snap_id_start);
        for &src_snap_id in self.snap_map.keys() {
            if src_snap_id != snap_ids[0] {
                snap_ids.push(src_snap_id);
            }
        }

        debug!(
            target: "lamina::copy",
            event = "list_snaps",
            dst_object_key = %self.dst_object_key,
            snap_ids = snap_ids.len(),
            extents = self.image_extents.len()
        );

        self.snapshot_delta = self
            .src_source
            .list_snaps(
                cx,
                &self.image_extents,
                &snap_ids,
                LIST_SNAPS_FLAG_DISABLE_LIST_FROM_PARENT,
            )
            .map_err(|err| {
                error!(
                    target: "lamina::copy",
                    event = "list_snaps_failed",
                    error = %err
                );
                err
            })?;

        self.plan.may_exist = compute_object_may_exist(self.dst_ctx, self.object_number);
        compute_read_ops(
            &mut self.plan,
            &self.snapshot_delta,
            self.snap_map,
            self.src_ctx,
            self.src_snap_id_start,
            self.flatten,
        )
    }

    fn send_reads(&mut self, cx: &Cx) -> Result<()> {
        let keys: Vec<WriteReadSnapIds> = self.plan.read_ops.keys().copied().collect();
        let src_snap_id = self.src_ctx.current_snap_id();

        for key in keys {
            cx_checkpoint(cx)?;
            let Some(read_op) = self.plan.read_ops.get(&key) else {
                continue;
            };
            if read_op.image_interval.is_empty() {
                // nothing was written for this key (pure trunc/remove at
                // the source); the state still matters downstream
                if let Some(handler) = self.handler {
                    handler.handle_read(0);
                }
                continue;
            }

            let extents: Vec<ImageExtent> = read_op
                .image_interval
                .iter()
                .map(|(offset, length)| ImageExtent::new(offset, length))
                .collect();

            let mut read_flags = 0;
            if key.read_snap != src_snap_id {
                // the snapshot may be larger than the current head
                read_flags |= READ_FLAG_DISABLE_CLIPPING;
            }
            let op_flags = OP_FLAG_FADVISE_SEQUENTIAL | OP_FLAG_FADVISE_NOCACHE;

            debug!(
                target: "lamina::copy",
                event = "read",
                read_snap = %key.read_snap,
                extents = extents.len()
            );

            let result = self
                .src_source
                .read(cx, &extents, key.read_snap, read_flags, op_flags)
                .map_err(|err| {
                    error!(
                        target: "lamina::copy",
                        event = "read_failed",
                        read_snap = %key.read_snap,
                        error = %err
                    );
                    err
                })?;

            let bytes_read = result.data.len() as u64;
            if let Some(read_op) = self.plan.read_ops.get_mut(&key) {
                read_op.image_extent_map = result.extent_map;
                read_op.out_data = result.data;
            }
            if let Some(handler) = self.handler {
                handler.handle_read(bytes_read);
            }
        }
        Ok(())
    }

    fn build_write_plan(&mut self) -> Result<()> {
        merge_write_ops(&mut self.plan, self.dst_ctx.layout())?;
        compute_zero_ops(
            &mut self.plan,
            &self.snapshot_delta,
            self.snap_map,
            self.src_ctx,
            self.dst_ctx,
            &self.image_extents,
            self.src_snap_id_start,
        )?;

        if self.plan.write_plan.is_empty() {
            return Err(LaminaError::NothingToCopy);
        }
        Ok(())
    }

    fn send_writes(&mut self, cx: &Cx) -> Result<()> {
        let batches: Vec<SnapId> = self.plan.write_plan.keys().copied().collect();
        for src_snap in batches {
            cx_checkpoint(cx)?;
            self.send_write_batch(cx, src_snap)?;
        }
        Ok(())
    }

    fn send_write_batch(&mut self, cx: &Cx, src_snap: SnapId) -> Result<()> {
        let Some(write_ops) = self.plan.write_plan.remove(&src_snap) else {
            return Ok(());
        };

        // resolve the destination snapshot context: the batch is written
        // under the context that existed before its own snapshot was
        // taken, so the next batch seals it
        let mut dst_snaps: Vec<SnapId> = Vec::new();
        let mut dst_snap_seq = SnapId::NONE;
        if !src_snap.is_none() {
            let dst_snap_ids = self
                .snap_map
                .get(&src_snap)
                .ok_or(LaminaError::InvalidSnapshot(src_snap.0))?;
            let primary = dst_snap_ids
                .first()
                .copied()
                .ok_or_else(|| LaminaError::Inconsistent("empty snap map entry".to_owned()))?;

            let exists = self.plan.may_exist.get(&primary).copied().unwrap_or(false);
            if !exists && !write_ops.is_empty() {
                // the object cannot exist there; removal is the only
                // valid mutation
                debug!(
                    target: "lamina::copy",
                    event = "object_absent",
                    src_snap = %src_snap
                );
                debug_assert!(
                    write_ops.len() == 1 && matches!(write_ops[0], WriteOp::Remove),
                    "absent destination snapshot only admits a removal"
                );
            }

            dst_snaps = dst_snap_ids[1..].to_vec();
            if let Some(&seq) = dst_snaps.first() {
                dst_snap_seq = seq;
            }
            debug_assert!(!dst_snap_seq.is_head());
        }

        debug!(
            target: "lamina::copy",
            event = "write_batch",
            src_snap = %src_snap,
            dst_snap_seq = %dst_snap_seq,
            dst_snaps = dst_snaps.len(),
            ops = write_ops.len()
        );

        let migrating = self.dst_ctx.is_migrating();
        let mut op = ObjectOperation::new();
        if migrating {
            // detect a concurrent copier that already advanced the
            // object's snapset sequence
            op.assert_snapc_seq_gt(dst_snap_seq);
        }

        for write_op in &write_ops {
            match write_op {
                WriteOp::Write {
                    object_offset,
                    data,
                } => {
                    trace!(
                        target: "lamina::copy",
                        event = "write_op",
                        object_offset,
                        length = data.len()
                    );
                    op.write(*object_offset, data.clone());
                }
                WriteOp::Zero {
                    object_offset,
                    length,
                } => {
                    trace!(
                        target: "lamina::copy",
                        event = "zero_op",
                        object_offset,
                        length
                    );
                    op.zero(*object_offset, *length);
                }
                WriteOp::RemoveTruncate { object_offset } => {
                    trace!(
                        target: "lamina::copy",
                        event = "remove_trunc_op",
                        object_offset
                    );
                    op.create();
                    op.truncate(*object_offset);
                }
                WriteOp::Truncate { object_offset } => {
                    trace!(
                        target: "lamina::copy",
                        event = "trunc_op",
                        object_offset
                    );
                    op.truncate(*object_offset);
                }
                WriteOp::Remove => {
                    trace!(target: "lamina::copy", event = "remove_op");
                    op.remove();
                }
            }
        }

        // the migration assertion alone does not warrant a round-trip
        let baseline = usize::from(migrating);
        if op.len() == baseline {
            return Ok(());
        }

        let lock_guard = self.start_lock_op()?;
        let result = self
            .dst_writer
            .operate(cx, &self.dst_object_key, &op, dst_snap_seq, &dst_snaps);
        drop(lock_guard);

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_errno(libc::ENOENT) => {
                debug!(
                    target: "lamina::copy",
                    event = "batch_superseded",
                    src_snap = %src_snap
                );
                Ok(())
            }
            Err(err) if err.is_errno(libc::ERANGE) => {
                debug!(
                    target: "lamina::copy",
                    event = "concurrent_copy",
                    src_snap = %src_snap
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    target: "lamina::copy",
                    event = "write_failed",
                    src_snap = %src_snap,
                    error = %err
                );
                Err(err)
            }
        }
    }

    fn send_object_map_updates(&mut self, cx: &Cx) -> Result<()> {
        if !self.dst_ctx.test_features(FEATURE_OBJECT_MAP) || self.plan.object_states.is_empty() {
            return Ok(());
        }

        let states: Vec<_> = self
            .plan
            .object_states
            .iter()
            .map(|(&snap, &state)| (snap, state))
            .collect();

        for (src_snap, object_state) in states {
            cx_checkpoint(cx)?;

            let Some(object_map) = self.dst_ctx.object_map() else {
                // the exclusive lock may have been lost in the background
                error!(target: "lamina::copy", event = "object_map_missing");
                return Err(LaminaError::ObjectMapUnavailable);
            };
            let dst_snap = dst_primary(self.snap_map, src_snap)?;

            let lock_guard = self.start_lock_op()?;
            debug!(
                target: "lamina::copy",
                event = "update_object_map",
                dst_snap = %dst_snap,
                state = ?object_state
            );
            let sent = object_map
                .update(dst_snap, self.object_number, object_state)
                .map_err(|err| {
                    error!(
                        target: "lamina::copy",
                        event = "object_map_update_failed",
                        dst_snap = %dst_snap,
                        error = %err
                    );
                    err
                })?;
            drop(lock_guard);

            // an unsent update is only legal for the head revision, whose
            // map is maintained in memory
            debug_assert!(sent || dst_snap.is_head());
        }
        Ok(())
    }

    /// Acquire an exclusive-lock operation token on the destination.
    /// Images without a configured lock proceed unguarded.
    fn start_lock_op(&self) -> Result<Option<LockOpGuard>> {
        match self.dst_ctx.exclusive_lock() {
            None => Ok(None),
            Some(lock) => match lock.start_op() {
                Ok(guard) => Ok(Some(guard)),
                Err(err) => {
                    error!(target: "lamina::copy", event = "lost_exclusive_lock");
                    Err(err)
                }
            },
        }
    }

    fn finish(&mut self, r: i32) {
        // release the source-side async op before signalling completion
        self.src_op_guard.take();
        debug!(
            target: "lamina::copy",
            event = "finish",
            dst_object_key = %self.dst_object_key,
            r
        );
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(r);
        }
    }
}
