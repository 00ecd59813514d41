#![forbid(unsafe_code)]
//! Planning: snapshot delta in, ordered mutation plan out.
//!
//! Three passes build the plan. The read planner turns the delta into a
//! minimal set of source reads, one per `(write_snap, read_snap)` key,
//! rerouting never-materialized regions to the parent image when
//! flattening. The merge pass converts sparse read results into
//! object-relative WRITE ops and derives implied zeros from the gaps the
//! source chose not to materialize. The zero synthesis pass walks
//! snapshots in ascending order tracking the object's logical end size,
//! turning zero intervals into ZERO, TRUNCATE, REMOVE, or
//! REMOVE_TRUNCATE ops and deciding the per-snapshot object-map state.

use lamina_error::{LaminaError, Result};
use lamina_store::{prune_parent_extents, ImageCtx, ObjectMapState, FEATURE_FAST_DIFF};
use lamina_types::{
    file_to_extents, ExtentState, ImageExtent, ImageLayout, IntervalSet, ObjectNumber, SnapId,
    SnapMap, SnapshotDelta, WriteReadSnapIds,
};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// One planned read against the source: the union of image intervals
/// wanted under a single delta key, and the sparse result once executed.
#[derive(Debug, Default)]
pub struct ReadOp {
    /// Image-relative intervals to request.
    pub image_interval: IntervalSet,
    /// Extents the source actually materialized (subset of the request).
    pub image_extent_map: Vec<ImageExtent>,
    /// Bytes of the materialized extents, concatenated in extent order.
    pub out_data: Vec<u8>,
}

/// One destination mutation, object-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Write { object_offset: u64, data: Vec<u8> },
    Zero { object_offset: u64, length: u64 },
    Truncate { object_offset: u64 },
    /// Ensure the object exists, then truncate: replaces parent-backed
    /// content with an explicit zero-length overlay so reads no longer
    /// fall through to the parent.
    RemoveTruncate { object_offset: u64 },
    Remove,
}

/// Accumulated planning state for one request.
#[derive(Debug, Default)]
pub struct CopyPlan {
    /// Reads keyed by delta key, ascending.
    pub read_ops: BTreeMap<WriteReadSnapIds, ReadOp>,
    /// Per source snapshot: image intervals the source materialized.
    pub data_intervals: BTreeMap<SnapId, IntervalSet>,
    /// Per source snapshot: image intervals that are logically zero.
    pub zero_intervals: BTreeMap<SnapId, IntervalSet>,
    /// Ordered mutation batches keyed by source snapshot, ascending.
    pub write_plan: BTreeMap<SnapId, Vec<WriteOp>>,
    /// Object-map state to publish per source snapshot; absent means the
    /// object does not exist at that snapshot.
    pub object_states: BTreeMap<SnapId, ObjectMapState>,
    /// Whether the destination object may exist at each destination
    /// snapshot, by object count.
    pub may_exist: BTreeMap<SnapId, bool>,
}

/// Destination snapshot a source snapshot's state lands on. The base
/// revision (`SnapId::NONE`) resolves to the destination head.
pub(crate) fn dst_primary(snap_map: &SnapMap, src_snap: SnapId) -> Result<SnapId> {
    if src_snap.is_none() {
        return Ok(SnapId::HEAD);
    }
    snap_map
        .get(&src_snap)
        .and_then(|ids| ids.first().copied())
        .ok_or(LaminaError::InvalidSnapshot(src_snap.0))
}

/// Compute, for every destination snapshot plus the head, whether the
/// destination object is allowed to exist there (object number vs. the
/// image's per-snapshot object count).
#[must_use]
pub fn compute_object_may_exist(
    dst: &ImageCtx,
    object_number: ObjectNumber,
) -> BTreeMap<SnapId, bool> {
    let mut snap_ids = dst.snaps();
    snap_ids.push(SnapId::HEAD);

    let mut may_exist = BTreeMap::new();
    for snap_id in snap_ids {
        may_exist.insert(snap_id, object_number.0 < dst.object_count(snap_id));
    }
    trace!(
        target: "lamina::copy::plan",
        event = "may_exist",
        object_number = object_number.0,
        snaps = ?may_exist
    );
    may_exist
}

/// Classify the delta into read operations.
///
/// DATA intervals become reads under their delta key. DNE intervals are
/// legal only under the initial key; when the copy starts from the
/// beginning of history and the source has a parent, they are candidates
/// for a parent read, clamped to the parent overlap at the first mapped
/// snapshot. Keys whose destination snapshot cannot hold this object are
/// skipped wholesale.
pub fn compute_read_ops(
    plan: &mut CopyPlan,
    delta: &SnapshotDelta,
    snap_map: &SnapMap,
    src: &ImageCtx,
    src_snap_id_start: SnapId,
    flatten: bool,
) -> Result<()> {
    let read_from_parent = src_snap_id_start.is_none() && src.has_parent();

    let mut only_dne_extents = true;
    let mut dne_image_interval = IntervalSet::new();

    for (key, extents) in delta.entries() {
        if !key.is_initial() {
            // don't read from snapshots the destination object cannot
            // exist at, in case the backend reports a stale snap list
            let dst_snap = dst_primary(snap_map, key.write_snap)?;
            let exists = plan
                .may_exist
                .get(&dst_snap)
                .copied()
                .ok_or_else(|| absent_existence(dst_snap))?;
            if !exists {
                debug!(
                    target: "lamina::copy::plan",
                    event = "skip_absent_snapshot",
                    write_snap = %key.write_snap
                );
                continue;
            }
        }

        for extent in extents {
            match extent.state {
                ExtentState::Dne => {
                    debug_assert!(
                        key.is_initial(),
                        "DNE extents only appear under the initial key"
                    );
                    if key.is_initial() && read_from_parent {
                        trace!(
                            target: "lamina::copy::plan",
                            event = "dne_extent",
                            offset = extent.offset,
                            length = extent.length
                        );
                        dne_image_interval.insert(extent.offset, extent.length);
                    }
                }
                ExtentState::Zeroed => only_dne_extents = false,
                ExtentState::Data => {
                    trace!(
                        target: "lamina::copy::plan",
                        event = "read_op",
                        write_snap = %key.write_snap,
                        read_snap = %key.read_snap,
                        offset = extent.offset,
                        length = extent.length
                    );
                    plan.read_ops
                        .entry(*key)
                        .or_default()
                        .image_interval
                        .insert(extent.offset, extent.length);
                    only_dne_extents = false;
                }
            }
        }
    }

    if !dne_image_interval.is_empty() && (!only_dne_extents || flatten) {
        let first_src_snap = *snap_map
            .keys()
            .next()
            .ok_or_else(|| LaminaError::Inconsistent("snap map is empty".to_owned()))?;
        let key = WriteReadSnapIds::new(first_src_snap, first_src_snap);

        match src.parent_overlap(first_src_snap) {
            Err(err) => {
                // not fatal: the regions simply stay unmaterialized
                debug!(
                    target: "lamina::copy::plan",
                    event = "parent_overlap_failed",
                    snap = %first_src_snap,
                    error = %err
                );
            }
            Ok(src_parent_overlap) => {
                trace!(
                    target: "lamina::copy::plan",
                    event = "parent_overlap",
                    overlap = src_parent_overlap
                );
                for (offset, length) in dne_image_interval.iter() {
                    let end = offset.saturating_add(length).min(src_parent_overlap);
                    if offset >= end {
                        // starts beyond the end of the parent overlap
                        continue;
                    }
                    trace!(
                        target: "lamina::copy::plan",
                        event = "parent_read_op",
                        snap = %first_src_snap,
                        offset,
                        length = end - offset
                    );
                    plan.read_ops
                        .entry(key)
                        .or_default()
                        .image_interval
                        .insert(offset, end - offset);
                }
            }
        }
    }

    Ok(())
}

/// Merge executed reads into the write plan: record materialized data
/// intervals, derive implied zeros from sparse gaps, and emit WRITE ops
/// with the read buffer sliced per object extent.
pub fn merge_write_ops(plan: &mut CopyPlan, layout: &ImageLayout) -> Result<()> {
    for (key, read_op) in &plan.read_ops {
        let src_snap = key.write_snap;

        let data_interval = plan.data_intervals.entry(src_snap).or_default();
        for extent in &read_op.image_extent_map {
            data_interval.insert(extent.offset, extent.length);
        }

        // bytes the read wanted but the source did not materialize are
        // logically zero
        let mut gaps = read_op.image_interval.clone();
        gaps.subtract(data_interval);
        for (offset, length) in gaps.iter() {
            trace!(
                target: "lamina::copy::plan",
                event = "sparse_read_zero",
                snap = %src_snap,
                offset,
                length
            );
            plan.zero_intervals
                .entry(src_snap)
                .or_default()
                .insert(offset, length);
        }

        let mut buffer_offset: u64 = 0;
        for extent in &read_op.image_extent_map {
            for object_extent in
                file_to_extents(layout, extent.offset, extent.length, buffer_offset)
            {
                let start = usize::try_from(object_extent.buffer_offset).map_err(|_| {
                    LaminaError::Inconsistent("read buffer offset overflows usize".to_owned())
                })?;
                let end = start + object_extent.length as usize;
                if end > read_op.out_data.len() {
                    return Err(LaminaError::Inconsistent(format!(
                        "read returned {} bytes, extent map wants {}",
                        read_op.out_data.len(),
                        end
                    )));
                }
                trace!(
                    target: "lamina::copy::plan",
                    event = "write_op",
                    snap = %src_snap,
                    object_offset = object_extent.offset,
                    length = object_extent.length
                );
                plan.write_plan
                    .entry(src_snap)
                    .or_default()
                    .push(WriteOp::Write {
                        object_offset: object_extent.offset,
                        data: read_op.out_data[start..end].to_vec(),
                    });
                buffer_offset += object_extent.length;
            }
        }
    }
    Ok(())
}

/// Synthesize zero/truncate/remove ops and the object-map state plan.
///
/// Walks every snapshot with planned activity in ascending order,
/// carrying the object's logical end size forward. A zero interval that
/// reaches the end of the live object shrinks it (TRUNCATE, or REMOVE at
/// offset zero) instead of writing zeros; interior intervals become ZERO
/// ops. Snapshots whose destination object may not exist get a single
/// REMOVE.
pub fn compute_zero_ops(
    plan: &mut CopyPlan,
    delta: &SnapshotDelta,
    snap_map: &SnapMap,
    src: &ImageCtx,
    dst: &ImageCtx,
    image_extents: &[ImageExtent],
    src_snap_id_start: SnapId,
) -> Result<()> {
    let mut hide_parent = src_snap_id_start.is_none() && src.has_parent();
    let layout = dst.layout();

    // collect the zeroed extents the delta reports directly
    for (key, extents) in delta.entries() {
        for extent in extents {
            if extent.state != ExtentState::Zeroed {
                continue;
            }
            if !key.is_initial() {
                plan.zero_intervals
                    .entry(key.write_snap)
                    .or_default()
                    .insert(extent.offset, extent.length);
            } else if hide_parent {
                // discards below the starting snapshot hide the parent:
                // attribute them to the first mapped snapshot
                let first_src_snap = *snap_map
                    .keys()
                    .next()
                    .ok_or_else(|| LaminaError::Inconsistent("snap map is empty".to_owned()))?;
                plan.zero_intervals
                    .entry(first_src_snap)
                    .or_default()
                    .insert(extent.offset, extent.length);
            }
        }
    }

    let fast_diff = dst.test_features(FEATURE_FAST_DIFF);
    let mut prev_end_size: u64 = 0;

    // walk every snapshot with planned activity: all mapped snapshots
    // plus any revision that carries data
    for &snap in snap_map.keys() {
        plan.zero_intervals.entry(snap).or_default();
    }
    let data_snaps: Vec<SnapId> = plan.data_intervals.keys().copied().collect();
    for snap in data_snaps {
        plan.zero_intervals.entry(snap).or_default();
    }

    let first_walked = plan.zero_intervals.keys().next().copied();
    let walk: Vec<SnapId> = plan.zero_intervals.keys().copied().collect();

    for src_snap in walk {
        // data wins over zero at the same snapshot
        let data = plan
            .data_intervals
            .get(&src_snap)
            .cloned()
            .unwrap_or_default();
        let zero_interval = {
            let interval = plan
                .zero_intervals
                .get_mut(&src_snap)
                .ok_or_else(|| LaminaError::Inconsistent("zero interval vanished".to_owned()))?;
            interval.subtract(&data);
            interval.clone()
        };

        let dst_snap = dst_primary(snap_map, src_snap)?;
        let exists = plan
            .may_exist
            .get(&dst_snap)
            .copied()
            .ok_or_else(|| absent_existence(dst_snap))?;
        if !exists && prev_end_size > 0 {
            debug!(
                target: "lamina::copy::plan",
                event = "object_absent",
                src_snap = %src_snap,
                dst_snap = %dst_snap
            );
            plan.write_plan
                .entry(src_snap)
                .or_default()
                .push(WriteOp::Remove);
            prev_end_size = 0;
            continue;
        }

        if hide_parent {
            let parent_overlap = match dst.parent_overlap(dst_snap) {
                Ok(overlap) => overlap,
                Err(err) => {
                    debug!(
                        target: "lamina::copy::plan",
                        event = "parent_overlap_failed",
                        snap = %dst_snap,
                        error = %err
                    );
                    0
                }
            };
            if parent_overlap == 0 {
                trace!(target: "lamina::copy::plan", event = "no_parent_overlap");
                hide_parent = false;
            } else {
                let mut extents = image_extents.to_vec();
                let overlap = prune_parent_extents(&mut extents, parent_overlap);
                if overlap == 0 {
                    trace!(target: "lamina::copy::plan", event = "no_parent_overlap");
                    hide_parent = false;
                } else if Some(src_snap) == first_walked {
                    prev_end_size = overlap;
                    debug_assert!(prev_end_size <= layout.object_size());
                }
            }
        }

        let mut end_size = prev_end_size;
        if let Some(ops) = plan.write_plan.get(&src_snap) {
            for op in ops {
                if let WriteOp::Write {
                    object_offset,
                    data,
                } = op
                {
                    end_size = end_size.max(object_offset + data.len() as u64);
                }
            }
        }

        trace!(
            target: "lamina::copy::plan",
            event = "zero_synthesis",
            src_snap = %src_snap,
            dst_snap = %dst_snap,
            end_size,
            prev_end_size
        );

        for (zero_offset, zero_length) in zero_interval.iter() {
            for object_extent in file_to_extents(layout, zero_offset, zero_length, 0) {
                if object_extent.offset + object_extent.length >= end_size {
                    // the zero reaches the end of the live object
                    if object_extent.offset == 0 && hide_parent {
                        plan.write_plan
                            .entry(src_snap)
                            .or_default()
                            .push(WriteOp::RemoveTruncate { object_offset: 0 });
                    } else if object_extent.offset < prev_end_size {
                        if object_extent.offset == 0 {
                            plan.write_plan
                                .entry(src_snap)
                                .or_default()
                                .push(WriteOp::Remove);
                        } else {
                            plan.write_plan
                                .entry(src_snap)
                                .or_default()
                                .push(WriteOp::Truncate {
                                    object_offset: object_extent.offset,
                                });
                        }
                    }
                    end_size = end_size.min(object_extent.offset);
                } else {
                    plan.write_plan
                        .entry(src_snap)
                        .or_default()
                        .push(WriteOp::Zero {
                            object_offset: object_extent.offset,
                            length: object_extent.length,
                        });
                }
            }
        }

        if end_size > 0 || hide_parent {
            let state = if fast_diff
                && end_size == prev_end_size
                && !plan.write_plan.contains_key(&src_snap)
            {
                ObjectMapState::ExistsClean
            } else {
                ObjectMapState::Exists
            };
            plan.object_states.insert(src_snap, state);
        }
        prev_end_size = end_size;
    }

    Ok(())
}

fn absent_existence(dst_snap: SnapId) -> LaminaError {
    LaminaError::Inconsistent(format!("no existence entry for destination snap {dst_snap}"))
}
