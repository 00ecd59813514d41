#![forbid(unsafe_code)]
//! Striping math: image-relative byte ranges to backing-object ranges and
//! back.
//!
//! An image is carved into stripe units of `stripe_unit` bytes, dealt
//! round-robin across `stripe_count` objects, `object_size / stripe_unit`
//! rows per object. A group of `stripe_count` objects forms one object
//! set; object sets repeat for the length of the image. The common layout
//! (`stripe_unit == object_size`, `stripe_count == 1`) degenerates to a
//! straight one-object-per-`object_size`-chunk split.

use crate::{ImageExtent, ObjectExtent, ObjectNumber};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("invalid layout field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated striping parameters for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    object_size: u64,
    stripe_unit: u64,
    stripe_count: u64,
}

impl ImageLayout {
    /// Create a layout if the parameters are consistent: `object_size` a
    /// power of two in `[4 KiB, 32 MiB]`, `stripe_unit` a non-zero divisor
    /// of `object_size`, `stripe_count >= 1`.
    pub fn new(object_size: u64, stripe_unit: u64, stripe_count: u64) -> Result<Self, LayoutError> {
        if !object_size.is_power_of_two() || !((1 << 12)..=(1 << 25)).contains(&object_size) {
            return Err(LayoutError::InvalidField {
                field: "object_size",
                reason: "must be a power of two in 4KiB..=32MiB",
            });
        }
        if stripe_unit == 0 || object_size % stripe_unit != 0 {
            return Err(LayoutError::InvalidField {
                field: "stripe_unit",
                reason: "must be a non-zero divisor of object_size",
            });
        }
        if stripe_count == 0 {
            return Err(LayoutError::InvalidField {
                field: "stripe_count",
                reason: "must be at least 1",
            });
        }
        Ok(Self {
            object_size,
            stripe_unit,
            stripe_count,
        })
    }

    /// The trivial layout: one stripe unit per object, no fan-out.
    pub fn simple(object_size: u64) -> Result<Self, LayoutError> {
        Self::new(object_size, object_size, 1)
    }

    #[must_use]
    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    #[must_use]
    pub fn stripe_unit(&self) -> u64 {
        self.stripe_unit
    }

    #[must_use]
    pub fn stripe_count(&self) -> u64 {
        self.stripe_count
    }

    #[must_use]
    fn stripes_per_object(&self) -> u64 {
        self.object_size / self.stripe_unit
    }
}

/// Map a range of one backing object to the image-relative extents it
/// backs. Contiguous image ranges are merged.
#[must_use]
pub fn extent_to_file(
    layout: &ImageLayout,
    object_number: ObjectNumber,
    offset: u64,
    length: u64,
) -> Vec<ImageExtent> {
    let su = layout.stripe_unit();
    let sc = layout.stripe_count();
    let spo = layout.stripes_per_object();
    let object_set = object_number.0 / sc;
    let stripe_pos = object_number.0 % sc;

    let end = offset.saturating_add(length).min(layout.object_size());
    let mut extents: Vec<ImageExtent> = Vec::new();
    let mut pos = offset;
    while pos < end {
        let row = pos / su;
        let intra = pos % su;
        let take = (su - intra).min(end - pos);

        let stripe_no = object_set * spo + row;
        let block_no = stripe_no * sc + stripe_pos;
        let image_offset = block_no * su + intra;

        match extents.last_mut() {
            Some(last) if last.end() == image_offset => last.length += take,
            _ => extents.push(ImageExtent::new(image_offset, take)),
        }
        pos += take;
    }
    extents
}

/// Map an image-relative range to the backing-object extents it lands on,
/// in image order. Each extent records where its bytes sit in a flat
/// buffer that starts at `buffer_offset`.
#[must_use]
pub fn file_to_extents(
    layout: &ImageLayout,
    image_offset: u64,
    image_length: u64,
    buffer_offset: u64,
) -> Vec<ObjectExtent> {
    let su = layout.stripe_unit();
    let sc = layout.stripe_count();
    let spo = layout.stripes_per_object();

    let end = image_offset.saturating_add(image_length);
    let mut extents: Vec<ObjectExtent> = Vec::new();
    let mut pos = image_offset;
    let mut buf = buffer_offset;
    while pos < end {
        let block_no = pos / su;
        let intra = pos % su;
        let take = (su - intra).min(end - pos);

        let stripe_no = block_no / sc;
        let stripe_pos = block_no % sc;
        let object_set = stripe_no / spo;
        let row = stripe_no % spo;
        let object_number = ObjectNumber(object_set * sc + stripe_pos);
        let object_off = row * su + intra;

        match extents.last_mut() {
            Some(last)
                if last.object_number == object_number
                    && last.offset + last.length == object_off
                    && last.buffer_offset + last.length == buf =>
            {
                last.length += take;
            }
            _ => extents.push(ObjectExtent {
                object_number,
                offset: object_off,
                length: take,
                buffer_offset: buf,
            }),
        }
        pos += take;
        buf += take;
    }
    extents
}

/// Number of backing objects a striped image of `image_size` bytes touches.
#[must_use]
pub fn objects_for_size(layout: &ImageLayout, image_size: u64) -> u64 {
    if image_size == 0 {
        return 0;
    }
    let su = layout.stripe_unit();
    let sc = layout.stripe_count();
    let period = layout.object_size() * sc;

    let full_sets = image_size / period;
    let remainder = image_size % period;
    let tail = if remainder == 0 {
        0
    } else if remainder >= su * sc {
        // at least one full stripe row touches every object in the set
        sc
    } else {
        remainder.div_ceil(su)
    };
    full_sets * sc + tail
}
