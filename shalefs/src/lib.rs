//! A library for reading ShaleFS images.
//!
//! A ShaleFS image is a read-only, write-once filesystem image optimized for
//! directory trees with many near-duplicate files. It is a plain stream of
//! framed sections: zero or more `BLOCK` sections holding compressed file
//! data, one `SCHEMA` section describing the frozen metadata layout, and one
//! final `META` section holding the metadata itself.
//!
//! For writing images, check the `shalefs-enc` crate instead.
//!
//! ```no_run
//! use shalefs::{Image, StatDefaults};
//! use std::fs;
//!
//! # fn work() -> shalefs::image::Result<()> {
//! let f = fs::File::open("tree.shale")?;
//! let (index, mut image) = Image::open(f)?;
//!
//! let entry = index.find("src/lib.rs").unwrap();
//! let stat = index.getattr(&entry, &StatDefaults::current());
//! let content = image.read_file(&entry)?;
//! assert_eq!(stat.size as usize, content.len());
//! # Ok(()) }
//! ```
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

pub mod compress;
pub mod image;
pub mod metadata;
pub mod section;

pub use positioned_io;
pub use zerocopy;

pub use compress::Compression;
pub use image::{Entry, EntryKind, Image, ImageIndex, Stat, StatDefaults};

use std::{cmp::Ordering, ops::Range};

/// There is currently no binary search function in std over a generic range.
/// This is copied from std: <https://github.com/rust-lang/rust/blob/1.86.0/library/core/src/slice/mod.rs#L2817>
/// License: MIT OR Apache-2.0
fn bisect_range_by<F>(range: Range<usize>, mut f: F) -> Option<usize>
where
    F: FnMut(usize) -> Ordering,
{
    let total_size = range.end - range.start;
    let mut size = total_size;
    if size == 0 {
        return None;
    }
    let mut base = 0usize;

    while size > 1 {
        let half = size / 2;
        let mid = base + half;
        let cmp = f(mid);
        base = if cmp == Ordering::Greater { base } else { mid };
        size -= half;
    }

    let cmp = f(base);
    if cmp == Ordering::Equal {
        debug_assert!(base < total_size);
        Some(base)
    } else {
        None
    }
}
