//! A library for writing [ShaleFS][shalefs] images.
//!
//! The write pipeline is: [`scanner::Scanner`] walks a source tree, orders
//! the regular files, and streams their bytes through the
//! [`segmenter::Segmenter`], which finds duplicate byte runs across files and
//! emits back-reference chunks while packing the residue into fixed-size
//! blocks. Sealed blocks go to the [`writer::ImageWriter`], which compresses
//! them on a worker pool (preserving block order) and appends framed
//! sections. At the end the [`metadata::Builder`] freezes the entry tree into
//! the parallel-vector metadata, emitted as the final two sections.
//!
//! For reading images back, check the [`shalefs`] crate.
//!
//! ## Examples
//!
//! ```no_run
//! use shalefs_enc::{
//!     metadata::Builder,
//!     progress::Progress,
//!     segmenter::{self, Segmenter},
//!     writer::{ImageWriter, WriterConfig},
//! };
//! use std::{fs, num::NonZero, sync::Arc};
//!
//! # fn work() -> shalefs_enc::Result<()> {
//! let f = fs::File::create("out.shale")?;
//! let progress = Arc::new(Progress::default());
//! let mut writer = ImageWriter::new(f, &WriterConfig::default(), progress.clone())?;
//!
//! let mut builder = Builder::new(&Default::default(), 0o755);
//! let mut segmenter = Segmenter::new(&segmenter::Config::default(), progress)?;
//!
//! let root = builder.root();
//! let chunks = segmenter.add_file(b"hello world", &mut writer)?;
//! builder.put_file(root, b"hello.txt", 0o644, chunks)?;
//!
//! segmenter.finish(&mut writer)?;
//! let (schema, meta) = builder.finish()?;
//! writer.finish(&schema, &meta)?;
//! # Ok(()) }
//! ```
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

mod error;
mod ordered_parallel;

pub mod metadata;
pub mod progress;
pub mod rewrite;
pub mod rolling;
pub mod scanner;
pub mod segmenter;
pub mod worker;
pub mod writer;

use self::error::ErrorInner;
pub use self::error::{Error, Result};
