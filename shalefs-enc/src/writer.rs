//! The filesystem writer: compresses sealed blocks on a worker pool and
//! appends framed sections to the output stream.
//!
//! Block compression runs in parallel, but sections are always emitted in
//! block id order; the pool reorders completions internally. A byte budget
//! caps how much sealed-but-not-yet-compressed data the writer owns:
//! [`ImageWriter::write_block`] suspends the caller until enough earlier
//! blocks have passed through compression.

use std::{
    fmt,
    io::Write,
    num::NonZero,
    sync::{Arc, Condvar, Mutex},
    thread,
};

use shalefs::section::{SectionHeader, SectionKind};
use shalefs::zerocopy::IntoBytes;
use shalefs::Compression;

use crate::{
    ErrorInner, Result,
    ordered_parallel::OrderedParallel,
    progress::Progress,
    segmenter::BlockSink,
};

/// Compression selection and resource limits for an [`ImageWriter`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Codec for `BLOCK` sections.
    pub compression: Compression,
    /// Codec for the `SCHEMA` section.
    pub schema_compression: Compression,
    /// Codec for the `META` section.
    pub metadata_compression: Compression,
    /// Writer pool size.
    pub num_workers: NonZero<usize>,
    /// Budget for uncompressed bytes owned by the writer. One oversized
    /// block is always admitted, so peak usage is bounded by this limit
    /// plus one block.
    pub memory_limit: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Null,
            schema_compression: Compression::Null,
            metadata_compression: Compression::Null,
            num_workers: thread::available_parallelism()
                .unwrap_or(NonZero::new(1).expect("not zero")),
            memory_limit: 1 << 30,
        }
    }
}

/// Byte budget shared between the submitting thread and the compression
/// workers.
struct MemoryGate {
    limit: usize,
    used: Mutex<usize>,
    cond: Condvar,
}

impl MemoryGate {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Block until `n` more bytes fit in the budget. An acquisition from an
    /// empty budget always succeeds, so a single block larger than the whole
    /// limit cannot wedge the pipeline.
    fn acquire(&self, n: usize) {
        let mut used = self.used.lock().expect("not poisoned");
        while *used != 0 && *used + n > self.limit {
            used = self.cond.wait(used).expect("not poisoned");
        }
        *used += n;
    }

    fn release(&self, n: usize) {
        let mut used = self.used.lock().expect("not poisoned");
        *used -= n;
        self.cond.notify_all();
    }
}

pub struct ImageWriter<W: ?Sized> {
    pool: OrderedParallel<Result<Vec<u8>>>,
    gate: Arc<MemoryGate>,
    compression: Compression,
    schema_compression: Compression,
    metadata_compression: Compression,
    progress: Arc<Progress>,
    /// Blocks submitted so far; the id the next submitted block will get.
    block_count: u32,
    w: W,
}

impl<W: fmt::Debug + ?Sized> fmt::Debug for ImageWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageWriter")
            .field("block_count", &self.block_count)
            .field("compression", &self.compression)
            .field("w", &&self.w)
            .finish_non_exhaustive()
    }
}

impl<W: Write> ImageWriter<W> {
    pub fn new(w: W, config: &WriterConfig, progress: Arc<Progress>) -> Result<Self> {
        Ok(Self {
            pool: OrderedParallel::new("writer", config.num_workers.get())?,
            gate: Arc::new(MemoryGate::new(config.memory_limit)),
            compression: config.compression,
            schema_compression: config.schema_compression,
            metadata_compression: config.metadata_compression,
            progress,
            block_count: 0,
            w,
        })
    }

    /// The id the next submitted block will get.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Submit a sealed block for compression and emission.
    ///
    /// Suspends while the memory budget is exhausted. Any block whose
    /// compression already completed is written out before returning.
    pub fn write_block(&mut self, block: Vec<u8>) -> Result<()> {
        if self.progress.is_cancelled() {
            bail!(ErrorInner::Cancelled);
        }
        self.block_count = self
            .block_count
            .checked_add(1)
            .ok_or(ErrorInner::Limit("block count exceeds 2^32"))?;

        self.gate.acquire(block.len());
        let compression = self.compression;
        let gate = Arc::clone(&self.gate);
        let done = self.pool.submit_and_get(move || {
            let len = block.len();
            let ret = compression.compress(&block);
            drop(block);
            gate.release(len);
            ret.map_err(Into::into)
        });
        for compressed in done {
            self.emit_section(SectionKind::BLOCK, &compressed?)?;
        }
        Ok(())
    }

    fn emit_section(&mut self, kind: SectionKind, payload: &[u8]) -> Result<()> {
        let header = SectionHeader {
            kind,
            payload_size: (payload.len() as u64).into(),
        };
        self.w.write_all(header.as_bytes())?;
        self.w.write_all(payload)?;
        if kind == SectionKind::BLOCK {
            Progress::bump(&self.progress.blocks_written, 1);
        }
        Progress::bump(&self.progress.compressed_bytes, payload.len() as u64);
        Ok(())
    }

    /// Drain the remaining block compressions, then emit the schema and
    /// metadata sections and flush the stream.
    pub fn finish(mut self, schema: &[u8], metadata: &[u8]) -> Result<W>
    where
        W: Sized,
    {
        for compressed in self.pool.finish() {
            self.emit_section(SectionKind::BLOCK, &compressed?)?;
        }

        let schema_payload = self.schema_compression.compress(schema)?;
        self.emit_section(SectionKind::SCHEMA, &schema_payload)?;
        let metadata_payload = self.metadata_compression.compress(metadata)?;
        self.emit_section(SectionKind::META, &metadata_payload)?;

        self.w.flush()?;
        Ok(self.w)
    }
}

impl<W: Write> BlockSink for ImageWriter<W> {
    fn write_block(&mut self, block: Vec<u8>) -> Result<()> {
        ImageWriter::write_block(self, block)
    }
}
