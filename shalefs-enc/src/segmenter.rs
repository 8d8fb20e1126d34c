//! The segmenting block manager.
//!
//! The segmenter owns the single active block of the image being built. File
//! bytes stream through it; runs that duplicate bytes already in the active
//! block are replaced by back-reference chunks, everything else ends up in
//! the block as literals. Candidate duplicates are found with one rolling
//! hash per configured window size, probing hash tables that map the hash of
//! a block suffix to its offset.
//!
//! Literal bytes first gather in a small pending buffer and flow into the
//! block with a lag of up to one lookup window. The lag is what backward
//! extension feeds on: when a match is found, the pending tail that
//! duplicates the bytes in front of the match source is simply dropped and
//! the match grows to cover it. A full block is sealed lazily, on the next
//! byte that needs space, so a just-filled block keeps serving matches.
//!
//! The tables only ever cover the active block. Sealing a block discards
//! them, so new matches are found in the open block only and segmenter
//! memory stays bounded by one block times the number of window sizes.
//! Cross-file deduplication falls out of adjacent files sharing the
//! still-open block, which is why feeding similar files consecutively
//! matters.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    ErrorInner, Result,
    metadata::Chunk,
    progress::Progress,
    rolling::RollingHash,
};

/// Receiver of sealed blocks, usually an
/// [`ImageWriter`][crate::writer::ImageWriter].
pub trait BlockSink {
    fn write_block(&mut self, block: Vec<u8>) -> Result<()>;
}

impl BlockSink for Vec<Vec<u8>> {
    fn write_block(&mut self, block: Vec<u8>) -> Result<()> {
        self.push(block);
        Ok(())
    }
}

/// Segmentation parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Block size exponent `S`; blocks hold at most `2^S` bytes.
    pub block_size_bits: u32,
    /// Window sizes as power-of-two exponents; the order is irrelevant,
    /// they are sorted internally. Empty disables segmentation: files are
    /// then just concatenated and sliced at block boundaries.
    pub window_size_bits: Vec<u32>,
    /// Hash table positions are registered every `W >> shift` block bytes.
    pub window_increment_shift: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size_bits: 24,
            window_size_bits: vec![17, 15, 13, 11],
            window_increment_shift: 1,
        }
    }
}

/// One window size worth of segmenter state.
struct Window {
    size: usize,
    /// Offsets are registered every `increment` block bytes.
    increment: usize,
    /// Rolling hash of the last `size` bytes appended to the block.
    block_hasher: RollingHash,
    /// Rolling hash of the last `size` input bytes of the current file.
    input_hasher: RollingHash,
    input_hash: u32,
    /// Hash of a block suffix -> offset of that suffix. The first insertion
    /// wins; the oldest instance maximizes forward extension.
    lookup: HashMap<u32, u32>,
}

impl Window {
    fn new(size_bits: u32, increment_shift: u32) -> Self {
        let size = 1usize << size_bits;
        Self {
            size,
            increment: (size >> increment_shift).max(1),
            block_hasher: RollingHash::new(size as u32),
            input_hasher: RollingHash::new(size as u32),
            input_hash: 0,
            lookup: HashMap::new(),
        }
    }
}

/// The segmenting block manager. See [module level documentation][self].
pub struct Segmenter {
    block_size: usize,
    block: Vec<u8>,
    block_id: u32,
    /// Sorted by descending window size; larger windows probe first.
    windows: Vec<Window>,
    /// Literal bytes consumed from the input but not yet moved into the
    /// block. Bounded by `pending_flush_at`.
    pending: Vec<u8>,
    /// Flush the surplus once `pending` grows past this.
    pending_flush_at: usize,
    /// Pending bytes to keep back as retraction fodder, one lookup window
    /// minus one.
    pending_keep: usize,
    progress: Arc<Progress>,
}

impl fmt::Debug for Segmenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segmenter")
            .field("block_size", &self.block_size)
            .field("block_id", &self.block_id)
            .field("block_len", &self.block.len())
            .field("pending_len", &self.pending.len())
            .field("windows", &self.windows.len())
            .finish_non_exhaustive()
    }
}

impl Segmenter {
    pub fn new(config: &Config, progress: Arc<Progress>) -> Result<Self> {
        if !shalefs::metadata::BLOCK_SIZE_BITS_RANGE.contains(&config.block_size_bits) {
            bail!(ErrorInner::Config(format!(
                "block size bits {} out of range {:?}",
                config.block_size_bits,
                shalefs::metadata::BLOCK_SIZE_BITS_RANGE,
            )));
        }
        let mut window_bits = config.window_size_bits.clone();
        window_bits.sort_unstable_by(|a, b| b.cmp(a));
        window_bits.dedup();
        if let Some(&bits) = window_bits.iter().find(|&&b| b >= config.block_size_bits) {
            bail!(ErrorInner::Config(format!(
                "window size 2^{bits} does not fit the block size 2^{}",
                config.block_size_bits,
            )));
        }

        let block_size = 1usize << config.block_size_bits;
        let lookup_window = window_bits.first().map_or(0, |&bits| 1usize << bits);
        Ok(Self {
            block_size,
            block: Vec::with_capacity(block_size),
            block_id: 0,
            windows: window_bits
                .iter()
                .map(|&bits| Window::new(bits, config.window_increment_shift))
                .collect(),
            pending: Vec::new(),
            pending_flush_at: lookup_window * 2,
            pending_keep: lookup_window.saturating_sub(1),
            progress,
        })
    }

    /// The id of the currently open block.
    #[must_use]
    pub fn active_block_id(&self) -> u32 {
        self.block_id
    }

    /// The configured block size exponent.
    #[must_use]
    pub fn block_size_bits(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    /// Add one file's bytes and return its chunk list.
    ///
    /// The returned chunks cover every input byte exactly once, in order;
    /// concatenating the referenced block slices reconstructs the file.
    /// Blocks sealed along the way are handed to `sink`, which may suspend
    /// the call for back-pressure.
    pub fn add_file(&mut self, data: &[u8], sink: &mut dyn BlockSink) -> Result<Vec<Chunk>> {
        debug_assert!(self.pending.is_empty());
        let mut chunks = Vec::new();

        if self.windows.is_empty() {
            self.add_unsegmented(data, sink, &mut chunks)?;
        } else {
            self.add_segmented(data, sink, &mut chunks)?;
            let rest = self.pending.len();
            self.flush_pending(rest, sink, &mut chunks)?;
        }

        Progress::bump(&self.progress.bytes_read, data.len() as u64);
        Ok(chunks)
    }

    /// Seal the final, partial block. Must be called exactly once, after the
    /// last file.
    pub fn finish(mut self, sink: &mut dyn BlockSink) -> Result<()> {
        debug_assert!(self.pending.is_empty());
        if !self.block.is_empty() {
            let block = std::mem::take(&mut self.block);
            sink.write_block(block)?;
        }
        Ok(())
    }

    fn add_unsegmented(
        &mut self,
        data: &[u8],
        sink: &mut dyn BlockSink,
        chunks: &mut Vec<Chunk>,
    ) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            if self.block.len() == self.block_size {
                self.seal(sink)?;
            }
            let n = (self.block_size - self.block.len()).min(rest.len());
            push_chunk(
                chunks,
                Chunk {
                    block_id: self.block_id,
                    offset: self.block.len() as u32,
                    size: n as u32,
                },
            );
            self.block.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
        }
        Ok(())
    }

    fn add_segmented(
        &mut self,
        data: &[u8],
        sink: &mut dyn BlockSink,
        chunks: &mut Vec<Chunk>,
    ) -> Result<()> {
        for w in &mut self.windows {
            w.input_hasher.reset();
            w.input_hash = 0;
        }

        let mut i = 0usize;
        while i < data.len() {
            self.update_input_hashers(data, i);

            let mut matched = None;
            for w in &self.windows {
                if i + 1 < w.size {
                    continue;
                }
                if let Some(&off) = w.lookup.get(&w.input_hash) {
                    let off = off as usize;
                    // Hashes collide; confirm bytewise before committing.
                    let win = &data[i + 1 - w.size..i + 1];
                    if self.block.get(off..off + w.size) == Some(win) {
                        matched = Some((w.size, off));
                        break;
                    }
                }
            }

            match matched {
                Some((w_size, off)) => i = self.emit_match(data, i, w_size, off, sink, chunks)?,
                None => {
                    self.pending.push(data[i]);
                    if self.pending.len() >= self.pending_flush_at {
                        let n = self.pending.len() - self.pending_keep;
                        self.flush_pending(n, sink, chunks)?;
                    }
                    i += 1;
                }
            }
        }
        Ok(())
    }

    #[inline]
    fn update_input_hashers(&mut self, data: &[u8], i: usize) {
        let b = data[i];
        for w in &mut self.windows {
            w.input_hash = if i < w.size {
                w.input_hasher.feed(b)
            } else {
                w.input_hasher.slide(data[i - w.size], b)
            };
        }
    }

    /// Move the first `n` pending bytes into the block, emitting their
    /// literal chunks and sealing filled-up blocks along the way.
    fn flush_pending(
        &mut self,
        n: usize,
        sink: &mut dyn BlockSink,
        chunks: &mut Vec<Chunk>,
    ) -> Result<()> {
        let mut flushed = 0;
        while flushed < n {
            if self.block.len() == self.block_size {
                self.seal(sink)?;
            }
            let m = (n - flushed).min(self.block_size - self.block.len());
            push_chunk(
                chunks,
                Chunk {
                    block_id: self.block_id,
                    offset: self.block.len() as u32,
                    size: m as u32,
                },
            );
            for k in flushed..flushed + m {
                let byte = self.pending[k];
                self.append_block_byte(byte);
            }
            flushed += m;
        }
        self.pending.drain(..n);
        Ok(())
    }

    /// Append one literal byte to the block and index the new suffixes.
    /// The caller has ensured there is space.
    fn append_block_byte(&mut self, byte: u8) {
        self.block.push(byte);
        let len = self.block.len();
        for w in &mut self.windows {
            match len.checked_sub(w.size + 1) {
                Some(p) => {
                    w.block_hasher.slide(self.block[p], byte);
                }
                None => {
                    w.block_hasher.feed(byte);
                }
            }
            if len >= w.size && (len - w.size) % w.increment == 0 {
                w.lookup
                    .entry(w.block_hasher.get())
                    .or_insert((len - w.size) as u32);
            }
        }
    }

    /// Turn a verified window match at input position `i` into a
    /// back-reference chunk, extending it backward over the pending literal
    /// tail and forward over further equal bytes.
    ///
    /// Returns the input position to resume from.
    fn emit_match(
        &mut self,
        data: &[u8],
        i: usize,
        w_size: usize,
        off: usize,
        sink: &mut dyn BlockSink,
        chunks: &mut Vec<Chunk>,
    ) -> Result<usize> {
        // The first `w_size - 1` bytes of the matched window are literals
        // consumed earlier. Drop the ones still pending; the match covers
        // them. Ones already flushed into the block stay covered by their
        // literal chunks and the match shrinks from the left instead.
        let retract = (w_size - 1).min(self.pending.len());
        self.pending.truncate(self.pending.len() - retract);
        let skip = (w_size - 1) - retract;
        let mut src_start = off + skip;

        // Extend backward beyond the window while the pending tail keeps
        // matching the bytes in front of the source.
        if skip == 0 {
            while src_start > 0
                && self.pending.last() == Some(&self.block[src_start - 1])
            {
                self.pending.pop();
                src_start -= 1;
            }
        }

        // Extend forward while incoming bytes keep matching the block.
        let mut j = i + 1;
        let mut src_end = off + w_size;
        while j < data.len() && src_end < self.block.len() && data[j] == self.block[src_end] {
            self.update_input_hashers(data, j);
            j += 1;
            src_end += 1;
        }

        // Literal bytes preceding the match become their own chunks. This
        // may seal the source block; the chunk below still references it by
        // its id.
        let src_block = self.block_id;
        let rest = self.pending.len();
        self.flush_pending(rest, sink, chunks)?;

        let size = (src_end - src_start) as u32;
        push_chunk(
            chunks,
            Chunk {
                block_id: src_block,
                offset: src_start as u32,
                size,
            },
        );
        Progress::bump(&self.progress.saved_bytes, u64::from(size));
        log::trace!("match: block {src_block} @{src_start}..{src_end} covering input ..{j}");

        Ok(j)
    }

    /// Hand the full active block to the sink and start a fresh one.
    /// The hash tables die with the block.
    fn seal(&mut self, sink: &mut dyn BlockSink) -> Result<()> {
        debug_assert_eq!(self.block.len(), self.block_size);
        log::debug!("sealing block {} ({} bytes)", self.block_id, self.block.len());

        let block = std::mem::replace(&mut self.block, Vec::with_capacity(self.block_size));
        sink.write_block(block)?;

        self.block_id = self
            .block_id
            .checked_add(1)
            .ok_or(ErrorInner::Limit("block count exceeds 2^32"))?;
        for w in &mut self.windows {
            w.lookup.clear();
            w.block_hasher.reset();
        }
        Ok(())
    }
}

/// Append a chunk, merging it into the previous one when they are adjacent
/// in the same block.
fn push_chunk(chunks: &mut Vec<Chunk>, c: Chunk) {
    if let Some(p) = chunks
        .last_mut()
        .filter(|p| p.block_id == c.block_id && p.offset + p.size == c.offset)
    {
        p.size += c.size;
    } else {
        chunks.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(block_bits: u32, window_bits: &[u32]) -> Config {
        Config {
            block_size_bits: block_bits,
            window_size_bits: window_bits.to_vec(),
            window_increment_shift: 1,
        }
    }

    fn new_segmenter(cfg: &Config) -> Segmenter {
        Segmenter::new(cfg, Arc::new(Progress::default())).unwrap()
    }

    /// Reconstruct one file from its chunks over the sealed blocks.
    fn reconstruct(blocks: &[Vec<u8>], chunks: &[Chunk]) -> Vec<u8> {
        let mut out = Vec::new();
        for c in chunks {
            let block = &blocks[c.block_id as usize];
            out.extend_from_slice(&block[c.offset as usize..(c.offset + c.size) as usize]);
        }
        out
    }

    fn pseudo_random(len: usize, mut state: u32) -> Vec<u8> {
        std::iter::repeat_with(|| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .take(len)
        .collect()
    }

    #[test]
    fn rejects_bad_config() {
        let progress = Arc::new(Progress::default());
        assert!(Segmenter::new(&config(8, &[]), progress.clone()).is_err());
        assert!(Segmenter::new(&config(16, &[16]), progress).is_err());
    }

    #[test]
    fn single_byte_file() {
        let mut seg = new_segmenter(&config(12, &[]));
        let mut blocks = Vec::new();
        let chunks = seg.add_file(b"A", &mut blocks).unwrap();
        seg.finish(&mut blocks).unwrap();
        assert_eq!(chunks, [Chunk { block_id: 0, offset: 0, size: 1 }]);
        assert_eq!(blocks, [b"A".to_vec()]);
    }

    #[test]
    fn unsegmented_splits_at_block_boundary() {
        let mut seg = new_segmenter(&config(12, &[]));
        let mut blocks = Vec::new();
        let data = pseudo_random(3 << 12, 1);
        let a = seg.add_file(&data[..5000], &mut blocks).unwrap();
        let b = seg.add_file(&data[5000..], &mut blocks).unwrap();
        seg.finish(&mut blocks).unwrap();

        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.len() == 1 << 12));
        assert_eq!(
            a,
            [
                Chunk { block_id: 0, offset: 0, size: 4096 },
                Chunk { block_id: 1, offset: 0, size: 904 },
            ],
        );
        assert_eq!(reconstruct(&blocks, &a), &data[..5000]);
        assert_eq!(reconstruct(&blocks, &b), &data[5000..]);
    }

    #[test]
    fn repeated_buffer_collapses() {
        // Ten copies of the same 4KiB buffer: everything after the first
        // copy must come out as back-references into block 0.
        let buf = pseudo_random(4096, 7);
        let data: Vec<u8> = std::iter::repeat_with(|| buf.iter().copied())
            .take(10)
            .flatten()
            .collect();

        let mut seg = new_segmenter(&config(20, &[11]));
        let mut blocks = Vec::new();
        let chunks = seg.add_file(&data, &mut blocks).unwrap();
        seg.finish(&mut blocks).unwrap();

        assert_eq!(blocks.len(), 1);
        // The residue is the first copy plus at most one window of slack.
        assert!(
            blocks[0].len() < 4096 + 2048,
            "block grew to {} bytes",
            blocks[0].len(),
        );
        assert_eq!(reconstruct(&blocks, &chunks), data);
        assert!(chunks.iter().skip(1).all(|c| c.block_id == 0));
    }

    #[test]
    fn identical_files_share_block_bytes() {
        let content = pseudo_random(1 << 20, 3);
        let cfg = config(20, &[17, 15, 13, 11]);
        let mut seg = new_segmenter(&cfg);
        let mut blocks = Vec::new();

        let x = seg.add_file(&content, &mut blocks).unwrap();
        let y = seg.add_file(&content, &mut blocks).unwrap();
        seg.finish(&mut blocks).unwrap();

        let total: usize = blocks.iter().map(|b| b.len()).sum();
        assert!(
            total < (1 << 20) + (1 << 17),
            "blocks hold {total} bytes for two identical 1MiB files",
        );
        assert_eq!(reconstruct(&blocks, &x), content);
        assert_eq!(reconstruct(&blocks, &y), content);
    }

    #[test]
    fn exact_copy_becomes_back_reference() {
        // Segmenter soundness: a copied region at least one lookup window
        // long becomes a back-reference, not fresh literals.
        let unique = pseudo_random(8192, 11);
        let mut data = unique.clone();
        data.extend_from_slice(&unique[1024..1024 + 4096]);

        let mut seg = new_segmenter(&config(20, &[11]));
        let mut blocks = Vec::new();
        let chunks = seg.add_file(&data, &mut blocks).unwrap();
        seg.finish(&mut blocks).unwrap();

        assert_eq!(reconstruct(&blocks, &chunks), data);
        assert!(
            blocks[0].len() < data.len(),
            "copied region was emitted as literals",
        );
        // The whole copy collapses into one chunk pointing back at the
        // literal region.
        assert!(
            chunks.contains(&Chunk { block_id: 0, offset: 1024, size: 4096 }),
            "no back-reference found: {chunks:?}",
        );
    }

    #[test]
    fn sealing_discards_match_candidates() {
        // Hash tables die at seal: content repeated after the block holding
        // its first occurrence was sealed is stored again as literals.
        let data = pseudo_random((1 << 12) + 256, 5);
        let cfg = config(12, &[11]);
        let mut seg = new_segmenter(&cfg);
        let mut blocks = Vec::new();

        let a = seg.add_file(&data, &mut blocks).unwrap();
        assert_eq!(blocks.len(), 1, "first file spills over one block");
        let b = seg.add_file(&data[..4096], &mut blocks).unwrap();
        seg.finish(&mut blocks).unwrap();

        let total: usize = blocks.iter().map(|b| b.len()).sum();
        assert_eq!(total, data.len() + 4096, "no deduplication is possible");
        assert_eq!(reconstruct(&blocks, &a), data);
        assert_eq!(reconstruct(&blocks, &b), &data[..4096]);
    }

    #[test]
    fn full_block_keeps_serving_matches() {
        // A block that filled up exactly is sealed lazily, so a file equal
        // to the block content still deduplicates against it.
        let data = pseudo_random(1 << 12, 9);
        let cfg = config(12, &[11]);
        let mut seg = new_segmenter(&cfg);
        let mut blocks = Vec::new();

        let a = seg.add_file(&data, &mut blocks).unwrap();
        assert_eq!(blocks.len(), 0, "exactly-full block stays open");
        let b = seg.add_file(&data, &mut blocks).unwrap();
        seg.finish(&mut blocks).unwrap();

        assert_eq!(blocks.len(), 1);
        assert_eq!(reconstruct(&blocks, &a), data);
        assert_eq!(reconstruct(&blocks, &b), data);
    }

    #[test]
    fn chunks_are_coalesced() {
        let mut chunks = Vec::new();
        push_chunk(&mut chunks, Chunk { block_id: 0, offset: 0, size: 10 });
        push_chunk(&mut chunks, Chunk { block_id: 0, offset: 10, size: 5 });
        push_chunk(&mut chunks, Chunk { block_id: 0, offset: 20, size: 5 });
        push_chunk(&mut chunks, Chunk { block_id: 1, offset: 25, size: 5 });
        assert_eq!(
            chunks,
            [
                Chunk { block_id: 0, offset: 0, size: 15 },
                Chunk { block_id: 0, offset: 20, size: 5 },
                Chunk { block_id: 1, offset: 25, size: 5 },
            ],
        );
    }
}
