//! The frozen metadata structures of a ShaleFS image.
//!
//! The metadata is a set of parallel vectors of fixed-size little-endian
//! records, concatenated into the `META` section payload. The `SCHEMA`
//! section holds a single fixed [`Schema`] struct recording the byte range of
//! every vector plus a few image-wide scalars. A reader navigates purely by
//! integer indices into these vectors; nothing is materialized or unpacked.
//!
//! [`Metadata::parse`] validates every structural invariant up front so that
//! all later accesses can index without checks:
//!
//! - `entry_index` is a permutation of `[0, N)` and `entries[entry_index[i]]`
//!   has inode `i`.
//! - inodes are grouped by kind: directories first (root is inode 0), then
//!   symlinks, then regular files, then other entries.
//! - each directory's children occupy a contiguous run of `entries`, strictly
//!   ascending by name bytes.
//! - `chunk_index` is a non-decreasing CSR table and every chunk lies within
//!   its block.

use std::fmt;

use bstr::BStr;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, little_endian as le};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from parsing or validating the metadata.
#[derive(Debug)]
pub struct Error(Box<str>);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed metadata: {}", self.0)
    }
}

impl std::error::Error for Error {}

trait BoolExt {
    fn or_context(self, msg: &'static str) -> Result<()>;
}
impl BoolExt for bool {
    #[inline]
    fn or_context(self, msg: &'static str) -> Result<()> {
        if self {
            Ok(())
        } else {
            Err(Error(msg.into()))
        }
    }
}

trait OptionExt<T> {
    fn context(self, msg: &'static str) -> Result<T>;
}
impl<T> OptionExt<T> for Option<T> {
    #[inline]
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(Error(msg.into())),
        }
    }
}

/// The magic-and-version marker leading the schema.
pub const SCHEMA_MAGIC: [u8; 8] = *b"SHALEFS1";

/// Inclusive range of valid block size exponents.
pub const BLOCK_SIZE_BITS_RANGE: std::ops::RangeInclusive<u32> = 12..=28;

/// Schema flag: the image stores a whole-image owner (uid) override.
pub const SCHEMA_FLAG_OWNER: u32 = 1 << 0;
/// Schema flag: the image stores a whole-image group (gid) override.
pub const SCHEMA_FLAG_GROUP: u32 = 1 << 1;
/// Schema flag: the image stores a whole-image mtime override.
pub const SCHEMA_FLAG_MTIME: u32 = 1 << 2;

/// The byte range of one frozen vector inside the `META` payload.
///
/// `len` counts elements for record vectors and bytes for string buffers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct VecRange {
    pub offset: le::U32,
    pub len: le::U32,
}

/// The fixed schema struct stored in the `SCHEMA` section.
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Schema {
    /// Must equal [`SCHEMA_MAGIC`].
    pub magic: [u8; 8],
    /// Block size exponent `S`; blocks hold at most `2^S` bytes.
    pub block_size_bits: le::U32,
    /// The first regular-file inode, `#directories + #symlinks`.
    pub chunk_index_offset: le::U32,
    /// The first symlink inode, `#directories`.
    pub link_index_offset: le::U32,
    /// Bitset of `SCHEMA_FLAG_*` marking which overrides are stored.
    pub flags: le::U32,
    /// Whole-image owner override, meaningful iff [`SCHEMA_FLAG_OWNER`].
    pub owner: le::U32,
    /// Whole-image group override, meaningful iff [`SCHEMA_FLAG_GROUP`].
    pub group: le::U32,
    /// Whole-image mtime override, meaningful iff [`SCHEMA_FLAG_MTIME`].
    pub mtime: le::U64,

    pub entries: VecRange,
    pub entry_index: VecRange,
    pub directories: VecRange,
    pub chunks: VecRange,
    pub chunk_index: VecRange,
    pub link_index: VecRange,
    pub modes: VecRange,
    pub name_offsets: VecRange,
    pub name_bytes: VecRange,
    pub link_offsets: VecRange,
    pub link_bytes: VecRange,
}

impl Schema {
    /// Parse and validate the `SCHEMA` section payload.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let this = Self::read_from_bytes(bytes)
            .ok()
            .context("schema section has wrong size")?;
        (this.magic == SCHEMA_MAGIC).or_context("schema magic mismatch")?;
        BLOCK_SIZE_BITS_RANGE
            .contains(&this.block_size_bits.get())
            .or_context("block size bits out of range")?;
        Ok(this)
    }
}

/// One entry record: an inode linked under a name.
///
/// Entry 0 is the root directory; its `name_index` is unused.
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Entry {
    pub name_index: le::U32,
    pub mode_index: le::U32,
    pub inode: le::U32,
}

/// One directory record, indexed by directory inode.
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Directory {
    /// Position in `entries` of the first child.
    pub first_entry: le::U32,
    /// Number of children; they are contiguous and sorted by name bytes.
    pub entry_count: le::U32,
}

/// One chunk record: a slice of an uncompressed block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Chunk {
    pub block_id: le::U32,
    pub offset: le::U32,
    pub size: le::U32,
}

/// The kind of an inode, derived from its position in the inode numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeKind {
    Directory,
    Symlink,
    Regular,
    Other,
}

/// The parsed and validated metadata of one image.
///
/// This owns the raw `META` payload; all accessors are zero-copy views.
pub struct Metadata {
    schema: Schema,
    payload: Box<[u8]>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // NB. Always hide the payload, it is large.
        f.debug_struct("Metadata")
            .field("schema", &self.schema)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl Metadata {
    /// Parse the `META` payload against a parsed [`Schema`] and validate all
    /// invariants.
    ///
    /// `block_count` is the number of `BLOCK` sections in the image; chunks
    /// must not reference past it.
    pub fn parse(schema: Schema, payload: Vec<u8>, block_count: u32) -> Result<Self> {
        u32::try_from(payload.len())
            .ok()
            .context("metadata payload exceeds 2^32 bytes")?;
        let this = Self {
            schema,
            payload: payload.into_boxed_slice(),
        };
        this.validate(block_count)?;
        Ok(this)
    }

    fn validate(&self, block_count: u32) -> Result<()> {
        let s = &self.schema;

        // All ranges must slice and cast cleanly before anything else.
        self.try_records::<Entry>(&s.entries, "entries")?;
        self.try_records::<le::U32>(&s.entry_index, "entry_index")?;
        self.try_records::<Directory>(&s.directories, "directories")?;
        self.try_records::<Chunk>(&s.chunks, "chunks")?;
        self.try_records::<le::U32>(&s.chunk_index, "chunk_index")?;
        self.try_records::<le::U32>(&s.link_index, "link_index")?;
        self.try_records::<le::U32>(&s.modes, "modes")?;
        self.try_records::<le::U32>(&s.name_offsets, "name_offsets")?;
        self.try_records::<u8>(&s.name_bytes, "name_bytes")?;
        self.try_records::<le::U32>(&s.link_offsets, "link_offsets")?;
        self.try_records::<u8>(&s.link_bytes, "link_bytes")?;

        let entries = self.entries();
        let entry_index = self.entry_index();
        let directories = self.directories();
        let chunks = self.chunks();
        let chunk_index = self.chunk_index();
        let modes = self.modes();

        let inode_cnt = entries.len();
        let dir_cnt = directories.len();
        let link_cnt = self.link_index().len();
        (chunk_index.len() >= 1).or_context("chunk_index misses its sentinel")?;
        let file_cnt = chunk_index.len() - 1;

        // Inode numbering: dirs, then symlinks, then regular files, then others.
        (dir_cnt >= 1).or_context("missing root directory")?;
        (entry_index.len() == inode_cnt).or_context("entry_index length mismatch")?;
        (s.link_index_offset.get() as usize == dir_cnt)
            .or_context("link_index_offset does not match directory count")?;
        (s.chunk_index_offset.get() as usize == dir_cnt + link_cnt)
            .or_context("chunk_index_offset does not match directory and symlink counts")?;
        (dir_cnt + link_cnt + file_cnt <= inode_cnt).or_context("entries table too short")?;

        // `entry_index` is a permutation of [0, N).
        for (ino, pos) in entry_index.iter().enumerate() {
            let ent = entries
                .get(pos.get() as usize)
                .context("index out of range in entry_index")?;
            (ent.inode.get() as usize == ino)
                .or_context("entry_index and entries.inode disagree")?;
        }

        // Per-entry mode indices, and mode kinds agreeing with the numbering.
        for ent in entries {
            let mode = modes
                .get(ent.mode_index.get() as usize)
                .context("index out of range in entries.mode_index")?
                .get();
            let expect = match self.kind_of(ent.inode.get()) {
                InodeKind::Directory => mode & S_IFMT == S_IFDIR,
                InodeKind::Symlink => mode & S_IFMT == S_IFLNK,
                InodeKind::Regular => mode & S_IFMT == S_IFREG,
                InodeKind::Other => !matches!(mode & S_IFMT, S_IFDIR | S_IFLNK | S_IFREG),
            };
            expect.or_context("entry mode does not match its inode kind")?;
        }

        // String tables: offsets non-decreasing and within their buffers.
        let check_string_table = |offsets: &[le::U32], buffer_len: usize, msg: &'static str| -> Result<()> {
            (!offsets.is_empty()).or_context(msg)?;
            (offsets[0].get() == 0).or_context(msg)?;
            offsets
                .windows(2)
                .all(|w| w[0].get() <= w[1].get())
                .or_context(msg)?;
            (offsets[offsets.len() - 1].get() as usize == buffer_len).or_context(msg)?;
            Ok(())
        };
        check_string_table(
            self.name_offsets(),
            self.name_bytes().len(),
            "malformed name string table",
        )?;
        check_string_table(
            self.link_offsets(),
            self.link_bytes().len(),
            "malformed symlink string table",
        )?;
        let name_cnt = self.name_offsets().len() - 1;
        let link_target_cnt = self.link_offsets().len() - 1;

        // Directory child runs: in range, partitioning, sorted by name.
        let mut total_children = 0usize;
        for (dir_ino, dir) in directories.iter().enumerate() {
            let start = dir.first_entry.get() as usize;
            let cnt = dir.entry_count.get() as usize;
            let run = start
                .checked_add(cnt)
                .and_then(|end| entries.get(start..end))
                .context("directory child range out of bounds")?;
            total_children += cnt;
            for child in run {
                ((child.name_index.get() as usize) < name_cnt)
                    .or_context("index out of range in entries.name_index")?;
                // No directory may contain an ancestor: child directories are
                // always created after (thus numbered above) their parent.
                if (child.inode.get() as usize) < dir_cnt {
                    (child.inode.get() as usize > dir_ino)
                        .or_context("directory contains an ancestor")?;
                }
            }
            run.windows(2)
                .all(|w| self.name(w[0].name_index.get()) < self.name(w[1].name_index.get()))
                .or_context("directory children are not strictly sorted by name")?;
        }
        (total_children + 1 == entries.len())
            .or_context("directory child runs do not partition the entries")?;

        // Chunks: CSR monotone, and every chunk within its block.
        chunk_index
            .windows(2)
            .all(|w| w[0].get() <= w[1].get())
            .or_context("chunk_index is not non-decreasing")?;
        (chunk_index[chunk_index.len() - 1].get() as usize <= chunks.len())
            .or_context("chunk_index overruns the chunk table")?;
        let block_size = self.block_size();
        for c in chunks {
            (c.block_id.get() < block_count).or_context("chunk references a missing block")?;
            c.offset
                .get()
                .checked_add(c.size.get())
                .filter(|&end| end <= block_size)
                .context("chunk exceeds its block")?;
        }

        // Symlink targets.
        for idx in self.link_index() {
            ((idx.get() as usize) < link_target_cnt)
                .or_context("index out of range in link_index")?;
        }

        Ok(())
    }

    fn try_records<T: FromBytes + Immutable + KnownLayout>(
        &self,
        range: &VecRange,
        what: &'static str,
    ) -> Result<&[T]> {
        let offset = range.offset.get() as usize;
        let byte_len = (range.len.get() as usize)
            .checked_mul(size_of::<T>())
            .context("metadata vector length overflow")?;
        let bytes = offset
            .checked_add(byte_len)
            .and_then(|end| self.payload.get(offset..end))
            .ok_or_else(|| Error(format!("metadata vector {what} out of bounds").into()))?;
        // The cast cannot fail: all record types have alignment 1 and the
        // length is an exact multiple of the record size.
        Ok(<[T]>::ref_from_bytes(bytes).expect("sized above"))
    }

    fn records<T: FromBytes + Immutable + KnownLayout>(&self, range: &VecRange) -> &[T] {
        self.try_records(range, "").expect("validated")
    }

    /// The parsed schema this metadata was laid out by.
    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Block size exponent `S`.
    #[inline]
    pub fn block_size_bits(&self) -> u32 {
        self.schema.block_size_bits.get()
    }

    /// Block size in bytes, `2^S`.
    #[inline]
    pub fn block_size(&self) -> u32 {
        1 << self.block_size_bits()
    }

    /// The first regular-file inode.
    #[inline]
    pub fn chunk_index_offset(&self) -> u32 {
        self.schema.chunk_index_offset.get()
    }

    /// The first symlink inode.
    #[inline]
    pub fn link_index_offset(&self) -> u32 {
        self.schema.link_index_offset.get()
    }

    /// Whole-image owner (uid) override stored at build time, if any.
    pub fn owner_override(&self) -> Option<u32> {
        (self.schema.flags.get() & SCHEMA_FLAG_OWNER != 0).then(|| self.schema.owner.get())
    }

    /// Whole-image group (gid) override stored at build time, if any.
    pub fn group_override(&self) -> Option<u32> {
        (self.schema.flags.get() & SCHEMA_FLAG_GROUP != 0).then(|| self.schema.group.get())
    }

    /// Whole-image mtime override stored at build time, if any.
    pub fn mtime_override(&self) -> Option<u64> {
        (self.schema.flags.get() & SCHEMA_FLAG_MTIME != 0).then(|| self.schema.mtime.get())
    }

    pub fn entries(&self) -> &[Entry] {
        self.records(&self.schema.entries)
    }

    pub fn entry_index(&self) -> &[le::U32] {
        self.records(&self.schema.entry_index)
    }

    pub fn directories(&self) -> &[Directory] {
        self.records(&self.schema.directories)
    }

    pub fn chunks(&self) -> &[Chunk] {
        self.records(&self.schema.chunks)
    }

    pub fn chunk_index(&self) -> &[le::U32] {
        self.records(&self.schema.chunk_index)
    }

    pub fn link_index(&self) -> &[le::U32] {
        self.records(&self.schema.link_index)
    }

    pub fn modes(&self) -> &[le::U32] {
        self.records(&self.schema.modes)
    }

    fn name_offsets(&self) -> &[le::U32] {
        self.records(&self.schema.name_offsets)
    }

    fn name_bytes(&self) -> &[u8] {
        self.records(&self.schema.name_bytes)
    }

    fn link_offsets(&self) -> &[le::U32] {
        self.records(&self.schema.link_offsets)
    }

    fn link_bytes(&self) -> &[u8] {
        self.records(&self.schema.link_bytes)
    }

    /// The number of inodes (and entries).
    #[inline]
    pub fn inode_count(&self) -> u32 {
        self.entries().len() as u32
    }

    /// The number of directories.
    #[inline]
    pub fn dir_count(&self) -> u32 {
        self.directories().len() as u32
    }

    /// The number of regular files.
    #[inline]
    pub fn file_count(&self) -> u32 {
        (self.chunk_index().len() - 1) as u32
    }

    /// Classify an inode by its position in the numbering.
    pub fn kind_of(&self, inode: u32) -> InodeKind {
        if inode < self.link_index_offset() {
            InodeKind::Directory
        } else if inode < self.chunk_index_offset() {
            InodeKind::Symlink
        } else if inode < self.chunk_index_offset() + self.file_count() {
            InodeKind::Regular
        } else {
            InodeKind::Other
        }
    }

    /// Get a deduplicated name by index.
    pub fn name(&self, name_index: u32) -> &BStr {
        let offsets = self.name_offsets();
        let start = offsets[name_index as usize].get() as usize;
        let end = offsets[name_index as usize + 1].get() as usize;
        BStr::new(&self.name_bytes()[start..end])
    }

    /// Get the symlink target of a symlink inode.
    ///
    /// # Panics
    ///
    /// Panics if `inode` is not a symlink.
    pub fn link_target(&self, inode: u32) -> &BStr {
        assert_eq!(self.kind_of(inode), InodeKind::Symlink);
        let link_idx = self.link_index()[(inode - self.link_index_offset()) as usize].get();
        let offsets = self.link_offsets();
        let start = offsets[link_idx as usize].get() as usize;
        let end = offsets[link_idx as usize + 1].get() as usize;
        BStr::new(&self.link_bytes()[start..end])
    }

    /// Get the chunk list of a regular-file inode, or `None` for other kinds.
    pub fn chunks_of(&self, inode: u32) -> Option<&[Chunk]> {
        (self.kind_of(inode) == InodeKind::Regular).then(|| {
            let idx = (inode - self.chunk_index_offset()) as usize;
            let tbl = self.chunk_index();
            let start = tbl[idx].get() as usize;
            let end = tbl[idx + 1].get() as usize;
            &self.chunks()[start..end]
        })
    }
}

// Stored on disk, thus platform-agnostic.
// From: <https://man.archlinux.org/man/inode.7.en#The_file_type_and_mode>
pub(crate) const S_IFMT: u32 = 0o0170000;
pub(crate) const S_IFLNK: u32 = 0o0120000;
pub(crate) const S_IFREG: u32 = 0o0100000;
pub(crate) const S_IFDIR: u32 = 0o0040000;
