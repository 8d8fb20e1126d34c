//! The high-level interface for accessing a ShaleFS image.

use std::{
    fmt,
    io::{BufRead, Read, Write},
    num::NonZero,
};

use bstr::{BStr, ByteSlice};
use lru::LruCache;
use positioned_io::{ReadAt, Size};

use crate::{
    bisect_range_by,
    metadata::{self, InodeKind, Metadata, S_IFDIR, S_IFLNK, S_IFMT, Schema},
    section::{self, HEADER_SIZE, SectionEntry, SectionKind, SectionReader},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
enum ErrorInner {
    Section(String, Option<section::Error>),
    MissingSection(SectionKind),
    DuplicatedSection(SectionKind),
    MisplacedSection(SectionKind),
    ParseMetadata(metadata::Error),
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Section(msg, Some(err)) => write!(f, "{msg}: {err}"),
            ErrorInner::Section(msg, None) => write!(f, "{msg}"),
            ErrorInner::MissingSection(kind) => write!(f, "missing section {kind:?}"),
            ErrorInner::DuplicatedSection(kind) => write!(f, "duplicated sections {kind:?}"),
            ErrorInner::MisplacedSection(kind) => {
                write!(f, "section {kind:?} is out of place")
            }
            ErrorInner::ParseMetadata(err) => err.fmt(f),
            ErrorInner::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Section(_, Some(err)) => Some(err),
            ErrorInner::ParseMetadata(err) => Some(err),
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<metadata::Error> for Error {
    #[cold]
    fn from(err: metadata::Error) -> Self {
        Self(Box::new(ErrorInner::ParseMetadata(err)))
    }
}

// Needed for `Read` impls.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

trait ResultExt<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T, section::Error> {
    #[inline]
    fn context(self, msg: impl fmt::Display) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(err) => Err(ErrorInner::Section(msg.to_string(), Some(err)).into()),
        }
    }
}

/// Size limits and cache tuning for opening an image.
#[derive(Debug)]
pub struct Config {
    schema_size_limit: usize,
    metadata_size_limit: usize,
    block_cache_size_limit: usize,
    inode_offset: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Some arbitrarily chosen numbers.
            schema_size_limit: 1 << 20,
            metadata_size_limit: 64 << 20,
            // 32 x 16MiB blocks.
            block_cache_size_limit: 512 << 20,
            inode_offset: 0,
        }
    }
}

impl Config {
    pub fn schema_size_limit(mut self, limit: usize) -> Self {
        self.schema_size_limit = limit;
        self
    }

    pub fn metadata_size_limit(mut self, limit: usize) -> Self {
        self.metadata_size_limit = limit;
        self
    }

    pub fn block_cache_size_limit(mut self, limit: usize) -> Self {
        self.block_cache_size_limit = limit;
        self
    }

    /// Offset added to every inode number reported by [`ImageIndex::getattr`]
    /// and subtracted by [`ImageIndex::find_inode`].
    pub fn inode_offset(mut self, offset: u64) -> Self {
        self.inode_offset = offset;
        self
    }
}

/// Image-wide stat attributes for fields the metadata does not store.
#[derive(Debug, Clone, Copy)]
pub struct StatDefaults {
    pub uid: u32,
    pub gid: u32,
    /// Seconds since the UNIX epoch, used for mtime, atime and ctime.
    pub time: u64,
}

impl StatDefaults {
    /// Defaults from the calling process: effective uid/gid and the current
    /// time.
    pub fn current() -> Self {
        let time = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            uid: rustix::process::geteuid().as_raw(),
            gid: rustix::process::getegid().as_raw(),
            time,
        }
    }
}

/// The result of [`ImageIndex::getattr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// File type and permissions, with all write bits cleared.
    pub mode: u32,
    pub size: u64,
    pub blocks: u64,
    pub ino: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
}

/// The navigable metadata of an image: sections, entry tree and attributes.
///
/// This is the cheap, read-only half produced by [`Image::open`]; actual file
/// content goes through [`Image`].
pub struct ImageIndex {
    sections: Box<[SectionEntry]>,
    block_count: u32,
    metadata: Metadata,
    inode_offset: u64,
}

impl fmt::Debug for ImageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageIndex")
            .field("block_count", &self.block_count)
            .field("inode_offset", &self.inode_offset)
            .finish_non_exhaustive()
    }
}

impl ImageIndex {
    fn new(rdr: &mut SectionReader<dyn ReadAt + '_>, stream_len: u64, config: &Config) -> Result<Self> {
        let sections = rdr
            .scan(stream_len)
            .context("failed to enumerate sections")?
            .into_boxed_slice();

        // BLOCK sections first, then exactly one SCHEMA and one final META.
        let find_unique = |kind: SectionKind| -> Result<u64> {
            let mut iter = sections
                .iter()
                .filter_map(|ent| (ent.kind == kind).then_some(ent.offset));
            let off = iter.next().ok_or(ErrorInner::MissingSection(kind))?;
            if iter.next().is_some() {
                return Err(ErrorInner::DuplicatedSection(kind).into());
            }
            Ok(off)
        };
        let schema_offset = find_unique(SectionKind::SCHEMA)?;
        let metadata_offset = find_unique(SectionKind::META)?;
        let block_count = sections.len() - 2;
        let blocks_in_front = sections[..block_count]
            .iter()
            .all(|ent| ent.kind == SectionKind::BLOCK);
        if !blocks_in_front || sections[sections.len() - 1].kind != SectionKind::META {
            bail!(ErrorInner::MisplacedSection(SectionKind::META));
        }
        let block_count = u32::try_from(block_count)
            .map_err(|_| ErrorInner::Section("too many sections".into(), None))?;

        let metadata = {
            let (_, raw_schema) = rdr
                .read_section_at(schema_offset, config.schema_size_limit)
                .context("failed to read schema section")?;
            let schema = Schema::parse(&raw_schema)?;

            let (_, raw_metadata) = rdr
                .read_section_at(metadata_offset, config.metadata_size_limit)
                .context("failed to read metadata section")?;
            Metadata::parse(schema, raw_metadata, block_count)?
        };

        Ok(Self {
            sections,
            block_count,
            metadata,
            inode_offset: config.inode_offset,
        })
    }

    /// The low-level metadata.
    #[inline]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The number of data blocks in the image.
    #[inline]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// The section table, in file order.
    #[inline]
    pub fn sections(&self) -> &[SectionEntry] {
        &self.sections
    }

    /// Get the root directory entry.
    pub fn root(&self) -> Entry<'_> {
        Entry {
            index: self,
            entry_pos: self.metadata.entry_index()[0].get(),
        }
    }

    /// Resolve a `/`-separated path from the root.
    ///
    /// Leading, trailing, and repeated separators are ignored, so `""` and
    /// `"/"` both resolve to the root.
    pub fn find(&self, path: &str) -> Option<Entry<'_>> {
        path.split('/')
            .filter(|seg| !seg.is_empty())
            .try_fold(self.root(), |ent, seg| ent.as_dir()?.get(seg))
    }

    /// Resolve an inode number (with the configured inode offset applied).
    pub fn find_inode(&self, ino: u64) -> Option<Entry<'_>> {
        let inode = u32::try_from(ino.checked_sub(self.inode_offset)?).ok()?;
        let pos = self.metadata.entry_index().get(inode as usize)?.get();
        Some(Entry {
            index: self,
            entry_pos: pos,
        })
    }

    /// Resolve `name` inside the directory with inode number `ino`.
    pub fn find_at(&self, ino: u64, name: impl AsRef<[u8]>) -> Option<Entry<'_>> {
        self.find_inode(ino)?.as_dir()?.get(name)
    }

    /// Stat an entry. Write permission bits are always cleared; owner, group
    /// and times come from `defaults` unless the image stores overrides.
    pub fn getattr(&self, entry: &Entry<'_>, defaults: &StatDefaults) -> Stat {
        const READ_ONLY_MASK: u32 = !0o222;

        let m = &self.metadata;
        let size = entry.size();
        let time = m.mtime_override().unwrap_or(defaults.time);
        Stat {
            mode: entry.mode() & READ_ONLY_MASK,
            size,
            blocks: size.div_ceil(512),
            ino: u64::from(entry.inode()) + self.inode_offset,
            uid: m.owner_override().unwrap_or(defaults.uid),
            gid: m.group_override().unwrap_or(defaults.gid),
            mtime: time,
            atime: time,
            ctime: time,
        }
    }

    /// Visit all entries in depth-first pre-order, starting at the root.
    pub fn walk(&self, mut visitor: impl FnMut(&Entry<'_>)) {
        fn go(ent: &Entry<'_>, visitor: &mut impl FnMut(&Entry<'_>)) {
            visitor(ent);
            if let Some(dir) = ent.as_dir() {
                for child in dir.entries() {
                    go(&child, visitor);
                }
            }
        }
        go(&self.root(), &mut visitor);
    }

    /// Pretty-print the whole hierarchy for diagnostics.
    ///
    /// `chunk_cb` is invoked for every regular file with its indentation and
    /// inode, to let the caller append per-file chunk details.
    pub fn dump(
        &self,
        out: &mut dyn Write,
        chunk_cb: &mut dyn FnMut(&mut dyn Write, &str, u32) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        self.dump_entry(out, "", &self.root(), chunk_cb)
    }

    fn dump_entry(
        &self,
        out: &mut dyn Write,
        indent: &str,
        ent: &Entry<'_>,
        chunk_cb: &mut dyn FnMut(&mut dyn Write, &str, u32) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        let inode = ent.inode();
        write!(out, "{indent}<inode:{inode}> {}", mode_string(ent.mode()))?;
        if inode != 0 {
            write!(out, " {}", ent.name())?;
        }
        match ent.kind() {
            EntryKind::Regular => {
                writeln!(out, " {}", ent.size())?;
                chunk_cb(out, &format!("{indent}  "), inode)?;
            }
            EntryKind::Directory => {
                let dir = ent.as_dir().expect("is a directory");
                writeln!(out, " ({} entries)", dir.entries().len())?;
                let sub_indent = format!("{indent}  ");
                for child in dir.entries() {
                    self.dump_entry(out, &sub_indent, &child, chunk_cb)?;
                }
            }
            EntryKind::Symlink => writeln!(out, " -> {}", ent.target())?,
            EntryKind::Other => writeln!(out, " (special)")?,
        }
        Ok(())
    }
}

/// Render a mode as a 13-character string: set-uid/set-gid/sticky flags, the
/// file type, then the three permission triplets.
pub fn mode_string(mode: u32) -> String {
    const S_ISUID: u32 = 0o4000;
    const S_ISGID: u32 = 0o2000;
    const S_ISVTX: u32 = 0o1000;

    let mut s = String::with_capacity(13);
    s.push(if mode & S_ISUID != 0 { 'U' } else { '-' });
    s.push(if mode & S_ISGID != 0 { 'G' } else { '-' });
    s.push(if mode & S_ISVTX != 0 { 'S' } else { '-' });
    s.push(match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        _ => '-',
    });
    for shift in [6u32, 3, 0] {
        let bits = mode >> shift;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

/// The kind of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// A handle to one entry of the image hierarchy.
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    index: &'a ImageIndex,
    entry_pos: u32,
}

impl fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("inode", &self.inode())
            .field("name", &self.name())
            .finish()
    }
}

impl<'a> Entry<'a> {
    fn record(&self) -> &'a metadata::Entry {
        &self.index.metadata.entries()[self.entry_pos as usize]
    }

    /// The inode number of this entry, without any inode offset applied.
    pub fn inode(&self) -> u32 {
        self.record().inode.get()
    }

    /// The name of this entry. The root has an empty name.
    pub fn name(&self) -> &'a BStr {
        if self.entry_pos == self.index.metadata.entry_index()[0].get() {
            return BStr::new(b"");
        }
        self.index.metadata.name(self.record().name_index.get())
    }

    /// File type and permission bits.
    pub fn mode(&self) -> u32 {
        self.index.metadata.modes()[self.record().mode_index.get() as usize].get()
    }

    /// Classify this entry.
    pub fn kind(&self) -> EntryKind {
        match self.index.metadata.kind_of(self.inode()) {
            InodeKind::Directory => EntryKind::Directory,
            InodeKind::Symlink => EntryKind::Symlink,
            InodeKind::Regular => EntryKind::Regular,
            InodeKind::Other => EntryKind::Other,
        }
    }

    /// Get the directory view if this entry is a directory.
    pub fn as_dir(&self) -> Option<Dir<'a>> {
        (self.kind() == EntryKind::Directory).then_some(Dir {
            index: self.index,
            inode: self.inode(),
        })
    }

    /// The symlink target.
    ///
    /// # Panics
    ///
    /// Panics if this entry is not a symlink.
    pub fn target(&self) -> &'a BStr {
        self.index.metadata.link_target(self.inode())
    }

    /// The chunk list for a regular file, or an empty slice otherwise.
    pub fn chunks(&self) -> &'a [metadata::Chunk] {
        self.index.metadata.chunks_of(self.inode()).unwrap_or(&[])
    }

    /// Logical size: content length for regular files, target length for
    /// symlinks, 0 otherwise.
    pub fn size(&self) -> u64 {
        match self.kind() {
            EntryKind::Regular => self
                .chunks()
                .iter()
                .map(|c| u64::from(c.size.get()))
                .sum::<u64>(),
            EntryKind::Symlink => self.target().len() as u64,
            EntryKind::Directory | EntryKind::Other => 0,
        }
    }
}

/// A directory view over its contiguous, name-sorted child range.
#[derive(Debug, Clone, Copy)]
pub struct Dir<'a> {
    index: &'a ImageIndex,
    inode: u32,
}

impl<'a> Dir<'a> {
    fn child_range(&self) -> std::ops::Range<usize> {
        let d = &self.index.metadata.directories()[self.inode as usize];
        let start = d.first_entry.get() as usize;
        start..start + d.entry_count.get() as usize
    }

    /// Iterate all entries in this directory, in ascending order of names.
    pub fn entries(&self) -> impl ExactSizeIterator<Item = Entry<'a>> + use<'a> {
        let index = self.index;
        self.child_range().map(move |pos| Entry {
            index,
            entry_pos: pos as u32,
        })
    }

    /// Find the entry of given name via binary search over the sorted child
    /// range.
    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<Entry<'a>> {
        self.get_inner(name.as_ref())
    }

    fn get_inner(&self, name: &[u8]) -> Option<Entry<'a>> {
        let range = self.child_range();
        let start = range.start;
        // `bisect_range_by` hands out indices relative to the range start.
        let pos = bisect_range_by(range, |rel| {
            let ent = Entry {
                index: self.index,
                entry_pos: (start + rel) as u32,
            };
            Ord::cmp(ent.name().as_bytes(), name)
        })?;
        Some(Entry {
            index: self.index,
            entry_pos: (start + pos) as u32,
        })
    }
}

/// The content-access half of an opened image: a section reader plus an LRU
/// cache of decompressed blocks.
pub struct Image<R: ?Sized> {
    /// LRU cache of block id -> decompressed block content.
    cache: LruCache<u32, Vec<u8>>,
    block_size: u32,
    rdr: SectionReader<R>,
}

impl<R: ?Sized> fmt::Debug for Image<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("block_size", &self.block_size)
            .field("cached_blocks", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt + Size> Image<R> {
    /// Open a ShaleFS image from a random access stream, typically a
    /// [`std::fs::File`].
    ///
    /// Do not wrap the stream in [`BufReader`][std::io::BufReader]; the image
    /// has internal caches.
    pub fn open(rdr: R) -> Result<(ImageIndex, Self)> {
        Self::open_with_config(rdr, &Config::default())
    }

    /// Same as [`Image::open`] but with a non-default [`Config`].
    pub fn open_with_config(rdr: R, config: &Config) -> Result<(ImageIndex, Self)> {
        let stream_len = rdr
            .size()?
            .ok_or_else(|| ErrorInner::Section("cannot get the size of the image stream".into(), None))?;
        let mut rdr = SectionReader::new(rdr);
        let index = ImageIndex::new(&mut rdr, stream_len, config)?;

        let block_size = index.metadata().block_size();
        let cache_len = NonZero::new((config.block_cache_size_limit / block_size as usize).max(1))
            .expect("at least one");
        Ok((
            index,
            Self {
                cache: LruCache::new(cache_len),
                block_size,
                rdr,
            },
        ))
    }
}

impl<R> Image<R> {
    pub fn into_inner(self) -> R
    where
        R: Sized,
    {
        self.rdr.into_inner()
    }

    pub fn get_ref(&self) -> &R {
        self.rdr.get_ref()
    }
}

impl<R: ReadAt + ?Sized> Image<R> {
    /// Decompress a block into the cache if it is not resident yet.
    fn cache_block(&mut self, index: &ImageIndex, block_id: u32) -> Result<()> {
        // NB. Use `get` instead of `contains` to promote it to MRU.
        if self.cache.get(&block_id).is_some() {
            log::trace!("block {block_id}: cache hit");
            return Ok(());
        }
        log::trace!("block {block_id}: cache miss");

        let section_offset = index.sections()[block_id as usize].offset;

        (|| {
            let header = self.rdr.read_header_at(section_offset)?;

            // Reuse an evicted buffer when the cache is full.
            let mut buf = if self.cache.len() == self.cache.cap().get() {
                let (_, mut buf) = self.cache.pop_lru().expect("not empty");
                buf.resize(self.block_size as usize, 0);
                buf
            } else {
                vec![0u8; self.block_size as usize]
            };
            let len =
                self.rdr
                    .read_payload_at_into(&header, section_offset + HEADER_SIZE, &mut buf)?;
            buf.truncate(len);
            self.cache.push(block_id, buf);
            Ok(())
        })()
        .context(format_args!("failed to read block {block_id}"))
    }

    /// Get a chunk inside the most recently cached block.
    fn get_chunk_in_cache(&self, start: u32, end: u32) -> Result<&[u8]> {
        let (&block_id, cache) = self.cache.peek_mru().expect("cache is not empty");
        let chunk = cache.get(start as usize..end as usize).ok_or_else(
            #[cold]
            || {
                let msg = format!(
                    "block {block_id} has only {} bytes but is referenced at {start}..{end}",
                    cache.len(),
                );
                ErrorInner::Section(msg, None)
            },
        )?;
        Ok(chunk)
    }

    /// Read one chunk, going through the block cache.
    pub fn read_chunk<'b>(
        &'b mut self,
        index: &ImageIndex,
        chunk: &metadata::Chunk,
    ) -> Result<&'b [u8]> {
        self.cache_block(index, chunk.block_id.get())?;
        // Chunk bounds are validated at parse time.
        self.get_chunk_in_cache(chunk.offset.get(), chunk.offset.get() + chunk.size.get())
    }

    /// Read the whole content of a regular file into memory.
    ///
    /// For a streaming interface, see [`Entry::chunks`] and [`ChunksReader`].
    pub fn read_file(&mut self, entry: &Entry<'_>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ChunksReader::new(self, entry).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// A [`Read`]-able view over the concatenated chunks of a regular file.
#[derive(Debug)]
pub struct ChunksReader<'a, 'b, R: ?Sized> {
    index: &'a ImageIndex,
    chunks: std::slice::Iter<'a, metadata::Chunk>,
    in_block_offset: u32,
    chunk_rest_size: u32,
    image: &'b mut Image<R>,
}

impl<'a, 'b, R: ReadAt + ?Sized> ChunksReader<'a, 'b, R> {
    /// A reader over the content of `entry`; empty for non-regular entries.
    pub fn new(image: &'b mut Image<R>, entry: &Entry<'a>) -> Self {
        Self {
            index: entry.index,
            chunks: entry.chunks().iter(),
            in_block_offset: 0,
            chunk_rest_size: 0,
            image,
        }
    }
}

impl<R: ReadAt + ?Sized> Read for ChunksReader<'_, '_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let cache = self.fill_buf()?;
        let len = cache.len().min(buf.len());
        buf[..len].copy_from_slice(&cache[..len]);
        self.consume(len);
        Ok(len)
    }
}

impl<R: ReadAt + ?Sized> BufRead for ChunksReader<'_, '_, R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        if self.chunk_rest_size == 0 {
            let Some(chunk) = self.chunks.next() else {
                return Ok(&[]);
            };
            self.in_block_offset = chunk.offset.get();
            self.chunk_rest_size = chunk.size.get();
            self.image.cache_block(self.index, chunk.block_id.get())?;
        }
        let chunk = self.image.get_chunk_in_cache(
            self.in_block_offset,
            // Chunk bounds are validated at parse time.
            self.in_block_offset + self.chunk_rest_size,
        )?;
        Ok(chunk)
    }

    fn consume(&mut self, amt: usize) {
        assert!(amt <= self.chunk_rest_size as usize);
        self.in_block_offset += amt as u32;
        self.chunk_rest_size -= amt as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings() {
        assert_eq!(mode_string(0o40755), "---drwxr-xr-x");
        assert_eq!(mode_string(0o100644), "----rw-r--r--");
        assert_eq!(mode_string(0o120777), "---lrwxrwxrwx");
        assert_eq!(mode_string(0o104755), "U---rwxr-xr-x");
        assert_eq!(mode_string(0o41777), "--Sdrwxrwxrwx");
        assert_eq!(mode_string(0o100000).len(), 13);
    }
}
