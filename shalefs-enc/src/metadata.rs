//! The metadata builder: an in-memory entry tree frozen into the
//! parallel-vector layout of the `SCHEMA` and `META` sections.
//!
//! Names and modes are deduplicated through insertion-ordered sets while the
//! tree is built. [`Builder::finish`] assigns the final inode numbering
//! (directories first, then symlinks, regular files, and other entries, each
//! group in insertion order), sorts every directory's children by name
//! bytes, and serializes the vectors described by
//! [`shalefs::metadata::Schema`].
//!
//! ## Limitations
//!
//! All counts and the serialized metadata itself must stay below 2³² bytes.
//! This does not limit file data: chunks address blocks with 32-bit ids and
//! offsets, so the total data size is only bounded by the number of blocks.

use bstr::{BStr, BString};
use indexmap::IndexSet;
use shalefs::metadata::{
    self as meta, SCHEMA_FLAG_GROUP, SCHEMA_FLAG_MTIME, SCHEMA_FLAG_OWNER, Schema, VecRange,
};
use shalefs::zerocopy::{IntoBytes, little_endian as le};

use crate::{ErrorInner, Result};

// Stored on disk, thus platform-agnostic.
// From: <https://man.archlinux.org/man/inode.7.en#The_file_type_and_mode>
const S_IFMT: u32 = 0o0170000;
const S_IFLNK: u32 = 0o0120000;
const S_IFREG: u32 = 0o0100000;
const S_IFDIR: u32 = 0o0040000;
const S_IFSOCK: u32 = 0o0140000;

/// A chunk of data for a regular file, as produced by the
/// [`Segmenter`][crate::segmenter::Segmenter].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub block_id: u32,
    pub offset: u32,
    pub size: u32,
}

/// Image-wide attributes recorded in the schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Block size exponent; must match the segmenter's
    /// [`Config`][crate::segmenter::Config]. `Default` matches the
    /// segmenter's default.
    pub block_size_bits: Option<u32>,
    /// Whole-image owner (uid) override.
    pub owner: Option<u32>,
    /// Whole-image group (gid) override.
    pub group: Option<u32>,
    /// Whole-image mtime override, in seconds since the UNIX epoch.
    pub mtime: Option<u64>,
}

/// A handle to a directory created by [`Builder::put_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InodeKind {
    // NB. The order matters: it is the on-disk inode numbering order.
    Dir,
    Symlink,
    File,
    Other,
}

#[derive(Debug)]
struct InodeData {
    kind: InodeKind,
    // To maintain the mapping after sorting inodes by their kinds.
    orig_ino: u32,
    mode_idx: u32,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct DirEntry {
    parent: u32,
    name_idx: u32,
    child: u32,
}

/// The metadata builder. See [module level documentation][self].
#[derive(Debug)]
pub struct Builder {
    config: Config,

    inodes: Vec<InodeData>,
    /// Uniqueness of `(parent, name_idx)` is what actually matters here;
    /// `child` never repeats, so the full-record set checks the same thing.
    dir_entries: IndexSet<DirEntry>,
    chunks: Vec<Chunk>,
    file_chunk_start: Vec<u32>,
    link_target_idxs: Vec<u32>,

    name_table: IndexSet<BString>,
    link_table: IndexSet<BString>,
    modes: IndexSet<u32>,
}

impl Builder {
    /// Create a builder whose implicit root directory has permission bits
    /// `root_mode`.
    pub fn new(config: &Config, root_mode: u32) -> Self {
        let mut this = Self {
            config: *config,
            inodes: Default::default(),
            dir_entries: Default::default(),
            chunks: Default::default(),
            file_chunk_start: Default::default(),
            link_target_idxs: Default::default(),
            name_table: Default::default(),
            link_table: Default::default(),
            modes: Default::default(),
        };
        this.put_inode(S_IFDIR, InodeKind::Dir, root_mode)
            .expect("first inode cannot overflow");
        this
    }

    /// The implicitly created root directory.
    #[inline]
    pub fn root(&self) -> DirId {
        DirId(0)
    }

    fn put_inode(&mut self, file_type: u32, kind: InodeKind, mode: u32) -> Result<u32> {
        let ino = u32::try_from(self.inodes.len())
            .ok()
            .ok_or(ErrorInner::Limit("inode count exceeds 2^32"))?;
        let mode_idx = self.modes.insert_full(file_type | (mode & 0o7777)).0 as u32;
        self.inodes.push(InodeData {
            kind,
            orig_ino: ino,
            mode_idx,
        });
        Ok(ino)
    }

    fn put_entry(&mut self, parent: DirId, name: &BStr, child: u32) -> Result<()> {
        u32::try_from(self.dir_entries.len())
            .ok()
            .ok_or(ErrorInner::Limit("directory entry count exceeds 2^32"))?;
        let name_idx = self.name_table.insert_full(name.into()).0 as u32;
        let inserted = self
            .dir_entries
            .insert(DirEntry {
                parent: parent.0,
                name_idx,
                child,
            });
        if !inserted {
            return Err(ErrorInner::DuplicatedEntry.into());
        }
        Ok(())
    }

    /// Add an empty directory under `parent`.
    ///
    /// # Errors
    ///
    /// Fails when a count limit overflows or an entry of the same name
    /// already exists in `parent`.
    pub fn put_dir(&mut self, parent: DirId, name: impl AsRef<[u8]>, mode: u32) -> Result<DirId> {
        let ino = self.put_inode(S_IFDIR, InodeKind::Dir, mode)?;
        self.put_entry(parent, name.as_ref().into(), ino)?;
        Ok(DirId(ino))
    }

    /// Add a regular file under `parent` with its chunk list.
    ///
    /// # Panics
    ///
    /// Panics if a chunk exceeds the configured block size; the segmenter
    /// never produces such chunks.
    ///
    /// # Errors
    ///
    /// See [`Builder::put_dir`].
    pub fn put_file(
        &mut self,
        parent: DirId,
        name: impl AsRef<[u8]>,
        mode: u32,
        chunks: impl IntoIterator<Item = Chunk>,
    ) -> Result<()> {
        let chunk_start = self.chunks.len() as u32;
        self.chunks.extend(chunks);
        u32::try_from(self.chunks.len())
            .ok()
            .ok_or(ErrorInner::Limit("chunk count exceeds 2^32"))?;
        let block_size = 1u32 << self.block_size_bits();
        if let Some(c) = self.chunks[chunk_start as usize..].iter().find(|c| {
            c.offset
                .checked_add(c.size)
                .is_none_or(|end| end > block_size)
        }) {
            panic!("invalid chunk for block size {block_size}B: {c:?}");
        }
        let ino = self.put_inode(S_IFREG, InodeKind::File, mode)?;
        self.file_chunk_start.push(chunk_start);
        self.put_entry(parent, name.as_ref().into(), ino)?;
        Ok(())
    }

    /// Add a symbolic link under `parent`.
    ///
    /// # Errors
    ///
    /// See [`Builder::put_dir`].
    pub fn put_symlink(
        &mut self,
        parent: DirId,
        name: impl AsRef<[u8]>,
        mode: u32,
        target: impl AsRef<[u8]>,
    ) -> Result<()> {
        let ino = self.put_inode(S_IFLNK, InodeKind::Symlink, mode)?;
        let target_idx = self.link_table.insert_full(target.as_ref().into()).0 as u32;
        self.link_target_idxs.push(target_idx);
        self.put_entry(parent, name.as_ref().into(), ino)?;
        Ok(())
    }

    /// Add an entry that is neither a directory, a regular file, nor a
    /// symlink (a socket, pipe or device). Only its name and mode are
    /// stored.
    ///
    /// # Errors
    ///
    /// See [`Builder::put_dir`].
    pub fn put_other(&mut self, parent: DirId, name: impl AsRef<[u8]>, mode: u32) -> Result<()> {
        // Keep the source's type bits, unless they name one of the
        // first-class kinds, which would corrupt the inode numbering.
        let file_type = match mode & S_IFMT {
            0 | S_IFDIR | S_IFLNK | S_IFREG => S_IFSOCK,
            t => t,
        };
        let ino = self.put_inode(file_type, InodeKind::Other, mode)?;
        self.put_entry(parent, name.as_ref().into(), ino)?;
        Ok(())
    }

    fn block_size_bits(&self) -> u32 {
        self.config
            .block_size_bits
            .unwrap_or(crate::segmenter::Config::default().block_size_bits)
    }

    /// Freeze the tree and serialize it, returning the `SCHEMA` and `META`
    /// payloads.
    pub fn finish(mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        // Stable sort groups inodes by kind while keeping the insertion
        // order within each group; directory topological order survives.
        self.inodes.sort_by_key(|inode| inode.kind as u8);
        let orig_to_final = {
            let mut map = vec![0u32; self.inodes.len()];
            for (final_ino, inode) in self.inodes.iter().enumerate() {
                map[inode.orig_ino as usize] = final_ino as u32;
            }
            map
        };

        let dir_cnt = self
            .inodes
            .iter()
            .take_while(|data| data.kind == InodeKind::Dir)
            .count();
        let link_cnt = self.link_target_idxs.len();
        let file_cnt = self.file_chunk_start.len();
        assert_ne!(dir_cnt, 0, "root exists");

        // The final entry order: the root first, then every directory's
        // children sorted by name, directories themselves in inode order.
        let mut child_entries = std::mem::take(&mut self.dir_entries).into_iter().collect::<Vec<_>>();
        child_entries.sort_by(|a, b| {
            (orig_to_final[a.parent as usize], &self.name_table[a.name_idx as usize])
                .cmp(&(orig_to_final[b.parent as usize], &self.name_table[b.name_idx as usize]))
        });

        let inode_cnt = self.inodes.len();
        let mut entries = vec![meta::Entry::default(); inode_cnt];
        let mut entry_index = vec![le::U32::from(0u32); inode_cnt];
        let mut directories = vec![meta::Directory::default(); dir_cnt];

        entries[0] = meta::Entry {
            name_index: 0.into(),
            mode_index: (self.inodes[0].mode_idx).into(),
            inode: 0.into(),
        };

        {
            let mut pos = 1u32;
            let mut iter = child_entries.iter().peekable();
            for (dir_ino, dir) in directories.iter_mut().enumerate() {
                dir.first_entry = pos.into();
                let mut cnt = 0u32;
                while let Some(ent) =
                    iter.next_if(|ent| orig_to_final[ent.parent as usize] as usize == dir_ino)
                {
                    let child_ino = orig_to_final[ent.child as usize];
                    entries[pos as usize] = meta::Entry {
                        name_index: ent.name_idx.into(),
                        mode_index: self.inodes[child_ino as usize].mode_idx.into(),
                        inode: child_ino.into(),
                    };
                    entry_index[child_ino as usize] = pos.into();
                    pos += 1;
                    cnt += 1;
                }
                dir.entry_count = cnt.into();
            }
            assert_eq!(pos as usize, inode_cnt, "every inode has one entry");
        }

        // CSR chunk table with its trailing sentinel.
        let mut chunk_index = Vec::with_capacity(file_cnt + 1);
        chunk_index.extend(
            self.file_chunk_start
                .iter()
                .map(|&v| le::U32::from(v)),
        );
        chunk_index.push((self.chunks.len() as u32).into());

        let chunks = self
            .chunks
            .iter()
            .map(|c| meta::Chunk {
                block_id: c.block_id.into(),
                offset: c.offset.into(),
                size: c.size.into(),
            })
            .collect::<Vec<_>>();

        let link_index = self
            .link_target_idxs
            .iter()
            .map(|&v| le::U32::from(v))
            .collect::<Vec<_>>();

        let modes = self
            .modes
            .iter()
            .map(|&v| le::U32::from(v))
            .collect::<Vec<_>>();

        let (name_offsets, name_bytes) = build_string_table(
            &self.name_table,
            "total file name length exceeds 2^32",
        )?;
        let (link_offsets, link_bytes) = build_string_table(
            &self.link_table,
            "total symlink target length exceeds 2^32",
        )?;

        // Concatenate the vectors into the payload and record their ranges.
        let mut payload = Vec::new();
        let range_of = |payload: &mut Vec<u8>, bytes: &[u8], elems: usize| -> Result<VecRange> {
            // Records are unaligned little-endian, 4-byte alignment is only
            // for tidiness.
            payload.resize(payload.len().next_multiple_of(4), 0);
            let offset = u32::try_from(payload.len())
                .ok()
                .ok_or(ErrorInner::Limit("metadata exceeds 2^32 bytes"))?;
            payload.extend_from_slice(bytes);
            Ok(VecRange {
                offset: offset.into(),
                len: (elems as u32).into(),
            })
        };

        let mut schema = Schema {
            magic: meta::SCHEMA_MAGIC,
            block_size_bits: self.block_size_bits().into(),
            chunk_index_offset: ((dir_cnt + link_cnt) as u32).into(),
            link_index_offset: (dir_cnt as u32).into(),
            ..Default::default()
        };
        let mut flags = 0u32;
        if let Some(uid) = self.config.owner {
            flags |= SCHEMA_FLAG_OWNER;
            schema.owner = uid.into();
        }
        if let Some(gid) = self.config.group {
            flags |= SCHEMA_FLAG_GROUP;
            schema.group = gid.into();
        }
        if let Some(mtime) = self.config.mtime {
            flags |= SCHEMA_FLAG_MTIME;
            schema.mtime = mtime.into();
        }
        schema.flags = flags.into();

        schema.entries = range_of(&mut payload, entries.as_bytes(), entries.len())?;
        schema.entry_index = range_of(&mut payload, entry_index.as_bytes(), entry_index.len())?;
        schema.directories = range_of(&mut payload, directories.as_bytes(), directories.len())?;
        schema.chunks = range_of(&mut payload, chunks.as_bytes(), chunks.len())?;
        schema.chunk_index = range_of(&mut payload, chunk_index.as_bytes(), chunk_index.len())?;
        schema.link_index = range_of(&mut payload, link_index.as_bytes(), link_index.len())?;
        schema.modes = range_of(&mut payload, modes.as_bytes(), modes.len())?;
        schema.name_offsets = range_of(&mut payload, name_offsets.as_bytes(), name_offsets.len())?;
        schema.name_bytes = range_of(&mut payload, &name_bytes, name_bytes.len())?;
        schema.link_offsets = range_of(&mut payload, link_offsets.as_bytes(), link_offsets.len())?;
        schema.link_bytes = range_of(&mut payload, &link_bytes, link_bytes.len())?;

        Ok((schema.as_bytes().to_vec(), payload))
    }
}

type StringTable = (Vec<le::U32>, Vec<u8>);

fn build_string_table(tbl: &IndexSet<BString>, err_msg: &'static str) -> Result<StringTable> {
    let total_len = tbl.iter().map(|s| s.len()).sum::<usize>();
    u32::try_from(total_len)
        .ok()
        .ok_or(ErrorInner::Limit(err_msg))?;

    let mut offsets = Vec::with_capacity(tbl.len() + 1);
    let mut buffer = Vec::with_capacity(total_len);
    offsets.push(0u32.into());
    for s in tbl {
        buffer.extend_from_slice(s);
        offsets.push((buffer.len() as u32).into());
    }
    Ok((offsets, buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shalefs::metadata::Metadata;

    fn parse(schema: Vec<u8>, payload: Vec<u8>, block_count: u32) -> Metadata {
        let schema = Schema::parse(&schema).unwrap();
        Metadata::parse(schema, payload, block_count).unwrap()
    }

    #[test]
    fn empty_tree() {
        let builder = Builder::new(&Config::default(), 0o755);
        let (schema, payload) = builder.finish().unwrap();
        let m = parse(schema, payload, 0);
        assert_eq!(m.inode_count(), 1);
        assert_eq!(m.dir_count(), 1);
        assert_eq!(m.file_count(), 0);
    }

    #[test]
    fn children_are_sorted_and_searchable() {
        let mut b = Builder::new(&Config::default(), 0o755);
        let root = b.root();
        b.put_file(root, "zeta", 0o644, []).unwrap();
        let sub = b.put_dir(root, "etc", 0o755).unwrap();
        b.put_symlink(root, "alpha", 0o777, "zeta").unwrap();
        b.put_file(sub, "passwd", 0o644, []).unwrap();

        let (schema, payload) = b.finish().unwrap();
        let m = parse(schema, payload, 0);

        assert_eq!(m.inode_count(), 5);
        assert_eq!(m.dir_count(), 2);
        assert_eq!(m.link_index_offset(), 2);
        assert_eq!(m.chunk_index_offset(), 3);

        let root_dir = &m.directories()[0];
        let children: Vec<_> = (0..root_dir.entry_count.get())
            .map(|k| {
                let e = &m.entries()[(root_dir.first_entry.get() + k) as usize];
                (m.name(e.name_index.get()).to_vec(), e.inode.get())
            })
            .collect();
        assert_eq!(
            children,
            [
                (b"alpha".to_vec(), 2),
                (b"etc".to_vec(), 1),
                (b"zeta".to_vec(), 3),
            ],
        );
        assert_eq!(m.link_target(2), "zeta");
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut b = Builder::new(&Config::default(), 0o755);
        let root = b.root();
        b.put_file(root, "a", 0o644, []).unwrap();
        assert!(b.put_dir(root, "a", 0o755).is_err());
    }

    #[test]
    fn chunk_table_is_csr() {
        let mut b = Builder::new(&Config::default(), 0o755);
        let root = b.root();
        b.put_file(root, "a", 0o644, [Chunk { block_id: 0, offset: 0, size: 7 }])
            .unwrap();
        b.put_file(root, "b", 0o644, []).unwrap();
        b.put_file(
            root,
            "c",
            0o644,
            [
                Chunk { block_id: 0, offset: 7, size: 3 },
                Chunk { block_id: 1, offset: 0, size: 5 },
            ],
        )
        .unwrap();

        let (schema, payload) = b.finish().unwrap();
        let m = parse(schema, payload, 2);

        // Files keep their insertion order: a, b, c get inodes 1, 2, 3.
        let sizes: Vec<u64> = (1..=3)
            .map(|ino| {
                m.chunks_of(ino)
                    .unwrap()
                    .iter()
                    .map(|c| u64::from(c.size.get()))
                    .sum()
            })
            .collect();
        assert_eq!(sizes, [7, 0, 8]);
    }
}
