//! The source tree scanner: walks a directory tree, orders the regular
//! files, and drives the segmenter and metadata builder.
//!
//! OS access goes through the [`OsAccess`] trait so the walk is testable and
//! portable; [`OsAccessPosix`] is the real implementation. User-supplied
//! filtering and ordering plug in through [`Script`].
//!
//! Per-file I/O errors are counted into the progress and logged; the scan
//! continues without the file. Everything else is fatal.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bstr::{BStr, BString, ByteSlice};
use xxhash_rust::xxh32::xxh32;

use crate::{
    ErrorInner, Result,
    metadata::{Builder, Config as MetaConfig, DirId},
    progress::Progress,
    segmenter::Segmenter,
    worker::WorkerGroup,
    writer::ImageWriter,
};

/// How regular files are ordered before segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileOrder {
    /// Directory walk order.
    None,
    /// Lexicographic by absolute path.
    Path,
    /// Locality-sensitive content hash order, so that likely-similar files
    /// are fed to the segmenter consecutively.
    #[default]
    Similarity,
    /// Ascending [`Script::order_key`].
    Script,
}

/// Metadata of one candidate entry, handed to [`Script`] hooks.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo<'a> {
    pub path: &'a Path,
    pub name: &'a BStr,
    pub size: u64,
    pub mode: u32,
}

/// A user-provided filter and ordering plug-in.
pub trait Script: Send + Sync {
    /// Whether to include this entry (and, for directories, descend).
    fn filter(&self, entry: &EntryInfo<'_>) -> Result<bool, String>;
    /// Ordering key for regular files under [`FileOrder::Script`]; files
    /// are fed to the segmenter in ascending key order.
    fn order_key(&self, entry: &EntryInfo<'_>) -> Result<u64, String>;
}

/// Read-only file content, borrowed from the OS.
pub struct FileContents {
    // `None` for empty files, which cannot be mapped.
    map: Option<memmap2::Mmap>,
}

impl fmt::Debug for FileContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContents")
            .field("len", &self.as_bytes().len())
            .finish()
    }
}

impl FileContents {
    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

/// The slice of OS the scanner needs. Paths are always absolute within the
/// source tree.
pub trait OsAccess: Send + Sync {
    /// List the names of a directory's entries, in any order.
    fn open_directory(&self, path: &Path) -> io::Result<Vec<std::ffi::OsString>>;
    /// `lstat`: never follows symlinks.
    fn stat(&self, path: &Path) -> io::Result<fs::Metadata>;
    fn read_symlink(&self, path: &Path) -> io::Result<PathBuf>;
    /// Open a regular file and map its content.
    fn open_file(&self, path: &Path) -> io::Result<FileContents>;
}

/// [`OsAccess`] over the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsAccessPosix;

impl OsAccess for OsAccessPosix {
    fn open_directory(&self, path: &Path) -> io::Result<Vec<std::ffi::OsString>> {
        fs::read_dir(path)?
            .map(|ent| Ok(ent?.file_name()))
            .collect()
    }

    fn stat(&self, path: &Path) -> io::Result<fs::Metadata> {
        fs::symlink_metadata(path)
    }

    fn read_symlink(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    #[allow(unsafe_code)]
    fn open_file(&self, path: &Path) -> io::Result<FileContents> {
        let file = fs::File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(FileContents { map: None });
        }
        // The source tree is assumed stable during the build; a concurrent
        // truncation would fault, like every other mmap consumer.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(FileContents { map: Some(map) })
    }
}

/// Scanner configuration beyond the segmenter's own.
#[derive(Debug, Default)]
pub struct ScannerOptions {
    pub file_order: FileOrder,
    /// Whole-image owner/group/mtime overrides, recorded in the schema.
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Dir,
    File,
    Symlink,
    Other,
}

/// One entry collected during the walk.
struct Node {
    path: PathBuf,
    name: BString,
    mode: u32,
    size: u64,
    kind: NodeKind,
    /// Index of the parent directory node; children of the scan root point
    /// at themselves and resolve to the builder's root.
    parent: usize,
    target: Option<BString>,
}

/// The tree scanner. See [module level documentation][self].
pub struct Scanner {
    os: Arc<dyn OsAccess>,
    options: ScannerOptions,
    script: Option<Box<dyn Script>>,
    workers: WorkerGroup,
    progress: Arc<Progress>,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("options", &self.options)
            .field("has_script", &self.script.is_some())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn new(
        os: Arc<dyn OsAccess>,
        options: ScannerOptions,
        script: Option<Box<dyn Script>>,
        max_workers: usize,
        progress: Arc<Progress>,
    ) -> Result<Self> {
        if options.file_order == FileOrder::Script && script.is_none() {
            bail!(ErrorInner::Config(
                "file order `script` requires a script".into()
            ));
        }
        // Bound the readahead so hashing cannot outrun the segmenter by
        // more than a queue's worth of files.
        let workers = WorkerGroup::new_load_adaptive("scanner", max_workers, max_workers * 4)?;
        Ok(Self {
            os,
            options,
            script,
            workers,
            progress,
        })
    }

    /// Walk `root`, feed every regular file through `segmenter` into
    /// `writer`, and return the frozen `(schema, metadata)` payloads.
    ///
    /// The caller still owns the writer and must
    /// [`finish`][ImageWriter::finish] it with the returned payloads.
    pub fn scan<W: std::io::Write>(
        mut self,
        root: &Path,
        segmenter: &mut Segmenter,
        writer: &mut ImageWriter<W>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let nodes = self.collect_tree(root)?;
        let file_order = self.order_files(&nodes)?;

        let root_meta = self.os.stat(root)?;
        if !root_meta.is_dir() {
            bail!(ErrorInner::Config(format!(
                "source {} is not a directory",
                root.display()
            )));
        }
        let meta_config = MetaConfig {
            block_size_bits: Some(segmenter.block_size_bits()),
            owner: self.options.owner,
            group: self.options.group,
            mtime: self.options.timestamp,
        };
        let mut builder = Builder::new(&meta_config, unix_mode(&root_meta));

        // Directories, symlinks and specials first, in walk order; parents
        // always precede their children.
        let mut dir_ids: Vec<Option<DirId>> = vec![None; nodes.len()];
        for (idx, node) in nodes.iter().enumerate() {
            let parent_id = dir_ids[node.parent].unwrap_or_else(|| builder.root());
            match node.kind {
                NodeKind::Dir => {
                    let id = builder.put_dir(parent_id, &node.name, node.mode)?;
                    dir_ids[idx] = Some(id);
                }
                NodeKind::Symlink => {
                    let target = node.target.as_ref().expect("read during walk");
                    builder.put_symlink(parent_id, &node.name, node.mode, target)?;
                }
                NodeKind::Other => builder.put_other(parent_id, &node.name, node.mode)?,
                NodeKind::File => {}
            }
        }

        // Then the regular files, in the chosen order.
        for idx in file_order {
            if self.progress.is_cancelled() {
                bail!(ErrorInner::Cancelled);
            }
            let node = &nodes[idx];
            let parent_id = dir_ids[node.parent].unwrap_or_else(|| builder.root());
            self.progress.set_current_file(&node.path);
            let contents = match self.os.open_file(&node.path) {
                Ok(c) => c,
                Err(err) => {
                    log::warn!("failed to read {}: {}", node.path.display(), err);
                    Progress::bump(&self.progress.errors, 1);
                    continue;
                }
            };
            let chunks = segmenter.add_file(contents.as_bytes(), writer)?;
            builder.put_file(parent_id, &node.name, node.mode, chunks)?;
            Progress::bump(&self.progress.files_scanned, 1);
        }

        self.workers.wait();
        builder.finish()
    }

    /// Walk the tree breadth-first with name-sorted children, collecting
    /// every entry that passes the filter.
    fn collect_tree(&self, root: &Path) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        // Queue of directories to list: (node index of parent, path).
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((usize::MAX, root.to_path_buf()));

        while let Some((parent_idx, dir_path)) = queue.pop_front() {
            if self.progress.is_cancelled() {
                bail!(ErrorInner::Cancelled);
            }
            let mut names = match self.os.open_directory(&dir_path) {
                Ok(names) => names,
                Err(err) => {
                    log::warn!("failed to list {}: {}", dir_path.display(), err);
                    Progress::bump(&self.progress.errors, 1);
                    continue;
                }
            };
            names.sort_unstable_by(|a, b| os_name_bytes(a).cmp(os_name_bytes(b)));

            for name in names {
                let path = dir_path.join(&name);
                let meta = match self.os.stat(&path) {
                    Ok(meta) => meta,
                    Err(err) => {
                        log::warn!("failed to stat {}: {}", path.display(), err);
                        Progress::bump(&self.progress.errors, 1);
                        continue;
                    }
                };

                let kind = if meta.is_dir() {
                    NodeKind::Dir
                } else if meta.is_file() {
                    NodeKind::File
                } else if meta.is_symlink() {
                    NodeKind::Symlink
                } else {
                    NodeKind::Other
                };
                let name = BString::from(os_name_bytes(&name).to_vec());
                let mode = unix_mode(&meta);

                if let Some(script) = &self.script {
                    let info = EntryInfo {
                        path: &path,
                        name: name.as_bstr(),
                        size: meta.len(),
                        mode,
                    };
                    match script.filter(&info) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(msg) => bail!(ErrorInner::Filter(msg)),
                    }
                }

                let target = if kind == NodeKind::Symlink {
                    match self.os.read_symlink(&path) {
                        Ok(t) => Some(BString::from(os_name_bytes(t.as_os_str()).to_vec())),
                        Err(err) => {
                            log::warn!("failed to read symlink {}: {}", path.display(), err);
                            Progress::bump(&self.progress.errors, 1);
                            continue;
                        }
                    }
                } else {
                    None
                };

                let idx = nodes.len();
                nodes.push(Node {
                    path: path.clone(),
                    name,
                    mode,
                    size: meta.len(),
                    kind,
                    parent: if parent_idx == usize::MAX { idx } else { parent_idx },
                    target,
                });
                Progress::bump(&self.progress.files_found, 1);
                if kind == NodeKind::Dir {
                    queue.push_back((idx, path));
                }
            }
        }
        Ok(nodes)
    }

    /// Compute the order in which regular files are fed to the segmenter.
    fn order_files(&self, nodes: &[Node]) -> Result<Vec<usize>> {
        let mut files: Vec<usize> = (0..nodes.len())
            .filter(|&i| nodes[i].kind == NodeKind::File)
            .collect();

        match self.options.file_order {
            FileOrder::None => {}
            FileOrder::Path => {
                files.sort_by(|&a, &b| {
                    os_name_bytes(nodes[a].path.as_os_str())
                        .cmp(os_name_bytes(nodes[b].path.as_os_str()))
                });
            }
            FileOrder::Similarity => {
                let handles: Vec<_> = files
                    .iter()
                    .map(|&idx| {
                        let os = Arc::clone(&self.os);
                        let path = nodes[idx].path.clone();
                        let progress = Arc::clone(&self.progress);
                        self.workers.submit_with_result(move || {
                            match os.open_file(&path) {
                                Ok(contents) => {
                                    let data = contents.as_bytes();
                                    let sample = &data[..data.len().min(SIMILARITY_SAMPLE)];
                                    similarity_hash(sample)
                                }
                                Err(err) => {
                                    log::warn!("failed to sample {}: {}", path.display(), err);
                                    Progress::bump(&progress.errors, 1);
                                    0
                                }
                            }
                        })
                    })
                    .collect();
                let keys: Vec<u32> = handles.into_iter().map(|h| gray_code(h.wait())).collect();
                let mut keyed: Vec<(u32, usize)> =
                    keys.into_iter().zip(files.iter().copied()).collect();
                keyed.sort_by_key(|&(key, idx)| (key, idx));
                files = keyed.into_iter().map(|(_, idx)| idx).collect();
            }
            FileOrder::Script => {
                let script = self.script.as_ref().expect("checked in new");
                let mut keyed = Vec::with_capacity(files.len());
                for idx in files {
                    let node = &nodes[idx];
                    let info = EntryInfo {
                        path: &node.path,
                        name: node.name.as_bstr(),
                        size: node.size,
                        mode: node.mode,
                    };
                    let key = script.order_key(&info).map_err(ErrorInner::Filter)?;
                    keyed.push((key, idx));
                }
                keyed.sort_by_key(|&(key, idx)| (key, idx));
                files = keyed.into_iter().map(|(_, idx)| idx).collect();
            }
        }
        Ok(files)
    }
}

#[cfg(unix)]
fn os_name_bytes(name: &std::ffi::OsStr) -> &[u8] {
    std::os::unix::ffi::OsStrExt::as_bytes(name)
}

#[cfg(unix)]
fn unix_mode(meta: &fs::Metadata) -> u32 {
    std::os::unix::fs::MetadataExt::mode(meta)
}

/// At most this many leading bytes take part in the similarity key of a
/// large file.
const SIMILARITY_SAMPLE: usize = 64 << 10;

/// A tiny nilsimsa-flavored locality-sensitive hash: a histogram of hashed
/// byte trigrams, folded to one bit per bucket against the mean.
///
/// Similar content produces keys at a small Hamming distance, and
/// [`gray_code`] ordering keeps small-distance keys numerically close, so
/// sorting by it feeds likely-redundant files to the segmenter in
/// succession.
pub fn similarity_hash(data: &[u8]) -> u32 {
    let mut counts = [0u32; 32];
    for w in data.windows(3) {
        let bucket = xxh32(w, 0) % 32;
        counts[bucket as usize] += 1;
    }
    let total: u64 = counts.iter().map(|&c| u64::from(c)).sum();
    let mean = (total / 32) as u32;
    counts
        .iter()
        .enumerate()
        .fold(0u32, |key, (i, &c)| key | (u32::from(c > mean) << i))
}

/// Reflected binary code; adjacent values differ in one bit.
pub fn gray_code(v: u32) -> u32 {
    v ^ (v >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_groups_similar_content() {
        let base: Vec<u8> = (0..4096u32).flat_map(|i| (i / 3).to_le_bytes()).collect();
        let mut tweaked = base.clone();
        for b in tweaked.iter_mut().skip(100).take(32) {
            *b ^= 0xFF;
        }
        let unrelated: Vec<u8> = (0..4096u32)
            .flat_map(|i| (i.wrapping_mul(2_654_435_761)).to_le_bytes())
            .collect();

        let a = similarity_hash(&base);
        let b = similarity_hash(&tweaked);
        let c = similarity_hash(&unrelated);
        assert!(
            (a ^ b).count_ones() <= (a ^ c).count_ones(),
            "tweaked content drifted further than unrelated content",
        );
    }

    #[test]
    fn gray_code_neighbors_differ_in_one_bit() {
        for v in 0..1000u32 {
            assert_eq!((gray_code(v) ^ gray_code(v + 1)).count_ones(), 1);
        }
    }
}
