//! End-to-end round trips through the scanner: real directory trees in,
//! images out, read back and compared.

use std::{fs, num::NonZero, os::unix::fs as ufs, path::Path, sync::Arc};

use shalefs::{Compression, EntryKind, Image, ImageIndex, StatDefaults};
use shalefs_enc::{
    progress::Progress,
    rewrite::{self, RewriteConfig},
    scanner::{FileOrder, OsAccessPosix, Scanner, ScannerOptions},
    segmenter::{self, Segmenter},
    writer::{ImageWriter, WriterConfig},
};

fn build_image(root: &Path, order: FileOrder, compression: &str) -> (Vec<u8>, Arc<Progress>) {
    let progress = Arc::new(Progress::default());
    let writer_config = WriterConfig {
        compression: Compression::parse(compression).unwrap(),
        schema_compression: Compression::Null,
        metadata_compression: Compression::Null,
        num_workers: NonZero::new(2).expect("not zero"),
        memory_limit: 1 << 30,
    };
    let seg_config = segmenter::Config {
        block_size_bits: 16,
        window_size_bits: vec![11],
        window_increment_shift: 1,
    };
    let options = ScannerOptions {
        file_order: order,
        ..Default::default()
    };

    let mut writer =
        ImageWriter::new(Vec::new(), &writer_config, Arc::clone(&progress)).unwrap();
    let mut segmenter = Segmenter::new(&seg_config, Arc::clone(&progress)).unwrap();
    let scanner = Scanner::new(
        Arc::new(OsAccessPosix),
        options,
        None,
        2,
        Arc::clone(&progress),
    )
    .unwrap();

    let (schema, metadata) = scanner.scan(root, &mut segmenter, &mut writer).unwrap();
    segmenter.finish(&mut writer).unwrap();
    (writer.finish(&schema, &metadata).unwrap(), progress)
}

/// Compare an image subtree against the source tree it was built from.
fn assert_tree_matches(
    index: &ImageIndex,
    image: &mut Image<Vec<u8>>,
    entry: &shalefs::Entry<'_>,
    src: &Path,
) {
    let meta = fs::symlink_metadata(src).unwrap();
    let stat = index.getattr(entry, &StatDefaults::current());
    assert_eq!(stat.mode & 0o222, 0, "write bits must be cleared: {src:?}");

    match entry.kind() {
        EntryKind::Directory => {
            assert!(meta.is_dir());
            let mut src_names: Vec<_> = fs::read_dir(src)
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            src_names.sort();
            let dir = entry.as_dir().unwrap();
            assert_eq!(dir.entries().len(), src_names.len(), "at {src:?}");
            for (child, name) in dir.entries().zip(&src_names) {
                assert_eq!(
                    child.name().to_vec(),
                    name.as_encoded_bytes(),
                    "names diverge at {src:?}",
                );
                assert_tree_matches(index, image, &child, &src.join(name));
            }
        }
        EntryKind::Regular => {
            let content = fs::read(src).unwrap();
            assert_eq!(image.read_file(entry).unwrap(), content, "at {src:?}");
            assert_eq!(stat.size, content.len() as u64);
        }
        EntryKind::Symlink => {
            let target = fs::read_link(src).unwrap();
            assert_eq!(
                entry.target().to_vec(),
                target.as_os_str().as_encoded_bytes(),
            );
        }
        EntryKind::Other => {}
    }
}

fn populate_sample_tree(root: &Path) {
    fs::create_dir_all(root.join("src/nested")).unwrap();
    fs::create_dir(root.join("empty")).unwrap();
    fs::write(root.join("src/lib.rs"), b"pub fn answer() -> u32 { 42 }\n").unwrap();
    fs::write(root.join("src/nested/mod.rs"), vec![0x5Au8; 10_000]).unwrap();
    fs::write(root.join("src/nested/copy.rs"), vec![0x5Au8; 10_000]).unwrap();
    fs::write(root.join("zero"), b"").unwrap();
    ufs::symlink("src/lib.rs", root.join("link")).unwrap();
}

#[test]
fn round_trip_identity() {
    let tmp = tempfile::tempdir().unwrap();
    populate_sample_tree(tmp.path());

    let (bytes, progress) = build_image(tmp.path(), FileOrder::Similarity, "null");
    assert_eq!(Progress::get(&progress.errors), 0);
    assert_eq!(Progress::get(&progress.files_scanned), 4);

    let (index, mut image) = Image::open(bytes).unwrap();
    let root = index.root();
    assert_tree_matches(&index, &mut image, &root, tmp.path());

    // The two identical 10000-byte files deduplicated against each other.
    assert!(Progress::get(&progress.saved_bytes) >= 9_000);
}

#[test]
fn path_order_is_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    populate_sample_tree(tmp.path());

    let (a, _) = build_image(tmp.path(), FileOrder::Path, "null");
    let (b, _) = build_image(tmp.path(), FileOrder::Path, "null");
    assert_eq!(a, b, "two builds of the same tree must be byte-identical");
}

#[test]
fn unreadable_files_are_counted_not_fatal() {
    use std::os::unix::fs::PermissionsExt;

    if rustix::process::geteuid().is_root() {
        // Root reads anything; the scenario cannot be produced.
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("ok"), b"fine").unwrap();
    let bad = tmp.path().join("bad");
    fs::write(&bad, b"secret").unwrap();
    fs::set_permissions(&bad, fs::Permissions::from_mode(0o000)).unwrap();

    let (bytes, progress) = build_image(tmp.path(), FileOrder::None, "null");
    assert_eq!(Progress::get(&progress.errors), 1);

    let (index, mut image) = Image::open(bytes).unwrap();
    let ok = index.find("ok").unwrap();
    assert_eq!(image.read_file(&ok).unwrap(), b"fine");
    // The unreadable file is absent from the image.
    assert!(index.find("bad").is_none());

    fs::set_permissions(&bad, fs::Permissions::from_mode(0o644)).unwrap();
}

#[cfg(feature = "zstd")]
#[test]
fn recompress_preserves_content() {
    let tmp = tempfile::tempdir().unwrap();
    populate_sample_tree(tmp.path());

    let (original, _) = build_image(tmp.path(), FileOrder::Path, "zstd:level=1");

    let progress = Arc::new(Progress::default());
    let writer_config = WriterConfig {
        compression: Compression::parse(if cfg!(feature = "lzma") {
            "lzma:level=9:extreme"
        } else {
            "zstd:level=19"
        })
        .unwrap(),
        schema_compression: Compression::Null,
        metadata_compression: Compression::Null,
        num_workers: NonZero::new(2).expect("not zero"),
        memory_limit: 1 << 30,
    };
    let writer = ImageWriter::new(Vec::new(), &writer_config, progress).unwrap();
    let repacked = rewrite::rewrite(&original, writer, &RewriteConfig::default()).unwrap();

    let (index_a, mut image_a) = Image::open(original).unwrap();
    let (index_b, mut image_b) = Image::open(repacked).unwrap();

    // Chunk lists and the whole metadata survive byte-for-byte.
    assert_eq!(
        index_a.metadata().chunks(),
        index_b.metadata().chunks(),
        "recompression must not touch chunk references",
    );
    assert_eq!(index_a.block_count(), index_b.block_count());

    let mut paths = vec![];
    index_a.walk(|e| {
        if e.kind() == EntryKind::Regular {
            paths.push(e.inode());
        }
    });
    for ino in paths {
        let a = index_a.find_inode(u64::from(ino)).unwrap();
        let b = index_b.find_inode(u64::from(ino)).unwrap();
        assert_eq!(
            image_a.read_file(&a).unwrap(),
            image_b.read_file(&b).unwrap(),
        );
    }

    assert_tree_matches(&index_b, &mut image_b, &index_b.root(), tmp.path());
}
