//! Builder-level round trips: construct images in memory and read them back
//! through the `shalefs` crate.

use std::{io::Write, num::NonZero, sync::Arc};

use shalefs::{Compression, EntryKind, Image, StatDefaults, section::SectionKind};
use shalefs_enc::{
    metadata::{Builder, Chunk, Config as MetaConfig},
    progress::Progress,
    segmenter::{self, Segmenter},
    writer::{ImageWriter, WriterConfig},
};

fn writer_config(compression: Compression) -> WriterConfig {
    WriterConfig {
        compression,
        schema_compression: Compression::Null,
        metadata_compression: Compression::Null,
        num_workers: NonZero::new(2).expect("not zero"),
        memory_limit: 1 << 30,
    }
}

fn build_with(
    seg_config: &segmenter::Config,
    compression: Compression,
    f: impl FnOnce(&mut Builder, &mut Segmenter, &mut ImageWriter<Vec<u8>>) -> shalefs_enc::Result<()>,
) -> Vec<u8> {
    let progress = Arc::new(Progress::default());
    let mut writer =
        ImageWriter::new(Vec::new(), &writer_config(compression), Arc::clone(&progress)).unwrap();
    let mut segmenter = Segmenter::new(seg_config, progress).unwrap();
    let meta_config = MetaConfig {
        block_size_bits: Some(seg_config.block_size_bits),
        ..Default::default()
    };
    let mut builder = Builder::new(&meta_config, 0o755);
    f(&mut builder, &mut segmenter, &mut writer).unwrap();
    segmenter.finish(&mut writer).unwrap();
    let (schema, metadata) = builder.finish().unwrap();
    writer.finish(&schema, &metadata).unwrap()
}

fn small_config() -> segmenter::Config {
    segmenter::Config {
        block_size_bits: 20,
        window_size_bits: vec![11],
        window_increment_shift: 1,
    }
}

#[test]
fn empty_image() {
    let bytes = build_with(&small_config(), Compression::Null, |_, _, _| Ok(()));
    let (index, _image) = Image::open(bytes).unwrap();

    // No data: zero BLOCK sections, one SCHEMA, one META.
    assert_eq!(index.block_count(), 0);
    assert_eq!(index.sections().len(), 2);
    assert_eq!(index.sections()[0].kind, SectionKind::SCHEMA);
    assert_eq!(index.sections()[1].kind, SectionKind::META);

    let root = index.root();
    assert_eq!(root.inode(), 0);
    assert_eq!(root.kind(), EntryKind::Directory);
    assert_eq!(root.as_dir().unwrap().entries().len(), 0);

    let stat = index.getattr(&root, &StatDefaults { uid: 42, gid: 43, time: 44 });
    assert_eq!(stat.mode, 0o40555);
    assert_eq!((stat.uid, stat.gid, stat.mtime), (42, 43, 44));
}

#[test]
fn single_byte_file() {
    let bytes = build_with(&small_config(), Compression::Null, |meta, seg, writer| {
        let chunks = seg.add_file(b"A", writer)?;
        assert_eq!(chunks, [Chunk { block_id: 0, offset: 0, size: 1 }]);
        meta.put_file(meta.root(), "a", 0o644, chunks)?;
        Ok(())
    });

    let (index, mut image) = Image::open(bytes).unwrap();
    assert_eq!(index.block_count(), 1);

    let a = index.find("/a").unwrap();
    assert_eq!(a.kind(), EntryKind::Regular);
    let stat = index.getattr(&a, &StatDefaults::current());
    assert_eq!(stat.size, 1);
    assert_eq!(stat.blocks, 1);
    assert_eq!(stat.mode, 0o100444);
    assert_eq!(image.read_file(&a).unwrap(), b"A");
}

#[test]
fn entry_tree_smoke() {
    let cfg = small_config();
    let bytes = build_with(&cfg, Compression::Null, |meta, seg, writer| {
        let root = meta.root();
        let dir = meta.put_dir(root, "0dir", 0o700)?;
        let chunks = seg.add_file(b"hello world", writer)?;
        meta.put_file(root, "1file", 0o644, chunks)?;
        meta.put_symlink(root, "2symlink", 0o777, "target/path")?;
        meta.put_other(root, "3socket", 0o140600)?;
        let chunks = seg.add_file(b"nested", writer)?;
        meta.put_file(dir, "inner", 0o600, chunks)?;
        Ok(())
    });

    let (index, mut image) = Image::open(bytes).unwrap();
    let root = index.root().as_dir().unwrap();

    let names: Vec<_> = root.entries().map(|e| e.name().to_vec()).collect();
    assert_eq!(names, [b"0dir".to_vec(), b"1file".to_vec(), b"2symlink".to_vec(), b"3socket".to_vec()]);

    let kinds: Vec<_> = root.entries().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        [EntryKind::Directory, EntryKind::Regular, EntryKind::Symlink, EntryKind::Other],
    );

    let link = index.find("2symlink").unwrap();
    assert_eq!(link.target(), "target/path");
    assert_eq!(link.size(), 11);

    let inner = index.find("0dir/inner").unwrap();
    assert_eq!(image.read_file(&inner).unwrap(), b"nested");
    assert!(index.find("0dir/none").is_none());
    assert!(index.find("1file/oops").is_none());

    // Inode lookups compose with directory search.
    let dir_ino = u64::from(index.find("0dir").unwrap().inode());
    assert_eq!(
        index.find_at(dir_ino, "inner").unwrap().inode(),
        inner.inode(),
    );
    assert_eq!(index.find_inode(u64::from(inner.inode())).unwrap().name(), "inner");

    // Walk visits every entry exactly once, parents before children.
    let mut visited = Vec::new();
    index.walk(|e| visited.push(e.inode()));
    visited.sort_unstable();
    assert_eq!(visited, (0..index.metadata().inode_count()).collect::<Vec<_>>());

    let mut dump = Vec::new();
    index
        .dump(&mut dump, &mut |out, indent, inode| {
            writeln!(out, "{indent}chunks of inode {inode}")
        })
        .unwrap();
    let dump = String::from_utf8(dump).unwrap();
    assert!(dump.contains("2symlink -> target/path"), "{dump}");
    assert!(dump.contains("---drwx------ 0dir"), "{dump}");
}

#[cfg(feature = "zstd")]
#[test]
fn compressed_blocks_round_trip() {
    let data: Vec<u8> = (0..1u32 << 16).flat_map(|i| (i / 9).to_le_bytes()).collect();
    let bytes = build_with(
        &small_config(),
        Compression::Zstd { level: 3 },
        |meta, seg, writer| {
            let chunks = seg.add_file(&data, writer)?;
            meta.put_file(meta.root(), "data.bin", 0o644, chunks)?;
            Ok(())
        },
    );
    // Repetitive input must actually shrink.
    assert!(bytes.len() < data.len() / 2, "no compression happened");

    let (index, mut image) = Image::open(bytes).unwrap();
    let entry = index.find("data.bin").unwrap();
    assert_eq!(image.read_file(&entry).unwrap(), data);
}

#[test]
fn cancellation_stops_admission() {
    let progress = Arc::new(Progress::default());
    let mut writer = ImageWriter::new(
        Vec::new(),
        &writer_config(Compression::Null),
        Arc::clone(&progress),
    )
    .unwrap();

    writer.write_block(vec![0u8; 16]).unwrap();
    progress.request_cancel();
    let err = writer.write_block(vec![0u8; 16]).unwrap_err();
    assert_eq!(err.to_string(), "cancelled");
}

#[test]
fn many_files_share_one_block() {
    // Identical small files inside one block dedup down to one copy.
    let content = vec![0xA5u8; 4096];
    let cfg = segmenter::Config {
        block_size_bits: 16,
        window_size_bits: vec![11],
        window_increment_shift: 1,
    };
    let bytes = build_with(&cfg, Compression::Null, |meta, seg, writer| {
        let root = meta.root();
        for i in 0..8 {
            let chunks = seg.add_file(&content, writer)?;
            meta.put_file(root, format!("file{i}"), 0o644, chunks)?;
        }
        Ok(())
    });

    let (index, mut image) = Image::open(bytes).unwrap();
    assert_eq!(index.block_count(), 1);
    for i in 0..8 {
        let entry = index.find(&format!("file{i}")).unwrap();
        assert_eq!(image.read_file(&entry).unwrap(), content);
    }
    // All files alias the same handful of block bytes.
    let meta = index.metadata();
    let data_bytes: u64 = (0..meta.file_count())
        .flat_map(|k| meta.chunks_of(meta.chunk_index_offset() + k).unwrap())
        .map(|c| u64::from(c.size.get()))
        .sum();
    assert_eq!(data_bytes, 8 * 4096);
}
