//! Recompress an existing image with new codec settings.
//!
//! The input image is memory-mapped and walked section by section. `BLOCK`
//! payloads are decompressed and resubmitted through an [`ImageWriter`], so
//! they flow through the same worker pool, ordering, and memory budget as a
//! fresh build; the schema and metadata payloads are repacked as the final
//! sections. Chunk references and metadata bytes are untouched, making this
//! a pure re-encoding of payloads.

use std::io::Write;

use shalefs::compress::decompress_into;
use shalefs::metadata::Schema;
use shalefs::section::{SectionHeader, SectionKind};
use shalefs::zerocopy::FromBytes;

use crate::{ErrorInner, Result, writer::ImageWriter};

/// Size limit for the decompressed schema and metadata payloads.
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    pub schema_size_limit: usize,
    pub metadata_size_limit: usize,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            schema_size_limit: 1 << 20,
            metadata_size_limit: 64 << 20,
        }
    }
}

/// Memory-map an image file for [`rewrite`].
#[allow(unsafe_code)]
pub fn map_image(file: &std::fs::File) -> std::io::Result<memmap2::Mmap> {
    // The image is assumed immutable while it is being rewritten.
    unsafe { memmap2::Mmap::map(file) }
}

/// Re-encode every section of `input` through `writer`.
///
/// The writer's configuration supplies the new block, schema and metadata
/// codecs. Returns the underlying output stream.
pub fn rewrite<W: Write>(
    input: &[u8],
    mut writer: ImageWriter<W>,
    config: &RewriteConfig,
) -> Result<W> {
    let sections = scan_sections(input)?;

    // The schema tells us the block size, which bounds every decompressed
    // BLOCK payload.
    let schema_raw = sections
        .iter()
        .filter(|s| s.kind == SectionKind::SCHEMA)
        .map(|s| decompress_section(s, config.schema_size_limit))
        .collect::<Result<Vec<_>>>()?;
    let [schema_raw] = schema_raw.try_into().map_err(|_| {
        ErrorInner::Rewrite("expected exactly one schema section".into())
    })?;
    let schema = Schema::parse(&schema_raw)
        .map_err(|err| ErrorInner::Rewrite(err.to_string()))?;
    let block_size = 1usize << schema.block_size_bits.get();

    let mut metadata_raw = None;
    for section in &sections {
        match section.kind {
            SectionKind::BLOCK => {
                let block = decompress_section(section, block_size)?;
                writer.write_block(block)?;
            }
            SectionKind::SCHEMA => {}
            SectionKind::META => {
                if metadata_raw.is_some() {
                    bail!(ErrorInner::Rewrite(
                        "expected exactly one metadata section".into()
                    ));
                }
                metadata_raw = Some(decompress_section(section, config.metadata_size_limit)?);
            }
            kind => bail!(ErrorInner::Rewrite(format!("unknown section kind {kind:?}"))),
        }
    }
    let metadata_raw = metadata_raw
        .ok_or_else(|| ErrorInner::Rewrite("missing metadata section".into()))?;

    writer.finish(&schema_raw, &metadata_raw)
}

struct RawSection<'a> {
    kind: SectionKind,
    payload: &'a [u8],
}

/// Walk the self-delimiting section stream of a mapped image.
fn scan_sections(input: &[u8]) -> Result<Vec<RawSection<'_>>> {
    let mut sections = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let (header, after) = SectionHeader::read_from_prefix(rest)
            .map_err(|_| ErrorInner::Rewrite("truncated section header".into()))?;
        let size = usize::try_from(header.payload_size.get())
            .ok()
            .filter(|&n| n <= after.len())
            .ok_or_else(|| ErrorInner::Rewrite("truncated section payload".into()))?;
        sections.push(RawSection {
            kind: header.kind,
            payload: &after[..size],
        });
        rest = &after[size..];
    }
    Ok(sections)
}

fn decompress_section(section: &RawSection<'_>, size_limit: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; size_limit];
    let len = decompress_into(section.payload, &mut out)?;
    out.truncate(len);
    Ok(out)
}
