//! The low-level module for accessing sections in a ShaleFS image.
//!
//! An image is a plain stream of sections. Each section is a 9-byte
//! [`SectionHeader`] (one kind byte and a little-endian `u64` payload size)
//! followed by that many payload bytes. Sections are self-delimiting, so the
//! whole image can be enumerated by a single forward scan and no trailing
//! index is needed. Block ids are implicit: the n-th `BLOCK` section holds
//! block n.

use std::fmt;

use positioned_io::ReadAt;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned, little_endian as le};

use crate::compress;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from scanning, reading, or decompressing sections.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
#[non_exhaustive]
enum ErrorInner {
    UnknownKind(u8),
    TruncatedSection { offset: u64 },
    OffsetOverflow,
    PayloadTooLong { limit: usize, got: u64 },
    Decompress(compress::Error),
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
            ErrorInner::UnknownKind(kind) => write!(f, "unknown section kind {kind}"),
            ErrorInner::TruncatedSection { offset } => {
                write!(f, "truncated section at offset {offset}")
            }
            ErrorInner::OffsetOverflow => f.pad("section offset overflow"),
            ErrorInner::PayloadTooLong { limit, got } => {
                write!(
                    f,
                    "section payload has {got} bytes, exceeding the limit of {limit} bytes"
                )
            }
            ErrorInner::Decompress(err) => write!(f, "failed to decompress section payload: {err}"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Decompress(err) => Some(err),
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<compress::Error> for Error {
    #[cold]
    fn from(err: compress::Error) -> Self {
        Self(Box::new(ErrorInner::Decompress(err)))
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

pub(crate) const HEADER_SIZE: u64 = size_of::<SectionHeader>() as u64;

/// The section header: one kind byte and the compressed payload length.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C, packed)]
pub struct SectionHeader {
    /// The type of this section.
    pub kind: SectionKind,
    /// The length in bytes of the (compressed) payload following.
    pub payload_size: le::U64,
}

impl fmt::Debug for SectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionHeader")
            .field("kind", &self.kind)
            .field("payload_size", &self.payload_size.get())
            .finish()
    }
}

/// The type of a section.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(transparent)]
pub struct SectionKind(pub u8);

macro_rules! impl_open_enum {
    ($name:ident; $($(#[$meta:meta])* $variant:ident = $value:expr,)*) => {
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(match *self {
                    $(Self::$variant => stringify!($variant),)*
                    _ => return f
                        .debug_tuple(stringify!($name))
                        .field(&self.0)
                        .finish(),
                })
            }
        }

        impl $name {
            $(
                $(#[$meta])*
                pub const $variant: Self = Self($value);
            )*
        }
    };
}

impl_open_enum! {
    SectionKind;

    /// A block of file data.
    BLOCK = 1,
    /// The fixed schema struct describing the metadata layout,
    /// see [`crate::metadata::Schema`].
    SCHEMA = 2,
    /// The frozen metadata vectors, see [`crate::metadata::Metadata`].
    /// This must be the last section.
    META = 3,
}

impl SectionKind {
    fn validate(self) -> Result<()> {
        match self {
            Self::BLOCK | Self::SCHEMA | Self::META => Ok(()),
            Self(other) => bail!(ErrorInner::UnknownKind(other)),
        }
    }
}

/// The kind and start offset of one section found by [`SectionReader::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    pub kind: SectionKind,
    /// Offset of the section header from the start of the image.
    pub offset: u64,
}

/// The wrapper type for reading sections from a random access reader.
///
/// The inner type should implement [`positioned_io::ReadAt`], typically
/// [`std::fs::File`] or an in-memory `Vec<u8>`. No additional buffering is
/// needed; payloads are read in one piece.
pub struct SectionReader<R: ?Sized> {
    /// The temporary buffer for raw compressed section payload.
    /// It is stored only for allocation reuse. This struct is still state-less.
    raw_buf: Vec<u8>,
    rdr: R,
}

impl<R: fmt::Debug + ?Sized> fmt::Debug for SectionReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionReader")
            .field(
                "raw_buf",
                &format_args!("{}/{}", self.raw_buf.len(), self.raw_buf.capacity()),
            )
            .field("rdr", &&self.rdr)
            .finish()
    }
}

impl<R> SectionReader<R> {
    /// Create a new section reader wrapping an existing random access stream.
    pub fn new(rdr: R) -> Self {
        SectionReader {
            raw_buf: Vec::new(),
            rdr,
        }
    }
}

impl<R: ?Sized> SectionReader<R> {
    /// Get a reference to the underlying reader.
    #[inline]
    #[must_use]
    pub fn get_ref(&self) -> &R {
        &self.rdr
    }

    /// Get a mutable reference to the underlying reader.
    #[inline]
    #[must_use]
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.rdr
    }

    /// Retrieve the ownership of the underlying reader.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> R
    where
        R: Sized,
    {
        self.rdr
    }
}

impl<R: ReadAt + ?Sized> SectionReader<R> {
    /// Read a section header at `offset`.
    pub fn read_header_at(&mut self, offset: u64) -> Result<SectionHeader> {
        let mut header = SectionHeader::new_zeroed();
        self.rdr
            .read_exact_at(offset, header.as_mut_bytes())
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    ErrorInner::TruncatedSection { offset }.into()
                } else {
                    Error::from(err)
                }
            })?;
        header.kind.validate()?;
        Ok(header)
    }

    /// Enumerate all sections by a forward scan over the self-delimiting
    /// stream.
    ///
    /// `stream_len` is the total size of the underlying stream; the last
    /// section must end exactly there.
    pub fn scan(&mut self, stream_len: u64) -> Result<Vec<SectionEntry>> {
        let mut sections = Vec::new();
        let mut offset = 0u64;
        while offset < stream_len {
            let header = self.read_header_at(offset)?;
            sections.push(SectionEntry {
                kind: header.kind,
                offset,
            });
            let next = offset
                .checked_add(HEADER_SIZE)
                .and_then(|o| o.checked_add(header.payload_size.get()))
                .ok_or(ErrorInner::OffsetOverflow)?;
            if next > stream_len {
                bail!(ErrorInner::TruncatedSection { offset });
            }
            offset = next;
        }
        debug_assert_eq!(offset, stream_len);
        Ok(sections)
    }

    /// Read and decompress a full section at `offset` into memory.
    pub fn read_section_at(
        &mut self,
        offset: u64,
        payload_size_limit: usize,
    ) -> Result<(SectionHeader, Vec<u8>)> {
        let header = self.read_header_at(offset)?;
        let mut out = vec![0u8; payload_size_limit];
        let len = self.read_payload_at_into(&header, offset + HEADER_SIZE, &mut out)?;
        out.truncate(len);
        Ok((header, out))
    }

    /// Read and decompress the section payload of given header into a buffer,
    /// returning the decompressed length.
    ///
    /// `payload_offset` is the offset just after the section header. Both the
    /// compressed and the decompressed size must fit in `out.len()`, or an
    /// error is emitted.
    pub fn read_payload_at_into(
        &mut self,
        header: &SectionHeader,
        payload_offset: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        let size_limit = out.len();
        let compressed_size = header.payload_size.get();
        let compressed_size = usize::try_from(compressed_size)
            .ok()
            .filter(|&n| n <= size_limit)
            .ok_or(ErrorInner::PayloadTooLong {
                limit: size_limit,
                got: compressed_size,
            })?;
        let raw_buf = &mut self.raw_buf;
        raw_buf.resize(compressed_size, 0);
        self.rdr.read_exact_at(payload_offset, raw_buf)?;
        let len = compress::decompress_into(raw_buf, out)?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: SectionKind, payload: &[u8]) -> Vec<u8> {
        let header = SectionHeader {
            kind,
            payload_size: (payload.len() as u64).into(),
        };
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn header_layout() {
        assert_eq!(HEADER_SIZE, 9);
        let bytes = frame(SectionKind::BLOCK, b"xy");
        assert_eq!(bytes, [1, 2, 0, 0, 0, 0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn scan_sections() {
        let mut image = frame(SectionKind::BLOCK, b"0123");
        image.extend_from_slice(&frame(SectionKind::SCHEMA, b""));
        image.extend_from_slice(&frame(SectionKind::META, b"m"));

        let mut rdr = SectionReader::new(image.clone());
        let sections = rdr.scan(image.len() as u64).unwrap();
        assert_eq!(
            sections
                .iter()
                .map(|s| (s.kind, s.offset))
                .collect::<Vec<_>>(),
            [
                (SectionKind::BLOCK, 0),
                (SectionKind::SCHEMA, 13),
                (SectionKind::META, 22),
            ],
        );

        let (header, payload) = rdr.read_section_at(0, 64).unwrap();
        assert_eq!(header.kind, SectionKind::BLOCK);
        assert_eq!(payload, b"0123");
    }

    #[test]
    fn scan_rejects_truncation() {
        let mut image = frame(SectionKind::BLOCK, b"0123");
        image.pop();
        let mut rdr = SectionReader::new(image.clone());
        let err = rdr.scan(image.len() as u64).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn scan_rejects_unknown_kind() {
        let image = frame(SectionKind(9), b"");
        let mut rdr = SectionReader::new(image.clone());
        let err = rdr.scan(image.len() as u64).unwrap_err();
        assert!(err.to_string().contains("unknown section kind"));
    }
}
