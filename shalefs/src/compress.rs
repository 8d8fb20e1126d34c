//! Block compression codecs and the textual algorithm spec.
//!
//! A codec is selected by a spec string of the form `algo:key=value:flag`,
//! for example `zstd:level=22`, `lzma:level=9:extreme`, `lz4hc:level=9` or
//! plain `null`. Separators may be `:` or `,`.
//!
//! The section framing of a ShaleFS image does not record the codec; every
//! codec except `null` produces self-identifying, self-checking frames
//! (zstd, xz and LZ4 frame formats), so [`decompress_into`] recognizes the
//! payload by its frame magic and falls back to a plain copy otherwise.
//! Integrity of compressed payloads thus rides on the codec's native framing.

use std::fmt;

#[cfg(feature = "lz4")]
use std::io::{Read, Write};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from parsing a compression spec or running a codec.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
enum ErrorInner {
    UnknownAlgorithm(String),
    UnsupportedAlgorithm(&'static str),
    BadParameter(String),
    CorruptInput(std::io::Error),
    OutputOverflow { limit: usize },
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::UnknownAlgorithm(name) => {
                write!(f, "unknown compression algorithm {name:?}")
            }
            ErrorInner::UnsupportedAlgorithm(name) => {
                write!(f, "compression algorithm {name:?} is not built into this library")
            }
            ErrorInner::BadParameter(msg) => write!(f, "bad compression parameter: {msg}"),
            ErrorInner::CorruptInput(err) => write!(f, "corrupt compressed payload: {err}"),
            ErrorInner::OutputOverflow { limit } => {
                write!(f, "decompressed payload exceeds the limit of {limit} bytes")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::CorruptInput(err) => Some(err),
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

impl Error {
    /// Whether this error indicates a corrupted compressed payload, as
    /// opposed to a misuse of the codec selection.
    pub fn is_corrupt_input(&self) -> bool {
        matches!(
            &*self.0,
            ErrorInner::CorruptInput(_) | ErrorInner::OutputOverflow { .. }
        )
    }
}

// Frame magics of the self-framing codecs.
const MAGIC_ZSTD: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const MAGIC_XZ: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
const MAGIC_LZ4: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

#[cfg(feature = "lzma")]
const LZMA_PRESET_EXTREME: u32 = 1 << 31;

/// A parsed compression algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Compression {
    /// Store payloads uncompressed.
    Null,
    /// LZ4 frame format, fast mode.
    #[cfg(feature = "lz4")]
    Lz4,
    /// LZ4 frame format, high-compression mode.
    #[cfg(feature = "lz4")]
    Lz4Hc { level: u32 },
    /// Zstandard.
    #[cfg(feature = "zstd")]
    Zstd { level: i32 },
    /// LZMA in the xz container.
    #[cfg(feature = "lzma")]
    Lzma {
        level: u32,
        extreme: bool,
        /// Dictionary size as a power-of-two exponent.
        dict_size: Option<u32>,
    },
}

impl Compression {
    /// Parse an algorithm spec string, eg. `zstd:level=22`.
    ///
    /// # Errors
    ///
    /// Fails with an unknown-algorithm error for names this library has never
    /// heard of, an unsupported-algorithm error for algorithms disabled at
    /// build time, and a bad-parameter error for malformed or out-of-range
    /// parameters.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split([':', ',']);
        let algo = parts.next().unwrap_or("");
        let mut level = None::<u32>;
        let mut extreme = false;
        let mut dict_size = None::<u32>;
        for part in parts {
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some(("level", v)) => {
                    level = Some(v.parse().map_err(|_| {
                        ErrorInner::BadParameter(format!("invalid level {v:?}"))
                    })?);
                }
                Some(("dict_size", v)) => {
                    let bits: u32 = v.parse().map_err(|_| {
                        ErrorInner::BadParameter(format!("invalid dict_size {v:?}"))
                    })?;
                    if !(12..=30).contains(&bits) {
                        bail!(ErrorInner::BadParameter(format!(
                            "dict_size {bits} out of range 12..=30"
                        )));
                    }
                    dict_size = Some(bits);
                }
                None if part == "extreme" => extreme = true,
                _ => {
                    bail!(ErrorInner::BadParameter(format!(
                        "unrecognized parameter {part:?} for algorithm {algo:?}"
                    )))
                }
            }
        }

        let reject_params = |this: Self| {
            if level.is_some() || extreme || dict_size.is_some() {
                Err(ErrorInner::BadParameter(format!(
                    "algorithm {algo:?} takes no parameters"
                ))
                .into())
            } else {
                Ok(this)
            }
        };

        match algo {
            "null" => reject_params(Self::Null),
            #[cfg(feature = "lz4")]
            "lz4" => reject_params(Self::Lz4),
            #[cfg(feature = "lz4")]
            "lz4hc" => {
                let level = level.unwrap_or(9);
                if !(1..=12).contains(&level) {
                    bail!(ErrorInner::BadParameter(format!(
                        "lz4hc level {level} out of range 1..=12"
                    )));
                }
                Ok(Self::Lz4Hc { level })
            }
            #[cfg(feature = "zstd")]
            "zstd" => {
                let level = level.unwrap_or(3) as i32;
                if !(1..=22).contains(&level) {
                    bail!(ErrorInner::BadParameter(format!(
                        "zstd level {level} out of range 1..=22"
                    )));
                }
                Ok(Self::Zstd { level })
            }
            #[cfg(feature = "lzma")]
            "lzma" => {
                let level = level.unwrap_or(6);
                if level > 9 {
                    bail!(ErrorInner::BadParameter(format!(
                        "lzma level {level} out of range 0..=9"
                    )));
                }
                Ok(Self::Lzma {
                    level,
                    extreme,
                    dict_size,
                })
            }
            #[cfg(not(feature = "lz4"))]
            "lz4" | "lz4hc" => Err(ErrorInner::UnsupportedAlgorithm("lz4").into()),
            #[cfg(not(feature = "zstd"))]
            "zstd" => Err(ErrorInner::UnsupportedAlgorithm("zstd").into()),
            #[cfg(not(feature = "lzma"))]
            "lzma" => Err(ErrorInner::UnsupportedAlgorithm("lzma").into()),
            _ => Err(ErrorInner::UnknownAlgorithm(algo.into()).into()),
        }
    }

    /// The plain algorithm name, without parameters.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            #[cfg(feature = "lz4")]
            Self::Lz4 => "lz4",
            #[cfg(feature = "lz4")]
            Self::Lz4Hc { .. } => "lz4hc",
            #[cfg(feature = "zstd")]
            Self::Zstd { .. } => "zstd",
            #[cfg(feature = "lzma")]
            Self::Lzma { .. } => "lzma",
        }
    }

    /// Compress `data` into a fresh buffer.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match *self {
            Self::Null => Ok(data.to_vec()),
            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_compress(data, 0),
            #[cfg(feature = "lz4")]
            Self::Lz4Hc { level } => lz4_compress(data, level),
            #[cfg(feature = "zstd")]
            Self::Zstd { level } => {
                zstd::bulk::compress(data, level).map_err(|err| ErrorInner::CorruptInput(err).into())
            }
            #[cfg(feature = "lzma")]
            Self::Lzma {
                level,
                extreme,
                dict_size,
            } => lzma_compress(data, level, extreme, dict_size),
        }
    }
}

#[cfg(feature = "lz4")]
fn lz4_compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let cvt = |err| Error::from(ErrorInner::CorruptInput(err));
    let mut enc = lz4::EncoderBuilder::new()
        .level(level)
        .build(Vec::with_capacity(data.len() / 2 + 64))
        .map_err(cvt)?;
    enc.write_all(data).map_err(cvt)?;
    let (out, ret) = enc.finish();
    ret.map_err(cvt)?;
    Ok(out)
}

#[cfg(feature = "lzma")]
fn lzma_compress(
    data: &[u8],
    level: u32,
    extreme: bool,
    dict_size: Option<u32>,
) -> Result<Vec<u8>> {
    use xz2::stream::{Action, Check, Filters, LzmaOptions, Status, Stream};

    let cvt_stream =
        |err: xz2::stream::Error| Error::from(ErrorInner::BadParameter(err.to_string()));

    let preset = level | if extreme { LZMA_PRESET_EXTREME } else { 0 };
    let mut opts = LzmaOptions::new_preset(preset).map_err(cvt_stream)?;
    if let Some(bits) = dict_size {
        opts.dict_size(1 << bits);
    }
    let mut filters = Filters::new();
    filters.lzma2(&opts);
    let mut stream = Stream::new_stream_encoder(&filters, Check::Crc32).map_err(cvt_stream)?;

    let mut out = Vec::with_capacity(data.len() / 2 + 128);
    loop {
        let consumed = stream.total_in() as usize;
        if out.len() == out.capacity() {
            out.reserve(1024);
        }
        let status = stream
            .process_vec(&data[consumed..], &mut out, Action::Finish)
            .map_err(cvt_stream)?;
        if status == Status::StreamEnd {
            return Ok(out);
        }
    }
}

/// Decompress a section payload into `out`, returning the decompressed length.
///
/// The codec is recognized by the payload's frame magic; payloads without a
/// known magic are copied verbatim (`null`).
///
/// # Errors
///
/// Fails if the recognized codec is disabled at build time, if the payload is
/// corrupt per the codec's native framing, or if the decompressed data does
/// not fit in `out`.
pub fn decompress_into(data: &[u8], out: &mut [u8]) -> Result<usize> {
    if data.starts_with(&MAGIC_ZSTD) {
        #[cfg(feature = "zstd")]
        return zstd::bulk::decompress_to_buffer(data, out)
            .map_err(|err| ErrorInner::CorruptInput(err).into());
        #[cfg(not(feature = "zstd"))]
        bail!(ErrorInner::UnsupportedAlgorithm("zstd"));
    }
    if data.starts_with(&MAGIC_XZ) {
        #[cfg(feature = "lzma")]
        return lzma_decompress_into(data, out);
        #[cfg(not(feature = "lzma"))]
        bail!(ErrorInner::UnsupportedAlgorithm("lzma"));
    }
    if data.starts_with(&MAGIC_LZ4) {
        #[cfg(feature = "lz4")]
        return lz4_decompress_into(data, out);
        #[cfg(not(feature = "lz4"))]
        bail!(ErrorInner::UnsupportedAlgorithm("lz4"));
    }

    // No known frame magic: an uncompressed payload.
    let Some(dst) = out.get_mut(..data.len()) else {
        bail!(ErrorInner::OutputOverflow { limit: out.len() });
    };
    dst.copy_from_slice(data);
    Ok(data.len())
}

#[cfg(feature = "lzma")]
fn lzma_decompress_into(data: &[u8], out: &mut [u8]) -> Result<usize> {
    use xz2::stream::{Action, Status, Stream};

    (|| {
        let mut stream = Stream::new_stream_decoder(u64::MAX, 0)?;
        let st = stream.process(data, out, Action::Run)?;
        if stream.total_in() as usize != data.len() || st != Status::StreamEnd {
            bail!(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "LZMA stream did not end cleanly",
            ));
        }
        Ok(stream.total_out() as usize)
    })()
    .map_err(|err| ErrorInner::CorruptInput(err).into())
}

#[cfg(feature = "lz4")]
fn lz4_decompress_into(data: &[u8], out: &mut [u8]) -> Result<usize> {
    let cvt = |err| Error::from(ErrorInner::CorruptInput(err));
    let mut dec = lz4::Decoder::new(data).map_err(cvt)?;
    let mut len = 0usize;
    loop {
        match dec.read(&mut out[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(cvt(err)),
        }
        if len == out.len() {
            // Either exactly full, or the frame holds more than fits.
            let mut probe = [0u8; 1];
            match dec.read(&mut probe) {
                Ok(0) => break,
                Ok(_) => bail!(ErrorInner::OutputOverflow { limit: out.len() }),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(cvt(err)),
            }
        }
    }
    let (_, ret) = dec.finish();
    ret.map_err(cvt)?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_specs() {
        assert_eq!(Compression::parse("null").unwrap(), Compression::Null);
        assert_eq!(
            Compression::parse("zstd:level=22").unwrap(),
            Compression::Zstd { level: 22 },
        );
        assert_eq!(
            Compression::parse("lz4hc:level=9").unwrap(),
            Compression::Lz4Hc { level: 9 },
        );
        assert!(Compression::parse("zstd:level=99").is_err());
        assert!(Compression::parse("null:level=1").is_err());
        assert!(Compression::parse("snappy").is_err());
        assert!(Compression::parse("zstd:frobnicate=1").is_err());
    }

    #[cfg(feature = "lzma")]
    #[test]
    fn parse_lzma_extreme() {
        assert_eq!(
            Compression::parse("lzma:level=9:extreme").unwrap(),
            Compression::Lzma {
                level: 9,
                extreme: true,
                dict_size: None,
            },
        );
        assert!(Compression::parse("lzma:dict_size=31").is_err());
    }

    fn round_trip(c: Compression) {
        let data: Vec<u8> = (0..8192u32).flat_map(|i| (i / 7).to_le_bytes()).collect();
        let compressed = c.compress(&data).unwrap();
        let mut out = vec![0u8; data.len() + 16];
        let n = decompress_into(&compressed, &mut out).unwrap();
        assert_eq!(&out[..n], &data[..]);
    }

    #[test]
    fn round_trip_null() {
        round_trip(Compression::Null);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn round_trip_zstd() {
        round_trip(Compression::Zstd { level: 3 });
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn round_trip_lz4() {
        round_trip(Compression::Lz4);
        round_trip(Compression::Lz4Hc { level: 9 });
    }

    #[cfg(feature = "lzma")]
    #[test]
    fn round_trip_lzma() {
        round_trip(Compression::Lzma {
            level: 6,
            extreme: false,
            dict_size: None,
        });
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn overflow_is_detected() {
        let data = vec![0x5Au8; 4096];
        let compressed = Compression::Zstd { level: 3 }.compress(&data).unwrap();
        let mut small = vec![0u8; 16];
        let err = decompress_into(&compressed, &mut small).unwrap_err();
        assert!(err.is_corrupt_input());
    }
}
