//! Build (or recompress) a ShaleFS image from a directory tree.

use std::{
    fs,
    num::NonZero,
    path::PathBuf,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::SystemTime,
};

use indicatif::{HumanBytes, HumanCount, ProgressBar, ProgressStyle};
use shalefs::Compression;
use shalefs_enc::{
    progress::{Progress, UI_TICK},
    rewrite::{self, RewriteConfig},
    scanner::{FileOrder, OsAccessPosix, Scanner, ScannerOptions},
    segmenter::{self, Segmenter},
    writer::{ImageWriter, WriterConfig},
};

// Default algorithm specs per concern, degrading with the set of codecs
// compiled in.

#[cfg(feature = "lz4")]
mod alg {
    pub const DATA_L1: &str = "lz4";
    pub const DATA_L2: &str = "lz4hc:level=9";
    pub const DATA_L3: &str = "lz4hc:level=9";
}
#[cfg(all(not(feature = "lz4"), feature = "zstd"))]
mod alg {
    pub const DATA_L1: &str = "zstd:level=1";
    pub const DATA_L2: &str = "zstd:level=4";
    pub const DATA_L3: &str = "zstd:level=7";
}
#[cfg(all(not(feature = "lz4"), not(feature = "zstd"), feature = "lzma"))]
mod alg {
    pub const DATA_L1: &str = "lzma:level=1";
    pub const DATA_L2: &str = "lzma:level=2";
    pub const DATA_L3: &str = "lzma:level=3";
}
#[cfg(not(any(feature = "lz4", feature = "zstd", feature = "lzma")))]
mod alg {
    pub const DATA_L1: &str = "null";
    pub const DATA_L2: &str = "null";
    pub const DATA_L3: &str = "null";
}

#[cfg(feature = "zstd")]
mod alg_mid {
    pub const DATA_L4: &str = "zstd:level=11";
    pub const DATA_L5: &str = "zstd:level=16";
    pub const DATA_L6: &str = "zstd:level=20";
    pub const DATA_L7: &str = "zstd:level=22";
    pub const SCHEMA: &str = "zstd:level=22";
}
#[cfg(all(not(feature = "zstd"), feature = "lzma"))]
mod alg_mid {
    pub const DATA_L4: &str = "lzma:level=4";
    pub const DATA_L5: &str = "lzma:level=5";
    pub const DATA_L6: &str = "lzma:level=6";
    pub const DATA_L7: &str = "lzma:level=7";
    pub const SCHEMA: &str = "lzma:level=9";
}
#[cfg(all(not(feature = "zstd"), not(feature = "lzma"), feature = "lz4"))]
mod alg_mid {
    pub const DATA_L4: &str = "lz4hc:level=9";
    pub const DATA_L5: &str = "lz4hc:level=9";
    pub const DATA_L6: &str = "lz4hc:level=9";
    pub const DATA_L7: &str = "lz4hc:level=9";
    pub const SCHEMA: &str = "lz4hc:level=9";
}
#[cfg(not(any(feature = "lz4", feature = "zstd", feature = "lzma")))]
mod alg_mid {
    pub const DATA_L4: &str = "null";
    pub const DATA_L5: &str = "null";
    pub const DATA_L6: &str = "null";
    pub const DATA_L7: &str = "null";
    pub const SCHEMA: &str = "null";
}

#[cfg(feature = "lzma")]
mod alg_high {
    pub const DATA_L8: &str = "lzma:level=8:dict_size=25";
    pub const DATA_L9: &str = "lzma:level=9:extreme";
    pub const METADATA: &str = "lzma:level=9:extreme";
}
#[cfg(all(not(feature = "lzma"), feature = "zstd"))]
mod alg_high {
    pub const DATA_L8: &str = "zstd:level=22";
    pub const DATA_L9: &str = "zstd:level=22";
    pub const METADATA: &str = "zstd:level=22";
}
#[cfg(all(not(feature = "lzma"), not(feature = "zstd"), feature = "lz4"))]
mod alg_high {
    pub const DATA_L8: &str = "lz4hc:level=9";
    pub const DATA_L9: &str = "lz4hc:level=9";
    pub const METADATA: &str = "lz4hc:level=9";
}
#[cfg(not(any(feature = "lz4", feature = "zstd", feature = "lzma")))]
mod alg_high {
    pub const DATA_L8: &str = "null";
    pub const DATA_L9: &str = "null";
    pub const METADATA: &str = "null";
}

struct LevelDefaults {
    block_size_bits: u32,
    data: &'static str,
    schema: &'static str,
    metadata: &'static str,
    window_sizes: &'static str,
}

const LEVELS: [LevelDefaults; 10] = [
    LevelDefaults { block_size_bits: 20, data: "null", schema: "null", metadata: "null", window_sizes: "-" },
    LevelDefaults { block_size_bits: 20, data: alg::DATA_L1, schema: alg_mid::SCHEMA, metadata: "null", window_sizes: "-" },
    LevelDefaults { block_size_bits: 20, data: alg::DATA_L2, schema: alg_mid::SCHEMA, metadata: "null", window_sizes: "-" },
    LevelDefaults { block_size_bits: 20, data: alg::DATA_L3, schema: alg_mid::SCHEMA, metadata: "null", window_sizes: "13" },
    LevelDefaults { block_size_bits: 21, data: alg_mid::DATA_L4, schema: alg_mid::SCHEMA, metadata: "null", window_sizes: "11" },
    LevelDefaults { block_size_bits: 22, data: alg_mid::DATA_L5, schema: alg_mid::SCHEMA, metadata: "null", window_sizes: "11" },
    LevelDefaults { block_size_bits: 23, data: alg_mid::DATA_L6, schema: alg_mid::SCHEMA, metadata: "null", window_sizes: "15,11" },
    LevelDefaults { block_size_bits: 24, data: alg_mid::DATA_L7, schema: alg_mid::SCHEMA, metadata: "null", window_sizes: "17,15,13,11" },
    LevelDefaults { block_size_bits: 24, data: alg_high::DATA_L8, schema: alg_mid::SCHEMA, metadata: alg_high::METADATA, window_sizes: "17,15,13,11" },
    LevelDefaults { block_size_bits: 24, data: alg_high::DATA_L9, schema: alg_mid::SCHEMA, metadata: alg_high::METADATA, window_sizes: "17,15,13,11" },
];

fn level_defaults_help() -> String {
    let mut out = String::from(
        "Compression level defaults:\n\
         \x20 Level  Block  Data                   Schema         Metadata              Windows\n",
    );
    for (level, l) in LEVELS.iter().enumerate() {
        out.push_str(&format!(
            "  {:<5}  2^{:<3}  {:<21}  {:<13}  {:<20}  {}\n",
            level, l.block_size_bits, l.data, l.schema, l.metadata, l.window_sizes,
        ));
    }
    out.push_str(
        "\nCompression algorithms:\n  null     no compression at all\n",
    );
    #[cfg(feature = "lz4")]
    out.push_str(
        "  lz4      LZ4 compression\n  lz4hc    LZ4 HC compression\n               level=[1..12]\n",
    );
    #[cfg(feature = "zstd")]
    out.push_str("  zstd     ZSTD compression\n               level=[1..22]\n");
    #[cfg(feature = "lzma")]
    out.push_str(
        "  lzma     LZMA compression\n               level=[0..9]\n               dict_size=[12..30]\n               extreme\n",
    );
    out
}

#[derive(Debug, clap::Parser)]
#[command(version, about = "create a ShaleFS filesystem image", after_help = level_defaults_help())]
struct Cli {
    /// Path to the source directory (or to an existing image with --recompress).
    #[arg(short, long)]
    input: PathBuf,

    /// Image output path.
    #[arg(short, long)]
    output: PathBuf,

    /// Compression level (0=fast, 9=best); selects the defaults below.
    #[arg(short = 'l', long, default_value_t = 7, value_parser = clap::value_parser!(u32).range(0..=9))]
    compress_level: u32,

    /// Block size bits (block size = 2^bits).
    #[arg(short = 'S', long, value_parser = clap::value_parser!(u32).range(12..=28))]
    block_size_bits: Option<u32>,

    /// Number of writer (compression) worker threads.
    #[arg(short = 'N', long)]
    num_workers: Option<usize>,

    /// Number of scanner worker threads.
    #[arg(short = 'M', long)]
    max_scanner_workers: Option<usize>,

    /// Writer memory limit for uncompressed blocks, with k/m/g suffix.
    #[arg(short = 'L', long, default_value = "1g")]
    memory_limit: String,

    /// Block compression algorithm spec.
    #[arg(short = 'C', long)]
    compression: Option<String>,

    /// Metadata schema compression algorithm spec.
    #[arg(long)]
    schema_compression: Option<String>,

    /// Metadata compression algorithm spec.
    #[arg(long)]
    metadata_compression: Option<String>,

    /// Comma-separated window size exponents for block hashing, or `-` to
    /// disable segmentation.
    #[arg(long)]
    blockhash_window_sizes: Option<String>,

    /// Window increment as a right shift of the window size.
    #[arg(long, default_value_t = 1)]
    window_increment_shift: u32,

    /// File ordering for the segmenter.
    #[arg(long, value_enum, default_value_t = OrderArg::Similarity)]
    order: OrderArg,

    /// Filter/ordering script path, required with --order=script.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Set the owner (uid) for the whole filesystem.
    #[arg(long)]
    set_owner: Option<u32>,

    /// Set the group (gid) for the whole filesystem.
    #[arg(long)]
    set_group: Option<u32>,

    /// Set the timestamp for the whole filesystem (unixtime or `now`).
    #[arg(long)]
    set_time: Option<String>,

    /// Recompress an existing image instead of scanning a tree.
    #[arg(long)]
    recompress: bool,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,

    /// Don't show progress.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OrderArg {
    None,
    Path,
    Script,
    Similarity,
}

fn parse_size_with_unit(s: &str) -> Result<usize, String> {
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 10),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 20),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| format!("invalid size {s:?}"))?;
    n.checked_shl(shift)
        .ok_or_else(|| format!("size {s:?} overflows"))
}

fn parse_window_sizes(s: &str) -> Result<Vec<u32>, String> {
    if s == "-" {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|_| format!("invalid window size exponent {part:?}"))
        })
        .collect()
}

fn run(cli: &Cli, progress: &Arc<Progress>) -> Result<(), Box<dyn std::error::Error>> {
    let defaults = &LEVELS[cli.compress_level as usize];

    let num_cpu = thread::available_parallelism().map_or(1, NonZero::get);
    let num_workers = cli.num_workers.unwrap_or(num_cpu).max(1);
    let max_scanner_workers = cli.max_scanner_workers.unwrap_or(num_cpu).max(1);

    let compression =
        Compression::parse(cli.compression.as_deref().unwrap_or(defaults.data))?;
    let schema_compression =
        Compression::parse(cli.schema_compression.as_deref().unwrap_or(defaults.schema))?;
    let metadata_compression = Compression::parse(
        cli.metadata_compression
            .as_deref()
            .unwrap_or(defaults.metadata),
    )?;

    let writer_config = WriterConfig {
        compression,
        schema_compression,
        metadata_compression,
        num_workers: NonZero::new(num_workers).expect("clamped to 1"),
        memory_limit: parse_size_with_unit(&cli.memory_limit)?,
    };

    let out = fs::File::create(&cli.output)?;
    let mut writer = ImageWriter::new(out, &writer_config, Arc::clone(progress))?;

    if cli.recompress {
        let image = fs::File::open(&cli.input)?;
        let map = rewrite::map_image(&image)?;
        rewrite::rewrite(&map, writer, &RewriteConfig::default())?;
        return Ok(());
    }

    // The script engine is an external collaborator; none is compiled into
    // this binary.
    if cli.script.is_some() || cli.order == OrderArg::Script {
        return Err("this build does not include a script engine; \
             --script and --order=script are unavailable"
            .into());
    }
    let file_order = match cli.order {
        OrderArg::None => FileOrder::None,
        OrderArg::Path => FileOrder::Path,
        OrderArg::Similarity => FileOrder::Similarity,
        OrderArg::Script => unreachable!("rejected above"),
    };

    let timestamp = match cli.set_time.as_deref() {
        None => None,
        Some("now") => Some(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        ),
        Some(s) => Some(s.parse::<u64>().map_err(|_| format!("invalid --set-time {s:?}"))?),
    };

    let segmenter_config = segmenter::Config {
        block_size_bits: cli.block_size_bits.unwrap_or(defaults.block_size_bits),
        window_size_bits: parse_window_sizes(
            cli.blockhash_window_sizes
                .as_deref()
                .unwrap_or(defaults.window_sizes),
        )?,
        window_increment_shift: cli.window_increment_shift,
    };
    let mut segmenter = Segmenter::new(&segmenter_config, Arc::clone(progress))?;

    let options = ScannerOptions {
        file_order,
        owner: cli.set_owner,
        group: cli.set_group,
        timestamp,
    };
    let scanner = Scanner::new(
        Arc::new(OsAccessPosix),
        options,
        None,
        max_scanner_workers,
        Arc::clone(progress),
    )?;

    let (schema, metadata) = scanner.scan(&cli.input, &mut segmenter, &mut writer)?;
    segmenter.finish(&mut writer)?;
    writer.finish(&schema, &metadata)?;
    Ok(())
}

fn spawn_progress_ui(progress: Arc<Progress>) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        let bar = ProgressBar::new_spinner()
            .with_style(ProgressStyle::with_template("{spinner} {msg}").expect("valid template"));
        while !stop2.load(Ordering::Relaxed) {
            bar.set_message(format!(
                "scanned {}/{} files, read {}, saved {}, {} blocks out, {} errors | {}",
                HumanCount(Progress::get(&progress.files_scanned)),
                HumanCount(Progress::get(&progress.files_found)),
                HumanBytes(Progress::get(&progress.bytes_read)),
                HumanBytes(Progress::get(&progress.saved_bytes)),
                HumanCount(Progress::get(&progress.blocks_written)),
                Progress::get(&progress.errors),
                progress.current_file(),
            ));
            bar.tick();
            thread::sleep(UI_TICK);
        }
        bar.finish_and_clear();
    });
    (stop, handle)
}

fn main() -> ExitCode {
    let cli: Cli = clap::Parser::parse();
    env_logger::Builder::new().filter_level(cli.log_level).init();

    let progress = Arc::new(Progress::default());
    let ui = (!cli.no_progress).then(|| spawn_progress_ui(Arc::clone(&progress)));

    let ret = run(&cli, &progress);

    if let Some((stop, handle)) = ui {
        stop.store(true, Ordering::Relaxed);
        let _ = handle.join();
    }

    match ret {
        Err(err) => {
            eprintln!("ERROR: {err}");
            ExitCode::from(2)
        }
        Ok(()) => {
            let errors = Progress::get(&progress.errors);
            let (read, saved, out_bytes) = (
                Progress::get(&progress.bytes_read),
                Progress::get(&progress.saved_bytes),
                Progress::get(&progress.compressed_bytes),
            );
            log::info!(
                "filesystem created: {} read, {} deduplicated, {} written, {} errors",
                HumanBytes(read),
                HumanBytes(saved),
                HumanBytes(out_bytes),
                errors,
            );
            if errors > 0 {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
    }
}
