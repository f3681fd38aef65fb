use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ffdb::config::{parse_byte_size, CodecKind, DEFAULT_COMPRESS_LEVEL};
use ffdb::{
    derive_key, CodecContext, EntryPatterns, FfdbError, IndexHeader, Indexer, IndexerOptions,
    KeyParams, KeySize,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ffdb-index")]
#[command(
    about = "Create a positional index for a flatfile, optionally compressing or encrypting its entries",
    long_about = None
)]
struct Args {
    /// Flatfile to index
    #[arg(short = 'f', long = "file")]
    input: PathBuf,

    /// Regex pattern(s) capturing identifiers; each pattern contributes
    /// its capture groups independently
    #[arg(short = 'i', long = "id", num_args = 1..)]
    patterns: Vec<String>,

    /// Joined regex pattern(s): all capture groups of one match are
    /// colon-joined into a single compound identifier
    #[arg(short = 'j', long = "joinedid", num_args = 1..)]
    joined_patterns: Vec<String>,

    /// Pattern marking the end of each entry
    #[arg(short = 'e', long = "endpattern", default_value = "^-$")]
    terminator: String,

    /// Record all matches of each pattern, not just the first
    #[arg(short = 'a', long = "allmatches")]
    all_matches: bool,

    /// Worker threads for parallel indexing
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    threads: usize,

    /// Flatfile bytes per parallel block (accepts suffixes: 100k, 50M)
    #[arg(short = 'b', long = "blocksize")]
    blocksize: Option<String>,

    /// Offset (in bytes) added to every entry position, for indexes meant
    /// to be appended to an existing flatfile
    #[arg(short = 'o', long = "offset", default_value_t = 0)]
    offset: u64,

    /// Encrypt entries with the given key size in bytes:
    /// 16=aes-128, 24=aes-192, 32=aes-256. Writes INPUT.enc
    #[arg(short = 'k', long = "keysize", value_parser = ["16", "24", "32"])]
    keysize: Option<String>,

    /// Passphrase for encryption; prompted when omitted
    #[arg(short = 'p', long = "passphrase")]
    passphrase: Option<String>,

    /// Compress entries at the given zlib level. Writes INPUT.xz
    #[arg(short = 'c', long = "compresslevel")]
    compresslevel: Option<u32>,

    /// Record entry checksums in the index
    #[arg(short = 'x', long = "xsanity")]
    xsanity: bool,

    /// Leave the index unsorted (sort it externally before extraction)
    #[arg(short = 'u', long = "unsorted")]
    unsorted: bool,

    /// Print matching identifiers only; no positional index
    #[arg(short = 'n', long = "nopos")]
    nopos: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{err:#}");
            let code = err
                .downcast_ref::<FfdbError>()
                .map(FfdbError::exit_code)
                .unwrap_or(2);
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let mut args = Args::parse();

    if let Some(level) = args.compresslevel {
        if level > 9 {
            return Err(FfdbError::Usage("compress level must be 0-9".into()).into());
        }
    }
    if args.keysize.is_some() && args.passphrase.is_none() {
        args.passphrase = Some(read_passphrase()?);
    }
    let encrypt = args.passphrase.is_some();
    let compress = args.compresslevel.is_some();
    let kind = CodecKind::from_flags(compress, encrypt);
    if args.nopos && (kind != CodecKind::None || args.xsanity || args.offset != 0) {
        return Err(FfdbError::Usage(
            "--nopos cannot be combined with compression, encryption, checksums or an offset"
                .into(),
        )
        .into());
    }

    let key_size = match (&args.keysize, encrypt) {
        (Some(bytes), _) => {
            let bits: u32 = bytes.parse::<u32>().map(|b| b * 8).unwrap_or(0);
            Some(
                KeySize::from_bits(bits)
                    .ok_or_else(|| FfdbError::Usage(format!("bad key size {bytes}")))?,
            )
        }
        (None, true) => Some(KeySize::Aes128),
        (None, false) => None,
    };

    let mut header = IndexHeader::new(kind, key_size, args.xsanity);
    let codec = match (&args.passphrase, key_size) {
        (Some(passphrase), Some(size)) => {
            let params = KeyParams::generate();
            let key = derive_key(passphrase, size, &params);
            header.key_params = Some(params);
            CodecContext::new(
                kind,
                Some(key),
                args.compresslevel.unwrap_or(DEFAULT_COMPRESS_LEVEL),
            )?
        }
        _ => CodecContext::new(kind, None, args.compresslevel.unwrap_or(DEFAULT_COMPRESS_LEVEL))?,
    };

    let out_flatfile = match kind {
        CodecKind::None => None,
        CodecKind::Zlib => Some(suffixed(&args.input, "xz")),
        CodecKind::Aes | CodecKind::AesZlib => Some(suffixed(&args.input, "enc")),
    };
    if let Some(path) = &out_flatfile {
        if path.exists() {
            return Err(FfdbError::Usage(format!(
                "refusing to overwrite existing file {}",
                path.display()
            ))
            .into());
        }
        info!(output = %path.display(), "encoded flatfile will be written");
    }

    let block_size = args
        .blocksize
        .as_deref()
        .map(parse_byte_size)
        .transpose()?;
    let patterns = EntryPatterns::compile(&args.patterns, &args.joined_patterns)?;
    let indexer = Indexer::new(
        patterns,
        header,
        codec,
        IndexerOptions {
            terminator: args.terminator.clone(),
            all_matches: args.all_matches,
            base_offset: args.offset,
            checksums: args.xsanity,
            sorted: !args.unsorted,
            ids_only: args.nopos,
            threads: args.threads.max(1),
            block_size,
        },
    )?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let outcome = indexer.index(&args.input, out_flatfile.as_deref(), &mut out)?;
    info!(
        entries = outcome.entries,
        records = outcome.records,
        skipped = outcome.skipped,
        "done"
    );
    Ok(0)
}

fn suffixed(path: &std::path::Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn read_passphrase() -> Result<String> {
    eprint!("Passphrase: ");
    io::stderr().flush()?;
    let mut passphrase = String::new();
    io::stdin().read_line(&mut passphrase)?;
    Ok(passphrase.trim_end().to_string())
}
