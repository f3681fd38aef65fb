use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use ffdb::{
    CodecContext, DuplicatesPolicy, ExtractOptions, Extractor, FfdbError, IndexStore, SourceSpec,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ffdb-extract")]
#[command(about = "Extract entries from an indexed flatfile", long_about = None)]
struct Args {
    /// Flatfile to read; a local path or an http(s) URL
    #[arg(short = 'f', long = "file")]
    flatfile: String,

    /// Positional index of the flatfile
    #[arg(short = 'i', long = "index")]
    index: PathBuf,

    /// Identifier(s) of the entries to extract
    #[arg(short = 's', long = "single", num_args = 1.., conflicts_with = "list")]
    identifiers: Vec<String>,

    /// File containing one identifier per line
    #[arg(short = 'l', long = "list")]
    list: Option<PathBuf>,

    /// Write output to a file (atomically, on full success) instead of stdout
    #[arg(short = 'o', long = "outfile")]
    outfile: Option<PathBuf>,

    /// Merge and retrieve adjacent entries together; fewer round trips,
    /// more memory. Recommended for remote flatfiles
    #[arg(short = 'm', long = "mergedretrieval")]
    merged: bool,

    /// Worker threads for parallel retrieval
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    threads: usize,

    /// Identifiers per worker block; 0 shares one coalesced plan
    #[arg(short = 'b', long = "blocksize")]
    blocksize: Option<usize>,

    /// Extract every entry of a duplicated identifier
    #[arg(short = 'd', long = "duplicates")]
    duplicates: bool,

    /// Extract the entry appearing last in the flatfile
    #[arg(short = 'z', long = "zfound")]
    zfound: bool,

    /// Verify entry checksums recorded in the index
    #[arg(short = 'x', long = "xsanity")]
    xsanity: bool,

    /// Passphrase for encrypted entries; prompted when omitted
    #[arg(short = 'p', long = "passphrase")]
    passphrase: Option<String>,

    /// Flatfile is whole-file gzip; a .gzi side index is required
    #[arg(short = 'c', long = "compressed")]
    compressed: bool,

    /// Path of the .gzi side index (defaults to FLATFILE + "i")
    #[arg(short = 'g', long = "gzindex")]
    gzindex: Option<PathBuf>,

    /// Keep a local cache of compressed segments (remote gzip only)
    #[arg(short = 'k', long = "keepcache")]
    keepcache: bool,

    /// Directory for the segment cache
    #[arg(long = "cachedir")]
    cachedir: Option<PathBuf>,
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

    if args.zfound && args.duplicates {
        return Err(FfdbError::Usage(
            "--zfound and --duplicates are mutually exclusive".into(),
        )
        .into());
    }
    if args.identifiers.is_empty() && args.list.is_none() {
        return Err(FfdbError::Usage(
            "at least one of --single or --list must be given".into(),
        )
        .into());
    }
    let remote = args.flatfile.contains("://");
    if args.flatfile.ends_with(".gz") && !args.compressed {
        warn!("flatfile has a .gz extension: assuming whole-file gzip");
        args.compressed = true;
    }
    if args.keepcache && !(remote && args.compressed) {
        return Err(FfdbError::Usage(
            "--keepcache only applies to remote gzip flatfiles".into(),
        )
        .into());
    }

    let policy = if args.duplicates {
        DuplicatesPolicy::All
    } else if args.zfound {
        DuplicatesPolicy::Last
    } else {
        DuplicatesPolicy::First
    };

    let identifiers = match &args.list {
        None => args.identifiers.clone(),
        Some(list) => io::BufReader::new(std::fs::File::open(list)?)
            .lines()
            .map(|line| line.map(|l| l.trim_end().to_string()))
            .filter(|line| line.as_ref().map(|l| !l.is_empty()).unwrap_or(true))
            .collect::<io::Result<Vec<_>>>()?,
    };

    let store = Arc::new(IndexStore::load(&args.index)?);
    let header = store.header();
    if header.codec.encrypted() && args.compressed {
        return Err(FfdbError::Usage(
            "a whole-file gzip flatfile cannot hold encrypted entries; \
             entry-level compression is handled automatically"
                .into(),
        )
        .into());
    }
    let passphrase = match (&args.passphrase, header.codec.encrypted()) {
        (Some(p), true) => Some(p.clone()),
        (None, true) => Some(read_passphrase()?),
        (Some(_), false) => {
            warn!("ignoring passphrase: the index was not made for encrypted entries");
            None
        }
        (None, false) => None,
    };
    let codec = CodecContext::for_header(header, passphrase.as_deref())?;

    let gzi = if args.compressed {
        match (&args.gzindex, remote) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => {
                return Err(FfdbError::Usage(
                    "a local .gzi side index must be given (-g) for remote gzip flatfiles".into(),
                )
                .into())
            }
            (None, false) => {
                let assumed = PathBuf::from(format!("{}i", args.flatfile));
                warn!(gzindex = %assumed.display(), "assuming side index path; use -g to override");
                Some(assumed)
            }
        }
    } else {
        None
    };
    let cache_dir = args.keepcache.then(|| {
        args.cachedir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("ffdb-gzcache"))
    });

    let spec = SourceSpec {
        location: args.flatfile.clone(),
        gzi,
        cache_dir,
        ..Default::default()
    };
    let source = ffdb::open_source(&spec)?;
    let extractor = Extractor::new(store, source, codec);
    let options = ExtractOptions {
        policy,
        merged: args.merged,
        threads: args.threads.max(1),
        block_size: args.blocksize,
        verify: args.xsanity,
    };

    if let Some(path) = &args.outfile {
        if path.exists() {
            return Err(FfdbError::Usage(format!(
                "refusing to overwrite existing file {}",
                path.display()
            ))
            .into());
        }
    }
    let report = match &args.outfile {
        Some(path) => extractor.extract_to_file(&identifiers, &options, path)?,
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            extractor.extract(&identifiers, &options, &mut out)?
        }
    };
    if report.missing > 0 {
        warn!(
            "only {} of the {} requested identifiers were found in the index",
            report.requested - report.missing,
            report.requested
        );
    }
    info!(extracted = report.extracted, "done");
    Ok(report.exit_code())
}

fn read_passphrase() -> Result<String> {
    eprint!("Passphrase: ");
    io::stderr().flush()?;
    let mut passphrase = String::new();
    io::stdin().read_line(&mut passphrase)?;
    Ok(passphrase.trim_end().to_string())
}
