use std::io::{self, BufRead};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ffdb::remove::{remove, RemoveOptions};
use ffdb::{DuplicatesPolicy, FfdbError};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ffdb-remove")]
#[command(
    about = "Delete entries from a flatfile, producing a reindexed .new pair",
    long_about = None
)]
struct Args {
    /// Flatfile the entries are removed from
    #[arg(short = 'f', long = "file")]
    flatfile: PathBuf,

    /// Index of the flatfile
    #[arg(short = 'i', long = "index")]
    index: PathBuf,

    /// File listing the identifiers of entries to delete
    #[arg(short = 'l', long = "list")]
    list: PathBuf,

    /// Write the .new pair into this directory
    #[arg(short = 'o', long = "outpath")]
    outpath: Option<PathBuf>,

    /// Delete every entry of a duplicated identifier
    #[arg(short = 'd', long = "duplicates")]
    duplicates: bool,

    /// Delete the entry appearing last in the flatfile
    #[arg(short = 'z', long = "zfound")]
    zfound: bool,

    /// Worker threads for the parallel index rewrite
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    threads: usize,

    /// Index records per reindex chunk
    #[arg(short = 'b', long = "blocksize")]
    blocksize: Option<usize>,
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
    let args = Args::parse();

    if args.zfound && args.duplicates {
        return Err(FfdbError::Usage(
            "--zfound and --duplicates are mutually exclusive".into(),
        )
        .into());
    }
    let name = args.flatfile.to_string_lossy();
    if name.ends_with(".gz") || name.contains("://") {
        return Err(FfdbError::Usage(
            "removal works on local, uncompressed flatfiles".into(),
        )
        .into());
    }
    if let Some(outpath) = &args.outpath {
        if !outpath.is_dir() {
            return Err(FfdbError::Usage(format!(
                "outpath {} does not exist or is not a directory",
                outpath.display()
            ))
            .into());
        }
    }

    let policy = if args.duplicates {
        DuplicatesPolicy::All
    } else if args.zfound {
        DuplicatesPolicy::Last
    } else {
        DuplicatesPolicy::First
    };
    let identifiers: Vec<String> = io::BufReader::new(std::fs::File::open(&args.list)?)
        .lines()
        .map(|line| line.map(|l| l.trim_end().to_string()))
        .filter(|line| line.as_ref().map(|l| !l.is_empty()).unwrap_or(true))
        .collect::<io::Result<_>>()?;

    let (pair, outcome) = remove(
        &args.flatfile,
        &args.index,
        &identifiers,
        &RemoveOptions {
            policy,
            outpath: args.outpath.clone(),
            threads: args.threads.max(1),
            chunk_size: args.blocksize,
        },
    )?;
    info!(
        flatfile = %pair.flatfile.display(),
        index = %pair.index.display(),
        removed = outcome.removed_entries,
        reindexed = outcome.kept_records,
        "done"
    );
    Ok(outcome.exit_code())
}
