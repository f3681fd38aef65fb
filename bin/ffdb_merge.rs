use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ffdb::merge::{merge, MergeOptions};
use ffdb::FfdbError;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ffdb-merge")]
#[command(about = "Merge new pre-indexed entries into an existing flatfile", long_about = None)]
struct Args {
    /// Flatfile the new entries are merged into
    #[arg(short = 'f', long = "file")]
    flatfile: PathBuf,

    /// Index of the flatfile
    #[arg(short = 'i', long = "index")]
    index: PathBuf,

    /// Flatfile holding the new entries
    #[arg(short = 'e', long = "entries")]
    entries: PathBuf,

    /// Index of the new entries
    #[arg(short = 'n', long = "newindex")]
    newindex: PathBuf,

    /// Create .new siblings instead of updating the original pair
    #[arg(short = 'c', long = "create")]
    create: bool,

    /// Write produced files into this directory
    #[arg(short = 'o', long = "outpath")]
    outpath: Option<PathBuf>,

    /// Delete the merged-in entries file and its index afterwards
    #[arg(short = 'd', long = "delete")]
    delete: bool,

    /// Gzip the final flatfile and write a .gzi side index
    #[arg(short = 'g', long = "gzip")]
    gzip: bool,

    /// Load the new index fully in memory; faster when it is small
    #[arg(short = 's', long = "small")]
    small: bool,
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

    if args.flatfile.to_string_lossy().contains("://") {
        return Err(FfdbError::Usage("cannot merge into a remote flatfile".into()).into());
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
    if args.create {
        for path in [&args.flatfile, &args.index] {
            let mut name = path.as_os_str().to_os_string();
            name.push(".new");
            let target = match (&args.outpath, PathBuf::from(&name).file_name()) {
                (Some(dir), Some(file)) => dir.join(file),
                _ => PathBuf::from(name),
            };
            if target.exists() {
                return Err(FfdbError::Usage(format!(
                    "refusing to overwrite existing file {}",
                    target.display()
                ))
                .into());
            }
        }
    }

    let pair = merge(
        &args.flatfile,
        &args.index,
        &args.entries,
        &args.newindex,
        &MergeOptions {
            create: args.create,
            outpath: args.outpath.clone(),
            small: args.small,
            gzip: args.gzip,
            delete_inputs: args.delete,
        },
    )?;
    info!(
        flatfile = %pair.flatfile.display(),
        index = %pair.index.display(),
        "merged"
    );
    Ok(0)
}
