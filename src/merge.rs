//! Merger: append a second indexed flatfile onto a first one, emitting a
//! merged index whose appended records are shifted by the first file's
//! length.
//!
//! The base flatfile is either updated in place (append only, existing
//! bytes untouched) or copied to a `.new` sibling first. The merged index
//! is always produced as a new file and only replaces the original in
//! update mode, after it is complete.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::error::{FfdbError, Result};
use crate::index::{format_record, IndexHeader, IndexLineIter, IndexRecord};

/// Decompressed bytes per gzip member when recompressing a merged
/// flatfile; every member boundary becomes a `.gzi` access point.
pub const GZIP_SPAN: u64 = 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    /// Write `.new` siblings instead of updating the base pair in place
    pub create: bool,
    /// Directory for the produced files (defaults to the inputs' location)
    pub outpath: Option<PathBuf>,
    /// Load the appended index fully into memory; faster when it is tiny
    /// compared to the base index
    pub small: bool,
    /// Recompress the final flatfile to `.gz` and emit a `.gzi` alongside
    pub gzip: bool,
    /// Remove the appended flatfile/index pair once merged
    pub delete_inputs: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Records merged in from the appended index
    pub appended: u64,
}

/// Paths produced by a merge.
#[derive(Clone, Debug)]
pub struct MergedPair {
    pub flatfile: PathBuf,
    pub index: PathBuf,
}

pub fn merge(
    base_flatfile: &Path,
    base_index: &Path,
    new_flatfile: &Path,
    new_index: &Path,
    options: &MergeOptions,
) -> Result<MergedPair> {
    let base_header = read_header(base_index)?;
    let new_header = read_header(new_index)?;
    if !base_header.compatible_with(&new_header) {
        return Err(FfdbError::Usage(format!(
            "indexes {} and {} have incompatible codec configurations",
            base_index.display(),
            new_index.display()
        )));
    }

    let shift = fs::metadata(base_flatfile)?.len();
    debug!(
        base = %base_flatfile.display(),
        appended = %new_flatfile.display(),
        shift,
        "merging"
    );

    // Merged index goes to a .new file first in every mode.
    let out_index = sibling(new_name(base_index), options.outpath.as_deref());
    let appended = {
        let mut out = File::create(&out_index)?;
        if options.small {
            merge_in_memory(base_index, new_index, shift, &base_header, &mut out)?
        } else {
            merge_streamed(base_index, new_index, shift, &base_header, &mut out)?
        }
    };

    let (flatfile, index) = if options.create {
        let out_flatfile = sibling(new_name(base_flatfile), options.outpath.as_deref());
        fs::copy(base_flatfile, &out_flatfile)?;
        append_file(&out_flatfile, new_flatfile)?;
        (out_flatfile, out_index)
    } else {
        append_file(base_flatfile, new_flatfile)?;
        fs::rename(&out_index, base_index)?;
        (base_flatfile.to_path_buf(), base_index.to_path_buf())
    };

    if options.gzip {
        let (gz, gzi) = gzip_with_index(&flatfile)?;
        info!(flatfile = %gz.display(), side_index = %gzi.display(), "compressed merged flatfile");
    }
    if options.delete_inputs {
        fs::remove_file(new_flatfile)?;
        fs::remove_file(new_index)?;
    }
    info!(appended, flatfile = %flatfile.display(), index = %index.display(), "merge finished");
    Ok(MergedPair { flatfile, index })
}

fn read_header(index: &Path) -> Result<IndexHeader> {
    Ok(IndexLineIter::open(index)?.header.unwrap_or_default())
}

fn new_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".new");
    PathBuf::from(name)
}

fn sibling(path: PathBuf, outpath: Option<&Path>) -> PathBuf {
    match (outpath, path.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => path,
    }
}

fn append_file(target: &Path, addendum: &Path) -> Result<u64> {
    let mut writer = OpenOptions::new().append(true).open(target)?;
    let mut reader = File::open(addendum)?;
    Ok(io::copy(&mut reader, &mut writer)?)
}

type RecordItem = Result<(String, IndexRecord)>;

fn shifted(item: RecordItem, shift: u64) -> RecordItem {
    item.map(|(id, mut record)| {
        record.offset += shift;
        (id, record)
    })
}

fn sort_key<'a>(id: &'a str, record: &IndexRecord) -> (&'a str, u64, u64) {
    crate::index::record_sort_key(id, record)
}

/// Streamed sorted merge of both index files; the appended side's offsets
/// are shifted as they are read.
fn merge_streamed(
    base_index: &Path,
    new_index: &Path,
    shift: u64,
    header: &IndexHeader,
    out: &mut dyn Write,
) -> Result<u64> {
    let base = IndexLineIter::open(base_index)?;
    let new = IndexLineIter::open(new_index)?.map(|item| shifted(item, shift));
    merge_iterators(base, new, header, out)
}

/// In-memory variant: the appended index is loaded and shifted up front,
/// which beats the streamed merge when it is small and the base is large.
fn merge_in_memory(
    base_index: &Path,
    new_index: &Path,
    shift: u64,
    header: &IndexHeader,
    out: &mut dyn Write,
) -> Result<u64> {
    let additions: Vec<(String, IndexRecord)> = IndexLineIter::open(new_index)?
        .map(|item| shifted(item, shift))
        .collect::<Result<_>>()?;
    let base = IndexLineIter::open(base_index)?;
    merge_iterators(base, additions.into_iter().map(Ok), header, out)
}

fn merge_iterators(
    base: impl Iterator<Item = RecordItem>,
    new: impl Iterator<Item = RecordItem>,
    header: &IndexHeader,
    out: &mut dyn Write,
) -> Result<u64> {
    let mut writer = BufWriter::new(out);
    if let Some(line) = header.format_line() {
        writeln!(writer, "{line}")?;
    }
    let mut base = base.peekable();
    let mut new = new.peekable();
    let mut appended = 0u64;
    loop {
        let take_new = match (base.peek(), new.peek()) {
            (None, None) => break,
            (Some(Err(_)), _) => false,
            (_, Some(Err(_))) => true,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(Ok((base_id, base_record))), Some(Ok((new_id, new_record)))) => {
                sort_key(new_id, new_record) < sort_key(base_id, base_record)
            }
        };
        let (id, record) = if take_new {
            appended += 1;
            new.next()
        } else {
            base.next()
        }
        .transpose()?
        .ok_or_else(|| FfdbError::Internal("merge iterator underflow".into()))?;
        writeln!(writer, "{}", format_record(&id, &record))?;
    }
    writer.flush()?;
    Ok(appended)
}

/// Compress a flatfile into multi-member gzip with one member per
/// [`GZIP_SPAN`] of input, recording each member boundary as an access
/// point in a pair-table `.gzi`.
pub fn gzip_with_index(flatfile: &Path) -> Result<(PathBuf, PathBuf)> {
    let mut gz_name = flatfile.as_os_str().to_os_string();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);
    // sibling naming convention: X.gz is indexed by X.gzi
    let mut gzi_name = gz_path.as_os_str().to_os_string();
    gzi_name.push("i");
    let gzi_path = PathBuf::from(gzi_name);

    let mut reader = File::open(flatfile)?;
    let mut writer = BufWriter::new(File::create(&gz_path)?);
    let mut points: Vec<(u64, u64)> = Vec::new();
    let mut compressed_offset = 0u64;
    let mut decompressed_offset = 0u64;
    let mut chunk = vec![0u8; GZIP_SPAN as usize];
    loop {
        let mut filled = 0usize;
        while filled < chunk.len() {
            let n = reader.read(&mut chunk[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        points.push((compressed_offset, decompressed_offset));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&chunk[..filled])?;
        let member = encoder.finish()?;
        writer.write_all(&member)?;
        compressed_offset += member.len() as u64;
        decompressed_offset += filled as u64;
        if filled < chunk.len() {
            break;
        }
    }
    writer.flush()?;
    crate::gzi::write_pairs(&gzi_path, &points)?;
    Ok((gz_path, gzi_path))
}
