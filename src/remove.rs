//! Remover: produce a new flatfile/index pair omitting the entries
//! selected for deletion, preserving the order of everything else.
//!
//! The flatfile is stream-copied with deleted ranges skipped; surviving
//! index records are shifted down by the total size of deletions at or
//! before their offset. Inputs are never modified.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel;
use tracing::{debug, info, warn};

use crate::config::DuplicatesPolicy;
use crate::error::{FfdbError, Result};
use crate::index::{format_record, IndexLineIter, IndexRecord, IndexStore};

/// Index records per chunk for the parallel index rewrite.
const REINDEX_CHUNK: usize = 50_000;

#[derive(Clone, Debug, Default)]
pub struct RemoveOptions {
    pub policy: DuplicatesPolicy,
    /// Directory for the produced `.new` pair (defaults to the inputs')
    pub outpath: Option<PathBuf>,
    pub threads: usize,
    /// Records per parallel reindex chunk
    pub chunk_size: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub requested: u64,
    pub missing: u64,
    /// Entry ranges removed from the flatfile
    pub removed_entries: u64,
    pub removed_bytes: u64,
    pub kept_records: u64,
    pub dropped_records: u64,
}

impl RemoveOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.missing > 0 {
            4
        } else {
            0
        }
    }
}

/// The produced pair.
#[derive(Clone, Debug)]
pub struct RemovedPair {
    pub flatfile: PathBuf,
    pub index: PathBuf,
}

/// Cumulative deletion sizes, queryable by flatfile offset.
struct DeltaTable {
    /// `(range_offset, bytes_removed_through_this_range)` ascending
    cumulative: Vec<(u64, u64)>,
}

impl DeltaTable {
    fn new(ranges: &[(u64, u64)]) -> Self {
        let mut cumulative = Vec::with_capacity(ranges.len());
        let mut total = 0u64;
        for (offset, length) in ranges {
            total += length;
            cumulative.push((*offset, total));
        }
        Self { cumulative }
    }

    /// Bytes removed at or before `offset`: how far a surviving record at
    /// that offset shifts down.
    fn delta_at(&self, offset: u64) -> u64 {
        let i = self.cumulative.partition_point(|(o, _)| *o <= offset);
        if i == 0 {
            0
        } else {
            self.cumulative[i - 1].1
        }
    }

    fn total(&self) -> u64 {
        self.cumulative.last().map(|(_, t)| *t).unwrap_or(0)
    }
}

pub fn remove(
    flatfile: &Path,
    index_path: &Path,
    delete_ids: &[String],
    options: &RemoveOptions,
) -> Result<(RemovedPair, RemoveOutcome)> {
    let store = IndexStore::load(index_path)?;
    let mut outcome = RemoveOutcome::default();

    // Resolve the delete list under the duplicates policy into a set of
    // exact ranges; the set also dedupes repeated identifiers.
    let mut doomed: BTreeSet<(u64, u64)> = BTreeSet::new();
    for identifier in delete_ids {
        outcome.requested += 1;
        let records = store.lookup(identifier, options.policy);
        if records.is_empty() {
            warn!(identifier = %identifier, "not found in index; skipping");
            outcome.missing += 1;
            continue;
        }
        for record in records {
            doomed.insert((record.offset, record.length));
        }
    }
    outcome.removed_entries = doomed.len() as u64;

    // Distinct doomed ranges can overlap only through duplicate ids at the
    // same offset with differing lengths; merge intervals for the copy.
    let mut intervals: Vec<(u64, u64)> = Vec::new();
    for (offset, length) in &doomed {
        match intervals.last_mut() {
            Some((last_offset, last_length)) if *offset < *last_offset + *last_length => {
                let end = (*offset + *length).max(*last_offset + *last_length);
                *last_length = end - *last_offset;
            }
            _ => intervals.push((*offset, *length)),
        }
    }
    let deltas = Arc::new(DeltaTable::new(&intervals));
    outcome.removed_bytes = deltas.total();

    let out_flatfile = output_name(flatfile, options.outpath.as_deref());
    let out_index = output_name(index_path, options.outpath.as_deref());
    debug!(
        flatfile = %flatfile.display(),
        ranges = intervals.len(),
        removed_bytes = outcome.removed_bytes,
        "removing entries"
    );

    copy_without_ranges(flatfile, &out_flatfile, &intervals)?;

    let old_size = fs::metadata(flatfile)?.len();
    let new_size = fs::metadata(&out_flatfile)?.len();
    if old_size - outcome.removed_bytes != new_size {
        return Err(FfdbError::Internal(format!(
            "deletion produced a flatfile of {new_size} bytes, expected {}",
            old_size - outcome.removed_bytes
        )));
    }

    let (kept, dropped) = rewrite_index(index_path, &out_index, &doomed, &deltas, options)?;
    outcome.kept_records = kept;
    outcome.dropped_records = dropped;

    info!(
        removed_entries = outcome.removed_entries,
        removed_bytes = outcome.removed_bytes,
        kept_records = outcome.kept_records,
        dropped_records = outcome.dropped_records,
        "removal finished"
    );
    Ok((
        RemovedPair {
            flatfile: out_flatfile,
            index: out_index,
        },
        outcome,
    ))
}

fn output_name(path: &Path, outpath: Option<&Path>) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".new");
    let new_path = PathBuf::from(name);
    match (outpath, new_path.file_name()) {
        (Some(dir), Some(file)) => dir.join(file),
        _ => new_path,
    }
}

/// Stream-copy `src` into `dst`, skipping the given sorted, disjoint
/// byte ranges.
fn copy_without_ranges(src: &Path, dst: &Path, ranges: &[(u64, u64)]) -> Result<()> {
    let mut reader = File::open(src)?;
    let size = reader.metadata()?.len();
    let mut writer = BufWriter::new(File::create(dst)?);
    let mut position = 0u64;
    for (offset, length) in ranges {
        if *offset > position {
            reader.seek(SeekFrom::Start(position))?;
            io::copy(&mut (&mut reader).take(offset - position), &mut writer)?;
        }
        position = offset + length;
    }
    if position < size {
        reader.seek(SeekFrom::Start(position))?;
        io::copy(&mut reader, &mut writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Rewrite the index without the doomed records, shifting survivors.
/// Chunks of records are rewritten by parallel workers when requested;
/// the driver reassembles chunks in order.
fn rewrite_index(
    index_path: &Path,
    out_index: &Path,
    doomed: &BTreeSet<(u64, u64)>,
    deltas: &Arc<DeltaTable>,
    options: &RemoveOptions,
) -> Result<(u64, u64)> {
    let mut out = File::create(out_index)?;
    if options.threads <= 1 {
        return crate::index::filter_index_file(index_path, &mut out, |_, record| {
            if doomed.contains(&(record.offset, record.length)) {
                None
            } else {
                let mut shifted = *record;
                shifted.offset -= deltas.delta_at(record.offset);
                Some(shifted)
            }
        });
    }

    let reader = IndexLineIter::open(index_path)?;
    if let Some(header) = &reader.header {
        if let Some(line) = header.format_line() {
            writeln!(out, "{line}")?;
        }
    }
    let chunk_size = options.chunk_size.unwrap_or(REINDEX_CHUNK).max(1);

    let (work_tx, work_rx) = channel::bounded::<(usize, Vec<(String, IndexRecord)>)>(
        options.threads * 2,
    );
    let (result_tx, result_rx) = channel::unbounded::<(usize, Result<(String, u64, u64)>)>();

    std::thread::scope(|scope| -> Result<(u64, u64)> {
        for _ in 0..options.threads {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let deltas = Arc::clone(deltas);
            let doomed = doomed.clone();
            scope.spawn(move || {
                while let Ok((chunk, records)) = work_rx.recv() {
                    let mut text = String::new();
                    let mut kept = 0u64;
                    let mut dropped = 0u64;
                    for (id, record) in records {
                        if doomed.contains(&(record.offset, record.length)) {
                            dropped += 1;
                            continue;
                        }
                        let mut shifted = record;
                        shifted.offset -= deltas.delta_at(record.offset);
                        text.push_str(&format_record(&id, &shifted));
                        text.push('\n');
                        kept += 1;
                    }
                    if result_tx.send((chunk, Ok((text, kept, dropped)))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        // Feed chunks from this thread; workers run concurrently.
        let mut chunk_count = 0usize;
        let mut pending: Vec<(String, IndexRecord)> = Vec::with_capacity(chunk_size);
        for item in reader {
            pending.push(item?);
            if pending.len() == chunk_size {
                let chunk = std::mem::replace(&mut pending, Vec::with_capacity(chunk_size));
                work_tx
                    .send((chunk_count, chunk))
                    .map_err(|_| FfdbError::Internal("reindex workers gone".into()))?;
                chunk_count += 1;
            }
        }
        if !pending.is_empty() {
            work_tx
                .send((chunk_count, pending))
                .map_err(|_| FfdbError::Internal("reindex workers gone".into()))?;
            chunk_count += 1;
        }
        drop(work_tx);

        let mut results = std::collections::BTreeMap::new();
        for (chunk, result) in result_rx.iter() {
            results.insert(chunk, result?);
        }
        let mut kept = 0u64;
        let mut dropped = 0u64;
        for chunk in 0..chunk_count {
            let (text, chunk_kept, chunk_dropped) = results
                .remove(&chunk)
                .ok_or_else(|| FfdbError::Internal("reindex chunk lost".into()))?;
            out.write_all(text.as_bytes())?;
            kept += chunk_kept;
            dropped += chunk_dropped;
        }
        out.flush()?;
        Ok((kept, dropped))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(dir: &Path) -> (PathBuf, PathBuf) {
        // Entries tile [0,30): three 10-byte entries a, b, c
        let ff = dir.join("entries.dat");
        let idx = dir.join("entries.pos");
        fs::write(&ff, b"aaaaaaaaaabbbbbbbbbbcccccccccc").unwrap();
        fs::write(&idx, "a\t0\t10\nb\t10\t10\nc\t20\t10\n").unwrap();
        (ff, idx)
    }

    fn run(dir: &Path, ids: &[&str], options: &RemoveOptions) -> (RemovedPair, RemoveOutcome) {
        let (ff, idx) = fixture(dir);
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        remove(&ff, &idx, &ids, options).unwrap()
    }

    #[test]
    fn test_delta_table() {
        let deltas = DeltaTable::new(&[(10, 10), (50, 5)]);
        assert_eq!(deltas.delta_at(0), 0);
        assert_eq!(deltas.delta_at(9), 0);
        assert_eq!(deltas.delta_at(10), 10);
        assert_eq!(deltas.delta_at(49), 10);
        assert_eq!(deltas.delta_at(50), 15);
        assert_eq!(deltas.total(), 15);
    }

    #[test]
    fn test_remove_middle_entry_shifts_followers() {
        let dir = tempfile::tempdir().unwrap();
        let (pair, outcome) = run(dir.path(), &["b"], &RemoveOptions::default());
        assert_eq!(fs::read(&pair.flatfile).unwrap(), b"aaaaaaaaaacccccccccc");
        assert_eq!(
            fs::read_to_string(&pair.index).unwrap(),
            "a\t0\t10\nc\t10\t10\n"
        );
        assert_eq!(outcome.removed_bytes, 10);
        assert_eq!(outcome.kept_records, 2);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn test_remove_first_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let (pair, outcome) = run(dir.path(), &["a", "c"], &RemoveOptions::default());
        assert_eq!(fs::read(&pair.flatfile).unwrap(), b"bbbbbbbbbb");
        assert_eq!(fs::read_to_string(&pair.index).unwrap(), "b\t0\t10\n");
        assert_eq!(outcome.removed_entries, 2);
    }

    #[test]
    fn test_missing_identifier_is_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let (_, outcome) = run(dir.path(), &["b", "nosuch"], &RemoveOptions::default());
        assert_eq!(outcome.missing, 1);
        assert_eq!(outcome.exit_code(), 4);
    }

    #[test]
    fn test_inputs_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (ff, idx) = fixture(dir.path());
        let ids = vec!["a".to_string()];
        remove(&ff, &idx, &ids, &RemoveOptions::default()).unwrap();
        assert_eq!(fs::metadata(&ff).unwrap().len(), 30);
        assert_eq!(
            fs::read_to_string(&idx).unwrap(),
            "a\t0\t10\nb\t10\t10\nc\t20\t10\n"
        );
    }

    #[test]
    fn test_parallel_reindex_matches_serial() {
        let dir = tempfile::tempdir().unwrap();
        let ff = dir.path().join("big.dat");
        let idx = dir.path().join("big.pos");
        let mut flat = Vec::new();
        let mut index = String::new();
        for i in 0..500 {
            index.push_str(&format!("id{i:04}\t{}\t4\n", flat.len()));
            flat.extend_from_slice(format!("e{i:03}").as_bytes());
        }
        fs::write(&ff, &flat).unwrap();
        fs::write(&idx, &index).unwrap();
        let ids: Vec<String> = (0..500)
            .step_by(7)
            .map(|i| format!("id{i:04}"))
            .collect();

        let serial_dir = tempfile::tempdir().unwrap();
        let parallel_dir = tempfile::tempdir().unwrap();
        let (serial, _) = remove(
            &ff,
            &idx,
            &ids,
            &RemoveOptions {
                outpath: Some(serial_dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();
        let (parallel, _) = remove(
            &ff,
            &idx,
            &ids,
            &RemoveOptions {
                threads: 4,
                chunk_size: Some(37),
                outpath: Some(parallel_dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            fs::read(&serial.index).unwrap(),
            fs::read(&parallel.index).unwrap()
        );
        assert_eq!(
            fs::read(&serial.flatfile).unwrap(),
            fs::read(&parallel.flatfile).unwrap()
        );
    }
}
