//! Entry extraction: identifiers -> index lookup -> planned reads ->
//! byte source -> codec -> output.
//!
//! Output order is the caller's request order; duplicates of one identifier
//! under the `all` policy emit in flatfile order. Workers never write to the
//! output stream directly: the driver serialises emission, restoring order
//! through a reorder buffer.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use crossbeam::channel;
use tracing::{debug, info, warn};

use crate::codec::{crc32, CodecContext};
use crate::config::DuplicatesPolicy;
use crate::error::{FfdbError, Result};
use crate::index::IndexStore;
use crate::planner::{
    default_block_size, partition_blocks, plan_reads, EntryRequest, PlanOptions, ReadRequest,
};
use crate::source::ByteSource;

/// Extraction tuning and behaviour flags.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    pub policy: DuplicatesPolicy,
    /// Coalesce adjacent ranges into merged reads
    pub merged: bool,
    /// Worker threads; 1 = run on the calling thread
    pub threads: usize,
    /// Identifiers per worker block; `None` = even split across workers,
    /// `Some(0)` = no blocking, one shared coalesced plan
    pub block_size: Option<usize>,
    /// Verify entry checksums against the index
    pub verify: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            policy: DuplicatesPolicy::First,
            merged: false,
            threads: 1,
            block_size: None,
            verify: false,
        }
    }
}

/// Counts accumulated over one extraction run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub requested: u64,
    pub found: u64,
    pub extracted: u64,
    pub missing: u64,
    pub corrupted: u64,
    /// Entries lost to byte-source failures after retries
    pub failed: u64,
}

impl ExtractReport {
    /// Exit code once the run has drained: integrity failures dominate,
    /// then IO failures, then partial success from missing identifiers.
    pub fn exit_code(&self) -> i32 {
        if self.corrupted > 0 {
            3
        } else if self.failed > 0 {
            2
        } else if self.missing > 0 {
            4
        } else {
            0
        }
    }
}

/// Decoded (or failed) entry keyed by its request sequence number.
struct EntryOutput {
    seq: usize,
    identifier: String,
    outcome: Outcome,
}

enum Outcome {
    Decoded(Vec<u8>),
    Corrupted,
    Failed,
}

struct UnitResult {
    unit: usize,
    outputs: Vec<EntryOutput>,
    fatal: Option<FfdbError>,
}

/// Extraction pipeline over a loaded index, an open byte source and a
/// codec context. All three are shared read-only across workers.
pub struct Extractor {
    index: Arc<IndexStore>,
    source: Arc<dyn ByteSource>,
    codec: Arc<CodecContext>,
}

impl Extractor {
    pub fn new(index: Arc<IndexStore>, source: Arc<dyn ByteSource>, codec: CodecContext) -> Self {
        Self {
            index,
            source,
            codec: Arc::new(codec),
        }
    }

    /// Extract entries for `identifiers` into `out`, in request order.
    pub fn extract(
        &self,
        identifiers: &[String],
        options: &ExtractOptions,
        out: &mut dyn Write,
    ) -> Result<ExtractReport> {
        if options.verify && !self.index.header().checksums {
            return Err(FfdbError::Usage(
                "sanity check requested but the index does not carry checksums".into(),
            ));
        }
        let mut report = ExtractReport::default();
        let mut entries = Vec::new();
        for identifier in identifiers {
            report.requested += 1;
            let records = self.index.lookup(identifier, options.policy);
            if records.is_empty() {
                warn!(identifier = %identifier, "not found in index; skipping");
                report.missing += 1;
                continue;
            }
            report.found += records.len() as u64;
            for record in records {
                entries.push(EntryRequest {
                    seq: entries.len(),
                    identifier: identifier.clone(),
                    record,
                });
            }
        }
        if entries.is_empty() {
            return Ok(report);
        }

        let plan_options = PlanOptions {
            merged: options.merged,
            ..Default::default()
        };
        let block_size = options
            .block_size
            .unwrap_or_else(|| default_block_size(entries.len(), options.threads));

        // With blocking disabled every read request of one shared plan is a
        // dispatch unit and request order needs a full reorder at the end;
        // with blocks, units ride in block order and intra-block order is
        // restored per unit.
        let shared_plan = block_size == 0;
        let units: Vec<(usize, Vec<ReadRequest>)> = if shared_plan {
            plan_reads(entries, &plan_options)
                .into_iter()
                .enumerate()
                .map(|(i, read)| (i, vec![read]))
                .collect()
        } else {
            partition_blocks(entries, block_size)
                .into_iter()
                .map(|block| plan_reads(block, &plan_options))
                .enumerate()
                .collect()
        };
        debug!(
            units = units.len(),
            threads = options.threads,
            merged = options.merged,
            "extraction plan ready"
        );

        let results = if options.threads <= 1 {
            units
                .iter()
                .map(|(unit, reads)| process_unit(*unit, reads, &self.source, &self.codec, options.verify))
                .collect()
        } else {
            self.run_workers(units, options)
        };

        self.emit(results, shared_plan, out, &mut report)?;
        info!(
            requested = report.requested,
            found = report.found,
            extracted = report.extracted,
            missing = report.missing,
            corrupted = report.corrupted,
            "extraction finished"
        );
        Ok(report)
    }

    /// Extract into a file through a temporary sibling, renamed into place
    /// only when the run fully succeeds.
    pub fn extract_to_file(
        &self,
        identifiers: &[String],
        options: &ExtractOptions,
        path: &Path,
    ) -> Result<ExtractReport> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut staged = match dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new_in(".")?,
        };
        let report = self.extract(identifiers, options, staged.as_file_mut())?;
        if report.exit_code() == 0 {
            staged.persist(path).map_err(|err| FfdbError::Io(err.error))?;
        } else {
            warn!(
                outfile = %path.display(),
                "run did not fully succeed; output left unwritten"
            );
        }
        Ok(report)
    }

    fn run_workers(
        &self,
        units: Vec<(usize, Vec<ReadRequest>)>,
        options: &ExtractOptions,
    ) -> Vec<UnitResult> {
        let (work_tx, work_rx) = channel::unbounded::<(usize, Vec<ReadRequest>)>();
        let (result_tx, result_rx) = channel::unbounded::<UnitResult>();
        for unit in units {
            let _ = work_tx.send(unit);
        }
        drop(work_tx);

        let mut handles = Vec::with_capacity(options.threads);
        for _ in 0..options.threads {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let source = Arc::clone(&self.source);
            let codec = Arc::clone(&self.codec);
            let verify = options.verify;
            handles.push(thread::spawn(move || {
                while let Ok((unit, reads)) = work_rx.recv() {
                    let result = process_unit(unit, &reads, &source, &codec, verify);
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let results: Vec<UnitResult> = result_rx.iter().collect();
        for handle in handles {
            let _ = handle.join();
        }
        results
    }

    fn emit(
        &self,
        results: Vec<UnitResult>,
        full_reorder: bool,
        out: &mut dyn Write,
        report: &mut ExtractReport,
    ) -> Result<()> {
        // Structural failures abort before any counting; workers have
        // already drained by the time results are collected.
        let mut fatal = None;
        let mut outputs = Vec::new();
        let mut by_unit = BTreeMap::new();
        for result in results {
            if let Some(err) = result.fatal {
                fatal.get_or_insert(err);
            }
            by_unit.insert(result.unit, result.outputs);
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        for (_, mut unit_outputs) in by_unit {
            unit_outputs.sort_by_key(|o| o.seq);
            outputs.extend(unit_outputs);
        }
        if full_reorder {
            outputs.sort_by_key(|o| o.seq);
        }
        for output in outputs {
            match output.outcome {
                Outcome::Decoded(bytes) => {
                    out.write_all(&bytes)?;
                    report.extracted += 1;
                }
                Outcome::Corrupted => report.corrupted += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Fetch and decode every read of one dispatch unit. Per-entry failures are
/// recorded and siblings continue; a bad passphrase is fatal for the run.
fn process_unit(
    unit: usize,
    reads: &[ReadRequest],
    source: &Arc<dyn ByteSource>,
    codec: &CodecContext,
    verify: bool,
) -> UnitResult {
    let mut outputs = Vec::new();
    let mut fatal = None;
    'reads: for read in reads {
        let bytes = match source.read_at(read.offset, read.length) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    offset = read.offset,
                    length = read.length,
                    error = %err,
                    "read failed; entries in this range are lost"
                );
                for entry in &read.entries {
                    outputs.push(EntryOutput {
                        seq: entry.seq,
                        identifier: entry.identifier.clone(),
                        outcome: Outcome::Failed,
                    });
                }
                continue;
            }
        };
        for entry in &read.entries {
            let start = (entry.record.offset - read.offset) as usize;
            let end = start + entry.record.length as usize;
            let outcome = match codec.decode(&bytes[start..end]) {
                Err(FfdbError::BadPassphrase) => {
                    fatal = Some(FfdbError::BadPassphrase);
                    break 'reads;
                }
                Err(FfdbError::CorruptEntry(_)) => {
                    warn!(identifier = %entry.identifier, "entry failed to decode; skipping");
                    Outcome::Corrupted
                }
                Err(err) => {
                    warn!(identifier = %entry.identifier, error = %err, "entry lost");
                    Outcome::Failed
                }
                Ok(decoded) => match entry.record.checksum {
                    Some(expected) if verify && crc32(&decoded) != expected => {
                        warn!(
                            identifier = %entry.identifier,
                            "checksum mismatch; skipping entry"
                        );
                        Outcome::Corrupted
                    }
                    _ => Outcome::Decoded(decoded),
                },
            };
            outputs.push(EntryOutput {
                seq: entry.seq,
                identifier: entry.identifier.clone(),
                outcome,
            });
        }
    }
    UnitResult {
        unit,
        outputs,
        fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecKind;
    use crate::index::IndexStore;
    use crate::source::LocalSource;
    use std::io::{BufReader, Cursor};

    fn fixture() -> (tempfile::TempDir, Extractor) {
        // Three entries tiling the flatfile, with a duplicated identifier
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("entries.dat");
        std::fs::write(&flat, b"alpha A\n-\nbeta BB\n-\ngamma C\n-\n").unwrap();
        let index_text = "9606\t0\t10\n9606\t10\t10\nalpha\t0\t10\nbeta\t10\t10\ngamma\t20\t10\n";
        let index =
            IndexStore::from_reader(BufReader::new(Cursor::new(index_text.to_string()))).unwrap();
        let source = Arc::new(LocalSource::open(&flat).unwrap());
        let extractor = Extractor::new(Arc::new(index), source, CodecContext::plain());
        (dir, extractor)
    }

    fn run(extractor: &Extractor, ids: &[&str], options: &ExtractOptions) -> (Vec<u8>, ExtractReport) {
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        let mut out = Vec::new();
        let report = extractor.extract(&ids, options, &mut out).unwrap();
        (out, report)
    }

    #[test]
    fn test_single_entry_in_request_order() {
        let (_dir, extractor) = fixture();
        let (out, report) = run(&extractor, &["gamma", "alpha"], &ExtractOptions::default());
        assert_eq!(out, b"gamma C\n-\nalpha A\n-\n");
        assert_eq!(report.extracted, 2);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_duplicates_policies() {
        let (_dir, extractor) = fixture();
        let (first, _) = run(&extractor, &["9606"], &ExtractOptions::default());
        assert_eq!(first, b"alpha A\n-\n");
        let (last, _) = run(
            &extractor,
            &["9606"],
            &ExtractOptions {
                policy: DuplicatesPolicy::Last,
                ..Default::default()
            },
        );
        assert_eq!(last, b"beta BB\n-\n");
        let (all, report) = run(
            &extractor,
            &["9606"],
            &ExtractOptions {
                policy: DuplicatesPolicy::All,
                ..Default::default()
            },
        );
        assert_eq!(all, b"alpha A\n-\nbeta BB\n-\n");
        assert_eq!(report.found, 2);
    }

    #[test]
    fn test_missing_identifier_reports_partial() {
        let (_dir, extractor) = fixture();
        let (out, report) = run(&extractor, &["alpha", "nosuch"], &ExtractOptions::default());
        assert_eq!(out, b"alpha A\n-\n");
        assert_eq!(report.missing, 1);
        assert_eq!(report.exit_code(), 4);
    }

    #[test]
    fn test_merged_equals_unmerged() {
        let (_dir, extractor) = fixture();
        let ids = ["beta", "alpha", "gamma"];
        let (plain, _) = run(&extractor, &ids, &ExtractOptions::default());
        let (merged, _) = run(
            &extractor,
            &ids,
            &ExtractOptions {
                merged: true,
                ..Default::default()
            },
        );
        assert_eq!(plain, merged);
    }

    #[test]
    fn test_parallel_equals_serial() {
        let (_dir, extractor) = fixture();
        let ids = ["gamma", "9606", "alpha", "beta"];
        let (serial, _) = run(&extractor, &ids, &ExtractOptions::default());
        for threads in [2, 4] {
            for block_size in [None, Some(1), Some(2), Some(0)] {
                let (parallel, _) = run(
                    &extractor,
                    &ids,
                    &ExtractOptions {
                        threads,
                        block_size,
                        merged: true,
                        ..Default::default()
                    },
                );
                assert_eq!(parallel, serial, "threads={threads} block={block_size:?}");
            }
        }
    }

    #[test]
    fn test_verify_requires_checksummed_index() {
        let (_dir, extractor) = fixture();
        let ids = vec!["alpha".to_string()];
        let mut out = Vec::new();
        let err = extractor
            .extract(
                &ids,
                &ExtractOptions {
                    verify: true,
                    ..Default::default()
                },
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, FfdbError::Usage(_)));
    }
}
