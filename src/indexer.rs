//! Flatfile indexer: scans terminator-delimited entries, captures
//! identifiers with precompiled regexes and emits positional records,
//! optionally re-writing entries through the codec stack into a new
//! flatfile.
//!
//! Entries tile the input: each one runs from the end of the previous entry
//! through its terminator line, inclusive. Trailing bytes after the last
//! terminator are not an entry. Entries that yield no identifiers get no
//! records; in plain mode their bytes stay in the flatfile and advance the
//! offset, while with codecs active they are dropped from the rewritten
//! flatfile entirely so the index keeps claiming every byte it covers.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crossbeam::channel;
use regex::bytes::Regex;
use tracing::{debug, info};

use crate::codec::{crc32, CodecContext};
use crate::config::CodecKind;
use crate::error::{FfdbError, Result};
use crate::index::{record_sort_key, write_index, IndexHeader, IndexRecord};

const SCAN_BUFFER: usize = 1024 * 1024;

/// Compiled identifier patterns. `ids` contribute their capture groups
/// independently; `joined` patterns colon-join all groups of one match into
/// a single compound identifier.
pub struct EntryPatterns {
    ids: Vec<Regex>,
    joined: Vec<Regex>,
}

impl EntryPatterns {
    pub fn compile(id_patterns: &[String], joined_patterns: &[String]) -> Result<Self> {
        if id_patterns.is_empty() && joined_patterns.is_empty() {
            return Err(FfdbError::Usage(
                "at least one identifier pattern is required".into(),
            ));
        }
        let compile = |pattern: &String| {
            Regex::new(&format!("(?m){pattern}"))
                .map_err(|err| FfdbError::Usage(format!("bad pattern {pattern:?}: {err}")))
        };
        Ok(Self {
            ids: id_patterns.iter().map(compile).collect::<Result<_>>()?,
            joined: joined_patterns.iter().map(compile).collect::<Result<_>>()?,
        })
    }

    /// Capture all identifiers of one entry, deduplicated, in match order.
    pub fn capture(&self, entry: &[u8], all_matches: bool) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut push = |id: String| {
            if !id.is_empty() && !found.contains(&id) {
                found.push(id);
            }
        };
        for pattern in &self.ids {
            for caps in pattern.captures_iter(entry) {
                for group in capture_groups(&caps) {
                    push(String::from_utf8_lossy(group).into_owned());
                }
                if !all_matches {
                    break;
                }
            }
        }
        for pattern in &self.joined {
            for caps in pattern.captures_iter(entry) {
                let parts: Vec<String> = capture_groups(&caps)
                    .into_iter()
                    .map(|g| String::from_utf8_lossy(g).into_owned())
                    .collect();
                if !parts.is_empty() {
                    push(parts.join(":"));
                }
                if !all_matches {
                    break;
                }
            }
        }
        found
    }
}

/// Non-empty capture groups of one match; a pattern with no groups
/// contributes its whole match.
fn capture_groups<'a>(caps: &'a regex::bytes::Captures<'a>) -> Vec<&'a [u8]> {
    if caps.len() == 1 {
        return vec![&caps[0]];
    }
    caps.iter()
        .skip(1)
        .flatten()
        .map(|m| m.as_bytes())
        .filter(|b| !b.is_empty())
        .collect()
}

/// Translate a `^...$`-anchored terminator into the byte needle delimiting
/// entries: anchors become newlines, the middle is taken literally.
pub fn terminator_needle(terminator: &str) -> Vec<u8> {
    let mut needle = Vec::new();
    let body = terminator.as_bytes();
    let starts = body.first() == Some(&b'^');
    let ends = body.last() == Some(&b'$') && body.len() > 1;
    if starts {
        needle.push(b'\n');
    }
    let inner = &body[usize::from(starts)..body.len() - usize::from(ends)];
    needle.extend_from_slice(inner);
    if ends {
        needle.push(b'\n');
    }
    needle
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|i| i + from)
}

/// Streaming splitter yielding terminator-delimited entries.
pub struct EntrySplitter<R: Read> {
    reader: R,
    needle: Vec<u8>,
    buf: Vec<u8>,
    scanned: usize,
    done: bool,
}

impl<R: Read> EntrySplitter<R> {
    pub fn new(reader: R, needle: Vec<u8>) -> Self {
        Self {
            reader,
            needle,
            buf: Vec::new(),
            scanned: 0,
            done: false,
        }
    }
}

impl<R: Read> Iterator for EntrySplitter<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(at) = find_subslice(&self.buf, &self.needle, self.scanned) {
                let end = at + self.needle.len();
                let entry: Vec<u8> = self.buf.drain(..end).collect();
                self.scanned = 0;
                return Some(Ok(entry));
            }
            // Keep a needle-sized tail unscanned so a terminator split
            // across reads is still found.
            self.scanned = self.buf.len().saturating_sub(self.needle.len() - 1);
            if self.done {
                return None;
            }
            let mut chunk = vec![0u8; SCAN_BUFFER];
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.done = true;
                    if self.buf.is_empty() {
                        return None;
                    }
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Indexer behaviour flags.
#[derive(Clone, Debug)]
pub struct IndexerOptions {
    /// Entry terminator in `^...$` form (default `^-$`)
    pub terminator: String,
    /// Record every pattern match, not just the first per pattern
    pub all_matches: bool,
    /// Base offset added to every record (used when the flatfile will be
    /// appended to another one later)
    pub base_offset: u64,
    /// Record CRC32 checksums of decoded entries
    pub checksums: bool,
    /// Emit a sorted index (unsorted leaves ordering to an external sort)
    pub sorted: bool,
    /// Print identifiers only, no positional records
    pub ids_only: bool,
    pub threads: usize,
    /// Flatfile bytes per parallel block (split at terminator boundaries)
    pub block_size: Option<u64>,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            terminator: "^-$".to_string(),
            all_matches: false,
            base_offset: 0,
            checksums: false,
            sorted: true,
            ids_only: false,
            threads: 1,
            block_size: None,
        }
    }
}

/// Totals for one indexing run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    pub entries: u64,
    pub records: u64,
    pub skipped: u64,
}

struct BlockOutput {
    block: usize,
    records: Vec<(String, IndexRecord)>,
    identifiers: Vec<String>,
    encoded: Option<File>,
    encoded_len: u64,
    outcome: IndexOutcome,
}

/// One configured indexing run.
pub struct Indexer {
    patterns: EntryPatterns,
    needle: Vec<u8>,
    header: IndexHeader,
    codec: CodecContext,
    options: IndexerOptions,
}

impl Indexer {
    pub fn new(
        patterns: EntryPatterns,
        header: IndexHeader,
        codec: CodecContext,
        options: IndexerOptions,
    ) -> Result<Self> {
        if options.ids_only
            && (codec.kind() != CodecKind::None || options.checksums || options.base_offset != 0)
        {
            return Err(FfdbError::Usage(
                "identifier-only output cannot be combined with codecs, checksums or an offset"
                    .into(),
            ));
        }
        let needle = terminator_needle(&options.terminator);
        if needle.is_empty() {
            return Err(FfdbError::Usage("empty entry terminator".into()));
        }
        Ok(Self {
            patterns,
            needle,
            header,
            codec,
            options,
        })
    }

    /// Index `input`, writing the index to `out_index` and, when the codec
    /// stack is active, encoded entries to `out_flatfile`.
    pub fn index(
        &self,
        input: &Path,
        out_flatfile: Option<&Path>,
        out_index: &mut dyn Write,
    ) -> Result<IndexOutcome> {
        let recoding = self.codec.kind() != CodecKind::None;
        if recoding && out_flatfile.is_none() {
            return Err(FfdbError::Usage(
                "codec stack requires an output flatfile path".into(),
            ));
        }
        let file_size = std::fs::metadata(input)?.len();
        let blocks = self.split_blocks(input, file_size)?;
        debug!(
            input = %input.display(),
            file_size,
            blocks = blocks.len(),
            threads = self.options.threads,
            "indexing"
        );

        let outputs = if blocks.len() <= 1 || self.options.threads <= 1 {
            blocks
                .iter()
                .enumerate()
                .map(|(i, span)| self.scan_block(input, i, *span))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.scan_parallel(input, &blocks)?
        };

        self.assemble(outputs, out_flatfile, out_index)
    }

    /// Byte spans of parallel blocks, each ending just past a terminator so
    /// no entry crosses a block boundary.
    fn split_blocks(&self, input: &Path, file_size: u64) -> Result<Vec<(u64, u64)>> {
        let threads = self.options.threads.max(1);
        if threads <= 1 || file_size == 0 {
            return Ok(vec![(0, file_size)]);
        }
        let block_size = match self.options.block_size {
            Some(0) | None => (file_size / threads as u64).max(1),
            Some(size) => size,
        };
        let mut file = File::open(input)?;
        let mut blocks = Vec::new();
        let mut start = 0u64;
        while start < file_size {
            let target = start + block_size;
            let end = if target >= file_size {
                file_size
            } else {
                find_needle_after(&mut file, file_size, target, &self.needle)?
            };
            blocks.push((start, end - start));
            start = end;
        }
        Ok(blocks)
    }

    fn scan_parallel(&self, input: &Path, blocks: &[(u64, u64)]) -> Result<Vec<BlockOutput>> {
        let (work_tx, work_rx) = channel::unbounded::<(usize, (u64, u64))>();
        for (i, span) in blocks.iter().enumerate() {
            let _ = work_tx.send((i, *span));
        }
        drop(work_tx);
        let mut outputs = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..self.options.threads {
                let work_rx = work_rx.clone();
                handles.push(scope.spawn(move || {
                    let mut done = Vec::new();
                    while let Ok((block, span)) = work_rx.recv() {
                        done.push(self.scan_block(input, block, span));
                    }
                    done
                }));
            }
            let mut all = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok(results) => all.extend(results),
                    Err(_) => all.push(Err(FfdbError::Internal("indexer worker panicked".into()))),
                }
            }
            all
        })
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
        outputs.sort_by_key(|o| o.block);
        Ok(outputs)
    }

    /// Scan one byte span of the input. Record offsets are absolute in
    /// plain mode; with codecs they are local to the block's encoded output
    /// and shifted during assembly.
    fn scan_block(&self, input: &Path, block: usize, span: (u64, u64)) -> Result<BlockOutput> {
        let recoding = self.codec.kind() != CodecKind::None;
        let (start, len) = span;
        let mut file = File::open(input)?;
        file.seek(SeekFrom::Start(start))?;
        let reader = file.take(len);

        let mut output = BlockOutput {
            block,
            records: Vec::new(),
            identifiers: Vec::new(),
            encoded: if recoding { Some(tempfile::tempfile()?) } else { None },
            encoded_len: 0,
            outcome: IndexOutcome::default(),
        };
        let mut position = if recoding {
            0
        } else {
            self.options.base_offset + start
        };
        {
            let mut encoded_writer = output.encoded.as_ref().map(BufWriter::new);

            for entry in EntrySplitter::new(reader, self.needle.clone()) {
                let entry = entry?;
                output.outcome.entries += 1;
                let ids = self.patterns.capture(&entry, self.options.all_matches);
                if ids.is_empty() {
                    output.outcome.skipped += 1;
                    if !recoding {
                        position += entry.len() as u64;
                    }
                    continue;
                }
                if self.options.ids_only {
                    output.identifiers.extend(ids);
                    continue;
                }
                let payload = self.codec.encode(&entry)?;
                if let Some(writer) = encoded_writer.as_mut() {
                    writer.write_all(&payload)?;
                    output.encoded_len += payload.len() as u64;
                }
                let checksum = self.options.checksums.then(|| crc32(&entry));
                let record = IndexRecord {
                    offset: position,
                    length: payload.len() as u64,
                    checksum,
                };
                position += payload.len() as u64;
                output.outcome.records += ids.len() as u64;
                for id in ids {
                    output.records.push((id, record));
                }
            }
            if let Some(mut writer) = encoded_writer {
                writer.flush()?;
            }
        }
        Ok(output)
    }

    fn assemble(
        &self,
        outputs: Vec<BlockOutput>,
        out_flatfile: Option<&Path>,
        out_index: &mut dyn Write,
    ) -> Result<IndexOutcome> {
        let recoding = self.codec.kind() != CodecKind::None;
        let mut outcome = IndexOutcome::default();
        let mut records: Vec<(String, IndexRecord)> = Vec::new();
        let mut shift = self.options.base_offset;

        let mut flatfile_writer = match (recoding, out_flatfile) {
            (true, Some(path)) => Some(BufWriter::new(File::create(path)?)),
            _ => None,
        };
        for mut output in outputs {
            outcome.entries += output.outcome.entries;
            outcome.records += output.outcome.records;
            outcome.skipped += output.outcome.skipped;
            if self.options.ids_only {
                for id in &output.identifiers {
                    writeln!(out_index, "{id}")?;
                }
                continue;
            }
            for (id, mut record) in output.records {
                if recoding {
                    record.offset += shift;
                }
                records.push((id, record));
            }
            if let (Some(writer), Some(encoded)) = (flatfile_writer.as_mut(), output.encoded.as_mut())
            {
                encoded.seek(SeekFrom::Start(0))?;
                io::copy(encoded, writer)?;
                shift += output.encoded_len;
            }
        }
        if let Some(mut writer) = flatfile_writer {
            writer.flush()?;
        }
        if self.options.ids_only {
            out_index.flush()?;
            return Ok(outcome);
        }
        if self.options.sorted {
            records.sort_by(|(a_id, a), (b_id, b)| {
                record_sort_key(a_id, a).cmp(&record_sort_key(b_id, b))
            });
        }
        write_index(
            out_index,
            &self.header,
            records.iter().map(|(id, record)| (id.as_str(), record)),
        )?;
        info!(
            entries = outcome.entries,
            records = outcome.records,
            skipped = outcome.skipped,
            "indexing finished"
        );
        Ok(outcome)
    }
}

/// Position just past the first terminator found at or after `from`.
/// Falls back to the file size when no terminator remains.
fn find_needle_after(file: &mut File, file_size: u64, from: u64, needle: &[u8]) -> Result<u64> {
    if from >= file_size {
        return Ok(file_size);
    }
    file.seek(SeekFrom::Start(from))?;
    let mut carry: Vec<u8> = Vec::new();
    let mut position = from;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            return Ok(file_size);
        }
        let mut window = std::mem::take(&mut carry);
        let window_start = position - window.len() as u64;
        window.extend_from_slice(&chunk[..n]);
        if let Some(at) = find_subslice(&window, needle, 0) {
            return Ok(window_start + at as u64 + needle.len() as u64);
        }
        position += n as u64;
        let keep = window.len().saturating_sub(needle.len() - 1);
        carry = window.split_off(keep);
    }
}
