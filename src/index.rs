//! Positional index: sorted text file mapping identifiers to byte ranges.
//!
//! Record format, one per line, LF terminated:
//!
//! ```text
//! <identifier>\t<offset>\t<length>[\t<checksum_hex>]
//! ```
//!
//! Offsets and lengths are decimal byte counts into the flatfile; the
//! optional checksum is the lowercase hex CRC32 of the decoded entry.
//! The file is sorted lexicographically by identifier, ties by ascending
//! offset. An optional first line starting with `#` declares the codec
//! configuration; absent header means a legacy plaintext index.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::config::{CodecKind, DuplicatesPolicy, KeyParams, KeySize};
use crate::error::{FfdbError, Result};

/// Field separator in index lines
pub const FIELD_SEPARATOR: char = '\t';

/// One positional record: where an encoded entry lives in the flatfile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub offset: u64,
    pub length: u64,
    pub checksum: Option<u32>,
}

impl IndexRecord {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            checksum: None,
        }
    }

    pub fn with_checksum(offset: u64, length: u64, checksum: u32) -> Self {
        Self {
            offset,
            length,
            checksum: Some(checksum),
        }
    }

    /// End of the byte range claimed by this record.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Codec declaration carried in the optional `#` header line.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct IndexHeader {
    pub codec: CodecKind,
    pub key_size: Option<KeySize>,
    pub key_params: Option<KeyParams>,
    pub checksums: bool,
}

impl IndexHeader {
    pub fn new(codec: CodecKind, key_size: Option<KeySize>, checksums: bool) -> Self {
        Self {
            codec,
            key_size,
            key_params: None,
            checksums,
        }
    }

    /// KDF parameters for this index, falling back to the compatibility
    /// defaults when the header does not declare them.
    pub fn effective_key_params(&self) -> KeyParams {
        self.key_params.clone().unwrap_or_default()
    }

    /// Parse a `# k=v ...` header line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut header = IndexHeader::default();
        let body = line.trim_start_matches('#').trim();
        for pair in body.split_whitespace() {
            let (key, value) = pair.split_once('=').ok_or_else(|| FfdbError::IndexFormat {
                line: 1,
                reason: format!("malformed header field {pair:?}"),
            })?;
            match key {
                "codec" => header.codec = CodecKind::parse(value)?,
                "aes" => {
                    let bits: u32 = value.parse().map_err(|_| {
                        FfdbError::UnsupportedCodec(format!("bad aes key size {value:?}"))
                    })?;
                    header.key_size = Some(KeySize::from_bits(bits).ok_or_else(|| {
                        FfdbError::UnsupportedCodec(format!("unsupported aes key size {bits}"))
                    })?);
                }
                "kdf" => {
                    if value != "pbkdf2-sha256" {
                        return Err(FfdbError::UnsupportedCodec(format!(
                            "unsupported kdf {value:?}"
                        )));
                    }
                }
                "iter" => {
                    let iterations: u32 = value.parse().map_err(|_| {
                        FfdbError::UnsupportedCodec(format!("bad iteration count {value:?}"))
                    })?;
                    header
                        .key_params
                        .get_or_insert_with(KeyParams::default)
                        .iterations = iterations;
                }
                "salt" => {
                    let salt = hex::decode(value).map_err(|_| {
                        FfdbError::UnsupportedCodec(format!("bad salt hex {value:?}"))
                    })?;
                    header.key_params.get_or_insert_with(KeyParams::default).salt = salt;
                }
                "crc" => header.checksums = value == "1",
                // Tolerate future keys as long as the codec itself is known
                _ => {}
            }
        }
        if header.codec.encrypted() && header.key_size.is_none() {
            return Err(FfdbError::UnsupportedCodec(
                "encrypted codec without aes= key size".into(),
            ));
        }
        Ok(header)
    }

    /// Render the header line, or `None` when the index needs no header.
    pub fn format_line(&self) -> Option<String> {
        if self.codec == CodecKind::None && !self.checksums {
            return None;
        }
        let mut line = format!("# codec={}", self.codec.as_str());
        if let Some(size) = self.key_size {
            line.push_str(&format!(" aes={}", size.bits()));
        }
        if self.codec.encrypted() {
            let params = self.effective_key_params();
            line.push_str(&format!(
                " kdf=pbkdf2-sha256 iter={} salt={}",
                params.iterations,
                hex::encode(&params.salt)
            ));
        }
        if self.checksums {
            line.push_str(" crc=1");
        }
        Some(line)
    }

    /// Two indexes can be merged only when their codec configuration and
    /// checksum presence agree.
    pub fn compatible_with(&self, other: &IndexHeader) -> bool {
        self.codec == other.codec
            && self.key_size == other.key_size
            && self.checksums == other.checksums
    }
}

/// Parse one record line. `line_number` is used for error reporting only.
pub fn parse_record(line: &str, line_number: u64) -> Result<(String, IndexRecord)> {
    let malformed = |reason: String| FfdbError::IndexFormat {
        line: line_number,
        reason,
    };
    let mut fields = line.trim_end_matches('\n').split(FIELD_SEPARATOR);
    let identifier = fields
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("empty identifier".into()))?;
    let offset: u64 = fields
        .next()
        .ok_or_else(|| malformed("missing offset column".into()))?
        .parse()
        .map_err(|_| malformed("offset is not a decimal byte count".into()))?;
    let length: u64 = fields
        .next()
        .ok_or_else(|| malformed("missing length column".into()))?
        .parse()
        .map_err(|_| malformed("length is not a decimal byte count".into()))?;
    let checksum = match fields.next() {
        Some(hex_crc) => Some(
            u32::from_str_radix(hex_crc, 16)
                .map_err(|_| malformed("checksum is not hex".into()))?,
        ),
        None => None,
    };
    Ok((identifier.to_string(), IndexRecord { offset, length, checksum }))
}

/// Render one record line (without trailing newline).
pub fn format_record(identifier: &str, record: &IndexRecord) -> String {
    match record.checksum {
        Some(crc) => format!(
            "{identifier}\t{}\t{}\t{:08x}",
            record.offset, record.length, crc
        ),
        None => format!("{identifier}\t{}\t{}", record.offset, record.length),
    }
}

/// Ordering key for index records: identifier, then offset, then length.
pub fn record_sort_key<'a>(identifier: &'a str, record: &IndexRecord) -> (&'a str, u64, u64) {
    (identifier, record.offset, record.length)
}

/// In-memory ordered multimap from identifier to positional records.
///
/// Read-only after load; shared across extraction workers behind an `Arc`.
#[derive(Debug)]
pub struct IndexStore {
    header: IndexHeader,
    map: BTreeMap<String, Vec<IndexRecord>>,
    records: u64,
}

impl IndexStore {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let store = Self::from_reader(BufReader::new(file))?;
        debug!(
            index = %path.display(),
            identifiers = store.map.len(),
            records = store.records,
            codec = store.header.codec.as_str(),
            "index loaded"
        );
        Ok(store)
    }

    pub fn from_reader<R: Read>(reader: BufReader<R>) -> Result<Self> {
        let mut header = None;
        let mut map: BTreeMap<String, Vec<IndexRecord>> = BTreeMap::new();
        let mut records = 0u64;
        let mut previous: Option<(String, IndexRecord)> = None;
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let line_number = number as u64 + 1;
            if line_number == 1 && line.starts_with('#') {
                header = Some(IndexHeader::parse(&line)?);
                continue;
            }
            if line.is_empty() {
                continue;
            }
            let (identifier, record) = parse_record(&line, line_number)?;
            if let Some((prev_id, prev_record)) = &previous {
                let out_of_order = identifier.as_str() < prev_id.as_str()
                    || (identifier == *prev_id && record.offset < prev_record.offset);
                if out_of_order {
                    return Err(FfdbError::UnsortedIndex {
                        line: line_number,
                        identifier,
                    });
                }
            }
            previous = Some((identifier.clone(), record));
            map.entry(identifier).or_default().push(record);
            records += 1;
        }
        let header = match header {
            Some(header) => header,
            // Legacy headerless index: plaintext; checksum presence is
            // whatever the records carry.
            None => {
                let checksums = map.values().flatten().next().is_some_and(|r| r.checksum.is_some());
                IndexHeader::new(CodecKind::None, None, checksums)
            }
        };
        if header.checksums {
            let missing = map.values().flatten().any(|r| r.checksum.is_none());
            if missing {
                return Err(FfdbError::IndexFormat {
                    line: 0,
                    reason: "index declares checksums but some records lack them".into(),
                });
            }
        }
        Ok(Self {
            header,
            map,
            records,
        })
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Total number of records (identifier duplicates counted).
    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Resolve one identifier under a duplicates policy.
    ///
    /// A miss is not an error: the empty vector is returned and the caller
    /// decides how to surface it.
    pub fn lookup(&self, identifier: &str, policy: DuplicatesPolicy) -> Vec<IndexRecord> {
        match self.map.get(identifier) {
            None => Vec::new(),
            Some(records) => match policy {
                DuplicatesPolicy::First => records.first().copied().into_iter().collect(),
                DuplicatesPolicy::Last => records.last().copied().into_iter().collect(),
                DuplicatesPolicy::All => records.clone(),
            },
        }
    }

    /// Vectorised lookup preserving input order.
    pub fn lookup_many(
        &self,
        identifiers: &[String],
        policy: DuplicatesPolicy,
    ) -> Vec<(String, Vec<IndexRecord>)> {
        identifiers
            .iter()
            .map(|id| (id.clone(), self.lookup(id, policy)))
            .collect()
    }

    /// Iterate all records in index order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &IndexRecord)> {
        self.map
            .iter()
            .flat_map(|(id, records)| records.iter().map(move |r| (id.as_str(), r)))
    }
}

/// Streaming iterator over the record lines of an index file, skipping the
/// header. Used where a full in-memory load is unnecessary (merge, remove).
pub struct IndexLineIter<R: BufRead> {
    reader: R,
    line_number: u64,
    pub header: Option<IndexHeader>,
}

impl IndexLineIter<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: BufRead> IndexLineIter<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        // Peek the first line for a header without consuming records
        let mut first = String::new();
        let header = if reader.fill_buf()?.first() == Some(&b'#') {
            reader.read_line(&mut first)?;
            Some(IndexHeader::parse(&first)?)
        } else {
            None
        };
        Ok(Self {
            reader,
            line_number: if header.is_some() { 1 } else { 0 },
            header,
        })
    }
}

impl<R: BufRead> Iterator for IndexLineIter<R> {
    type Item = Result<(String, IndexRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
            self.line_number += 1;
            if line.trim_end_matches('\n').is_empty() {
                continue;
            }
            return Some(parse_record(&line, self.line_number));
        }
    }
}

/// Write a complete index: header (when needed) followed by records, which
/// must already be in sorted order.
pub fn write_index<'a, W: Write + ?Sized>(
    writer: &mut W,
    header: &IndexHeader,
    records: impl Iterator<Item = (&'a str, &'a IndexRecord)>,
) -> Result<()> {
    let mut out = BufWriter::new(writer);
    if let Some(line) = header.format_line() {
        writeln!(out, "{line}")?;
    }
    for (identifier, record) in records {
        writeln!(out, "{}", format_record(identifier, record))?;
    }
    out.flush()?;
    Ok(())
}

/// Stream an index file into `out`, keeping records for which `keep` returns
/// a (possibly rewritten) record. The header is carried over verbatim.
pub fn filter_index_file(
    path: &Path,
    out: &mut dyn Write,
    mut keep: impl FnMut(&str, &IndexRecord) -> Option<IndexRecord>,
) -> Result<(u64, u64)> {
    let iter = IndexLineIter::open(path)?;
    let mut writer = BufWriter::new(out);
    if let Some(header) = &iter.header {
        if let Some(line) = header.format_line() {
            writeln!(writer, "{line}")?;
        }
    }
    let mut kept = 0u64;
    let mut dropped = 0u64;
    for item in iter {
        let (identifier, record) = item?;
        match keep(&identifier, &record) {
            Some(rewritten) => {
                writeln!(writer, "{}", format_record(&identifier, &rewritten))?;
                kept += 1;
            }
            None => dropped += 1,
        }
    }
    writer.flush()?;
    Ok((kept, dropped))
}
