//! Uniform random-access reads over local, remote and gzip-compressed
//! flatfiles.
//!
//! All implementations satisfy the same contract: `read_at` is a pure
//! function of its arguments and safe to call from concurrent workers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use flate2::read::MultiGzDecoder;
use flate2::{Decompress, FlushDecompress};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{FfdbError, Result};
use crate::gzi::GzIndex;

/// Random-access byte stream over a flatfile, local or remote.
pub trait ByteSource: Send + Sync {
    /// Read exactly `length` bytes starting at `offset`.
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Total size of the (decompressed) stream in bytes.
    fn size(&self) -> u64;
}

/// Positioned reads over a local file.
pub struct LocalSource {
    file: Mutex<File>,
    size: u64,
}

impl LocalSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl ByteSource for LocalSource {
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// HTTP(S) byte-range reads with bounded retry and exponential backoff.
pub struct RemoteSource {
    url: String,
    client: Client,
    size: u64,
    retry: RetryPolicy,
}

impl RemoteSource {
    pub fn open(url: &str, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(retry.timeout)
            .user_agent(concat!("ffdb/", env!("CARGO_PKG_VERSION")))
            .build()?;
        // Probe with a one-byte range: a server that answers 200 instead of
        // 206 does not honour ranges and cannot back random access.
        let response = client.get(url).header(RANGE, "bytes=0-0").send()?;
        let size = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.rsplit('/').next())
                    .and_then(|v| v.parse::<u64>().ok());
                total.ok_or_else(|| FfdbError::RangeUnsupported {
                    url: url.to_string(),
                })?
            }
            _ => {
                return Err(FfdbError::RangeUnsupported {
                    url: url.to_string(),
                })
            }
        };
        debug!(url, size, "remote flatfile reachable, ranges supported");
        Ok(Self {
            url: url.to_string(),
            client,
            size,
            retry,
        })
    }

    fn fetch_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, range)
            .send()?
            .error_for_status()?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(FfdbError::RangeUnsupported {
                url: self.url.clone(),
            });
        }
        let body = response.bytes()?;
        if body.len() as u64 != length {
            return Err(FfdbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "range request returned {} bytes, wanted {length}",
                    body.len()
                ),
            )));
        }
        Ok(body.to_vec())
    }
}

impl ByteSource for RemoteSource {
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let mut delay = self.retry.base_delay;
        let mut last_err = None;
        for attempt in 0..self.retry.attempts {
            match self.fetch_range(offset, length) {
                Ok(bytes) => return Ok(bytes),
                Err(err @ FfdbError::RangeUnsupported { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        url = %self.url,
                        offset,
                        length,
                        attempt = attempt + 1,
                        error = %err,
                        "range read failed"
                    );
                    last_err = Some(err);
                    if attempt + 1 < self.retry.attempts {
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| FfdbError::Internal("retry loop without attempts".into())))
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Local cache of compressed segments for remote gzip flatfiles.
///
/// Entries are content-addressed by `(url, access-point id, segment size)`
/// and written once under a per-key lock; concurrent readers share the file.
pub struct SegmentCache {
    dir: PathBuf,
    url_tag: String,
    locks: DashMap<usize, Arc<Mutex<()>>>,
}

impl SegmentCache {
    pub fn open(dir: PathBuf, url: &str) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let digest = Sha256::digest(url.as_bytes());
        Ok(Self {
            dir,
            url_tag: hex::encode(&digest[..8]),
            locks: DashMap::new(),
        })
    }

    fn segment_path(&self, point_id: usize, length: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{point_id}.{length}.gzseg", self.url_tag))
    }

    fn get_or_fetch(
        &self,
        point_id: usize,
        length: u64,
        fetch: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let lock = self
            .locks
            .entry(point_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();
        let path = self.segment_path(point_id, length);
        if path.is_file() {
            debug!(segment = %path.display(), "gzip segment cache hit");
            return Ok(std::fs::read(&path)?);
        }
        let bytes = fetch()?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir)?;
        staged.write_all(&bytes)?;
        staged
            .persist(&path)
            .map_err(|err| FfdbError::Io(err.error))?;
        Ok(bytes)
    }
}

/// Random access into a whole-file gzip through its `.gzi` side index.
///
/// A read locates the nearest preceding access point, range-reads the
/// compressed segment up to the next point past the requested range,
/// restarts decompression there and slices out the requested bytes.
pub struct GzipSource {
    inner: Arc<dyn ByteSource>,
    index: GzIndex,
    cache: Option<SegmentCache>,
    size: u64,
}

impl GzipSource {
    pub fn new(
        inner: Arc<dyn ByteSource>,
        index: GzIndex,
        cache: Option<SegmentCache>,
    ) -> Result<Self> {
        // The side index does not record the decompressed size; inflating
        // the final segment once bounds the probe by the access-point span.
        let (last_id, last) = index.locate(u64::MAX);
        let tail_len = inner.size() - last.compressed_offset;
        let tail = inner.read_at(last.compressed_offset, tail_len)?;
        let decompressed_tail = if last.window.is_empty() {
            inflate_members(&tail, 0, u64::MAX)?
        } else {
            inflate_raw_with_window(&tail, &last.window, 0, u64::MAX)?
        };
        let size = last.decompressed_offset + decompressed_tail.len() as u64;
        debug!(
            access_points = index.len(),
            last_point = last_id,
            decompressed_size = size,
            "gzip side index ready"
        );
        Ok(Self {
            inner,
            index,
            cache,
            size,
        })
    }
}

impl ByteSource for GzipSource {
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let (point_id, point) = self.index.locate(offset);
        let compressed_start = point.compressed_offset;
        let compressed_end = self
            .index
            .compressed_end(offset + length, self.inner.size());
        let segment_len = compressed_end - compressed_start;
        let segment = match &self.cache {
            Some(cache) => cache.get_or_fetch(point_id, segment_len, || {
                self.inner.read_at(compressed_start, segment_len)
            })?,
            None => self.inner.read_at(compressed_start, segment_len)?,
        };
        let skip = offset - point.decompressed_offset;
        let out = if point.window.is_empty() {
            inflate_members(&segment, skip, length)?
        } else {
            inflate_raw_with_window(&segment, &point.window, skip, length)?
        };
        if out.len() as u64 != length {
            return Err(FfdbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "gzip segment yielded {} bytes, wanted {length} at offset {offset}",
                    out.len()
                ),
            )));
        }
        Ok(out)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Decompress one or more concatenated gzip members, discarding `skip`
/// leading bytes and returning at most `take` bytes.
fn inflate_members(segment: &[u8], skip: u64, take: u64) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(segment);
    collect_decompressed(&mut decoder, skip, take)
}

/// Decompress a raw DEFLATE stream restarted mid-file, priming the inflate
/// window with the access point's dictionary snapshot.
fn inflate_raw_with_window(segment: &[u8], window: &[u8], skip: u64, take: u64) -> Result<Vec<u8>> {
    let mut inflater = Decompress::new(false);
    inflater
        .set_dictionary(window)
        .map_err(|err| FfdbError::Internal(format!("inflate dictionary rejected: {err}")))?;
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut consumed = 0usize;
    let mut produced = 0u64;
    let wanted = skip.saturating_add(take);
    while produced < wanted && consumed < segment.len() {
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let status = inflater
            .decompress(&segment[consumed..], &mut buf, FlushDecompress::None)
            .map_err(|err| {
                FfdbError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("inflate failed: {err}"),
                ))
            })?;
        consumed += (inflater.total_in() - before_in) as usize;
        let chunk = (inflater.total_out() - before_out) as usize;
        push_ranged(&mut out, &buf[..chunk], &mut produced, skip, take);
        if matches!(status, flate2::Status::StreamEnd) {
            break;
        }
        if chunk == 0 && (inflater.total_in() - before_in) == 0 {
            break; // no progress; input exhausted mid-block
        }
    }
    Ok(out)
}

fn collect_decompressed<R: Read>(reader: &mut R, skip: u64, take: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut produced = 0u64;
    let wanted = skip.saturating_add(take);
    while produced < wanted {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            // A segment cut at an access point can legitimately end
            // mid-member; the bytes we wanted are complete before that.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };
        push_ranged(&mut out, &buf[..n], &mut produced, skip, take);
    }
    Ok(out)
}

/// Append to `out` the part of `chunk` that falls inside `[skip, skip+take)`
/// of the decompressed stream, tracking the running position in `produced`.
fn push_ranged(out: &mut Vec<u8>, chunk: &[u8], produced: &mut u64, skip: u64, take: u64) {
    let start = *produced;
    let end = start + chunk.len() as u64;
    let copy_from = skip.clamp(start, end) - start;
    let copy_to = skip.saturating_add(take).clamp(start, end) - start;
    if copy_from < copy_to {
        out.extend_from_slice(&chunk[copy_from as usize..copy_to as usize]);
    }
    *produced = end;
}

/// Where a flatfile lives and how to open it.
#[derive(Clone, Debug, Default)]
pub struct SourceSpec {
    /// Local path or http(s) URL
    pub location: String,
    /// Side index path when the flatfile is whole-file gzip
    pub gzi: Option<PathBuf>,
    /// Cache directory for compressed segments (remote gzip only)
    pub cache_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
}

impl SourceSpec {
    pub fn local(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }

    pub fn is_remote(&self) -> bool {
        self.location.contains("://")
    }
}

/// Open the byte source matching a spec: scheme picks local vs remote, a
/// declared side index wraps the stream in gzip random access.
pub fn open_source(spec: &SourceSpec) -> Result<Arc<dyn ByteSource>> {
    if spec.location.starts_with("ftp://") {
        return Err(FfdbError::Usage(
            "ftp is not supported for range retrieval; use http(s) or a local copy".into(),
        ));
    }
    let base: Arc<dyn ByteSource> = if spec.is_remote() {
        Arc::new(RemoteSource::open(&spec.location, spec.retry)?)
    } else {
        Arc::new(LocalSource::open(Path::new(&spec.location))?)
    };
    match &spec.gzi {
        None => Ok(base),
        Some(gzi_path) => {
            let index = GzIndex::load(gzi_path)?;
            let cache = match (&spec.cache_dir, spec.is_remote()) {
                (Some(dir), true) => Some(SegmentCache::open(dir.clone(), &spec.location)?),
                _ => None,
            };
            Ok(Arc::new(GzipSource::new(base, index, cache)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    fn gzip_members(chunks: &[&[u8]]) -> (Vec<u8>, Vec<(u64, u64)>) {
        let mut compressed = Vec::new();
        let mut points = Vec::new();
        let mut decompressed_offset = 0u64;
        for chunk in chunks {
            points.push((compressed.len() as u64, decompressed_offset));
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(chunk).unwrap();
            compressed.extend_from_slice(&encoder.finish().unwrap());
            decompressed_offset += chunk.len() as u64;
        }
        (compressed, points)
    }

    fn gzip_source(chunks: &[&[u8]]) -> GzipSource {
        let dir = tempfile::tempdir().unwrap();
        let (compressed, points) = gzip_members(chunks);
        let ff = dir.path().join("data.gz");
        std::fs::write(&ff, &compressed).unwrap();
        let gzi = dir.path().join("data.gz.gzi");
        crate::gzi::write_pairs(&gzi, &points).unwrap();
        let inner = Arc::new(LocalSource::open(&ff).unwrap());
        let index = GzIndex::load(&gzi).unwrap();
        GzipSource::new(inner, index, None).unwrap()
    }

    #[test]
    fn test_local_source_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.dat");
        std::fs::write(&path, b"0123456789abcdef").unwrap();
        let source = LocalSource::open(&path).unwrap();
        assert_eq!(source.size(), 16);
        assert_eq!(source.read_at(4, 6).unwrap(), b"456789");
        assert!(source.read_at(12, 10).is_err());
    }

    #[test]
    fn test_gzip_source_size_and_reads() {
        let source = gzip_source(&[b"aaaaaaaaaa", b"bbbbbbbbbb", b"cccccccccc"]);
        assert_eq!(source.size(), 30);
        assert_eq!(source.read_at(0, 5).unwrap(), b"aaaaa");
        assert_eq!(source.read_at(8, 4).unwrap(), b"aabb");
        assert_eq!(source.read_at(25, 5).unwrap(), b"ccccc");
    }

    #[test]
    fn test_gzip_read_spanning_all_members() {
        let source = gzip_source(&[b"head", b"middle", b"tail"]);
        assert_eq!(source.read_at(0, 14).unwrap(), b"headmiddletail");
        assert_eq!(source.read_at(2, 10).unwrap(), b"admiddleta");
    }

    #[test]
    fn test_segment_cache_single_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SegmentCache::open(dir.path().to_path_buf(), "http://example/db.gz").unwrap();
        let mut calls = 0;
        let first = cache
            .get_or_fetch(3, 128, || {
                calls += 1;
                Ok(vec![7u8; 128])
            })
            .unwrap();
        let second = cache
            .get_or_fetch(3, 128, || {
                calls += 1;
                Ok(vec![9u8; 128])
            })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_ftp_rejected() {
        let spec = SourceSpec {
            location: "ftp://host/db.dat".into(),
            ..Default::default()
        };
        assert!(matches!(open_source(&spec), Err(FfdbError::Usage(_))));
    }
}
