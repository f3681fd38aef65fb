//! `.gzi` side index: access points for random reads into whole-file gzip.
//!
//! Two encodings are accepted:
//!
//! 1. The bgzip pair table: `u64 count` followed by `count` pairs of
//!    `(u64 compressed_offset, u64 decompressed_offset)`, little-endian.
//!    Every point is a gzip member boundary, so decompression restarts
//!    with an empty window.
//! 2. A windowed table (magic `FFGZ1\0`): each access point additionally
//!    carries `u8 window_bits` and a window snapshot, allowing restarts at
//!    arbitrary DEFLATE block boundaries via a preset dictionary.
//!
//! Access points with `window_bits != 0` describe a restart inside a byte;
//! the inflate used here cannot prime partial bits, so such indexes are
//! rejected at load. bgzip output and every gzip this crate writes restart
//! on byte boundaries.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{FfdbError, Result};

/// Magic prefix of the windowed access-point encoding
pub const WINDOWED_MAGIC: &[u8; 6] = b"FFGZ1\0";

/// One restart point in the compressed stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPoint {
    /// Byte offset into the compressed file where decompression restarts
    pub compressed_offset: u64,
    /// Decompressed-stream offset this point corresponds to
    pub decompressed_offset: u64,
    /// Inflate window at this point; empty at gzip member boundaries
    pub window: Vec<u8>,
}

impl AccessPoint {
    fn origin() -> Self {
        Self {
            compressed_offset: 0,
            decompressed_offset: 0,
            window: Vec::new(),
        }
    }
}

/// Parsed side index, ordered by decompressed offset.
///
/// The origin point `(0, 0)` is always present even when the file omits it.
#[derive(Debug)]
pub struct GzIndex {
    points: Vec<AccessPoint>,
}

impl GzIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::from_reader(&mut reader)
    }

    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut prefix = [0u8; 6];
        // The pair table starts with a u64 count; reading six bytes is safe
        // for any non-empty encoding and tells the two formats apart.
        reader.read_exact(&mut prefix).map_err(|_| {
            FfdbError::UnsupportedCodec("side index is truncated".into())
        })?;
        let mut points = if prefix == *WINDOWED_MAGIC {
            Self::read_windowed(reader)?
        } else {
            Self::read_pairs(&prefix, reader)?
        };
        points.sort_by_key(|p| p.decompressed_offset);
        if points.first().map(|p| p.decompressed_offset) != Some(0) {
            points.insert(0, AccessPoint::origin());
        }
        Ok(Self { points })
    }

    fn read_pairs<R: Read>(prefix: &[u8; 6], reader: &mut R) -> Result<Vec<AccessPoint>> {
        let mut count_bytes = [0u8; 8];
        count_bytes[..6].copy_from_slice(prefix);
        reader.read_exact(&mut count_bytes[6..])?;
        let count = u64::from_le_bytes(count_bytes);
        let mut points = Vec::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            let compressed_offset = read_u64(reader)?;
            let decompressed_offset = read_u64(reader)?;
            points.push(AccessPoint {
                compressed_offset,
                decompressed_offset,
                window: Vec::new(),
            });
        }
        Ok(points)
    }

    fn read_windowed<R: Read>(reader: &mut R) -> Result<Vec<AccessPoint>> {
        let count = read_u64(reader)?;
        let mut points = Vec::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            let compressed_offset = read_u64(reader)?;
            let decompressed_offset = read_u64(reader)?;
            let mut bits = [0u8; 1];
            reader.read_exact(&mut bits)?;
            if bits[0] != 0 {
                return Err(FfdbError::UnsupportedCodec(
                    "side index has a mid-byte access point".into(),
                ));
            }
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let window_len = u32::from_le_bytes(len_bytes) as usize;
            let mut window = vec![0u8; window_len];
            reader.read_exact(&mut window)?;
            points.push(AccessPoint {
                compressed_offset,
                decompressed_offset,
                window,
            });
        }
        Ok(points)
    }

    /// Number of access points, origin included.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Last access point at or before the given decompressed offset.
    /// Returns the point id and the point itself.
    pub fn locate(&self, decompressed_offset: u64) -> (usize, &AccessPoint) {
        let id = self
            .points
            .partition_point(|p| p.decompressed_offset <= decompressed_offset)
            .saturating_sub(1);
        (id, &self.points[id])
    }

    /// Compressed offset where reading may stop for a range ending at the
    /// given decompressed offset: the next access point past it, or the
    /// compressed file size when the range runs into the last segment.
    pub fn compressed_end(&self, decompressed_end: u64, compressed_size: u64) -> u64 {
        match self
            .points
            .iter()
            .find(|p| p.decompressed_offset >= decompressed_end)
        {
            Some(point) => point.compressed_offset,
            None => compressed_size,
        }
    }

    pub fn point(&self, id: usize) -> &AccessPoint {
        &self.points[id]
    }
}

/// Write a pair-table side index (the bgzip encoding) for points that all
/// sit on gzip member boundaries. The origin point is implicit and skipped.
pub fn write_pairs(path: &Path, points: &[(u64, u64)]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let explicit: Vec<_> = points.iter().filter(|(c, d)| *c != 0 || *d != 0).collect();
    writer.write_all(&(explicit.len() as u64).to_le_bytes())?;
    for (compressed, decompressed) in explicit {
        writer.write_all(&compressed.to_le_bytes())?;
        writer.write_all(&decompressed.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}
