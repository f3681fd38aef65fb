//! Planning of byte-source reads for a set of entry records.
//!
//! Per-entry planning issues one read per record. Merged retrieval sorts
//! records by offset and coalesces adjacent or near-adjacent ranges into a
//! single read, which is then sliced back into entries; this trades memory
//! for fewer round trips and matters most over HTTP.

use crate::index::IndexRecord;

/// Coalesce two ranges when the gap between them is at most this many bytes.
pub const DEFAULT_MAX_GAP: u64 = 4 * 1024;

/// Never grow a coalesced read beyond this many bytes.
pub const DEFAULT_MAX_READ: u64 = 4 * 1024 * 1024;

/// One entry to fetch. `seq` is the caller's request position and drives
/// output ordering; duplicates of one identifier get consecutive `seq`
/// values in flatfile order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryRequest {
    pub seq: usize,
    pub identifier: String,
    pub record: IndexRecord,
}

/// One read to issue against the byte source, carrying the entries whose
/// ranges it covers.
#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub offset: u64,
    pub length: u64,
    pub entries: Vec<EntryRequest>,
}

impl ReadRequest {
    fn single(entry: EntryRequest) -> Self {
        Self {
            offset: entry.record.offset,
            length: entry.record.length,
            entries: vec![entry],
        }
    }

    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Planner configuration.
#[derive(Clone, Copy, Debug)]
pub struct PlanOptions {
    /// Merge adjacent ranges into single reads
    pub merged: bool,
    pub max_gap: u64,
    pub max_read: u64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            merged: false,
            max_gap: DEFAULT_MAX_GAP,
            max_read: DEFAULT_MAX_READ,
        }
    }
}

impl PlanOptions {
    pub fn merged() -> Self {
        Self {
            merged: true,
            ..Default::default()
        }
    }
}

/// Turn entry requests into read requests.
///
/// Without merging, one read per entry in the given order. With merging,
/// entries are sorted by `(offset, length, seq)` and coalesced while the
/// inter-range gap stays within `max_gap` and the read within `max_read`.
pub fn plan_reads(mut entries: Vec<EntryRequest>, options: &PlanOptions) -> Vec<ReadRequest> {
    if !options.merged {
        return entries.into_iter().map(ReadRequest::single).collect();
    }
    // Identical offsets are legal (append-of-new-version); order them by
    // length then by original request position.
    entries.sort_by(|a, b| {
        (a.record.offset, a.record.length, a.seq).cmp(&(b.record.offset, b.record.length, b.seq))
    });
    let mut plan: Vec<ReadRequest> = Vec::new();
    for entry in entries {
        match plan.last_mut() {
            Some(current)
                if entry.record.offset <= current.end() + options.max_gap
                    && entry.record.end().max(current.end()) - current.offset
                        <= options.max_read =>
            {
                current.length = entry.record.end().max(current.end()) - current.offset;
                current.entries.push(entry);
            }
            _ => plan.push(ReadRequest::single(entry)),
        }
    }
    plan
}

/// Partition items into blocks of at most `block_size`, preserving order.
/// `block_size == 0` yields a single block (blocking disabled).
pub fn partition_blocks<T>(items: Vec<T>, block_size: usize) -> Vec<Vec<T>> {
    if block_size == 0 || items.len() <= block_size {
        return if items.is_empty() {
            Vec::new()
        } else {
            vec![items]
        };
    }
    let mut blocks = Vec::with_capacity(items.len().div_ceil(block_size));
    let mut current = Vec::with_capacity(block_size);
    for item in items {
        current.push(item);
        if current.len() == block_size {
            blocks.push(std::mem::replace(&mut current, Vec::with_capacity(block_size)));
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Default block size for `n` items over `workers` workers: an even split,
/// at least one item per block.
pub fn default_block_size(items: usize, workers: usize) -> usize {
    items.div_ceil(workers.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(seq: usize, offset: u64, length: u64) -> EntryRequest {
        EntryRequest {
            seq,
            identifier: format!("id{seq}"),
            record: IndexRecord::new(offset, length),
        }
    }

    #[test]
    fn test_per_entry_plan_keeps_order() {
        let plan = plan_reads(
            vec![request(0, 500, 10), request(1, 0, 10)],
            &PlanOptions::default(),
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].offset, 500);
        assert_eq!(plan[1].offset, 0);
    }

    #[test]
    fn test_adjacent_ranges_coalesce_into_one_read() {
        // S4: offsets 1000/1050/1100 with lengths 40 coalesce to [1000,1140)
        let plan = plan_reads(
            vec![
                request(0, 1000, 40),
                request(1, 1050, 40),
                request(2, 1100, 40),
            ],
            &PlanOptions::merged(),
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].offset, 1000);
        assert_eq!(plan[0].length, 140);
        assert_eq!(plan[0].entries.len(), 3);
    }

    #[test]
    fn test_large_gap_splits_reads() {
        let options = PlanOptions::merged();
        let plan = plan_reads(
            vec![request(0, 0, 10), request(1, 10 + DEFAULT_MAX_GAP + 1, 10)],
            &options,
        );
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_max_read_bounds_coalescing() {
        let options = PlanOptions {
            merged: true,
            max_gap: 4096,
            max_read: 100,
        };
        let plan = plan_reads(
            vec![request(0, 0, 60), request(1, 60, 60)],
            &options,
        );
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_identical_offsets_order_by_length_then_seq() {
        let plan = plan_reads(
            vec![request(5, 100, 80), request(2, 100, 40)],
            &PlanOptions::merged(),
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].entries[0].seq, 2);
        assert_eq!(plan[0].entries[1].seq, 5);
        assert_eq!(plan[0].length, 80);
    }

    #[test]
    fn test_overlapping_duplicates_merge() {
        let plan = plan_reads(
            vec![request(0, 100, 40), request(1, 100, 40), request(2, 120, 40)],
            &PlanOptions::merged(),
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].offset, 100);
        assert_eq!(plan[0].length, 60);
    }

    #[test]
    fn test_partition_blocks() {
        let blocks = partition_blocks(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(blocks, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(partition_blocks(vec![1, 2, 3], 0), vec![vec![1, 2, 3]]);
        assert!(partition_blocks(Vec::<u8>::new(), 2).is_empty());
    }

    #[test]
    fn test_default_block_size() {
        assert_eq!(default_block_size(10, 4), 3);
        assert_eq!(default_block_size(0, 4), 1);
        assert_eq!(default_block_size(10, 0), 10);
    }
}
