//! Merge and remove flows verified through extraction: whatever survives a
//! maintenance operation must decode to the same bytes as before it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ffdb::merge::{merge, MergeOptions};
use ffdb::remove::{remove, RemoveOptions};
use ffdb::source::LocalSource;
use ffdb::{
    CodecContext, DuplicatesPolicy, EntryPatterns, ExtractOptions, Extractor, IndexHeader,
    IndexStore, Indexer, IndexerOptions,
};
use tempfile::TempDir;

fn build_pair(dir: &Path, stem: &str, entries: &[&str], base_offset: u64) -> (PathBuf, PathBuf) {
    let flatfile = dir.join(format!("{stem}.dat"));
    let index = dir.join(format!("{stem}.pos"));
    let mut data = Vec::new();
    for entry in entries {
        data.extend_from_slice(format!("{entry}\npayload of {entry}\n-\n").as_bytes());
    }
    fs::write(&flatfile, &data).unwrap();
    let indexer = Indexer::new(
        EntryPatterns::compile(&["^(\\w+)$".to_string()], &[]).unwrap(),
        IndexHeader::default(),
        CodecContext::plain(),
        IndexerOptions {
            base_offset,
            ..Default::default()
        },
    )
    .unwrap();
    let mut out = Vec::new();
    indexer.index(&flatfile, None, &mut out).unwrap();
    fs::write(&index, &out).unwrap();
    (flatfile, index)
}

fn extract_one(flatfile: &Path, index: &Path, id: &str) -> Vec<u8> {
    let store = Arc::new(IndexStore::load(index).unwrap());
    let source = Arc::new(LocalSource::open(flatfile).unwrap());
    let extractor = Extractor::new(store, source, CodecContext::plain());
    let mut out = Vec::new();
    extractor
        .extract(&[id.to_string()], &ExtractOptions::default(), &mut out)
        .unwrap();
    out
}

#[test]
fn merged_pair_serves_entries_from_both_sides() {
    let dir = TempDir::new().unwrap();
    let (base_ff, base_idx) = build_pair(dir.path(), "base", &["apple", "cherry"], 0);
    let (new_ff, new_idx) = build_pair(dir.path(), "incoming", &["banana", "date"], 0);

    let before_apple = extract_one(&base_ff, &base_idx, "apple");
    let before_banana = extract_one(&new_ff, &new_idx, "banana");

    let pair = merge(
        &base_ff,
        &base_idx,
        &new_ff,
        &new_idx,
        &MergeOptions {
            create: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(extract_one(&pair.flatfile, &pair.index, "apple"), before_apple);
    assert_eq!(extract_one(&pair.flatfile, &pair.index, "banana"), before_banana);
    assert_eq!(
        fs::metadata(&pair.flatfile).unwrap().len(),
        fs::metadata(&base_ff).unwrap().len() + fs::metadata(&new_ff).unwrap().len()
    );
}

#[test]
fn merge_respects_preindexed_offset_of_appended_side() {
    // The appended index can also be produced directly with a base offset
    // equal to the base flatfile's size; merging with shift zero would
    // double-count, so the merger always derives the shift itself from the
    // current base length.
    let dir = TempDir::new().unwrap();
    let (base_ff, base_idx) = build_pair(dir.path(), "base", &["aaa", "bbb"], 0);
    let (new_ff, new_idx) = build_pair(dir.path(), "incoming", &["ccc"], 0);

    let pair = merge(
        &base_ff,
        &base_idx,
        &new_ff,
        &new_idx,
        &MergeOptions {
            create: true,
            ..Default::default()
        },
    )
    .unwrap();
    let merged = fs::read_to_string(&pair.index).unwrap();
    let ccc_line = merged.lines().find(|l| l.starts_with("ccc\t")).unwrap();
    let offset: u64 = ccc_line.split('\t').nth(1).unwrap().parse().unwrap();
    assert_eq!(offset, fs::metadata(&base_ff).unwrap().len());
}

#[test]
fn removed_pair_drops_deleted_and_preserves_the_rest() {
    let dir = TempDir::new().unwrap();
    let (ff, idx) = build_pair(dir.path(), "db", &["apple", "banana", "cherry", "date"], 0);
    let before_apple = extract_one(&ff, &idx, "apple");
    let before_date = extract_one(&ff, &idx, "date");

    let (pair, outcome) = remove(
        &ff,
        &idx,
        &["banana".to_string(), "cherry".to_string()],
        &RemoveOptions::default(),
    )
    .unwrap();

    assert_eq!(outcome.removed_entries, 2);
    assert_eq!(extract_one(&pair.flatfile, &pair.index, "apple"), before_apple);
    assert_eq!(extract_one(&pair.flatfile, &pair.index, "date"), before_date);
    assert!(extract_one(&pair.flatfile, &pair.index, "banana").is_empty());
    // the new pair satisfies the index invariants by construction
    IndexStore::load(&pair.index).unwrap();
}

#[test]
fn remove_after_merge_shifts_survivors() {
    // S5 then S6: merge a pair, delete an entry from the base side, and
    // check the appended entry shifts down by the deleted length.
    let dir = TempDir::new().unwrap();
    let (base_ff, base_idx) = build_pair(dir.path(), "base", &["xxx"], 0);
    let (new_ff, new_idx) = build_pair(dir.path(), "incoming", &["yyy"], 0);
    let base_len = fs::metadata(&base_ff).unwrap().len();
    let before_yyy = extract_one(&new_ff, &new_idx, "yyy");

    let merged = merge(
        &base_ff,
        &base_idx,
        &new_ff,
        &new_idx,
        &MergeOptions {
            create: true,
            ..Default::default()
        },
    )
    .unwrap();

    let (pair, _) = remove(
        &merged.flatfile,
        &merged.index,
        &["xxx".to_string()],
        &RemoveOptions::default(),
    )
    .unwrap();

    let index_text = fs::read_to_string(&pair.index).unwrap();
    assert_eq!(index_text.lines().count(), 1);
    let offset: u64 = index_text
        .lines()
        .next()
        .unwrap()
        .split('\t')
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(offset, 0); // xxx filled [0, base_len); yyy slid down to 0
    assert_eq!(
        fs::metadata(&pair.flatfile).unwrap().len(),
        fs::metadata(&merged.flatfile).unwrap().len() - base_len
    );
    assert_eq!(extract_one(&pair.flatfile, &pair.index, "yyy"), before_yyy);
}

#[test]
fn remove_with_duplicates_policy_all() {
    let dir = TempDir::new().unwrap();
    let ff = dir.path().join("dup.dat");
    let idx = dir.path().join("dup.pos");
    let mut data = Vec::new();
    for body in ["one", "two", "three"] {
        data.extend_from_slice(format!("9606\n{body}\n-\n").as_bytes());
    }
    data.extend_from_slice(b"keepme\nlast\n-\n");
    fs::write(&ff, &data).unwrap();
    let indexer = Indexer::new(
        EntryPatterns::compile(&["^(9606|keepme)$".to_string()], &[]).unwrap(),
        IndexHeader::default(),
        CodecContext::plain(),
        IndexerOptions::default(),
    )
    .unwrap();
    let mut out = Vec::new();
    indexer.index(&ff, None, &mut out).unwrap();
    fs::write(&idx, &out).unwrap();

    let (pair, outcome) = remove(
        &ff,
        &idx,
        &["9606".to_string()],
        &RemoveOptions {
            policy: DuplicatesPolicy::All,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(outcome.removed_entries, 3);
    assert_eq!(fs::read(&pair.flatfile).unwrap(), b"keepme\nlast\n-\n");
    assert_eq!(
        fs::read_to_string(&pair.index).unwrap(),
        "keepme\t0\t14\n"
    );
}
