//! Extraction from whole-file gzip flatfiles through the `.gzi` side
//! index, using the compressed pair the merger produces.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ffdb::merge::gzip_with_index;
use ffdb::source::{open_source, ByteSource, SourceSpec};
use ffdb::{
    CodecContext, EntryPatterns, ExtractOptions, Extractor, IndexHeader, IndexStore, Indexer,
    IndexerOptions,
};
use tempfile::TempDir;

fn build_flatfile(dir: &Path, entries: usize) -> (PathBuf, Vec<u8>) {
    let path = dir.join("db.dat");
    let mut data = Vec::new();
    for i in 0..entries {
        // make entries chunky so the file spans several gzip members
        data.extend_from_slice(
            format!("rec{i:05}\n{}\n-\n", "x".repeat(4000 + (i % 7) * 100)).as_bytes(),
        );
    }
    fs::write(&path, &data).unwrap();
    (path, data)
}

fn build_index(flatfile: &Path) -> String {
    let indexer = Indexer::new(
        EntryPatterns::compile(&["^(rec\\d+)$".to_string()], &[]).unwrap(),
        IndexHeader::default(),
        CodecContext::plain(),
        IndexerOptions::default(),
    )
    .unwrap();
    let mut out = Vec::new();
    indexer.index(flatfile, None, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn gzip_source_matches_plain_reads() {
    let dir = TempDir::new().unwrap();
    let (flatfile, data) = build_flatfile(dir.path(), 1200);
    let (gz, gzi) = gzip_with_index(&flatfile).unwrap();

    let source = open_source(&SourceSpec {
        location: gz.display().to_string(),
        gzi: Some(gzi),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(source.size(), data.len() as u64);

    // reads inside one segment, across segments, and at the tail
    for (offset, length) in [
        (0u64, 100u64),
        (1_048_000, 2_000),
        (data.len() as u64 - 500, 500),
    ] {
        assert_eq!(
            source.read_at(offset, length).unwrap(),
            &data[offset as usize..(offset + length) as usize],
            "offset={offset} length={length}"
        );
    }
}

#[test]
fn extraction_from_gzip_equals_extraction_from_plain() {
    let dir = TempDir::new().unwrap();
    let (flatfile, _) = build_flatfile(dir.path(), 800);
    let index_text = build_index(&flatfile);
    let index_path = dir.path().join("db.pos");
    fs::write(&index_path, &index_text).unwrap();
    let (gz, gzi) = gzip_with_index(&flatfile).unwrap();

    let ids: Vec<String> = [0usize, 411, 790, 5, 300]
        .iter()
        .map(|i| format!("rec{i:05}"))
        .collect();

    let run = |spec: SourceSpec| {
        let store = Arc::new(IndexStore::load(&index_path).unwrap());
        let source = open_source(&spec).unwrap();
        let extractor = Extractor::new(store, source, CodecContext::plain());
        let mut out = Vec::new();
        extractor
            .extract(
                &ids,
                &ExtractOptions {
                    merged: true,
                    ..Default::default()
                },
                &mut out,
            )
            .unwrap();
        out
    };

    let plain = run(SourceSpec::local(flatfile.display().to_string()));
    let gzipped = run(SourceSpec {
        location: gz.display().to_string(),
        gzi: Some(gzi),
        ..Default::default()
    });
    assert_eq!(plain, gzipped);
}
