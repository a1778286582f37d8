//! The JSONL reader survives the damage real cassette files accumulate:
//! BOMs, CRLF endings, blank lines, truncated tails, and corrupt entries.

use std::collections::HashMap;

use reqord::{
    CassetteEntry, JsonlStorage, RecordedRequest, RecordedResponse, StorageBackend,
};

fn entry(url: &str, recorded_at: u64) -> CassetteEntry {
    let req = RecordedRequest::new("GET", url, HashMap::new(), b"").unwrap();
    let (resp, _) = RecordedResponse::new(
        200,
        HashMap::new(),
        b"ok".to_vec(),
        Some("text/plain"),
        64 * 1024,
        recorded_at,
    )
    .unwrap();
    CassetteEntry::new(req, resp, recorded_at).unwrap()
}

fn encode(entry: &CassetteEntry) -> String {
    serde_json::to_string(entry).unwrap()
}

#[tokio::test]
async fn reader_skips_damage_and_keeps_good_lines_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("damaged.jsonl");

    let good_one = entry("https://api/one", 1_000);
    let good_two = entry("https://api/two", 2_000);
    let good_three = entry("https://api/three", 3_000);

    let mut zero_ts = encode(&entry("https://api/zero", 1)).replace("\"recorded_at\":1}", "\"recorded_at\":0}");
    zero_ts.push('\n');

    let mut content = String::new();
    content.push('\u{feff}');
    content.push_str(&encode(&good_one));
    content.push('\n');
    content.push('\n');
    content.push_str(&encode(&good_two));
    content.push_str("\r\n");
    content.push_str("this is not json\n");
    content.push_str(&zero_ts);
    content.push_str("{\"req\": {\"method\": \"GET\"}}\n");
    content.push_str(&encode(&good_three));
    content.push('\n');
    // Truncated tail: a write that died mid-line.
    content.push_str("{\"req\": {\"method\": \"GET\", \"url\": \"https://api/tr");

    std::fs::write(&path, content).unwrap();

    let storage = JsonlStorage::new();
    let entries = storage.read_entries(&path).await.unwrap();

    let urls: Vec<&str> = entries.iter().map(|e| e.req.url.as_str()).collect();
    assert_eq!(urls, vec!["https://api/one", "https://api/two", "https://api/three"]);
}

#[tokio::test]
async fn duplicate_fingerprint_and_timestamp_pairs_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("duplicates.jsonl");

    let first = entry("https://api/x", 1_000);
    let same_again = entry("https://api/x", 1_000);
    let later = entry("https://api/x", 2_000);

    let content = format!(
        "{}\n{}\n{}\n",
        encode(&first),
        encode(&same_again),
        encode(&later)
    );
    std::fs::write(&path, content).unwrap();

    let storage = JsonlStorage::new();
    let entries = storage.read_entries(&path).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].recorded_at, 1_000);
    assert_eq!(entries[1].recorded_at, 2_000);
}

#[tokio::test]
async fn missing_cassette_reads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let storage = JsonlStorage::new();
    let entries = storage
        .read_entries(&dir.path().join("nope.jsonl"))
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn append_creates_parent_directories_and_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deep/nested/cassette.jsonl");
    let storage = JsonlStorage::new();

    assert!(!storage.exists(&path).await);
    storage.write_entry(&path, &entry("https://api/x", 1)).await.unwrap();
    assert!(storage.exists(&path).await);

    let entries = storage.read_entries(&path).await.unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gone.jsonl");
    let storage = JsonlStorage::new();

    storage.write_entry(&path, &entry("https://api/x", 1)).await.unwrap();
    storage.delete_cassette(&path).await.unwrap();
    assert!(!storage.exists(&path).await);
    storage.delete_cassette(&path).await.unwrap();
}

#[tokio::test]
async fn written_entries_round_trip_through_the_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.jsonl");
    let storage = JsonlStorage::new();

    let original = entry("https://api/x?q=1", 42_000);
    storage.write_entry(&path, &original).await.unwrap();

    let entries = storage.read_entries(&path).await.unwrap();
    assert_eq!(entries, vec![original]);
}
