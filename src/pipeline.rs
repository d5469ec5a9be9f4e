//! The record pipeline: turns decompressed archive lines into
//! size-bounded, schema-normalized batches ready for ingestion.

use anyhow::{Context, Result};
use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io::BufRead;
use tracing::warn;

/// Numeric timestamps at or above this value are read as epoch
/// milliseconds; smaller ones as epoch seconds.
const MILLISECOND_THRESHOLD: i64 = 100_000_000_000;

/// The filter and recoding tables applied to every record. Kept as
/// explicit lookup tables so the rules can be inspected and tested
/// apart from the pipeline.
#[derive(Debug, Clone)]
pub struct RecordRules {
    /// Fields removed from every record.
    pub drop_fields: BTreeSet<String>,

    /// Exact-match replacements for string field values. Unmatched
    /// values pass through unchanged.
    pub value_labels: BTreeMap<String, String>,

    /// Field names recognized as the record timestamp, probed in
    /// order.
    pub timestamp_fields: Vec<String>,
}

impl RecordRules {
    /// Build the rule tables from the configured drop list. The value
    /// dictionary recodes numeric severity codes to their syslog
    /// labels.
    pub fn new(drop_fields: impl IntoIterator<Item = String>) -> Self {
        let value_labels = [
            ("0", "emergency"),
            ("1", "alert"),
            ("2", "critical"),
            ("3", "error"),
            ("4", "warning"),
            ("5", "notice"),
            ("6", "informational"),
            ("7", "debug"),
        ]
        .into_iter()
        .map(|(code, label)| (String::from(code), String::from(label)))
        .collect();
        RecordRules {
            drop_fields: drop_fields.into_iter().collect(),
            value_labels,
            timestamp_fields: vec![
                String::from("timestamp"),
                String::from("@timestamp"),
                String::from("time"),
                String::from("ts"),
            ],
        }
    }
}

/// One transformed record staged for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The record timestamp in epoch milliseconds.
    pub timestamp: i64,

    /// The transformed record, serialized as a single JSON line.
    pub line: String,
}

/// What became of one sealed batch after it was handed off.
#[derive(Debug, Clone, Copy)]
pub struct BatchDisposition {
    /// Whether the batch reached the primary endpoint.
    pub accepted: bool,

    /// Serialized bytes submitted for ingestion.
    pub bytes: u64,
}

/// Aggregate counters for one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineResult {
    /// Records parsed from the archive.
    pub records_read: u64,

    /// Decompressed bytes consumed from the archive.
    pub bytes_read: u64,

    /// Lines that were not a JSON object, skipped and counted.
    pub parse_failures: u64,

    /// Batches sealed by the batcher.
    pub batches_built: u64,

    /// Batches accepted by the primary endpoint.
    pub batches_forwarded: u64,

    /// Batches the primary endpoint did not accept.
    pub batches_failed: u64,

    /// Records contained in accepted batches.
    pub ingested_records: u64,

    /// Serialized bytes submitted for ingestion.
    pub ingest_bytes: u64,
}

/// Parse one archive line as a record. Anything that is not a JSON
/// object is rejected.
pub fn parse_record(line: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str(line) {
        Ok(Value::Object(record)) => Some(record),
        _ => None,
    }
}

/// Apply the rules to one parsed record: remove the drop-listed
/// fields, normalize the first recognized timestamp field to epoch
/// milliseconds, and recode string values through the dictionary.
/// Returns the transformed record and its timestamp; records without a
/// recognizable timestamp are assigned `fallback_timestamp`.
pub fn transform(
    rules: &RecordRules,
    fallback_timestamp: i64,
    mut record: Map<String, Value>,
) -> (Map<String, Value>, i64) {
    record.retain(|field, _| !rules.drop_fields.contains(field));
    let timestamp = normalize_timestamp(rules, &mut record, fallback_timestamp);
    for value in record.values_mut() {
        if let Value::String(text) = value {
            if let Some(label) = rules.value_labels.get(text.as_str()) {
                *value = Value::String(label.clone());
            }
        }
    }
    (record, timestamp)
}

/// Rewrite the first recognized timestamp field in place as epoch
/// milliseconds, and return that value.
fn normalize_timestamp(
    rules: &RecordRules,
    record: &mut Map<String, Value>,
    fallback_timestamp: i64,
) -> i64 {
    for field in &rules.timestamp_fields {
        if let Some(value) = record.get_mut(field) {
            if let Some(millis) = parse_timestamp(value) {
                *value = Value::from(millis);
                return millis;
            }
        }
    }
    fallback_timestamp
}

/// Read a timestamp value as epoch milliseconds. Accepts epoch
/// numbers (seconds or milliseconds), RFC 3339 strings, and numeric
/// strings.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Some(millis_from_epoch(integer))
            } else {
                number.as_f64().map(|seconds| {
                    if seconds >= MILLISECOND_THRESHOLD as f64 {
                        seconds as i64
                    } else {
                        (seconds * 1000.0) as i64
                    }
                })
            }
        }
        Value::String(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                Some(parsed.timestamp_millis())
            } else {
                text.parse::<i64>().ok().map(millis_from_epoch)
            }
        }
        _ => None,
    }
}

/// Interpret an epoch number as seconds or milliseconds.
fn millis_from_epoch(value: i64) -> i64 {
    if value.abs() >= MILLISECOND_THRESHOLD {
        value
    } else {
        value.saturating_mul(1000)
    }
}

/// Accumulates transformed records in source order and seals the
/// current batch whenever appending the next record would exceed the
/// record limit.
#[derive(Debug)]
pub struct Batcher {
    limit: usize,
    current: Vec<Entry>,
}

impl Batcher {
    /// Create a batcher sealing batches of at most `limit` records.
    pub fn new(limit: usize) -> Self {
        Batcher {
            limit: limit.max(1),
            current: Vec::new(),
        }
    }

    /// Stage the next record. Returns the sealed batch when the
    /// current one is full, with the staged record starting the next
    /// batch.
    pub fn push(&mut self, entry: Entry) -> Option<Vec<Entry>> {
        let sealed = if self.current.len() >= self.limit {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        };
        self.current.push(entry);
        sealed
    }

    /// Seal whatever remains once the input is exhausted.
    pub fn finish(self) -> Option<Vec<Entry>> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.current)
        }
    }
}

/// Drive the pipeline over a decompressed line stream, handing each
/// sealed batch to `emit` in source order. `emit` receives the batch
/// index and reports whether the batch was accepted; a rejected batch
/// is counted and does not stop the run.
pub async fn run<F, Fut>(
    reader: impl BufRead,
    rules: &RecordRules,
    fallback_timestamp: i64,
    max_batch_records: usize,
    mut emit: F,
) -> Result<PipelineResult>
where
    F: FnMut(u64, Vec<Entry>) -> Fut,
    Fut: Future<Output = Result<BatchDisposition>>,
{
    let mut result = PipelineResult::default();
    let mut batcher = Batcher::new(max_batch_records);
    for line in reader.lines() {
        let line = line.context("Failed to read a line from the decompressed archive")?;
        result.bytes_read += line.len() as u64 + 1;
        // Blank lines are not records
        if line.trim().is_empty() {
            continue;
        }
        let record = match parse_record(&line) {
            Some(record) => record,
            None => {
                result.parse_failures += 1;
                warn!("Skipping a line that is not a JSON object record");
                continue;
            }
        };
        result.records_read += 1;
        let (record, timestamp) = transform(rules, fallback_timestamp, record);
        let line = serde_json::to_string(&record)
            .context("Failed to serialize a transformed record")?;
        if let Some(batch) = batcher.push(Entry { timestamp, line }) {
            dispatch(&mut result, &mut emit, batch).await?;
        }
    }
    if let Some(batch) = batcher.finish() {
        dispatch(&mut result, &mut emit, batch).await?;
    }
    Ok(result)
}

/// Hand one sealed batch to the emitter and record its disposition.
async fn dispatch<F, Fut>(
    result: &mut PipelineResult,
    emit: &mut F,
    batch: Vec<Entry>,
) -> Result<()>
where
    F: FnMut(u64, Vec<Entry>) -> Fut,
    Fut: Future<Output = Result<BatchDisposition>>,
{
    let index = result.batches_built;
    result.batches_built += 1;
    let records = batch.len() as u64;
    let disposition = emit(index, batch).await?;
    result.ingest_bytes += disposition.bytes;
    if disposition.accepted {
        result.batches_forwarded += 1;
        result.ingested_records += records;
    } else {
        result.batches_failed += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> RecordRules {
        RecordRules::new(vec![String::from("checksum"), String::from("tenant_id")])
    }

    fn record(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(record) => record,
            _ => panic!("fixture must be a JSON object"),
        }
    }

    fn entry(index: usize) -> Entry {
        Entry {
            timestamp: index as i64,
            line: format!("{{\"n\":{}}}", index),
        }
    }

    /// Collect every sealed batch for the given record count and
    /// limit.
    fn batches(records: usize, limit: usize) -> Vec<Vec<Entry>> {
        let mut batcher = Batcher::new(limit);
        let mut sealed = Vec::new();
        for index in 0..records {
            if let Some(batch) = batcher.push(entry(index)) {
                sealed.push(batch);
            }
        }
        if let Some(batch) = batcher.finish() {
            sealed.push(batch);
        }
        sealed
    }

    #[test]
    fn batch_count_is_the_ceiling_of_records_over_limit() {
        for (records, limit, expected) in
            [(0, 4000, 0), (1, 4000, 1), (10, 3, 4), (6, 3, 2), (4001, 4000, 2)]
        {
            assert_eq!(batches(records, limit).len(), expected);
        }
    }

    #[test]
    fn batches_are_full_except_the_last_and_preserve_order() {
        let sealed = batches(10, 3);
        assert_eq!(
            sealed.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 3, 3, 1]
        );
        let concatenated: Vec<i64> = sealed
            .into_iter()
            .flatten()
            .map(|entry| entry.timestamp)
            .collect();
        assert_eq!(concatenated, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn a_single_record_yields_a_single_batch_at_any_limit() {
        assert_eq!(batches(1, 1).len(), 1);
        assert_eq!(batches(1, 1)[0].len(), 1);
    }

    #[test]
    fn dropped_fields_never_reach_the_output() {
        let (transformed, _) = transform(
            &rules(),
            0,
            record(json!({"message": "ok", "checksum": "abc", "tenant_id": "t-1"})),
        );
        assert_eq!(transformed.len(), 1);
        assert!(transformed.contains_key("message"));
    }

    #[test]
    fn dictionary_recoding_is_exact_match_only() {
        let (transformed, _) = transform(
            &rules(),
            0,
            record(json!({"level": "3", "status": "30", "note": "3 retries", "count": 3})),
        );
        assert_eq!(transformed["level"], json!("error"));
        assert_eq!(transformed["status"], json!("30"));
        assert_eq!(transformed["note"], json!("3 retries"));
        assert_eq!(transformed["count"], json!(3));
    }

    #[test]
    fn timestamps_are_normalized_to_epoch_milliseconds() {
        let (transformed, millis) = transform(
            &rules(),
            0,
            record(json!({"timestamp": "2024-05-01T00:00:00Z", "message": "ok"})),
        );
        assert_eq!(millis, 1_714_521_600_000);
        assert_eq!(transformed["timestamp"], json!(1_714_521_600_000_i64));

        let (_, seconds) = transform(&rules(), 0, record(json!({"time": 1_714_521_600})));
        assert_eq!(seconds, 1_714_521_600_000);

        let (_, already_millis) =
            transform(&rules(), 0, record(json!({"ts": 1_714_521_600_000_i64})));
        assert_eq!(already_millis, 1_714_521_600_000);
    }

    #[test]
    fn records_without_a_timestamp_get_the_fallback() {
        let (_, millis) = transform(&rules(), 42, record(json!({"message": "ok"})));
        assert_eq!(millis, 42);
    }

    #[tokio::test]
    async fn a_malformed_line_is_counted_and_skipped() {
        let input = b"{\"n\":1}\nnot json\n{\"n\":2}\n{\"n\":3}\n" as &[u8];
        let mut sealed = Vec::new();
        let result = run(input, &rules(), 0, 2, |_, batch| {
            sealed.push(batch.len());
            async { Ok(BatchDisposition { accepted: true, bytes: 0 }) }
        })
        .await
        .unwrap();
        assert_eq!(result.parse_failures, 1);
        assert_eq!(result.records_read, 3);
        assert_eq!(result.ingested_records, 3);
        assert_eq!(sealed, vec![2, 1]);
    }

    #[tokio::test]
    async fn empty_input_yields_no_batches() {
        let mut emitted = 0;
        let result = run(b"" as &[u8], &rules(), 0, 4000, |_, _| {
            emitted += 1;
            async { Ok(BatchDisposition { accepted: true, bytes: 0 }) }
        })
        .await
        .unwrap();
        assert_eq!(emitted, 0);
        assert_eq!(result.batches_built, 0);
        assert_eq!(result.records_read, 0);
        assert_eq!(result.ingested_records, 0);
    }

    #[tokio::test]
    async fn rejected_batches_are_counted_and_do_not_stop_the_run() {
        let input = b"{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n" as &[u8];
        let result = run(input, &rules(), 0, 1, |index, _| async move {
            Ok(BatchDisposition {
                accepted: index != 1,
                bytes: 10,
            })
        })
        .await
        .unwrap();
        assert_eq!(result.batches_built, 3);
        assert_eq!(result.batches_forwarded, 2);
        assert_eq!(result.batches_failed, 1);
        assert_eq!(result.ingested_records, 2);
        assert_eq!(result.ingest_bytes, 30);
    }

    #[tokio::test]
    async fn the_pipeline_is_a_pure_function_of_input_and_rules() {
        let input = b"{\"time\": 1714521600, \"level\": \"3\"}\n{\"message\": \"ok\"}\n";
        let mut first = Vec::new();
        run(&input[..], &rules(), 7, 1, |_, batch| {
            first.push(batch);
            async { Ok(BatchDisposition { accepted: true, bytes: 0 }) }
        })
        .await
        .unwrap();
        let mut second = Vec::new();
        run(&input[..], &rules(), 7, 1, |_, batch| {
            second.push(batch);
            async { Ok(BatchDisposition { accepted: true, bytes: 0 }) }
        })
        .await
        .unwrap();
        assert_eq!(first, second);
    }
}
