//! Chunk payload generators and test configuration

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::StreamWriter;
use cloudfetch::{CloudFetchConfig, RetryConfig, RowBatch};

/// Base URL every fake chunk link lives under
pub const STORAGE_BASE: &str = "https://storage.test/results";

/// Arrow IPC stream for one chunk
///
/// Columns: `chunk` (the chunk index on every row), `row` (0-based row number) and
/// `payload` (padding so chunks have a realistic size).
pub fn arrow_chunk(index: u64, rows: usize) -> Vec<u8> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("chunk", DataType::Int64, false),
        Field::new("row", DataType::Int64, false),
        Field::new("payload", DataType::Utf8, false),
    ]));

    let chunk_ids = Int64Array::from(vec![index as i64; rows]);
    let row_ids = Int64Array::from((0..rows as i64).collect::<Vec<_>>());
    let payload = StringArray::from(
        (0..rows)
            .map(|r| format!("chunk-{index:06}-row-{r:08}-padding"))
            .collect::<Vec<_>>(),
    );

    let batch = RowBatch::try_new(
        schema.clone(),
        vec![Arc::new(chunk_ids), Arc::new(row_ids), Arc::new(payload)],
    )
    .expect("valid batch");

    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, &schema).expect("IPC writer");
        writer.write(&batch).expect("write batch");
        writer.finish().expect("finish stream");
    }
    buffer
}

/// Wrap `data` in an LZ4 frame
pub fn lz4(data: &[u8]) -> Vec<u8> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(data).expect("lz4 write");
    encoder.finish().expect("lz4 finish")
}

/// Link for chunk `index`
pub fn chunk_url(index: u64) -> String {
    format!("{STORAGE_BASE}/{index}")
}

/// Fast configuration: millisecond backoffs, no jitter, short drain
pub fn test_config() -> CloudFetchConfig {
    CloudFetchConfig {
        max_parallel_downloads: 3,
        prefetch_window: 2,
        memory_limit_bytes: 64 * 1024 * 1024,
        max_retries: 3,
        retry_backoff_base: Duration::from_millis(5),
        retry_backoff_max: Duration::from_millis(50),
        retry_jitter: false,
        expired_link_max_refetches: 3,
        link_expiry_buffer: Duration::from_secs(60),
        metadata_lookahead: 4,
        metadata_retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        request_timeout: Duration::from_secs(5),
        lz4_expansion_ratio: 2.0,
        drain_timeout: Duration::from_secs(2),
    }
}
