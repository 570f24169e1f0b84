//! Reading helpers and custom assertions for pipeline tests

use std::time::Duration;

use arrow::array::Int64Array;
use cloudfetch::{Error, PipelineEvent, Reader, RowBatch};
use tokio::sync::broadcast;

/// Everything a reader produced before it stopped
#[derive(Debug)]
pub struct ReadOutcome {
    /// Chunk index of every batch, in the order received
    pub chunks: Vec<u64>,
    pub rows: usize,
    /// Terminal error, or `None` when the stream ended cleanly
    pub error: Option<Error>,
}

/// Chunk index stamped into a batch by [`super::arrow_chunk`]
pub fn chunk_of(batch: &RowBatch) -> u64 {
    let column = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("chunk column is Int64");
    column.value(0) as u64
}

/// Drain a reader until end of stream or its first error
pub async fn read_all(reader: &mut Reader, timeout: Duration) -> ReadOutcome {
    let mut outcome = ReadOutcome {
        chunks: Vec::new(),
        rows: 0,
        error: None,
    };

    let drained = tokio::time::timeout(timeout, async {
        loop {
            match reader.next().await {
                Ok(Some(batch)) => {
                    outcome.chunks.push(chunk_of(&batch));
                    outcome.rows += batch.num_rows();
                }
                Ok(None) => break,
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }
    })
    .await;

    assert!(drained.is_ok(), "reader did not finish within {timeout:?}");
    outcome
}

/// Assert batches arrived for chunks `0..count`, in order
pub fn assert_in_order(chunks: &[u64], count: u64) {
    let expected: Vec<u64> = (0..count).collect();
    assert_eq!(chunks, expected.as_slice(), "chunks out of order or missing");
}

/// Everything currently buffered on an event subscription
pub fn drain_events(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut collected = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => collected.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    collected
}

/// Wait until every memory lease is back in the pool
pub async fn wait_for_released(reader: &Reader, timeout: Duration) {
    let memory = reader.memory().clone();
    let released = tokio::time::timeout(timeout, async {
        while memory.leased_bytes() > 0 || memory.outstanding_leases() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        released.is_ok(),
        "leases still outstanding: {} bytes in {} leases",
        memory.leased_bytes(),
        memory.outstanding_leases()
    );
}
