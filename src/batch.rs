//! Batch builder (§4.B): accumulates encoded records into a length-bounded
//! batch and tracks the completion handle, sequence assignment, and retry
//! bookkeeping a `Batch` carries once handed to the sender.

use crate::error::ProducerError;
use crate::types::{CompressionType, RecordBatchMagic, RecordMetadata, TopicPartition};
use crate::wire::Compressor;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Instant;
use tokio::sync::oneshot;

/// Resolved by the sender when the containing batch terminates.
///
/// Distinct `Sender`/`Receiver` halves so dropping the user's awaited future
/// is a no-op on delivery: only the receiver is dropped, the sender side
/// held by the batch is unaffected and the batch still ships.
pub type CompletionHandle = oneshot::Receiver<Result<RecordMetadata, ProducerError>>;
type CompletionResolver = oneshot::Sender<Result<RecordMetadata, ProducerError>>;

/// One record queued inside a `Batch`, paired with the resolver for its
/// individual completion handle (several records can share one batch and
/// therefore one broker response, but each gets its own handle).
struct QueuedRecord {
    resolver: CompletionResolver,
}

/// Frozen identity assigned to a batch once it is handed to the sender.
///
/// Invariant: once set, never reassigned, even across re-enqueue.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequenceAssignment {
    pub base_sequence: i32,
    pub producer_id: i64,
    pub producer_epoch: i16,
}

/// An append-only container of encoded records bound to a single partition.
pub struct Batch {
    pub topic_partition: TopicPartition,
    pub magic: RecordBatchMagic,
    pub created_at: Instant,
    pub sequence: Option<SequenceAssignment>,
    pub retry_count: u32,
    pub drained: bool,
    record_count: usize,
    encoded: BytesMut,
    records: Vec<QueuedRecord>,
    max_bytes: usize,
}

impl Batch {
    pub fn new(topic_partition: TopicPartition, magic: RecordBatchMagic, max_bytes: usize) -> Self {
        Self {
            topic_partition,
            magic,
            created_at: Instant::now(),
            sequence: None,
            retry_count: 0,
            drained: false,
            record_count: 0,
            encoded: BytesMut::with_capacity(max_bytes.min(4096)),
            records: Vec::new(),
            max_bytes,
        }
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    fn estimated_record_size(key: Option<&[u8]>, value: Option<&[u8]>) -> usize {
        // Conservative varint/field overhead estimate per record, independent
        // of magic: callers that need the exact on-wire size can recompute
        // it at encode time; this estimate only needs to be an upper bound
        // for batch-fullness accounting.
        12 + key.map_or(0, |k| k.len()) + value.map_or(0, |v| v.len())
    }

    /// Try to append one record. Returns `Ok(handle)` if it fit, or
    /// `Err(None)` ("Full") if the caller must start a new batch — a
    /// distinct outcome from a hard append error.
    #[allow(clippy::type_complexity)]
    pub fn try_append(
        &mut self,
        timestamp: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<CompletionHandle, BatchFull> {
        let size = Self::estimated_record_size(key, value);
        if !self.encoded.is_empty() && self.encoded.len() + size > self.max_bytes {
            return Err(BatchFull);
        }
        if self.encoded.is_empty() && size > self.max_bytes {
            // A single record larger than the whole batch budget: caller
            // (the accumulator) is responsible for surfacing MessageTooLarge
            // before it ever reaches `try_append`; reaching here with an
            // empty batch means it simply does not fit at all.
            return Err(BatchFull);
        }

        encode_record(&mut self.encoded, timestamp, key, value);
        self.record_count += 1;

        let (tx, rx) = oneshot::channel();
        self.records.push(QueuedRecord { resolver: tx });
        Ok(rx)
    }

    pub fn is_full(&self) -> bool {
        self.encoded.len() >= self.max_bytes
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Finalize the batch into wire bytes, applying compression.
    ///
    /// Layout: a leading CRC over everything that follows it, then magic,
    /// compression/sequence header fields, record count, and the
    /// (possibly compressed) record payload.
    pub fn finalize(&self, compression: CompressionType, compressor: &dyn Compressor) -> Bytes {
        let payload = compressor.compress(&self.encoded);
        let mut body = BytesMut::with_capacity(payload.len() + 24);
        body.put_u8(self.magic as u8);
        body.put_u8(compression.wire_id());
        if let Some(seq) = self.sequence {
            body.put_i64(seq.producer_id);
            body.put_i16(seq.producer_epoch);
            body.put_i32(seq.base_sequence);
        } else {
            body.put_i64(-1);
            body.put_i16(-1);
            body.put_i32(-1);
        }
        body.put_i32(self.record_count as i32);
        body.put_slice(&payload);

        let crc = crc32fast::hash(&body);
        let mut out = BytesMut::with_capacity(body.len() + 4);
        out.put_u32(crc);
        out.put_slice(&body);
        out.freeze()
    }

    /// Resolve every queued record's handle with the same outcome — a
    /// Produce response is per-partition, not per-record, so every record
    /// in the batch shares the base offset (offset = base + index is left
    /// to callers that need per-record offsets; this crate resolves the
    /// batch-level `RecordMetadata` to each handle).
    pub fn resolve(mut self, metadata: RecordMetadata) {
        for record in self.records.drain(..) {
            let _ = record.resolver.send(Ok(metadata));
        }
    }

    pub fn fail(mut self, error: ProducerError) {
        for record in self.records.drain(..) {
            let _ = record.resolver.send(Err(error.clone()));
        }
    }
}

/// Sentinel returned by `try_append` when the batch cannot accept another
/// record; distinct from a hard error so the accumulator can start a new
/// batch rather than fail the caller.
#[derive(Debug, Clone, Copy)]
pub struct BatchFull;

fn encode_record(buf: &mut BytesMut, timestamp: i64, key: Option<&[u8]>, value: Option<&[u8]>) {
    buf.put_i64(timestamp);
    match key {
        Some(k) => {
            buf.put_i32(k.len() as i32);
            buf.put_slice(k);
        }
        None => buf.put_i32(-1),
    }
    match value {
        Some(v) => {
            buf.put_i32(v.len() as i32);
            buf.put_slice(v);
        }
        None => buf.put_i32(-1),
    }
}

/// Select the record-batch magic from the negotiated broker version and
/// idempotence configuration (§6 selection rule).
pub fn select_magic(broker_version: (u16, u16), idempotent_or_transactional: bool) -> RecordBatchMagic {
    if broker_version >= (0, 11) && idempotent_or_transactional {
        RecordBatchMagic::V2
    } else if broker_version >= (0, 10) {
        RecordBatchMagic::V1
    } else {
        RecordBatchMagic::V0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::IdentityCompressor;

    fn tp() -> TopicPartition {
        TopicPartition::new("t", 0)
    }

    #[test]
    fn appends_until_full_then_reports_full() {
        let mut batch = Batch::new(tp(), RecordBatchMagic::V2, 64);
        let mut appended = 0;
        loop {
            match batch.try_append(0, None, Some(b"0123456789")) {
                Ok(_) => appended += 1,
                Err(BatchFull) => break,
            }
            if appended > 100 {
                panic!("batch never reported full");
            }
        }
        assert!(appended > 0);
        assert!(batch.record_count() == appended);
    }

    #[test]
    fn sequence_assignment_is_frozen_once_set() {
        let mut batch = Batch::new(tp(), RecordBatchMagic::V2, 1024);
        batch.sequence = Some(SequenceAssignment {
            base_sequence: 5,
            producer_id: 42,
            producer_epoch: 0,
        });
        let before = batch.sequence;
        // Re-enqueue does not touch `sequence` — simulated by not mutating it
        // and asserting identity is preserved across a retry_count bump.
        batch.retry_count += 1;
        assert_eq!(batch.sequence.unwrap().base_sequence, before.unwrap().base_sequence);
    }

    #[test]
    fn resolve_completes_every_queued_handle() {
        let mut batch = Batch::new(tp(), RecordBatchMagic::V0, 1024);
        let h1 = batch.try_append(0, None, Some(b"a")).unwrap();
        let h2 = batch.try_append(0, None, Some(b"b")).unwrap();
        batch.resolve(RecordMetadata {
            topic_partition_offset: 10,
            timestamp: 99,
        });

        let m1 = h1.blocking_recv().unwrap().unwrap();
        let m2 = h2.blocking_recv().unwrap().unwrap();
        assert_eq!(m1.topic_partition_offset, 10);
        assert_eq!(m2.topic_partition_offset, 10);
    }

    #[test]
    fn finalize_is_stable_for_identity_compressor() {
        let mut batch = Batch::new(tp(), RecordBatchMagic::V1, 1024);
        let _ = batch.try_append(1, Some(b"k"), Some(b"v"));
        let bytes = batch.finalize(CompressionType::None, &IdentityCompressor);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn finalize_leading_crc_covers_the_remaining_bytes() {
        let mut batch = Batch::new(tp(), RecordBatchMagic::V2, 1024);
        let _ = batch.try_append(1, Some(b"k"), Some(b"v"));
        let bytes = batch.finalize(CompressionType::None, &IdentityCompressor);

        let stored_crc = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let recomputed = crc32fast::hash(&bytes[4..]);
        assert_eq!(stored_crc, recomputed);
    }

    #[test]
    fn magic_selection_matches_broker_version_rules() {
        assert_eq!(select_magic((2, 0), true), RecordBatchMagic::V2);
        assert_eq!(select_magic((0, 10), false), RecordBatchMagic::V1);
        assert_eq!(select_magic((0, 9), false), RecordBatchMagic::V0);
        assert_eq!(select_magic((0, 10), true), RecordBatchMagic::V1);
    }
}
