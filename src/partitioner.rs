//! Record serializer & partitioner (§4.A).

use crate::error::ProducerError;
use bytes::Bytes;
use rand::Rng;

/// Turns user key/value pairs into wire bytes.
///
/// The default `BytesSerializer` is the identity function: callers that
/// already hold `Bytes` pay nothing. Custom serializers (protobuf, avro,
/// ...) implement this trait and are invoked exactly once per record.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, topic: &str, value: &T) -> Result<Bytes, ProducerError>;
}

/// Identity serializer for data that is already encoded.
#[derive(Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Bytes> for BytesSerializer {
    fn serialize(&self, _topic: &str, value: &Bytes) -> Result<Bytes, ProducerError> {
        Ok(value.clone())
    }
}

/// Chooses a destination partition for a record.
pub trait Partitioner: Send + Sync {
    /// `available_partitions` are partitions with a known, reachable
    /// leader; `all_partitions` is the full partition count for the topic.
    fn partition(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        all_partitions: &[i32],
        available_partitions: &[i32],
    ) -> i32;
}

/// Default partitioner: Murmur2 hash of the key modulo partition count;
/// null keys pick uniformly among available partitions (or all partitions
/// if none are currently available).
#[derive(Default)]
pub struct Murmur2Partitioner;

impl Partitioner for Murmur2Partitioner {
    fn partition(
        &self,
        _topic: &str,
        key: Option<&[u8]>,
        all_partitions: &[i32],
        available_partitions: &[i32],
    ) -> i32 {
        match key {
            Some(k) if !k.is_empty() => {
                let hash = murmur2(k) & 0x7fffffff;
                all_partitions[(hash as usize) % all_partitions.len()]
            }
            _ => {
                let pool = if available_partitions.is_empty() {
                    all_partitions
                } else {
                    available_partitions
                };
                let idx = rand::thread_rng().gen_range(0..pool.len());
                pool[idx]
            }
        }
    }
}

/// Resolve the target partition for a record.
///
/// If `explicit` is given it must be a member of the topic's known
/// partition set. Otherwise the configured partitioner is consulted.
pub fn choose_partition(
    partitioner: &dyn Partitioner,
    topic: &str,
    explicit: Option<i32>,
    key: Option<&[u8]>,
    all_partitions: &[i32],
    available_partitions: &[i32],
) -> Result<i32, ProducerError> {
    match explicit {
        Some(p) => {
            if all_partitions.contains(&p) {
                Ok(p)
            } else {
                Err(ProducerError::UnknownPartition {
                    topic: topic.to_string(),
                    partition: p,
                })
            }
        }
        None => Ok(partitioner.partition(topic, key, all_partitions, available_partitions)),
    }
}

/// The Kafka-compatible Murmur2 variant (32-bit, seed 0x9747b28c).
///
/// This must byte-for-byte match the broker's own partitioner so that
/// producers and any server-side tooling that re-derives partition
/// assignment agree; it is a fixed algorithm, not an ecosystem gap, so it
/// is implemented directly rather than pulled from a generic hashing crate.
pub fn murmur2(data: &[u8]) -> i32 {
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;
    const SEED: u32 = 0x9747b28c;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let n_blocks = len / 4;
    for i in 0..n_blocks {
        let base = i * 4;
        let mut k = u32::from_le_bytes([data[base], data[base + 1], data[base + 2], data[base + 3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = &data[n_blocks * 4..];
    match tail.len() {
        3 => {
            h ^= (tail[2] as u32) << 16;
            h ^= (tail[1] as u32) << 8;
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        2 => {
            h ^= (tail[1] as u32) << 8;
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        1 => {
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        _ => {}
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur2_is_deterministic_and_sensitive_to_input() {
        assert_eq!(murmur2(b"kafka"), murmur2(b"kafka"));
        assert_ne!(murmur2(b"kafka"), murmur2(b"kafkb"));
        assert_ne!(murmur2(b""), murmur2(b"a"));
    }

    #[test]
    fn murmur2_handles_all_tail_lengths() {
        // Exercise the 0/1/2/3-byte tail branches explicitly.
        for len in 0..=8 {
            let data: Vec<u8> = (0..len as u8).collect();
            let _ = murmur2(&data);
        }
    }

    #[test]
    fn explicit_partition_must_be_known() {
        let err = choose_partition(&Murmur2Partitioner, "t", Some(5), None, &[0, 1, 2], &[0, 1, 2])
            .unwrap_err();
        assert!(matches!(err, ProducerError::UnknownPartition { partition: 5, .. }));
    }

    #[test]
    fn explicit_partition_within_range_is_used() {
        let p = choose_partition(&Murmur2Partitioner, "t", Some(1), None, &[0, 1, 2], &[0, 1, 2]).unwrap();
        assert_eq!(p, 1);
    }

    #[test]
    fn same_key_always_same_partition() {
        let all = [0, 1, 2, 3];
        let a = choose_partition(&Murmur2Partitioner, "t", None, Some(b"user-42"), &all, &all).unwrap();
        let b = choose_partition(&Murmur2Partitioner, "t", None, Some(b"user-42"), &all, &all).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn null_key_falls_back_to_all_partitions_when_none_available() {
        let all = [0, 1, 2];
        let p = choose_partition(&Murmur2Partitioner, "t", None, None, &all, &[]).unwrap();
        assert!(all.contains(&p));
    }
}
