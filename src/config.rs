//! Producer configuration: typed options, builder, and the validation rules
//! that must hold before a producer can be started.

use crate::error::ConfigError;
use crate::retry::{BackoffPolicy, JitterMode};
use crate::types::{Acks, CompressionType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sentinel used when a transaction timeout is not applicable
/// (non-transactional producer).
pub const NO_TRANSACTION_TIMEOUT: Duration = Duration::from_millis(0);

/// Monotonic per-instance client-id allocator.
///
/// Replaces the process-wide global counter a cooperative-scheduling
/// reference implementation would use with an object a caller can own and
/// reuse across producer instances if they want a shared namespace, or
/// construct fresh per producer.
#[derive(Debug, Default)]
pub struct ClientIdAllocator(AtomicU64);

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Immutable, validated producer configuration, shared read-only across the
/// facade, sender, and accumulator.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ProducerConfig {
    pub client_id: String,
    #[serde(skip, default = "default_acks")]
    pub acks: Acks,
    #[serde(skip, default)]
    pub compression_type: CompressionType,
    pub max_batch_size: usize,
    /// Total bytes the accumulator may hold across all partitions before
    /// `add_message` starts blocking on backpressure.
    pub buffer_memory: usize,
    pub linger_ms: u64,
    pub max_request_size: usize,
    pub metadata_max_age_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub enable_idempotence: bool,
    pub transactional_id: Option<String>,
    pub transaction_timeout_ms: u64,
    pub max_in_flight_requests_per_connection: usize,
}

fn default_acks() -> Acks {
    Acks::All
}

impl ProducerConfig {
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::default()
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(self.retry_backoff_ms)).with_jitter(JitterMode::None)
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional_id.is_some()
    }

    /// Fixed per-record overhead for the given magic, subtracted from
    /// `max_request_size` to bound the maximum serialized record size
    /// (see the `MessageTooLarge` contract).
    pub fn fixed_record_overhead(&self, magic: crate::types::RecordBatchMagic) -> usize {
        match magic {
            crate::types::RecordBatchMagic::V0 => 14,
            crate::types::RecordBatchMagic::V1 => 22,
            crate::types::RecordBatchMagic::V2 => 61,
        }
    }
}

/// Consuming builder for [`ProducerConfig`].
#[must_use = "builders do nothing unless you call .build()"]
#[derive(Clone, Debug)]
pub struct ProducerConfigBuilder {
    client_id: String,
    acks: Option<Acks>,
    compression_type: CompressionType,
    max_batch_size: usize,
    buffer_memory: usize,
    linger_ms: u64,
    max_request_size: usize,
    metadata_max_age_ms: u64,
    request_timeout_ms: u64,
    retry_backoff_ms: u64,
    enable_idempotence: bool,
    transactional_id: Option<String>,
    transaction_timeout_ms: u64,
    max_in_flight_requests_per_connection: usize,
}

impl Default for ProducerConfigBuilder {
    fn default() -> Self {
        Self {
            client_id: "producer".to_string(),
            acks: None,
            compression_type: CompressionType::None,
            max_batch_size: 16 * 1024,
            buffer_memory: 32 * 1024 * 1024,
            linger_ms: 0,
            max_request_size: 1024 * 1024,
            metadata_max_age_ms: 300_000,
            request_timeout_ms: 30_000,
            retry_backoff_ms: 100,
            enable_idempotence: false,
            transactional_id: None,
            transaction_timeout_ms: 60_000,
            max_in_flight_requests_per_connection: 1,
        }
    }
}

impl ProducerConfigBuilder {
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn acks(mut self, acks: Acks) -> Self {
        self.acks = Some(acks);
        self
    }

    pub fn compression_type(mut self, compression: CompressionType) -> Self {
        self.compression_type = compression;
        self
    }

    pub fn max_batch_size(mut self, bytes: usize) -> Self {
        self.max_batch_size = bytes;
        self
    }

    pub fn buffer_memory(mut self, bytes: usize) -> Self {
        self.buffer_memory = bytes;
        self
    }

    pub fn linger_ms(mut self, ms: u64) -> Self {
        self.linger_ms = ms;
        self
    }

    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    pub fn metadata_max_age_ms(mut self, ms: u64) -> Self {
        self.metadata_max_age_ms = ms;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn enable_idempotence(mut self, enabled: bool) -> Self {
        self.enable_idempotence = enabled;
        self
    }

    /// Enabling a transactional id forces idempotence on, matching the
    /// `transactional_id` config-option contract.
    pub fn transactional_id(mut self, id: impl Into<String>) -> Self {
        self.transactional_id = Some(id.into());
        self.enable_idempotence = true;
        self
    }

    pub fn transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.transaction_timeout_ms = ms;
        self
    }

    pub fn max_in_flight_requests_per_connection(mut self, n: usize) -> Self {
        self.max_in_flight_requests_per_connection = n;
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// `acks` not having been given resolves to `All`; idempotence forces
    /// `All` regardless of what was given, and an explicit non-`All` acks
    /// together with idempotence is a validation error (the two must not
    /// silently disagree).
    pub fn build(self) -> Result<ProducerConfig, ConfigError> {
        if self.max_batch_size > self.max_request_size {
            return Err(ConfigError::BatchLargerThanRequest);
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_batch_size",
            });
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_request_size",
            });
        }

        if self.transactional_id.is_some() && !self.enable_idempotence {
            return Err(ConfigError::TransactionalRequiresIdempotence);
        }

        let acks = match (self.acks, self.enable_idempotence) {
            (None, _) => Acks::All,
            (Some(Acks::All), _) => Acks::All,
            (Some(given), true) => {
                return Err(ConfigError::AcksIdempotenceMismatch {
                    acks: given.to_wire(),
                })
            }
            (Some(given), false) => given,
        };

        // Compression/broker-version compatibility (e.g. LZ4 needs >= 0.8.2)
        // can only be checked once a broker version has been negotiated, so
        // it is deferred to `Producer::start()` rather than validated here.

        Ok(ProducerConfig {
            client_id: self.client_id,
            acks,
            compression_type: self.compression_type,
            max_batch_size: self.max_batch_size,
            buffer_memory: self.buffer_memory,
            linger_ms: self.linger_ms,
            max_request_size: self.max_request_size,
            metadata_max_age_ms: self.metadata_max_age_ms,
            request_timeout_ms: self.request_timeout_ms,
            retry_backoff_ms: self.retry_backoff_ms,
            enable_idempotence: self.enable_idempotence,
            transactional_id: self.transactional_id,
            transaction_timeout_ms: if self.transactional_id.is_some() {
                self.transaction_timeout_ms
            } else {
                NO_TRANSACTION_TIMEOUT.as_millis() as u64
            },
            max_in_flight_requests_per_connection: self.max_in_flight_requests_per_connection,
        })
    }
}

/// Thin `Arc` wrapper alias used throughout the crate; config is built once
/// and shared, never mutated.
pub type SharedConfig = Arc<ProducerConfig>;
