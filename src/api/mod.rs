//! Appliance API client
//!
//! Executes logical remote operations over a selectable transport, with
//! retry/backoff for transient failures, a read-through cache for
//! idempotent queries, and bulk batching where the transport supports it.

pub mod cache;
pub mod transport;
pub mod value;

use crate::config::{ApiConfig, RetryConfig, TransportKind};
use crate::error::{VolumeError, VolumeResult};
use cache::ResponseCache;
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use transport::{ApiTransport, RestTransport, SocketTransport};

pub use value::{normalize, normalize_json, ApiValue};

/// Client for the remote storage appliance.
pub struct ApiClient {
    transport: Box<dyn ApiTransport>,
    cache: ResponseCache,
    retry: RetryConfig,
}

/// Whether a method is an idempotent query (cacheable) as opposed to a
/// mutation (cache-invalidating).
fn is_query(method: &str) -> bool {
    method.ends_with(".query") || method.ends_with(".get_instance") || method.ends_with(".ping")
}

impl ApiClient {
    /// Build a client for the configured transport.
    pub fn new(config: &ApiConfig) -> VolumeResult<Self> {
        let transport: Box<dyn ApiTransport> = match config.transport {
            TransportKind::Rest => Box::new(RestTransport::new(config)?),
            TransportKind::Socket => Box::new(SocketTransport::new(config)?),
        };
        Ok(Self::with_transport(transport, config.retry.clone()))
    }

    /// Build a client around an existing transport. Used by tests and by
    /// callers that construct their own transport.
    pub fn with_transport(transport: Box<dyn ApiTransport>, retry: RetryConfig) -> Self {
        Self {
            transport,
            cache: ResponseCache::default(),
            retry,
        }
    }

    /// Backoff before retry `attempt` (0-based): exponential from the
    /// configured base, capped, plus 0-20% random jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .retry
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.retry.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        Duration::from_millis(exp + (exp as f64 * jitter) as u64)
    }

    /// Execute one logical remote operation.
    ///
    /// Queries are served from the cache when fresh; mutations invalidate
    /// every cached query of the same resource class. Transient failures
    /// are retried up to the configured bound; everything else surfaces
    /// immediately.
    pub fn call(&self, method: &str, params: Value) -> VolumeResult<Value> {
        let query = is_query(method);
        if query {
            if let Some(hit) = self.cache.get(method, &params) {
                log::debug!("cache hit for {}", method);
                return Ok(hit);
            }
        }

        let mut attempt = 0u32;
        loop {
            match self.transport.call(method, &params) {
                Ok(result) => {
                    if query {
                        self.cache.put(method, &params, result.clone());
                    } else {
                        self.cache.invalidate_class(method);
                    }
                    return Ok(result);
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    log::warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        method,
                        err,
                        attempt + 1,
                        self.retry.max_retries,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    // A rejected mutation still means the remote state is
                    // not what the cache saw: a conflict or absence was
                    // produced by someone else's change, and a partial
                    // failure may have landed. Stop trusting the class.
                    if !query {
                        self.cache.invalidate_class(method);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Execute several independent mutations, in one bulk round trip when
    /// the transport supports it. Invalidates the cache for every touched
    /// resource class.
    pub fn call_batch(&self, calls: Vec<(String, Value)>) -> VolumeResult<Vec<Value>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let outcome = if self.transport.supports_batch() {
            log::debug!("batching {} call(s) into one round trip", calls.len());
            self.transport.call_batch(&calls)
        } else {
            calls
                .iter()
                .map(|(method, params)| self.call(method, params.clone()))
                .collect()
        };

        // A failed batch may still have applied some of its mutations;
        // every touched class is invalidated before the error surfaces.
        for (method, _) in &calls {
            if !is_query(method) {
                self.cache.invalidate_class(method);
            }
        }
        outcome
    }

    /// Invalidate cached queries for a resource class by example method.
    pub fn invalidate(&self, method: &str) {
        self.cache.invalidate_class(method);
    }
}
