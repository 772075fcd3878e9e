//! Optional resilience decorator for vector databases.
//!
//! [`ResilientVectorDb`] wraps any [`VectorDb`] with a circuit breaker and a
//! bounded retry of [`Error::ConnectionFailure`]. Nothing applies it
//! implicitly; callers opt in when they build the backend. Other error kinds
//! pass through untouched and count as a healthy backend.
//!
//! The breaker opens after `failure_threshold` consecutive connection
//! failures, rejects calls for `open_for`, then lets `probe_calls` trial calls
//! through. A successful probe closes it again; a failed one re-opens it.
//!
//! ```rust,ignore
//! use vectormem::storage::{MemoryDb, ResilienceConfig, ResilientVectorDb};
//!
//! let db = PostgresVectorDb::connect(&settings).await?;
//! let db = ResilientVectorDb::new(db, ResilienceConfig::from_env());
//! let memory = MemoryDb::new(db, "default");
//! ```

use super::traits::{RecordStream, ScoredRecordStream, VectorDb};
use crate::models::{Embedding, IndexName, MemoryFilter, MemoryRecord};
use crate::observability::record_retry;
use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Breaker and retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilienceConfig {
    /// Consecutive connection failures that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls.
    pub open_for: Duration,
    /// Trial calls admitted once the open period has elapsed.
    pub probe_calls: u32,
    /// Retries after the first attempt, connection failures only.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(30),
            probe_calls: 1,
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl ResilienceConfig {
    /// Defaults with `VECTORMEM_STORAGE_*` environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `VECTORMEM_STORAGE_*` overrides read through `lookup`.
    ///
    /// Unparseable values are ignored; counts are floored at one.
    #[must_use]
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let count = |key: &str| number(key).map(|v| u32::try_from(v).unwrap_or(u32::MAX));

        if let Some(v) = count("VECTORMEM_STORAGE_FAILURE_THRESHOLD") {
            self.failure_threshold = v.max(1);
        }
        if let Some(ms) = number("VECTORMEM_STORAGE_OPEN_MS") {
            self.open_for = Duration::from_millis(ms);
        }
        if let Some(v) = count("VECTORMEM_STORAGE_PROBE_CALLS") {
            self.probe_calls = v.max(1);
        }
        if let Some(v) = count("VECTORMEM_STORAGE_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(ms) = number("VECTORMEM_STORAGE_RETRY_BACKOFF_MS") {
            self.retry_backoff = Duration::from_millis(ms);
        }
        self
    }

    /// Sets the consecutive-failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets how long the breaker stays open.
    #[must_use]
    pub const fn with_open_for(mut self, open_for: Duration) -> Self {
        self.open_for = open_for;
        self
    }

    /// Sets the number of half-open probe calls.
    #[must_use]
    pub const fn with_probe_calls(mut self, probes: u32) -> Self {
        self.probe_calls = probes;
        self
    }

    /// Sets the retry budget and base backoff.
    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Delay before retry `attempt` (1-based): `retry_backoff * 2^(attempt - 1)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            n => self.retry_backoff.saturating_mul(1 << (n - 1).min(10)),
        }
    }
}

/// Observable breaker state, reported as the `vectormem_circuit_breaker_state`
/// gauge (0 closed, 1 open, 2 half-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of probe calls are admitted.
    HalfOpen,
}

impl BreakerState {
    /// Gauge value.
    #[must_use]
    pub const fn gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { probes: u32 },
}

/// Consecutive-failure circuit breaker for one backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    backend: &'static str,
    threshold: u32,
    open_for: Duration,
    probe_calls: u32,
    phase: Phase,
}

impl CircuitBreaker {
    /// Creates a closed breaker. Zero counts are raised to one.
    #[must_use]
    pub fn new(config: &ResilienceConfig, backend: &'static str) -> Self {
        Self {
            backend,
            threshold: config.failure_threshold.max(1),
            open_for: config.open_for,
            probe_calls: config.probe_calls.max(1),
            phase: Phase::Closed { failures: 0 },
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> BreakerState {
        match self.phase {
            Phase::Closed { .. } => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Asks to make a call. An elapsed open period turns into half-open, and
    /// the call that observes it is the first probe.
    pub fn try_acquire(&mut self) -> bool {
        match self.phase {
            Phase::Closed { .. } => true,
            Phase::Open { until } if Instant::now() >= until => {
                tracing::info!(backend = self.backend, "Circuit breaker half-open, probing");
                self.phase = Phase::HalfOpen { probes: 1 };
                true
            },
            Phase::HalfOpen { probes } if probes < self.probe_calls => {
                self.phase = Phase::HalfOpen { probes: probes + 1 };
                true
            },
            Phase::Open { .. } | Phase::HalfOpen { .. } => false,
        }
    }

    /// Records a healthy outcome and closes the breaker.
    pub fn record_success(&mut self) {
        if !matches!(self.phase, Phase::Closed { .. }) {
            tracing::info!(backend = self.backend, "Circuit breaker closed");
        }
        self.phase = Phase::Closed { failures: 0 };
    }

    /// Records a connection failure. Returns true if this opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        let reopen = match self.phase {
            Phase::Closed { failures } => {
                let failures = failures.saturating_add(1);
                self.phase = Phase::Closed { failures };
                failures >= self.threshold
            },
            Phase::HalfOpen { .. } => true,
            Phase::Open { .. } => false,
        };
        if reopen {
            tracing::warn!(
                backend = self.backend,
                threshold = self.threshold,
                open_ms = u64::try_from(self.open_for.as_millis()).unwrap_or(u64::MAX),
                "Circuit breaker opened"
            );
            self.phase = Phase::Open {
                until: Instant::now() + self.open_for,
            };
        }
        reopen
    }
}

/// Vector database wrapper with circuit breaking and connection retries.
pub struct ResilientVectorDb<V: VectorDb> {
    inner: V,
    config: ResilienceConfig,
    breaker: Mutex<CircuitBreaker>,
}

impl<V: VectorDb> ResilientVectorDb<V> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: V, config: ResilienceConfig) -> Self {
        let breaker = CircuitBreaker::new(&config, inner.backend_name());
        Self {
            inner,
            config,
            breaker: Mutex::new(breaker),
        }
    }

    /// Returns the wrapped backend.
    pub const fn inner(&self) -> &V {
        &self.inner
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds an outcome to the breaker; returns true if the circuit just opened.
    fn settle(&self, healthy: bool) -> bool {
        let mut breaker = self.breaker();
        let tripped = if healthy {
            breaker.record_success();
            false
        } else {
            breaker.record_failure()
        };
        let state = breaker.state();
        drop(breaker);
        metrics::gauge!(
            "vectormem_circuit_breaker_state",
            "backend" => self.inner.backend_name()
        )
        .set(state.gauge());
        tripped
    }

    async fn execute<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let backend = self.inner.backend_name();
        let mut attempt = 0;
        loop {
            if !self.breaker().try_acquire() {
                return Err(Error::connection(
                    format!("{backend}_{operation}"),
                    format!("circuit breaker open for backend '{backend}'"),
                ));
            }

            match call().await {
                Ok(value) => {
                    self.settle(true);
                    return Ok(value);
                },
                Err(e) if e.is_retryable() => {
                    let tripped = self.settle(false);
                    if tripped {
                        metrics::counter!(
                            "vectormem_circuit_breaker_trips_total",
                            "backend" => backend,
                            "operation" => operation
                        )
                        .increment(1);
                    }
                    if tripped || attempt >= self.config.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    record_retry(backend, operation);
                    tracing::warn!(
                        backend,
                        operation,
                        attempt,
                        error = %e,
                        "Retrying after connection failure"
                    );
                    tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
                },
                Err(e) => {
                    // Caller and data errors say nothing about backend health.
                    self.settle(true);
                    return Err(e);
                },
            }
        }
    }
}

#[async_trait]
impl<V: VectorDb> VectorDb for ResilientVectorDb<V> {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn create_index(&self, index: &IndexName, vector_size: usize) -> Result<()> {
        self.execute("create_index", || self.inner.create_index(index, vector_size))
            .await
    }

    async fn list_indexes(&self) -> Result<Vec<String>> {
        self.execute("list_indexes", || self.inner.list_indexes())
            .await
    }

    async fn delete_index(&self, index: &IndexName) -> Result<()> {
        self.execute("delete_index", || self.inner.delete_index(index))
            .await
    }

    async fn upsert(&self, index: &IndexName, record: &MemoryRecord) -> Result<String> {
        self.execute("upsert", || self.inner.upsert(index, record))
            .await
    }

    async fn read(
        &self,
        index: &IndexName,
        id: &str,
        include_vector: bool,
    ) -> Result<Option<MemoryRecord>> {
        self.execute("read", || self.inner.read(index, id, include_vector))
            .await
    }

    async fn read_batch(
        &self,
        index: &IndexName,
        ids: &[String],
        include_vector: bool,
    ) -> Result<RecordStream> {
        self.execute("read_batch", || {
            self.inner.read_batch(index, ids, include_vector)
        })
        .await
    }

    async fn delete(&self, index: &IndexName, id: &str) -> Result<bool> {
        self.execute("delete", || self.inner.delete(index, id)).await
    }

    async fn delete_batch(&self, index: &IndexName, ids: &[String]) -> Result<u64> {
        self.execute("delete_batch", || self.inner.delete_batch(index, ids))
            .await
    }

    async fn list(
        &self,
        index: &IndexName,
        filter: &MemoryFilter,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<RecordStream> {
        self.execute("list", || {
            self.inner.list(index, filter, limit, include_vector)
        })
        .await
    }

    async fn search(
        &self,
        index: &IndexName,
        query: &Embedding,
        filter: &MemoryFilter,
        min_relevance: f64,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<ScoredRecordStream> {
        self.execute("search", || {
            self.inner
                .search(index, query, filter, min_relevance, limit, include_vector)
        })
        .await
    }
}
