use crate::catalog::{self, CatalogError, Query, QueryId};
use crate::frame::{self, FrameError, RawFrame};
use crate::metric_collector::SensorBindings;
use crate::response::{self, DecodedReading, ParseError};
use crate::transport::{Transport, TransportError};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

// reads are sliced so a shutdown request is noticed mid-response
const READ_SLICE: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 256;

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub failure_threshold: u32,
    pub max_backoff: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl DriverConfig {
    /// How long polling pauses once the failure threshold is reached.
    pub fn backoff_interval(&self) -> Duration {
        (self.poll_interval * 2).min(self.max_backoff)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    AwaitingResponse,
    Decoding,
    Publishing,
    Backoff,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("shutdown requested")]
    Cancelled,
}

#[derive(Debug)]
pub enum TickOutcome {
    /// A reading was decoded and handed to `fields` bound sinks.
    Published { query: QueryId, fields: usize },
    /// The exchange was valid but carried nothing we can publish.
    Skipped { query: QueryId, reason: ParseError },
    Failed { query: QueryId, error: CycleError },
    /// Polling is paused after repeated failures.
    Suppressed,
    /// The previous cycle was still running.
    Dropped,
    /// Shutdown was requested while the cycle was in flight.
    Cancelled,
}

pub struct Inverter<T: Transport> {
    transport: T,
    config: DriverConfig,
    bindings: SensorBindings,
    schedule: Vec<&'static Query>,
    phase: Phase,
    last_poll: Option<Instant>,
    consecutive_failures: u32,
    query_index: usize,
    backoff_until: Option<Instant>,
    shutdown: Arc<AtomicBool>,
}

impl<T: Transport> Inverter<T> {
    pub fn new(transport: T, config: DriverConfig, bindings: SensorBindings) -> Self {
        let mut schedule: Vec<&'static Query> = catalog::all()
            .iter()
            .filter(|query| query.fields().iter().any(|field| bindings.is_bound(*field)))
            .collect();
        if schedule.is_empty() {
            warn!("no sensors bound, polling every query anyway");
            schedule = catalog::all().iter().collect();
        }

        let commands: Vec<&str> = schedule.iter().map(|query| query.command).collect();
        info!(
            "PI18 driver polling {} every {:.2}s",
            commands.join(", "),
            config.poll_interval.as_secs_f64()
        );

        Self {
            transport,
            config,
            bindings,
            schedule,
            phase: Phase::Idle,
            last_poll: None,
            consecutive_failures: 0,
            query_index: 0,
            backoff_until: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn current_query(&self) -> QueryId {
        self.schedule[self.query_index].id
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    /// Setting the flag aborts an in-flight read and stops further cycles.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!("{:?} -> {phase:?}", self.phase);
            self.phase = phase;
        }
    }

    /// Runs one complete poll cycle, or nothing while backing off.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.phase == Phase::Backoff {
            if self.backoff_until.is_some_and(|until| now < until) {
                debug!("polling suppressed during backoff");
                return TickOutcome::Suppressed;
            }
            info!("backoff elapsed, resuming polling");
            self.backoff_until = None;
            self.set_phase(Phase::Idle);
        }
        if self.shutdown.load(Ordering::Relaxed) {
            return TickOutcome::Cancelled;
        }

        self.last_poll = Some(now);
        let query = self.schedule[self.query_index];

        match self.run_cycle(query) {
            Ok(reading) => {
                debug!("{} -> {reading:?}", query.id);
                self.set_phase(Phase::Publishing);
                let fields = self.publish(&reading);
                self.complete_exchange();
                TickOutcome::Published {
                    query: query.id,
                    fields,
                }
            }
            Err(CycleError::Parse(reason)) if reason.is_recoverable() => {
                warn!("{} answer not published: {reason}", query.id);
                self.complete_exchange();
                TickOutcome::Skipped {
                    query: query.id,
                    reason,
                }
            }
            Err(CycleError::Cancelled) => {
                info!("{} cycle aborted by shutdown", query.id);
                self.set_phase(Phase::Idle);
                TickOutcome::Cancelled
            }
            Err(error) => {
                self.record_failure(now, query.id, &error);
                TickOutcome::Failed {
                    query: query.id,
                    error,
                }
            }
        }
    }

    fn run_cycle(&mut self, query: &'static Query) -> Result<DecodedReading, CycleError> {
        self.set_phase(Phase::Sending);
        let message = frame::encode(query)?;
        self.transport.clear_input()?;
        self.transport.write(&message)?;

        self.set_phase(Phase::AwaitingResponse);
        let raw = self.await_frame()?;

        self.set_phase(Phase::Decoding);
        let query = catalog::lookup(query.id)?;
        Ok(response::parse(query.shape, &raw.payload)?)
    }

    fn await_frame(&mut self) -> Result<RawFrame, CycleError> {
        let deadline = Instant::now() + self.config.read_timeout;
        let mut buffer = Vec::new();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(CycleError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(self.config.read_timeout).into());
            }

            match self
                .transport
                .read_with_timeout(READ_CHUNK, remaining.min(READ_SLICE))
            {
                Ok(bytes) => buffer.extend_from_slice(&bytes),
                Err(TransportError::Timeout(_)) => continue,
                Err(e) => return Err(e.into()),
            }

            match frame::decode(&buffer) {
                Err(FrameError::Incomplete) => continue,
                result => return Ok(result?),
            }
        }
    }

    fn publish(&mut self, reading: &DecodedReading) -> usize {
        let mut published = 0;
        for (field, value) in reading.values() {
            if let Some(sink) = self.bindings.sink_mut(field) {
                sink.publish(field, &value);
                published += 1;
            }
        }
        published
    }

    fn complete_exchange(&mut self) {
        if self.consecutive_failures > 0 {
            info!(
                "inverter answering again after {} failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.query_index = (self.query_index + 1) % self.schedule.len();
        self.set_phase(Phase::Idle);
    }

    fn record_failure(&mut self, now: Instant, query: QueryId, error: &CycleError) {
        self.consecutive_failures += 1;
        match error {
            CycleError::Transport(TransportError::Io(_)) => error!("{query} failed: {error}"),
            _ => warn!(
                "{query} failed ({} in a row): {error}",
                self.consecutive_failures
            ),
        }

        if self.consecutive_failures >= self.config.failure_threshold {
            let pause = self.config.backoff_interval();
            info!(
                "inverter unresponsive, pausing polls for {:.2}s",
                pause.as_secs_f64()
            );
            self.backoff_until = Some(now + pause);
            self.set_phase(Phase::Backoff);
        } else {
            self.set_phase(Phase::Idle);
        }
    }
}

/// Lets a host clock the driver from another thread. A tick that arrives
/// while a cycle holds the driver is dropped, never queued.
pub struct SharedInverter<T: Transport> {
    inner: Arc<Mutex<Inverter<T>>>,
}

impl<T: Transport> Clone for SharedInverter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> SharedInverter<T> {
    pub fn new(inverter: Inverter<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inverter)),
        }
    }

    pub fn try_tick(&self, now: Instant) -> TickOutcome {
        match self.inner.try_lock() {
            Ok(mut inverter) => inverter.tick(now),
            Err(TryLockError::WouldBlock) => {
                debug!("poll cycle still in flight, dropping tick");
                TickOutcome::Dropped
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().tick(now),
        }
    }

    /// Waits for any running cycle, then inspects the driver.
    pub fn with<R>(&self, f: impl FnOnce(&Inverter<T>) -> R) -> R {
        let inverter = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&inverter)
    }
}
