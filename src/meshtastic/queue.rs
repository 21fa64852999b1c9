//! Rate-limited outbound queue.
//!
//! Every send toward the radio goes through here. A single consumer task pops
//! jobs in FIFO order and keeps at least the configured delay (never below
//! [`MINIMUM_MESSAGE_DELAY`]) between the start of consecutive sends. Jobs wait
//! in the queue while the radio is not connected.
//!
//! `enqueue` only takes a std mutex for a few instructions, so transport
//! callbacks on foreign threads may call it directly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use super::{RadioTransport, TransportError};
use crate::config::{DEFAULT_MESSAGE_DELAY_SECS, MINIMUM_MESSAGE_DELAY_SECS};
use crate::metrics;
use crate::storage::{MessageMapping, MessageStore};

pub const MAX_QUEUE_SIZE: usize = 500;
/// Fill levels that raise log visibility. Admission is only refused at
/// [`MAX_QUEUE_SIZE`].
pub const QUEUE_HIGH_WATER_MARK: usize = MAX_QUEUE_SIZE * 3 / 4;
pub const QUEUE_MEDIUM_WATER_MARK: usize = MAX_QUEUE_SIZE / 2;
pub const MINIMUM_MESSAGE_DELAY: Duration = Duration::from_millis(2000);

const IDLE_POLL: Duration = Duration::from_millis(100);
const NOT_READY_WAIT: Duration = Duration::from_secs(1);

/// Work performed against the live transport. Returns the radio packet id
/// when the send produced one.
pub type SendAction =
    Box<dyn FnOnce(&dyn RadioTransport) -> Result<Option<u32>, TransportError> + Send + 'static>;

/// Where to record the identity mapping once a send yields a packet id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingHint {
    pub event_id: String,
    pub room_id: String,
    pub text: String,
    pub meshnet: String,
}

struct OutboundJob {
    action: SendAction,
    description: String,
    mapping: Option<MappingHint>,
    enqueued_at: Instant,
}

/// Hands out the transport only while it is usable for sending.
pub trait TransportSource: Send + Sync {
    fn ready_transport(&self) -> Option<Arc<dyn RadioTransport>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub running: bool,
    pub size: usize,
    pub delay: Duration,
    pub processor_active: bool,
    pub last_send_time: Option<DateTime<Utc>>,
}

struct QueueState {
    jobs: VecDeque<OutboundJob>,
    running: bool,
    delay: Duration,
    last_send: Option<Instant>,
    last_send_wall: Option<DateTime<Utc>>,
    processor: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
    /// Bumped on every start/stop so a superseded consumer exits.
    generation: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    source: Arc<dyn TransportSource>,
    store: Option<MessageStore>,
    msgs_to_keep: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Cloneable handle to one outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue").field("status", &self.status()).finish()
    }
}

fn effective_delay(requested_secs: f64) -> Duration {
    let requested = if requested_secs.is_finite() {
        requested_secs
    } else {
        DEFAULT_MESSAGE_DELAY_SECS
    };
    if requested < MINIMUM_MESSAGE_DELAY_SECS {
        warn!(
            "message_delay {}s is below the radio minimum of {}s, using {}s",
            requested, MINIMUM_MESSAGE_DELAY_SECS, MINIMUM_MESSAGE_DELAY_SECS
        );
        return MINIMUM_MESSAGE_DELAY;
    }
    match Duration::try_from_secs_f64(requested) {
        Ok(delay) => delay.max(MINIMUM_MESSAGE_DELAY),
        Err(_) => {
            warn!(
                "message_delay {}s is out of range, using {}s",
                requested, DEFAULT_MESSAGE_DELAY_SECS
            );
            Duration::from_secs_f64(DEFAULT_MESSAGE_DELAY_SECS)
        }
    }
}

impl OutboundQueue {
    pub fn new(source: Arc<dyn TransportSource>) -> Self {
        Self::build(source, None, 0)
    }

    /// Queue that records identity mappings for sends carrying a
    /// [`MappingHint`] and prunes the map to `msgs_to_keep` rows afterwards.
    pub fn with_store(source: Arc<dyn TransportSource>, store: MessageStore, msgs_to_keep: usize) -> Self {
        Self::build(source, Some(store), msgs_to_keep)
    }

    fn build(source: Arc<dyn TransportSource>, store: Option<MessageStore>, msgs_to_keep: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    running: false,
                    delay: effective_delay(DEFAULT_MESSAGE_DELAY_SECS),
                    last_send: None,
                    last_send_wall: None,
                    processor: None,
                    runtime: None,
                    generation: 0,
                }),
                wake: Notify::new(),
                source,
                store,
                msgs_to_keep,
            }),
        }
    }

    /// Start accepting jobs. A second call while running changes nothing.
    pub fn start(&self, delay_secs: f64) {
        {
            let mut st = self.shared.lock();
            if st.running {
                debug!("Outbound queue already running (delay {:?})", st.delay);
                return;
            }
            st.running = true;
            st.delay = effective_delay(delay_secs);
            st.generation += 1;
            st.runtime = Handle::try_current().ok();
            info!("Outbound queue started with {:.1}s between sends", st.delay.as_secs_f64());
        }
        self.ensure_processor_started();
    }

    /// Stop the consumer and abandon pending jobs. A send already in progress
    /// is allowed to finish.
    pub fn stop(&self) {
        let abandoned = {
            let mut st = self.shared.lock();
            if !st.running {
                return;
            }
            st.running = false;
            st.generation += 1;
            st.processor = None;
            let n = st.jobs.len();
            st.jobs.clear();
            n
        };
        self.shared.wake.notify_waiters();
        if abandoned > 0 {
            metrics::add_jobs_abandoned(abandoned as u64);
            info!("Outbound queue stopped, abandoned {} pending jobs", abandoned);
        } else {
            info!("Outbound queue stopped");
        }
    }

    /// Add a job. Returns false when the queue is stopped or full. Safe from
    /// any thread.
    pub fn enqueue(&self, action: SendAction, description: impl Into<String>, mapping: Option<MappingHint>) -> bool {
        let description = description.into();
        let size = {
            let mut st = self.shared.lock();
            if !st.running {
                drop(st);
                metrics::inc_jobs_rejected();
                warn!("Outbound queue not running, dropping: {}", description);
                return false;
            }
            if st.jobs.len() >= MAX_QUEUE_SIZE {
                drop(st);
                metrics::inc_jobs_rejected();
                warn!("Outbound queue full ({} jobs), dropping: {}", MAX_QUEUE_SIZE, description);
                return false;
            }
            st.jobs.push_back(OutboundJob {
                action,
                description,
                mapping,
                enqueued_at: Instant::now(),
            });
            st.jobs.len()
        };
        metrics::inc_jobs_queued();
        if size >= QUEUE_HIGH_WATER_MARK {
            warn!("Outbound queue at {}/{} jobs", size, MAX_QUEUE_SIZE);
        } else if size >= QUEUE_MEDIUM_WATER_MARK {
            info!("Outbound queue at {}/{} jobs", size, MAX_QUEUE_SIZE);
        }
        self.shared.wake.notify_one();
        self.ensure_processor_started();
        true
    }

    /// Convenience wrapper for plain text sends.
    pub fn enqueue_text(
        &self,
        text: String,
        channel: u32,
        destination: u32,
        description: impl Into<String>,
        mapping: Option<MappingHint>,
    ) -> bool {
        self.enqueue(
            Box::new(move |t: &dyn RadioTransport| t.send_text(&text, channel, destination).map(Some)),
            description,
            mapping,
        )
    }

    pub fn size(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn status(&self) -> QueueStatus {
        let st = self.shared.lock();
        QueueStatus {
            running: st.running,
            size: st.jobs.len(),
            delay: st.delay,
            processor_active: st.processor.as_ref().is_some_and(|h| !h.is_finished()),
            last_send_time: st.last_send_wall,
        }
    }

    /// Spawn the consumer if the queue is running without one. `start` may
    /// run outside a runtime, in which case the first enqueue from inside one
    /// spawns it.
    fn ensure_processor_started(&self) {
        let mut st = self.shared.lock();
        if !st.running || st.processor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let runtime = match st.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(h) => h,
            None => {
                debug!("No runtime available yet, outbound consumer start deferred");
                return;
            }
        };
        st.runtime = Some(runtime.clone());
        let generation = st.generation;
        st.processor = Some(runtime.spawn(process_jobs(self.shared.clone(), generation)));
    }
}

enum Step {
    Idle,
    NotReady,
    Wait(Duration),
    Send(OutboundJob, Arc<dyn RadioTransport>),
    Exit,
}

async fn process_jobs(shared: Arc<Shared>, generation: u64) {
    debug!("Outbound consumer {} started", generation);
    loop {
        let step = next_step(&shared, generation);
        match step {
            Step::Exit => break,
            Step::Idle => pause(&shared, IDLE_POLL).await,
            Step::NotReady => pause(&shared, NOT_READY_WAIT).await,
            Step::Wait(wait) => {
                debug!("Gating: waiting {}ms before next radio send", wait.as_millis());
                pause(&shared, wait).await;
            }
            Step::Send(job, transport) => run_job(&shared, job, transport).await,
        }
    }
    debug!("Outbound consumer {} exited", generation);
}

/// Sleep, cut short by enqueue or stop. The caller re-evaluates either way.
async fn pause(shared: &Shared, wait: Duration) {
    tokio::select! {
        _ = shared.wake.notified() => {}
        _ = sleep(wait) => {}
    }
}

fn next_step(shared: &Shared, generation: u64) -> Step {
    let mut st = shared.lock();
    if !st.running || st.generation != generation {
        return Step::Exit;
    }
    if st.jobs.is_empty() {
        return Step::Idle;
    }
    if let Some(last) = st.last_send {
        let elapsed = last.elapsed();
        if elapsed < st.delay {
            return Step::Wait(st.delay - elapsed);
        }
    }
    // Head job stays queued until the radio can take it.
    let transport = match shared.source.ready_transport() {
        Some(t) => t,
        None => return Step::NotReady,
    };
    match st.jobs.pop_front() {
        Some(job) => {
            st.last_send = Some(Instant::now());
            st.last_send_wall = Some(Utc::now());
            Step::Send(job, transport)
        }
        None => Step::Idle,
    }
}

async fn run_job(shared: &Shared, job: OutboundJob, transport: Arc<dyn RadioTransport>) {
    let OutboundJob {
        action,
        description,
        mapping,
        enqueued_at,
    } = job;
    debug!(
        "Sending to radio after {}ms in queue: {}",
        enqueued_at.elapsed().as_millis(),
        description
    );
    let result = tokio::task::spawn_blocking(move || action(transport.as_ref())).await;
    let packet_id = match result {
        Ok(Ok(id)) => {
            metrics::inc_jobs_sent();
            id
        }
        Ok(Err(e)) => {
            metrics::inc_jobs_failed();
            error!("Radio send failed ({}): {}", description, e);
            return;
        }
        Err(e) => {
            metrics::inc_jobs_failed();
            error!("Radio send task aborted ({}): {}", description, e);
            return;
        }
    };
    if let (Some(id), Some(hint), Some(store)) = (packet_id, mapping, shared.store.as_ref()) {
        let row = MessageMapping {
            mesh_id: Some(id),
            event_id: hint.event_id,
            room_id: hint.room_id,
            text: hint.text,
            meshnet: hint.meshnet,
        };
        if let Err(e) = store.store_message_map(&row) {
            error!("Failed to store message map for packet {}: {}", id, e);
            return;
        }
        if shared.msgs_to_keep > 0 {
            if let Err(e) = store.prune_message_map(shared.msgs_to_keep) {
                error!("Failed to prune message map: {}", e);
            }
        }
    }
}
