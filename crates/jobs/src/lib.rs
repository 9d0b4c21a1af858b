//! # Job registry
//!
//! In-memory store of per-job status, progress and results, with a fan-out
//! subscription channel per job. Subscribers get a deep-copied snapshot on
//! subscribe and after every mutation; broadcasts are non-blocking
//! best-effort: a subscriber whose buffer is full simply misses that
//! snapshot. A background janitor removes completed jobs that nobody is
//! watching anymore.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of each subscriber's snapshot channel.
const SUBSCRIBER_BUFFER: usize = 10;

/// How long a completed job lingers before the janitor may collect it.
const COMPLETED_TTL: Duration = Duration::from_secs(5 * 60);

/// How often the janitor sweeps.
const JANITOR_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }
}

/// One tracked job. Snapshots handed to subscribers never carry `results`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub status: JobStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,
    pub progress: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub operation: String,
    #[serde(skip)]
    pub results: Option<serde_json::Value>,
    #[serde(skip)]
    pub completed_at: Option<Instant>,
}

impl Job {
    fn new() -> Self {
        Self {
            status: JobStatus::Pending,
            message: "Job created".to_string(),
            data: None,
            progress: 0,
            operation: String::new(),
            results: None,
            completed_at: None,
        }
    }

    /// Deep copy without the opaque results payload.
    fn snapshot(&self) -> Job {
        Job {
            results: None,
            completed_at: None,
            ..self.clone()
        }
    }
}

struct Subscriber {
    token: u64,
    tx: mpsc::Sender<Job>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    watchers: HashMap<String, Vec<Subscriber>>,
    next_token: u64,
}

/// Concurrent job store. All operations take the single internal mutex; none
/// of them block on subscribers.
pub struct JobStore {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl JobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            ttl: COMPLETED_TTL,
        })
    }

    /// Store with a custom completed-job TTL (used by tests).
    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            ttl,
        })
    }

    /// Spawns the background janitor; returns its task handle.
    pub fn start_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }

    /// Inserts a new job in `pending`.
    pub fn create(&self, id: &str) {
        let mut inner = self.inner.lock().expect("job store poisoned");
        inner.jobs.insert(id.to_string(), Job::new());
        inner.watchers.entry(id.to_string()).or_default();
    }

    /// Full snapshot of a job, results included.
    pub fn get(&self, id: &str) -> Option<Job> {
        let inner = self.inner.lock().expect("job store poisoned");
        inner.jobs.get(id).cloned()
    }

    pub fn exists(&self, id: &str) -> bool {
        let inner = self.inner.lock().expect("job store poisoned");
        inner.jobs.contains_key(id)
    }

    /// Updates status and message, stamping `completed_at` on the first
    /// transition into a terminal status, then broadcasts.
    pub fn update(
        &self,
        id: &str,
        status: JobStatus,
        message: &str,
        data: Option<HashMap<String, String>>,
    ) {
        let mut inner = self.inner.lock().expect("job store poisoned");
        if let Some(job) = inner.jobs.get_mut(id) {
            job.status = status;
            job.message = message.to_string();
            if data.is_some() {
                job.data = data;
            }
            if status.is_terminal() && job.completed_at.is_none() {
                job.completed_at = Some(Instant::now());
            }
            broadcast_locked(&mut inner, id);
        }
    }

    /// Like [`update`](Self::update), also setting the operation label.
    pub fn update_with_operation(
        &self,
        id: &str,
        status: JobStatus,
        message: &str,
        data: Option<HashMap<String, String>>,
        operation: &str,
    ) {
        let mut inner = self.inner.lock().expect("job store poisoned");
        if let Some(job) = inner.jobs.get_mut(id) {
            job.status = status;
            job.message = message.to_string();
            if data.is_some() {
                job.data = data;
            }
            job.operation = operation.to_string();
            if status.is_terminal() && job.completed_at.is_none() {
                job.completed_at = Some(Instant::now());
            }
            broadcast_locked(&mut inner, id);
        }
    }

    /// Sets progress, clamped to `[0, 100]`, and broadcasts.
    pub fn update_progress(&self, id: &str, progress: i32) {
        let progress = progress.clamp(0, 100);
        let mut inner = self.inner.lock().expect("job store poisoned");
        if let Some(job) = inner.jobs.get_mut(id) {
            job.progress = progress;
            broadcast_locked(&mut inner, id);
        }
    }

    /// Attaches the opaque results payload. Does not broadcast.
    pub fn set_results(&self, id: &str, results: serde_json::Value) {
        let mut inner = self.inner.lock().expect("job store poisoned");
        if let Some(job) = inner.jobs.get_mut(id) {
            job.results = Some(results);
        }
    }

    /// Registers a subscriber for a job's snapshots.
    ///
    /// If the job exists, a snapshot of its current state is pushed
    /// immediately. The returned [`Subscription`] unregisters the channel on
    /// drop; subscribers must also tolerate the channel closing at any time
    /// (job cleanup).
    pub fn subscribe(self: &Arc<Self>, id: &str) -> (mpsc::Receiver<Job>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let token = {
            let mut inner = self.inner.lock().expect("job store poisoned");
            inner.next_token += 1;
            let token = inner.next_token;
            let snapshot = inner.jobs.get(id).map(Job::snapshot);
            inner
                .watchers
                .entry(id.to_string())
                .or_default()
                .push(Subscriber {
                    token,
                    tx: tx.clone(),
                });
            if let Some(snapshot) = snapshot {
                let _ = tx.try_send(snapshot);
            }
            token
        };

        let subscription = Subscription {
            store: Arc::clone(self),
            id: id.to_string(),
            token,
        };
        (rx, subscription)
    }

    /// Drops a job and closes all of its subscriber channels.
    pub fn cleanup(&self, id: &str) {
        let mut inner = self.inner.lock().expect("job store poisoned");
        inner.watchers.remove(id);
        inner.jobs.remove(id);
    }

    /// Removes jobs whose completion is older than the TTL and which have no
    /// subscribers at the moment of decision.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().expect("job store poisoned");
        let ttl = self.ttl;
        let expired: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(id, job)| {
                job.completed_at
                    .map(|at| at.elapsed() > ttl)
                    .unwrap_or(false)
                    && inner.watchers.get(id.as_str()).map(Vec::len).unwrap_or(0) == 0
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            debug!(job = %id, "janitor removing expired job");
            inner.jobs.remove(&id);
            inner.watchers.remove(&id);
        }
    }

    fn unsubscribe(&self, id: &str, token: u64) {
        let mut inner = self.inner.lock().expect("job store poisoned");
        if let Some(watchers) = inner.watchers.get_mut(id) {
            watchers.retain(|s| s.token != token);
        }
    }
}

/// RAII handle that unregisters a subscriber when dropped.
pub struct Subscription {
    store: Arc<JobStore>,
    id: String,
    token: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.unsubscribe(&self.id, self.token);
    }
}

fn broadcast_locked(inner: &mut Inner, id: &str) {
    let snapshot = match inner.jobs.get(id) {
        Some(job) => job.snapshot(),
        None => return,
    };
    if let Some(watchers) = inner.watchers.get(id) {
        for subscriber in watchers {
            // Best-effort: a full buffer drops this snapshot for that
            // subscriber rather than blocking the store.
            let _ = subscriber.tx.try_send(snapshot.clone());
        }
    }
}
