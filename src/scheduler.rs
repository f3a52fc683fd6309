//! Deferred job queue
//!
//! Effects built with [`EffectBuilder::queued`](crate::EffectBuilder::queued)
//! don't re-run when their sources change; they enqueue a [`Job`] instead.
//! The queue is flushed at the next [`tick`], which runs every pending job
//! once, in ascending id order (`pre` jobs first at equal id, id-less jobs
//! last). Enqueueing a job that is already pending is a no-op, so any number
//! of writes within one tick cost one run.
//!
//! After the main queue drains, post-flush callbacks run (deduplicated,
//! ordered by id), then [`next_tick`] callbacks. The cycle repeats until
//! nothing is pending.
//!
//! ## Runaway recursion
//!
//! A job that keeps re-queueing itself (typically an effect writing state it
//! reads, built with `allow_recurse`) is allowed [`SchedulerConfig::recursion_limit`]
//! re-entries per flush. Past that it is dropped for the rest of the flush and
//! reported as [`Error::RecursionLimit`] in the [`FlushReport`].
//!
//! ```ignore
//! let count = Observable::new(0);
//! let effect = Effect::builder({
//!     let count = count.clone();
//!     move || println!("{}", count.get())
//! })
//! .queued(JobOptions { id: Some(1), ..JobOptions::default() })
//! .build();
//!
//! count.set(1);
//! count.set(2);
//! let report = scheduler::tick(); // prints "2" once
//! assert_eq!(report.jobs_run, 1);
//! ```

use crate::error::Error;
use crate::hash::FastHashMap;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Re-entries a job gets within one flush before it is dropped.
pub const DEFAULT_RECURSION_LIMIT: usize = 100;

/// Default tick window of the [`EventLoop`](crate::EventLoop).
pub const DEFAULT_TICK: Duration = Duration::from_millis(4);

/// Longest the [`EventLoop`](crate::EventLoop) defers a flush while tasks
/// keep arriving.
pub const DEFAULT_MAX_TICK: Duration = Duration::from_millis(16);

/// Scheduler settings, installed per thread with [`configure`].
///
/// Deserializes from JSON with every field optional:
///
/// ```ignore
/// let config = SchedulerConfig::from_json(r#"{"recursion_limit": 20}"#)?;
/// scheduler::configure(config);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Re-entries of one job allowed within one flush.
    pub recursion_limit: usize,
    /// Quiet period after a task before the event loop flushes, in ms.
    pub tick_ms: u64,
    /// Longest the event loop waits for the queue to go quiet, in ms.
    pub max_tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            tick_ms: DEFAULT_TICK.as_millis() as u64,
            max_tick_ms: DEFAULT_MAX_TICK.as_millis() as u64,
        }
    }
}

impl SchedulerConfig {
    /// Parse a config, defaulting missing fields.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the recursion limit.
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Set the tick window.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_ms = tick.as_millis() as u64;
        self
    }

    /// Set the maximum tick window.
    pub fn with_max_tick(mut self, max_tick: Duration) -> Self {
        self.max_tick_ms = max_tick.as_millis() as u64;
        self
    }

    /// The tick window.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// The maximum tick window, never shorter than the tick window.
    pub fn max_tick(&self) -> Duration {
        Duration::from_millis(self.max_tick_ms.max(self.tick_ms))
    }
}

/// Options for a [`Job`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Sort key within a flush; `None` runs after every numbered job.
    pub id: Option<u64>,
    /// Run before non-`pre` jobs with the same id, and from
    /// [`flush_pre_flush_cbs`].
    pub pre: bool,
    /// Allow the job to re-queue itself while it is running.
    pub allow_recurse: bool,
}

struct JobInner {
    options: JobOptions,
    active: Cell<bool>,
    run: RefCell<Box<dyn FnMut()>>,
}

/// A unit of deferred work
///
/// Cloning shares the job; equality is identity, so a job is pending at most
/// once no matter how many clones are queued.
#[derive(Clone)]
pub struct Job(Rc<JobInner>);

impl Job {
    /// An id-less job.
    pub fn new(run: impl FnMut() + 'static) -> Self {
        Self::with_options(JobOptions::default(), run)
    }

    /// A job with explicit ordering options.
    pub fn with_options(options: JobOptions, run: impl FnMut() + 'static) -> Self {
        Job(Rc::new(JobInner {
            options,
            active: Cell::new(true),
            run: RefCell::new(Box::new(run)),
        }))
    }

    /// The job's sort key.
    pub fn id(&self) -> Option<u64> {
        self.0.options.id
    }

    /// Whether this is a `pre` job.
    pub fn is_pre(&self) -> bool {
        self.0.options.pre
    }

    /// Whether the job may re-queue itself while running.
    pub fn allow_recurse(&self) -> bool {
        self.0.options.allow_recurse
    }

    /// Inactive jobs stay queued but are skipped by the flush.
    pub fn is_active(&self) -> bool {
        self.0.active.get()
    }

    /// Mark the job inactive. Owning effects do this when stopped.
    pub fn deactivate(&self) {
        self.0.active.set(false);
    }

    /// Human readable name used in diagnostics.
    pub fn describe(&self) -> String {
        match self.id() {
            Some(id) if self.is_pre() => format!("pre job {id}"),
            Some(id) => format!("job {id}"),
            None => "anonymous job".to_owned(),
        }
    }

    fn flush_order(&self) -> (bool, Option<u64>, bool) {
        (self.id().is_none(), self.id(), !self.is_pre())
    }

    fn invoke(&self) {
        match self.0.run.try_borrow_mut() {
            Ok(mut run) => (*run)(),
            Err(_) => debug!(job = %self.describe(), "job is already running, skipped"),
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("options", &self.0.options)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Outcome of a flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Queued (and pre-flush) jobs that ran.
    pub jobs_run: usize,
    /// Post-flush callbacks that ran.
    pub post_flush_run: usize,
    /// Jobs dropped for exceeding the recursion limit.
    pub errors: Vec<Error>,
}

impl FlushReport {
    /// Whether nothing was dropped.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(&mut self, other: FlushReport) {
        self.jobs_run += other.jobs_run;
        self.post_flush_run += other.post_flush_run;
        self.errors.extend(other.errors);
    }
}

#[derive(Default)]
struct Queue {
    jobs: Vec<Job>,
    flush_index: usize,
    flushing: bool,
    flush_pending: bool,
    pending_post: Vec<Job>,
    active_post: Option<Vec<Job>>,
    post_flush_index: usize,
    next_tick: Vec<Box<dyn FnOnce()>>,
}

thread_local! {
    static QUEUE: RefCell<Queue> = RefCell::new(Queue::default());
    static CONFIG: RefCell<SchedulerConfig> = RefCell::new(SchedulerConfig::default());
}

/// Install the scheduler settings for the current thread.
pub fn configure(config: SchedulerConfig) {
    debug!(?config, "scheduler configured");
    CONFIG.with_borrow_mut(|current| *current = config);
}

/// The scheduler settings of the current thread.
pub fn config() -> SchedulerConfig {
    CONFIG.with_borrow(SchedulerConfig::clone)
}

fn request_flush() {
    QUEUE.with_borrow_mut(|queue| {
        if !queue.flushing && !queue.flush_pending {
            trace!("flush requested");
            queue.flush_pending = true;
        }
    });
}

/// Enqueue `job` for the next flush unless it is already pending.
pub fn queue_job(job: &Job) {
    let queued = QUEUE.with_borrow_mut(|queue| {
        // While flushing, a recursive job may queue another run of itself.
        let dedup_from = if queue.flushing && job.allow_recurse() {
            queue.flush_index + 1
        } else {
            queue.flush_index
        };
        if queue.jobs.get(dedup_from..).unwrap_or(&[]).contains(job) {
            return false;
        }
        match job.id() {
            None => queue.jobs.push(job.clone()),
            Some(id) => {
                let start = if queue.flushing {
                    queue.flush_index + 1
                } else {
                    0
                };
                let index = insertion_index(&queue.jobs, start, id);
                queue.jobs.insert(index, job.clone());
            }
        }
        true
    });
    if queued {
        trace!(job = %job.describe(), "job queued");
        request_flush();
    } else {
        cov_mark::hit!(job_deduplicated);
    }
}

/// Binary search in `jobs[start..]` keeping ascending id order with `pre`
/// jobs ahead of regular ones at equal id and id-less jobs last.
fn insertion_index(jobs: &[Job], start: usize, id: u64) -> usize {
    let key = (false, Some(id));
    let mut start = start.min(jobs.len());
    let mut end = jobs.len();
    while start < end {
        let middle = start + (end - start) / 2;
        let job = &jobs[middle];
        let middle_key = (job.id().is_none(), job.id());
        if middle_key < key || (middle_key == key && job.is_pre()) {
            start = middle + 1;
        } else {
            end = middle;
        }
    }
    start
}

/// Remove a pending job. A job the running flush has already reached is left
/// alone. Returns whether the job was removed.
pub fn cancel_job(job: &Job) -> bool {
    QUEUE.with_borrow_mut(|queue| {
        let from = if queue.flushing {
            queue.flush_index + 1
        } else {
            0
        };
        let Some(offset) = queue
            .jobs
            .get(from..)
            .and_then(|pending| pending.iter().position(|queued| queued == job))
        else {
            return false;
        };
        queue.jobs.remove(from + offset);
        true
    })
}

/// Whether `job` is waiting in the queue.
pub fn is_pending(job: &Job) -> bool {
    QUEUE.with_borrow(|queue| {
        let from = if queue.flushing {
            queue.flush_index + 1
        } else {
            0
        };
        queue.jobs.get(from..).unwrap_or(&[]).contains(job)
    })
}

/// Schedule a callback to run after the main queue of the next flush.
pub fn queue_post_flush_cb(job: Job) {
    QUEUE.with_borrow_mut(|queue| {
        let running = queue.active_post.as_ref().is_some_and(|active| {
            let from = queue.post_flush_index + usize::from(job.allow_recurse());
            active.get(from..).unwrap_or(&[]).contains(&job)
        });
        if !running {
            queue.pending_post.push(job);
        }
    });
    request_flush();
}

/// Run a callback once the next flush has finished.
pub fn next_tick(callback: impl FnOnce() + 'static) {
    QUEUE.with_borrow_mut(|queue| queue.next_tick.push(Box::new(callback)));
    request_flush();
}

/// Whether a flush has been requested and not yet run.
pub fn is_flush_pending() -> bool {
    QUEUE.with_borrow(|queue| queue.flush_pending || !queue.next_tick.is_empty())
}

/// Whether a flush is running on this thread.
pub fn is_flushing() -> bool {
    QUEUE.with_borrow(|queue| queue.flushing)
}

/// Run the pending `pre` jobs right away, ahead of the flush.
///
/// With an `instance` id only `pre` jobs carrying that id run. While a flush
/// is running, only jobs behind the flush cursor are considered.
pub fn flush_pre_flush_cbs(instance: Option<u64>) -> FlushReport {
    let mut report = FlushReport::default();
    let mut seen = Seen::default();
    let mut index = QUEUE.with_borrow(|queue| {
        if queue.flushing {
            queue.flush_index + 1
        } else {
            0
        }
    });
    loop {
        let next = QUEUE.with_borrow_mut(|queue| {
            let offset = queue.jobs.get(index..)?.iter().position(|job| {
                job.is_pre() && instance.is_none_or(|instance| job.id() == Some(instance))
            })?;
            index += offset;
            Some(queue.jobs.remove(index))
        });
        let Some(job) = next else {
            break;
        };
        if !job.is_active() {
            continue;
        }
        match seen.enter(&job) {
            Ok(()) => {
                job.invoke();
                report.jobs_run += 1;
            }
            Err(err) => report.errors.push(err),
        }
    }
    report
}

/// The tick boundary: run the pending flush, if any.
pub fn tick() -> FlushReport {
    if is_flush_pending() {
        flush_jobs()
    } else {
        FlushReport::default()
    }
}

/// Flush the queue now: jobs, then post-flush callbacks, then next-tick
/// callbacks, until nothing is pending.
///
/// Calling this from inside a running flush does nothing.
pub fn flush_jobs() -> FlushReport {
    let mut report = FlushReport::default();
    loop {
        let Some(round) = flush_round() else {
            cov_mark::hit!(flush_reentered);
            return report;
        };
        report.merge(round);

        let callbacks = QUEUE.with_borrow_mut(|queue| std::mem::take(&mut queue.next_tick));
        if callbacks.is_empty() && !is_flush_pending() {
            break;
        }
        for callback in callbacks {
            callback();
        }
    }
    debug!(
        jobs = report.jobs_run,
        post_flush = report.post_flush_run,
        errors = report.errors.len(),
        "flush finished"
    );
    report
}

/// Re-entry counts per job within one flush.
#[derive(Default)]
struct Seen(FastHashMap<Job, usize>);

impl Seen {
    fn enter(&mut self, job: &Job) -> crate::Result<()> {
        let limit = config().recursion_limit;
        let count = self.0.entry(job.clone()).or_insert(0);
        if *count > limit {
            error!(
                job = %job.describe(),
                limit,
                "maximum recursive updates exceeded, the job keeps triggering itself"
            );
            return Err(Error::RecursionLimit {
                job: job.describe(),
                limit,
            });
        }
        *count += 1;
        Ok(())
    }
}

/// Resets the queue when a flush round ends, including by a panicking job.
struct FlushGuard;

impl FlushGuard {
    fn begin() -> Option<Self> {
        QUEUE.with_borrow_mut(|queue| {
            if queue.flushing {
                return None;
            }
            queue.flush_pending = false;
            queue.flushing = true;
            Some(FlushGuard)
        })
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        let panicking = std::thread::panicking();
        QUEUE.with_borrow_mut(|queue| {
            queue.flushing = false;
            queue.flush_index = 0;
            queue.post_flush_index = 0;
            queue.active_post = None;
            if panicking {
                queue.jobs.clear();
                queue.pending_post.clear();
                queue.flush_pending = false;
            }
        });
    }
}

/// Run the queue and the post-flush callbacks until both are empty.
fn flush_round() -> Option<FlushReport> {
    let _guard = FlushGuard::begin()?;
    let mut report = FlushReport::default();
    let mut seen = Seen::default();
    loop {
        run_queue(&mut seen, &mut report);
        run_post_flush(&mut seen, &mut report);
        let idle = QUEUE.with_borrow(|queue| queue.jobs.is_empty() && queue.pending_post.is_empty());
        if idle {
            break;
        }
    }
    Some(report)
}

fn run_queue(seen: &mut Seen, report: &mut FlushReport) {
    let len = QUEUE.with_borrow_mut(|queue| {
        queue.flush_index = 0;
        queue.jobs.sort_by_key(Job::flush_order);
        queue.jobs.len()
    });
    if len != 0 {
        debug!(jobs = len, "flushing job queue");
    }
    loop {
        let job = QUEUE.with_borrow(|queue| queue.jobs.get(queue.flush_index).cloned());
        let Some(job) = job else {
            break;
        };
        if job.is_active() {
            match seen.enter(&job) {
                Ok(()) => {
                    job.invoke();
                    report.jobs_run += 1;
                }
                Err(err) => report.errors.push(err),
            }
        } else {
            cov_mark::hit!(inactive_job_skipped);
        }
        QUEUE.with_borrow_mut(|queue| queue.flush_index += 1);
    }
    QUEUE.with_borrow_mut(|queue| {
        queue.flush_index = 0;
        queue.jobs.clear();
    });
}

fn run_post_flush(seen: &mut Seen, report: &mut FlushReport) {
    let started = QUEUE.with_borrow_mut(|queue| {
        if queue.pending_post.is_empty() {
            return false;
        }
        let mut callbacks: Vec<Job> = Vec::with_capacity(queue.pending_post.len());
        for job in queue.pending_post.drain(..) {
            if !callbacks.contains(&job) {
                callbacks.push(job);
            }
        }
        callbacks.sort_by_key(|job| (job.id().is_none(), job.id()));
        queue.active_post = Some(callbacks);
        queue.post_flush_index = 0;
        true
    });
    if !started {
        return;
    }
    loop {
        let job = QUEUE.with_borrow(|queue| {
            queue
                .active_post
                .as_ref()
                .and_then(|active| active.get(queue.post_flush_index))
                .cloned()
        });
        let Some(job) = job else {
            break;
        };
        match seen.enter(&job) {
            Ok(()) if job.is_active() => {
                job.invoke();
                report.post_flush_run += 1;
            }
            Ok(()) => {}
            Err(err) => report.errors.push(err),
        }
        QUEUE.with_borrow_mut(|queue| queue.post_flush_index += 1);
    }
    QUEUE.with_borrow_mut(|queue| {
        queue.active_post = None;
        queue.post_flush_index = 0;
    });
}
