//! Event loop driving the scheduler on a dedicated thread
//!
//! Reactive state is thread-confined, so the loop owns it: the state is
//! built on the loop thread by an init closure, and other threads change it
//! by posting tasks. Each task runs against `&mut S`; the writes it makes
//! queue jobs as usual.
//!
//! The flush is debounced like a frame tick: after a task arrives the loop
//! keeps accepting tasks until the queue has been quiet for `tick`, or
//! `max_tick` has passed since the first one, then flushes the scheduler
//! once. A burst of posted writes therefore costs one flush.
//!
//! ## Usage
//!
//! ```ignore
//! struct App {
//!     state: ReactiveRecord,
//!     _binding: Effect,
//! }
//!
//! let handle = EventLoop::new()
//!     .tick(Duration::from_millis(2))
//!     .name("ui-state")
//!     .spawn(|| {
//!         let state = ReactiveRecord::new();
//!         let _binding = bind_host(&state, host, 1);
//!         App { state, _binding }
//!     })?;
//!
//! handle.post(|app| app.state.set("title", "hello").unwrap())?;
//! handle.join()?;
//! ```
//!
//! Without a loop (tests, single-threaded hosts) call
//! [`tick`](crate::scheduler::tick) directly.

use crate::error::{Error, Result};
use crate::scheduler::{self, SchedulerConfig};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Builder for the scheduler-driving thread.
///
/// Defaults come from [`SchedulerConfig::default`]: a 4ms tick and a 16ms
/// maximum tick.
pub struct EventLoop {
    config: SchedulerConfig,
    name: String,
    stack_size: Option<usize>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// A builder with default settings.
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            name: "reactive-loop".to_owned(),
            stack_size: None,
        }
    }

    /// Scheduler settings installed on the loop thread. Replaces any tick
    /// set before.
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Quiet period before a flush.
    ///
    /// Each task arriving within the period restarts it, up to `max_tick`.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.config = self.config.with_tick(tick);
        self
    }

    /// Longest a flush is deferred while tasks keep arriving.
    pub fn max_tick(mut self, max_tick: Duration) -> Self {
        self.config = self.config.with_max_tick(max_tick);
        self
    }

    /// Thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Thread stack size in bytes.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Spawn the loop thread; `init` builds the state it owns.
    pub fn spawn<S, I>(self, init: I) -> Result<LoopHandle<S>>
    where
        S: 'static,
        I: FnOnce() -> S + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Task<S>>();
        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let config = self.config;
        let handle = builder.spawn(move || {
            let tick = config.tick();
            let max_tick = config.max_tick();
            scheduler::configure(config);
            let mut state = init();
            run_loop(&rx, &mut state, tick, max_tick);
            // Tasks posted right before the handle closed still get flushed
            flush();
        })?;
        debug!(name = %self.name, "event loop spawned");
        Ok(LoopHandle {
            sender: tx,
            thread: handle,
        })
    }
}

/// Handle to a running [`EventLoop`].
///
/// Dropping the handle closes the loop once the tasks already posted have
/// run; [`join`](Self::join) does the same and waits for it.
pub struct LoopHandle<S> {
    sender: Sender<Task<S>>,
    thread: JoinHandle<()>,
}

impl<S: 'static> LoopHandle<S> {
    /// Run `task` on the loop thread.
    ///
    /// Fails with [`Error::LoopClosed`] once the thread has exited.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender
            .send(Box::new(task))
            .map_err(|_| Error::LoopClosed)
    }

    /// Close the loop and wait for the thread.
    ///
    /// Fails with [`Error::LoopClosed`] if the thread died before finishing,
    /// e.g. because building the state panicked.
    pub fn join(self) -> Result<()> {
        drop(self.sender);
        self.thread.join().map_err(|_| Error::LoopClosed)
    }
}

fn run_loop<S>(rx: &Receiver<Task<S>>, state: &mut S, tick: Duration, max_tick: Duration) {
    // Blocks without spinning while there is nothing to do
    while let Ok(task) = rx.recv() {
        run_task(state, task);

        let window = Instant::now();
        loop {
            let elapsed = window.elapsed();
            if elapsed >= max_tick {
                break;
            }
            match rx.recv_timeout(tick.min(max_tick - elapsed)) {
                Ok(task) => run_task(state, task),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        loop {
            match rx.try_recv() {
                Ok(task) => run_task(state, task),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        flush();
    }
}

fn run_task<S>(state: &mut S, task: Task<S>) {
    if catch_unwind(AssertUnwindSafe(|| task(state))).is_err() {
        error!("event loop task panicked");
    }
}

fn flush() {
    match catch_unwind(scheduler::tick) {
        Ok(report) => {
            for err in &report.errors {
                error!(%err, "flush dropped a job");
            }
        }
        Err(_) => error!("job panicked during flush, remaining queue discarded"),
    }
}
