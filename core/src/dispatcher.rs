//! Main-Thread Dispatcher.
//!
//! Every handler call happens on one worker thread, in the order requests
//! were accepted, never concurrently with another handler. Connection
//! threads hand off a [`Job`] and block on its completion signal rather
//! than calling the registry directly. Two [`Stepper`] strategies decide
//! *what* drives the queue to drain: a GUI host's own UI timer
//! (`TimerDrivenStepper`), or, headless, a thread this crate owns
//! (`ExternallyDrivenStepper`).

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::CoreError;
use crate::host::HostRuntime;
use crate::registry::CommandRegistry;

/// Default per-request timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);
/// How often `ExternallyDrivenStepper`'s internal pump drains the queue.
const INTERNAL_PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// One queued command invocation plus its completion signal. The `reply`
/// sender is dropped (and the send ignored) if the submitting thread already
/// timed out waiting — handlers are not interruptible, so a slow handler
/// still runs to completion, its late reply simply going nowhere.
struct Job {
    command_type: String,
    params: Map<String, Value>,
    reply: SyncSender<Result<Value, CoreError>>,
    queued_at: Instant,
}

/// The single pending FIFO queue plus the logic to drain one entry at a
/// time. `Dispatcher` itself does not decide when draining happens — that is
/// the `Stepper`'s job.
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    host: Arc<dyn HostRuntime>,
    queue: Mutex<VecDeque<Job>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CommandRegistry>, host: Arc<dyn HostRuntime>) -> Self {
        Dispatcher {
            registry,
            host,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a command and block the calling (connection worker) thread
    /// until either a handler result arrives or `timeout` elapses.
    pub fn submit_blocking(
        &self,
        command_type: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        let (reply, rx) = sync_channel(1);
        self.queue.lock().unwrap().push_back(Job {
            command_type: command_type.to_string(),
            params,
            reply,
            queued_at: Instant::now(),
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(command_type, "dispatcher job timed out waiting for a reply");
                Err(CoreError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(CoreError::HandlerError {
                message: "dispatcher dropped the job without replying".to_string(),
                error_type: "DispatcherError".to_string(),
            }),
        }
    }

    /// Process exactly one pending job, if any. Returns `true` if a job was
    /// processed. Never called concurrently with itself — both steppers
    /// guarantee a single draining thread at a time.
    pub fn step_one(&self) -> bool {
        let job = match self.queue.lock().unwrap().pop_front() {
            Some(job) => job,
            None => return false,
        };

        debug!(
            command_type = job.command_type.as_str(),
            waited_ms = job.queued_at.elapsed().as_millis() as u64,
            "running queued command"
        );

        let registry = &self.registry;
        let host = self.host.as_ref();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            registry.dispatch(host, &job.command_type, &job.params)
        }))
        .unwrap_or_else(|panic| {
            let message = panic_message(panic);
            error!(command_type = job.command_type.as_str(), message, "handler panicked");
            Err(CoreError::HandlerError {
                message,
                error_type: "HandlerPanic".to_string(),
            })
        });

        // Ignore the send failure: it only means the submitter already timed
        // out and stopped listening.
        let _ = job.reply.send(outcome);
        true
    }

    /// Drain every job currently pending, in order. Used by both stepper
    /// strategies as their unit of work per tick.
    pub fn step_all(&self) {
        while self.step_one() {}
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

/// A strategy for deciding when [`Dispatcher::step_all`] runs.
pub trait Stepper: Send + Sync {
    /// Begin driving the dispatcher. Must be idempotent-safe to call once.
    fn start(&self, dispatcher: Arc<Dispatcher>);

    /// Stop driving the dispatcher; any already-running step completes.
    fn stop(&self);
}

/// GUI-mode strategy: registers against the host's own UI timer
/// (`HostRuntime::register_tick`) and steps once per tick. No thread of our
/// own — the host's event loop is what calls us.
pub struct TimerDrivenStepper {
    running: Arc<AtomicBool>,
}

impl TimerDrivenStepper {
    pub fn new() -> Self {
        TimerDrivenStepper {
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for TimerDrivenStepper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stepper for TimerDrivenStepper {
    fn start(&self, dispatcher: Arc<Dispatcher>) {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let host = dispatcher.host.clone();
        host.register_tick(Box::new(move || {
            if running.load(Ordering::SeqCst) {
                dispatcher.step_all();
            }
        }));
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Headless strategy: no host event loop exists to drive us, so by default
/// we own a small internal pump thread that steps the dispatcher on a short
/// interval. A real external keep-alive driver (e.g. the process that
/// launched the host application) can instead call [`Dispatcher::step_all`]
/// itself with this stepper's pump disabled via
/// [`ExternallyDrivenStepper::without_internal_pump`].
pub struct ExternallyDrivenStepper {
    running: Arc<AtomicBool>,
    internal_pump: bool,
    interval: Duration,
}

impl ExternallyDrivenStepper {
    pub fn new() -> Self {
        ExternallyDrivenStepper {
            running: Arc::new(AtomicBool::new(false)),
            internal_pump: true,
            interval: INTERNAL_PUMP_INTERVAL,
        }
    }

    /// Disable the internal pump thread; the caller is responsible for
    /// calling `Dispatcher::step_all` from its own driver loop.
    pub fn without_internal_pump(mut self) -> Self {
        self.internal_pump = false;
        self
    }
}

impl Default for ExternallyDrivenStepper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stepper for ExternallyDrivenStepper {
    fn start(&self, dispatcher: Arc<Dispatcher>) {
        self.running.store(true, Ordering::SeqCst);
        if !self.internal_pump {
            return;
        }
        let running = self.running.clone();
        let interval = self.interval;
        std::thread::Builder::new()
            .name("dispatcher-pump".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    dispatcher.step_all();
                    std::thread::sleep(interval);
                }
            })
            .expect("failed to spawn dispatcher pump thread");
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NativeHost;
    use crate::registry::{CommandSchema, Handler, ParamSchema, ParamType};
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        schema: CommandSchema,
        calls: Arc<AtomicUsize>,
    }

    impl Handler for CountingHandler {
        fn schema(&self) -> &CommandSchema {
            &self.schema
        }

        fn call(&self, _host: &dyn HostRuntime, _params: &Map<String, Value>) -> Result<Value, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    struct PanicHandler {
        schema: CommandSchema,
    }

    impl Handler for PanicHandler {
        fn schema(&self) -> &CommandSchema {
            &self.schema
        }

        fn call(&self, _host: &dyn HostRuntime, _params: &Map<String, Value>) -> Result<Value, CoreError> {
            panic!("boom");
        }
    }

    fn dispatcher_with(registry: CommandRegistry) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(registry),
            Arc::new(NativeHost::headless()),
        ))
    }

    #[test]
    fn step_one_runs_jobs_in_fifo_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(CountingHandler {
            schema: CommandSchema {
                name: "count",
                description: "",
                params: vec![],
            },
            calls: calls.clone(),
        }));
        let dispatcher = dispatcher_with(registry);

        let d1 = dispatcher.clone();
        let t1 = std::thread::spawn(move || d1.submit_blocking("count", Map::new(), Duration::from_secs(5)));

        // Give the submitter a moment to enqueue before draining.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(dispatcher.pending_len(), 1);
        dispatcher.step_all();

        t1.join().unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_blocking_times_out_when_never_stepped() {
        let registry = CommandRegistry::new();
        let dispatcher = dispatcher_with(registry);
        let err = dispatcher
            .submit_blocking("whatever", Map::new(), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout));
    }

    #[test]
    fn panicking_handler_becomes_an_error_not_a_crash() {
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(PanicHandler {
            schema: CommandSchema {
                name: "explode",
                description: "",
                params: vec![],
            },
        }));
        let dispatcher = dispatcher_with(registry);

        let d1 = dispatcher.clone();
        let handle = std::thread::spawn(move || {
            d1.submit_blocking("explode", Map::new(), Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        dispatcher.step_all();

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, CoreError::HandlerError { .. }));
    }

    /// spec.md §8's "main-thread proof": many concurrent submitters, but
    /// every handler invocation still lands on one OS thread with strictly
    /// disjoint [begin, end) intervals — never two handlers running at once.
    #[test]
    fn concurrent_submitters_still_see_single_threaded_disjoint_execution() {
        struct RecordingHandler {
            schema: CommandSchema,
            intervals: Arc<Mutex<Vec<(std::thread::ThreadId, Instant, Instant)>>>,
        }

        impl Handler for RecordingHandler {
            fn schema(&self) -> &CommandSchema {
                &self.schema
            }

            fn call(&self, _host: &dyn HostRuntime, _params: &Map<String, Value>) -> Result<Value, CoreError> {
                let begin = Instant::now();
                // A little work so overlapping calls would actually show up
                // as overlapping intervals rather than racing past each other.
                std::thread::sleep(Duration::from_micros(200));
                let end = Instant::now();
                self.intervals
                    .lock()
                    .unwrap()
                    .push((std::thread::current().id(), begin, end));
                Ok(Value::Null)
            }
        }

        let intervals = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(RecordingHandler {
            schema: CommandSchema {
                name: "record",
                description: "",
                params: vec![],
            },
            intervals: intervals.clone(),
        }));
        let dispatcher = dispatcher_with(registry);
        let stepper = ExternallyDrivenStepper::new();
        stepper.start(dispatcher.clone());

        const CONNECTIONS: usize = 10;
        const REQUESTS_PER_CONNECTION: usize = 5;
        let submitters: Vec<_> = (0..CONNECTIONS)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    for _ in 0..REQUESTS_PER_CONNECTION {
                        dispatcher
                            .submit_blocking("record", Map::new(), Duration::from_secs(5))
                            .unwrap();
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }
        stepper.stop();

        let mut recorded = intervals.lock().unwrap().clone();
        assert_eq!(recorded.len(), CONNECTIONS * REQUESTS_PER_CONNECTION);

        let distinct_threads: std::collections::HashSet<_> = recorded.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(distinct_threads.len(), 1, "every handler call must run on the same thread");

        recorded.sort_by_key(|(_, begin, _)| *begin);
        for pair in recorded.windows(2) {
            let (_, _, prev_end) = pair[0];
            let (_, next_begin, _) = pair[1];
            assert!(
                next_begin >= prev_end,
                "handler executions must never overlap: {prev_end:?} vs {next_begin:?}"
            );
        }
    }

    #[test]
    fn externally_driven_internal_pump_drains_without_manual_step() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(CountingHandler {
            schema: CommandSchema {
                name: "count",
                description: "",
                params: vec![ParamSchema::optional("x", ParamType::Any, "")],
            },
            calls: calls.clone(),
        }));
        let dispatcher = dispatcher_with(registry);
        let stepper = ExternallyDrivenStepper::new();
        stepper.start(dispatcher.clone());

        let result = dispatcher.submit_blocking("count", Map::new(), Duration::from_secs(5));
        stepper.stop();

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
