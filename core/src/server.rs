//! Connection Server.
//!
//! Loopback TCP, one worker thread per accepted connection, one
//! request/response per connection. `SO_REUSEADDR` is deliberately left off
//! so a second `start()` against a port still held by a lingering listener
//! surfaces as `AddressInUse` immediately rather than silently stealing the
//! socket.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, Stepper, DEFAULT_JOB_TIMEOUT};
use crate::error::CoreError;
use crate::proto::{read_frame, write_frame, CommandResponse};
use crate::registry::CommandRegistry;
use crate::host::HostRuntime;

/// Listen backlog. Deliberately small: this server never expects more than a
/// handful of concurrent short-lived clients.
const LISTEN_BACKLOG: i32 = 5;
/// Default grace period `stop()` waits for in-flight connections to finish
/// before reporting the server `Stopped`.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How often the shutdown watcher polls `HostRuntime::shutdown_requested`.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Draining,
}

struct RunningHandle {
    listener_addr: SocketAddr,
    accept_thread: std::thread::JoinHandle<()>,
    /// Every accepted connection's socket, weakly held so a connection that
    /// finishes normally just lets its entry go stale. `stop()` upgrades and
    /// force-closes whatever is still alive once the grace period elapses.
    connections: Arc<Mutex<Vec<Weak<TcpStream>>>>,
}

/// Everything a running or stopped server needs, shared (via the outer
/// [`Server`]'s `Arc`) with the background threads it spawns — the accept
/// loop and the shutdown watcher — so those threads can outlive the call to
/// `start()` that spawned them.
struct Inner {
    dispatcher: Arc<Dispatcher>,
    stepper: Arc<dyn Stepper>,
    host: Arc<dyn HostRuntime>,
    state: Mutex<ServerState>,
    running: Mutex<Option<RunningHandle>>,
    active_connections: Arc<AtomicUsize>,
    job_timeout: Duration,
    grace_period: Duration,
    configured_port: Mutex<Option<u16>>,
}

/// The connection server. Owns the listener lifecycle and hands each
/// accepted connection's single request to the shared [`Dispatcher`]. Cheap
/// to clone — every clone shares the same underlying listener/dispatcher —
/// which is what lets the shutdown watcher thread hold its own handle.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(registry: CommandRegistry, host: Arc<dyn HostRuntime>, stepper: Arc<dyn Stepper>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), host.clone()));
        Server {
            inner: Arc::new(Inner {
                dispatcher,
                stepper,
                host,
                state: Mutex::new(ServerState::Stopped),
                running: Mutex::new(None),
                active_connections: Arc::new(AtomicUsize::new(0)),
                job_timeout: DEFAULT_JOB_TIMEOUT,
                grace_period: DEFAULT_GRACE_PERIOD,
                configured_port: Mutex::new(None),
            }),
        }
    }

    /// Must be called before the server is shared (i.e. before `start()`),
    /// while this is still the only handle to its `Inner`.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_grace_period must be called before the server is started or cloned")
            .grace_period = grace_period;
        self
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.lock().unwrap()
    }

    /// Record the port this server should bind on its next `start()`. Purely
    /// advisory bookkeeping for an embedder's own config layer — `start()`
    /// still takes the bind address explicitly — but the mutability rule
    /// from spec.md §3 (port is only mutable while `Stopped`) is enforced
    /// here: changing it while `Running`/`Starting`/`Draining` is rejected.
    pub fn set_port(&self, port: u16) -> Result<(), CoreError> {
        if *self.inner.state.lock().unwrap() != ServerState::Stopped {
            return Err(CoreError::BusyState);
        }
        *self.inner.configured_port.lock().unwrap() = Some(port);
        Ok(())
    }

    pub fn configured_port(&self) -> Option<u16> {
        *self.inner.configured_port.lock().unwrap()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().unwrap().as_ref().map(|r| r.listener_addr)
    }

    /// Bind to `addr` (port 0 picks an ephemeral port) and begin accepting.
    /// `AlreadyRunning` if not currently `Stopped`; `AddressInUse` if the
    /// port is held elsewhere; `BindFailed` for any other bind error.
    pub fn start(&self, addr: SocketAddr) -> Result<SocketAddr, CoreError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ServerState::Stopped {
                return Err(CoreError::AlreadyRunning);
            }
            *state = ServerState::Starting;
        }
        // A shutdown request from a previous run must not immediately drain
        // the server that's about to come back up.
        self.inner.host.clear_shutdown_request();

        let listener = match bind_listener(addr) {
            Ok(listener) => listener,
            Err(err) => {
                *self.inner.state.lock().unwrap() = ServerState::Stopped;
                return Err(err);
            }
        };
        let bound_addr = listener.local_addr().map_err(CoreError::Io)?;
        info!(%bound_addr, "connection server listening");

        self.inner.stepper.start(self.inner.dispatcher.clone());

        let dispatcher = self.inner.dispatcher.clone();
        let active = self.inner.active_connections.clone();
        let job_timeout = self.inner.job_timeout;
        let connections: Arc<Mutex<Vec<Weak<TcpStream>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_thread = {
            let connections = connections.clone();
            std::thread::Builder::new()
                .name("blender-mcp-accept".to_string())
                .spawn(move || accept_loop(listener, dispatcher, active, job_timeout, connections))
                .expect("failed to spawn accept thread")
        };

        *self.inner.running.lock().unwrap() = Some(RunningHandle {
            listener_addr: bound_addr,
            accept_thread,
            connections,
        });
        *self.inner.state.lock().unwrap() = ServerState::Running;

        let watcher = self.clone();
        std::thread::Builder::new()
            .name("blender-mcp-shutdown-watch".to_string())
            .spawn(move || watcher.watch_for_shutdown_request())
            .expect("failed to spawn shutdown watcher thread");

        Ok(bound_addr)
    }

    /// Poll `HostRuntime::shutdown_requested` while `Running`; the
    /// `server_shutdown` command's only effect besides its reply is setting
    /// that flag, so this is what turns it into the documented "accept,
    /// then asynchronously stop" behavior (spec.md §4.5).
    fn watch_for_shutdown_request(&self) {
        loop {
            if self.state() != ServerState::Running {
                return;
            }
            if self.inner.host.shutdown_requested() {
                info!("server_shutdown observed; draining the connection server");
                self.stop();
                return;
            }
            std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
    }

    /// Stop accepting new connections, wait up to the grace period for
    /// in-flight connections to finish, then report `Stopped`. Idempotent:
    /// calling `stop()` on an already-stopped server is a no-op.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == ServerState::Stopped {
                return;
            }
            *state = ServerState::Draining;
        }

        self.inner.stepper.stop();

        let handle = self.inner.running.lock().unwrap().take();
        let connections = handle.as_ref().map(|h| h.connections.clone());
        if let Some(handle) = handle {
            // Connecting to ourselves unblocks a thread parked in accept();
            // dropping the listener alone does not reliably interrupt a
            // blocking accept() on every platform.
            let _ = TcpStream::connect(handle.listener_addr);
            let _ = handle.accept_thread.join();
        }

        let deadline = Instant::now() + self.inner.grace_period;
        while self.inner.active_connections.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
        if self.inner.active_connections.load(Ordering::SeqCst) > 0 {
            warn!("grace period elapsed with connections still in flight; force-closing");
            if let Some(connections) = connections {
                for weak in connections.lock().unwrap().drain(..) {
                    if let Some(stream) = weak.upgrade() {
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                    }
                }
            }
        }

        *self.inner.state.lock().unwrap() = ServerState::Stopped;
        info!("connection server stopped");
    }

    pub fn restart(&self, addr: SocketAddr) -> Result<SocketAddr, CoreError> {
        self.stop();
        self.start(addr)
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, CoreError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(|e| CoreError::BindFailed(e.to_string()))?;
    // No SO_REUSEADDR: a port still held by a previous listener must fail
    // fast instead of silently binding over it.
    socket
        .set_reuse_address(false)
        .map_err(|e| CoreError::BindFailed(e.to_string()))?;
    socket.bind(&addr.into()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            CoreError::AddressInUse
        } else {
            CoreError::BindFailed(e.to_string())
        }
    })?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| CoreError::BindFailed(e.to_string()))?;
    Ok(socket.into())
}

fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    active: Arc<AtomicUsize>,
    job_timeout: Duration,
    connections: Arc<Mutex<Vec<Weak<TcpStream>>>>,
) {
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                debug!(error = %e, "accept loop exiting");
                break;
            }
        };
        connections.lock().unwrap().push(Arc::downgrade(&stream));
        active.fetch_add(1, Ordering::SeqCst);
        let dispatcher = dispatcher.clone();
        let active_for_thread = active.clone();
        std::thread::spawn(move || {
            handle_connection(stream, &dispatcher, job_timeout);
            active_for_thread.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// A client may carry `params.timeout_seconds` to override how long the
/// worker waits on the dispatcher's reply (spec.md §4.3/§9). Handlers never
/// see this field treated specially — it's just another param they ignore —
/// so no stripping is needed before dispatch.
fn request_timeout(params: &serde_json::Map<String, serde_json::Value>) -> Option<Duration> {
    params
        .get("timeout_seconds")
        .and_then(serde_json::Value::as_f64)
        .filter(|secs| *secs > 0.0)
        .map(Duration::from_secs_f64)
}

fn handle_connection(stream: Arc<TcpStream>, dispatcher: &Dispatcher, job_timeout: Duration) {
    let peer = stream.peer_addr().ok();
    if let Err(e) = stream.set_read_timeout(Some(crate::proto::DEFAULT_IO_TIMEOUT)) {
        warn!(?peer, error = %e, "failed to set read timeout");
    }
    if let Err(e) = stream.set_write_timeout(Some(crate::proto::DEFAULT_IO_TIMEOUT)) {
        warn!(?peer, error = %e, "failed to set write timeout");
    }

    let mut reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            warn!(?peer, error = %e, "failed to clone connection for reading");
            return;
        }
    };

    let request = match read_frame(&mut reader) {
        Ok(Some(req)) => req,
        Ok(None) => return,
        Err(err) => {
            let mut writer: &TcpStream = &stream;
            let _ = write_frame(&mut writer, &CommandResponse::from_core_error(&err));
            return;
        }
    };

    let response = match &request.command_type {
        // spec.md §3: an absent `type` is a defined no-op, not an error.
        None => CommandResponse::success(serde_json::Value::Null),
        Some(command_type) => {
            let timeout = request_timeout(&request.params).unwrap_or(job_timeout);
            match dispatcher.submit_blocking(command_type, request.params, timeout) {
                Ok(result) => CommandResponse::success(result),
                Err(err) => CommandResponse::from_core_error(&err),
            }
        }
    };

    let mut writer: &TcpStream = &stream;
    if let Err(e) = write_frame(&mut writer, &response) {
        debug!(?peer, error = %e, "failed to write response");
    }
    let _ = stream.shutdown(std::net::Shutdown::Write);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ExternallyDrivenStepper;
    use crate::handlers::build_registry;
    use crate::host::NativeHost;
    use serde_json::{json, Map, Value};
    use std::io::Write as _;
    use std::net::Ipv4Addr;

    #[test]
    fn request_timeout_reads_params_override() {
        let mut params = Map::new();
        params.insert("timeout_seconds".to_string(), json!(2.5));
        assert_eq!(request_timeout(&params), Some(Duration::from_secs_f64(2.5)));
    }

    #[test]
    fn request_timeout_ignores_missing_or_non_positive() {
        assert_eq!(request_timeout(&Map::new()), None);
        let mut zero = Map::new();
        zero.insert("timeout_seconds".to_string(), json!(0));
        assert_eq!(request_timeout(&zero), None);
        let mut negative = Map::new();
        negative.insert("timeout_seconds".to_string(), json!(-1));
        assert_eq!(request_timeout(&negative), None);
    }

    fn loopback_server() -> Server {
        Server::new(
            build_registry(),
            Arc::new(NativeHost::headless()),
            Arc::new(ExternallyDrivenStepper::new()),
        )
        .with_grace_period(Duration::from_millis(500))
    }

    fn any_addr() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn starts_serves_one_request_and_stops() {
        let server = loopback_server();
        let addr = server.start(any_addr()).unwrap();
        assert_eq!(server.state(), ServerState::Running);

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(br#"{"type":"get_scene_info","params":{}}"#)
            .unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("\"status\":\"success\""));

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn second_start_without_stop_is_already_running() {
        let server = loopback_server();
        let addr = server.start(any_addr()).unwrap();
        let err = server.start(addr).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRunning));
        server.stop();
    }

    #[test]
    fn starting_on_a_held_port_is_address_in_use() {
        let first = loopback_server();
        let addr = first.start(any_addr()).unwrap();

        let second = loopback_server();
        let err = second.start(addr).unwrap_err();
        assert!(matches!(err, CoreError::AddressInUse));

        first.stop();
    }

    #[test]
    fn set_port_is_rejected_while_running() {
        let server = loopback_server();
        server.start(any_addr()).unwrap();
        let err = server.set_port(7000).unwrap_err();
        assert!(matches!(err, CoreError::BusyState));
        assert_eq!(server.configured_port(), None);
        server.stop();
    }

    #[test]
    fn set_port_succeeds_while_stopped() {
        let server = loopback_server();
        server.set_port(7000).unwrap();
        assert_eq!(server.configured_port(), Some(7000));
    }

    #[test]
    fn stop_is_idempotent() {
        let server = loopback_server();
        server.start(any_addr()).unwrap();
        server.stop();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn stop_force_closes_a_connection_still_open_past_the_grace_period() {
        use crate::registry::{CommandSchema, Handler};

        struct SlowHandler {
            schema: CommandSchema,
        }

        impl Handler for SlowHandler {
            fn schema(&self) -> &CommandSchema {
                &self.schema
            }

            fn call(&self, _host: &dyn HostRuntime, _params: &Map<String, Value>) -> Result<Value, CoreError> {
                std::thread::sleep(Duration::from_secs(5));
                Ok(Value::Null)
            }
        }

        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(SlowHandler {
            schema: CommandSchema {
                name: "slow",
                description: "",
                params: vec![],
            },
        }));

        let server = Server::new(
            registry,
            Arc::new(NativeHost::headless()),
            Arc::new(ExternallyDrivenStepper::new()),
        )
        .with_grace_period(Duration::from_millis(100));
        let addr = server.start(any_addr()).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(br#"{"type":"slow","params":{}}"#).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        // Give the request time to actually reach the handler before stopping.
        std::thread::sleep(Duration::from_millis(50));

        let stop_started = Instant::now();
        server.stop();
        assert!(
            stop_started.elapsed() < Duration::from_secs(2),
            "stop() must not block for the stuck handler's full runtime"
        );
        assert_eq!(server.state(), ServerState::Stopped);

        // The force-closed socket surfaces as an immediate, empty read
        // rather than hanging until the handler eventually finishes.
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response);
        assert!(response.is_empty());
    }

    #[test]
    fn unknown_command_type_round_trips_as_wire_error() {
        let server = loopback_server();
        let addr = server.start(any_addr()).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(br#"{"type":"not_a_real_command","params":{}}"#)
            .unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("\"status\":\"error\""));
        assert!(text.contains("UnknownCommand"));

        server.stop();
    }

    #[test]
    fn absent_command_type_is_a_no_op_success() {
        let server = loopback_server();
        let addr = server.start(any_addr()).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(br#"{"params":{}}"#).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("\"status\":\"success\""));

        server.stop();
    }

    #[test]
    fn server_shutdown_drains_the_server_without_an_explicit_stop() {
        let server = loopback_server();
        let addr = server.start(any_addr()).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(br#"{"type":"server_shutdown","params":{}}"#)
            .unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8(response).unwrap().contains("\"accepted\":true"));

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.state() != ServerState::Stopped && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
