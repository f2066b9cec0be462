//! Per-connection session dispatcher.
//!
//! A [`Session`] owns one accepted connection and walks it through
//!
//! ```text
//! CONNECTING → LOGGING_IN (optional) → ENTERING → ACTIVE ⇄ DISPATCHING → EXITING → CLOSED
//! ```
//!
//! In [`Mode::Async`] the session runs three kinds of worker task next to
//! its own dispatch loop: a receive worker feeding a bounded inbound queue,
//! a send worker draining a bounded outbound queue, and one worker per
//! registered routine producer.  In [`Mode::Sync`] a single thread
//! receives, dispatches and replies in strict alternation, and routines are
//! not run.
//!
//! Control opcodes (`LOGOUT`, `EXIT`, `SHUTDOWN`) are acknowledged and end
//! the session; the reason is kept as a [`SessionEnd`] value for the
//! listener to act on.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use teleop_kernel::{Phases, RepeatingTask, StopSignal, lock_recover, shutdown_all};
use teleop_types::{Control, Direction, Envelope, TeleopError};
use tracing::{Span, debug, info, info_span, warn};
use uuid::Uuid;

use crate::codec;
use crate::queue::{BoundedQueue, DEFAULT_CAPACITY, DEFAULT_TIMEOUT};
use crate::registry::{HandlerRegistry, Hook};

const SESSION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::session");

/// How long a worker blocks on the socket or a queue before re-checking its
/// stop signal.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ────────────────────────────────────────────────────────────────────────────
// Public value types
// ────────────────────────────────────────────────────────────────────────────

/// Execution mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Separate receive and send workers plus routine producers.
    #[default]
    Async,
    /// One thread; receive, dispatch and reply alternate.
    Sync,
}

impl std::str::FromStr for Mode {
    type Err = TeleopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "async" => Ok(Mode::Async),
            "sync" => Ok(Mode::Sync),
            other => Err(TeleopError::Config(format!(
                "unknown session mode {other:?} (expected \"async\" or \"sync\")"
            ))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Async => write!(f, "async"),
            Mode::Sync => write!(f, "sync"),
        }
    }
}

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: Mode,
    /// Capacity of each of the inbound and outbound queues.
    pub queue_capacity: usize,
    /// How long an enqueue may block before it counts as an overflow.
    pub queue_timeout: Duration,
    /// Socket timeout once a frame has started arriving, and for writes.
    /// `None` waits forever.
    pub io_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Async,
            queue_capacity: DEFAULT_CAPACITY,
            queue_timeout: DEFAULT_TIMEOUT,
            io_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer sent `LOGOUT`.
    Logout,
    /// Peer sent `EXIT`; the listener should stop.
    Exit,
    /// Peer sent `SHUTDOWN`; the listener should stop and the host shut down.
    Shutdown,
    /// Peer closed the connection.
    PeerClosed,
    /// Login did not verify.
    Rejected,
    /// Closed from the outside, e.g. pre-empted by a new connection.
    Closed,
    /// A fatal fault ended the session.
    Fault(String),
}

impl SessionEnd {
    /// Whether the listener should stop accepting after this session.
    pub fn stops_listener(&self) -> bool {
        matches!(self, SessionEnd::Exit | SessionEnd::Shutdown)
    }
}

impl From<Control> for SessionEnd {
    fn from(control: Control) -> Self {
        match control {
            Control::Logout => SessionEnd::Logout,
            Control::Exit => SessionEnd::Exit,
            Control::Shutdown => SessionEnd::Shutdown,
        }
    }
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Logout => write!(f, "logout"),
            SessionEnd::Exit => write!(f, "exit"),
            SessionEnd::Shutdown => write!(f, "shutdown"),
            SessionEnd::PeerClosed => write!(f, "peer closed"),
            SessionEnd::Rejected => write!(f, "login rejected"),
            SessionEnd::Closed => write!(f, "closed"),
            SessionEnd::Fault(details) => write!(f, "fault: {details}"),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    LoggingIn,
    Entering,
    Active,
    Exiting,
    Closed,
}

/// Snapshot of a session for logs and status displays.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Local>,
    pub state: SessionState,
    pub last_cmd: Option<String>,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Client address => {} | since {} | {:?} | last CMD: {}",
            self.peer,
            self.connected_at.format("%Y-%m-%d %H:%M:%S"),
            self.state,
            self.last_cmd.as_deref().unwrap_or("-")
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

struct Shared {
    id: Uuid,
    peer: SocketAddr,
    connected_at: DateTime<Local>,
    registry: Arc<HandlerRegistry>,
    config: SessionConfig,
    writer: Mutex<TcpStream>,
    /// Unlocked handle used only to shut the socket down, so a reader or
    /// writer blocked mid-frame can be woken.
    control: TcpStream,
    inbound: BoundedQueue<Envelope>,
    outbound: BoundedQueue<Envelope>,
    state: Mutex<SessionState>,
    last_cmd: Mutex<Option<String>>,
    outcome: Mutex<Option<SessionEnd>>,
    stop: StopSignal,
    span: Span,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *lock_recover(&self.state) = state;
        debug!(target: SESSION_TARGET, ?state, "session state");
    }

    /// Record why the session ends and raise the stop signal.  The first
    /// reason wins.
    fn end(&self, outcome: SessionEnd) {
        let mut current = lock_recover(&self.outcome);
        if current.is_none() {
            *current = Some(outcome);
        }
        drop(current);
        self.stop.stop();
    }

    fn shutdown(&self, how: Shutdown) {
        if let Err(e) = self.control.shutdown(how) {
            debug!(target: SESSION_TARGET, ?how, error = %e, "socket already shut down");
        }
    }

    /// End the session because of a fatal fault.
    fn fail(&self, context: &str, err: &TeleopError) {
        if self.stop.is_stopped() {
            debug!(target: SESSION_TARGET, context, error = %err, "socket closed while stopping");
            return;
        }
        if is_disconnect(err) {
            info!(target: SESSION_TARGET, context, "peer disconnected");
            self.end(SessionEnd::PeerClosed);
        } else {
            warn!(target: SESSION_TARGET, context, error = %err, "session fault");
            self.end(SessionEnd::Fault(err.to_string()));
        }
    }

    fn send_now(&self, envelope: &Envelope) -> Result<(), TeleopError> {
        let mut writer = lock_recover(&self.writer);
        codec::send(&mut *writer, envelope)
    }

    /// Queue `envelope` for the send worker.  An outbound overflow ends the
    /// session; returns whether the envelope was queued.
    fn enqueue(&self, envelope: Envelope) -> bool {
        match self.outbound.push_timeout(envelope, self.config.queue_timeout) {
            Ok(()) => true,
            Err(dropped) => {
                let err = TeleopError::OverflowFault {
                    direction: Direction::Outbound,
                };
                warn!(target: SESSION_TARGET, cmd = %dropped.cmd(), error = %err, "peer is not draining replies");
                self.end(SessionEnd::Fault(err.to_string()));
                false
            }
        }
    }

    /// Deliver a reply the way the current mode does.
    fn reply(&self, envelope: Envelope) {
        match self.config.mode {
            Mode::Async => {
                self.enqueue(envelope);
            }
            Mode::Sync => {
                if let Err(e) = self.send_now(&envelope) {
                    self.fail("send", &e);
                }
            }
        }
    }

    /// Route one inbound envelope.
    fn dispatch(&self, envelope: &Envelope) -> Disposition {
        let cmd = envelope.cmd();
        *lock_recover(&self.last_cmd) = Some(cmd.to_string());

        if let Some(control) = Control::from_cmd(cmd) {
            info!(target: SESSION_TARGET, cmd, "control command received");
            self.reply(control.ack());
            return Disposition::End(control.into());
        }

        match self.registry.dispatch(envelope, self.peer) {
            None => {
                warn!(target: SESSION_TARGET, cmd, "no handler registered, message dropped");
            }
            Some(Ok(Some(reply))) => {
                debug!(target: SESSION_TARGET, cmd, reply = %reply.cmd(), "handled");
                self.reply(reply);
            }
            Some(Ok(None)) => {
                debug!(target: SESSION_TARGET, cmd, "handled");
            }
            Some(Err(e)) => {
                warn!(target: SESSION_TARGET, cmd, error = %e, "handler failed");
            }
        }
        Disposition::Continue
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            peer: self.peer,
            connected_at: self.connected_at,
            state: *lock_recover(&self.state),
            last_cmd: lock_recover(&self.last_cmd).clone(),
        }
    }
}

/// What the dispatch loop does after one envelope.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Continue,
    End(SessionEnd),
}

fn is_disconnect(err: &TeleopError) -> bool {
    match err {
        TeleopError::ConnectionFault { source, .. } => matches!(
            source.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

/// Wait up to `poll` for the next frame to start arriving.
///
/// `Ok(false)` when nothing arrived; the socket's read timeout is left at
/// `io_timeout` on `Ok(true)` so the frame itself is read under that bound.
fn wait_readable(
    stream: &TcpStream,
    poll: Duration,
    io_timeout: Option<Duration>,
) -> Result<bool, TeleopError> {
    stream
        .set_read_timeout(Some(poll))
        .map_err(|e| TeleopError::connection("set read timeout", e))?;
    let mut probe = [0u8; 1];
    let ready = match stream.peek(&mut probe) {
        Ok(0) => return Err(TeleopError::peer_closed("receive header")),
        Ok(_) => true,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => false,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
        Err(e) => return Err(TeleopError::connection("receive header", e)),
    };
    if ready {
        stream
            .set_read_timeout(io_timeout)
            .map_err(|e| TeleopError::connection("set read timeout", e))?;
    }
    Ok(ready)
}

/// Read the next envelope, polling so that `stop` is honoured.
///
/// `Ok(None)` when stopped or when a malformed frame was dropped.
fn next_envelope(
    reader: &mut TcpStream,
    stop: &StopSignal,
    io_timeout: Option<Duration>,
) -> Result<Option<Envelope>, TeleopError> {
    loop {
        if stop.is_stopped() {
            return Ok(None);
        }
        if wait_readable(reader, POLL_INTERVAL, io_timeout)? {
            break;
        }
    }
    match codec::receive(reader) {
        Ok(envelope) => Ok(Some(envelope)),
        Err(e) if !e.is_session_fatal() => {
            warn!(target: SESSION_TARGET, error = %e, "malformed message dropped");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Workers
// ────────────────────────────────────────────────────────────────────────────

struct RecvWorker {
    shared: Arc<Shared>,
    reader: TcpStream,
}

impl Phases for RecvWorker {
    fn on_tick(&mut self, stop: &StopSignal) {
        let _enter = self.shared.span.enter();
        match next_envelope(&mut self.reader, stop, self.shared.config.io_timeout) {
            Ok(Some(envelope)) => {
                if let Err(dropped) = self
                    .shared
                    .inbound
                    .push_timeout(envelope, self.shared.config.queue_timeout)
                {
                    let err = TeleopError::OverflowFault {
                        direction: Direction::Inbound,
                    };
                    warn!(target: SESSION_TARGET, cmd = %dropped.cmd(), error = %err, "command dropped");
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.shared.fail("receive", &e);
                stop.stop();
            }
        }
    }
}

struct SendWorker {
    shared: Arc<Shared>,
}

impl Phases for SendWorker {
    fn on_tick(&mut self, stop: &StopSignal) {
        let Some(envelope) = self.shared.outbound.pop_timeout(POLL_INTERVAL) else {
            return;
        };
        let _enter = self.shared.span.enter();
        if let Err(e) = self.shared.send_now(&envelope) {
            self.shared.fail("send", &e);
            stop.stop();
        }
    }
}

struct RoutineWorker {
    shared: Arc<Shared>,
    hook: Hook,
}

impl Phases for RoutineWorker {
    fn on_tick(&mut self, stop: &StopSignal) {
        let _enter = self.shared.span.enter();
        match self.hook.call(self.shared.peer) {
            Ok(Some(envelope)) => {
                if !self.shared.enqueue(envelope) {
                    stop.stop();
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: SESSION_TARGET, task = %thread_name(), error = %e, "routine failed, closing session");
                self.shared.end(SessionEnd::Fault(e.to_string()));
                stop.stop();
            }
        }
    }
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("routine").to_string()
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

/// The session task's phases.
struct SessionDriver {
    shared: Arc<Shared>,
    /// Read half; moved into the receive worker in async mode.
    reader: Option<TcpStream>,
    routines: Vec<RepeatingTask>,
    recv: Option<RepeatingTask>,
    send: Option<RepeatingTask>,
    entered: bool,
}

impl SessionDriver {
    fn login(&mut self, stop: &StopSignal) -> bool {
        let shared = Arc::clone(&self.shared);
        if !shared.registry.has_login() {
            return true;
        }
        shared.set_state(SessionState::LoggingIn);
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let envelope = loop {
            match next_envelope(reader, stop, shared.config.io_timeout) {
                Ok(Some(envelope)) => break envelope,
                Ok(None) if stop.is_stopped() => return false,
                Ok(None) => {}
                Err(e) => {
                    shared.fail("login", &e);
                    return false;
                }
            }
        };
        let Some(outcome) = shared.registry.login(&envelope, shared.peer) else {
            return true;
        };
        if let Err(e) = shared.send_now(&outcome.reply) {
            shared.fail("login reply", &e);
            return false;
        }
        if outcome.verified {
            info!(target: SESSION_TARGET, "login verified");
            true
        } else {
            warn!(target: SESSION_TARGET, "login rejected");
            shared.end(SessionEnd::Rejected);
            false
        }
    }

    fn enter(&mut self) {
        let shared = &self.shared;
        shared.set_state(SessionState::Entering);
        for hook in shared.registry.enter_hooks() {
            match hook.call(shared.peer) {
                Ok(Some(envelope)) => {
                    if let Err(e) = shared.send_now(&envelope) {
                        shared.fail("enter", &e);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(target: SESSION_TARGET, error = %e, "enter callback failed"),
            }
        }
        self.entered = true;
    }

    fn spawn_workers(&mut self) -> Result<(), TeleopError> {
        let shared = &self.shared;
        let Some(reader) = self.reader.take() else {
            return Err(TeleopError::TaskFault {
                name: "session".to_string(),
                details: "read half already taken".to_string(),
            });
        };
        let short = short_id(&shared.id);

        let recv = RepeatingTask::new(
            format!("recv-{short}"),
            Duration::ZERO,
            RecvWorker {
                shared: Arc::clone(shared),
                reader,
            },
        );
        recv.start()?;
        self.recv = Some(recv);

        let send = RepeatingTask::new(
            format!("send-{short}"),
            Duration::ZERO,
            SendWorker {
                shared: Arc::clone(shared),
            },
        );
        send.start()?;
        self.send = Some(send);

        for (index, hook) in shared.registry.routines().iter().enumerate() {
            let task = RepeatingTask::new(
                format!("routine{index}-{short}"),
                Duration::ZERO,
                RoutineWorker {
                    shared: Arc::clone(shared),
                    hook: hook.clone(),
                },
            );
            task.start()?;
            self.routines.push(task);
        }
        Ok(())
    }

    /// Give the send worker up to one queue timeout to flush what is left,
    /// so a control acknowledgement reaches the peer.  Returns whether the
    /// queue emptied.
    fn drain_outbound(&self) -> bool {
        match &self.send {
            Some(send) if send.is_alive() => {
                self.shared.outbound.wait_empty(self.shared.config.queue_timeout)
            }
            _ => true,
        }
    }

    fn exit(&self) {
        let shared = &self.shared;
        for hook in shared.registry.exit_hooks() {
            match hook.call(shared.peer) {
                Ok(Some(envelope)) => {
                    if let Err(e) = shared.send_now(&envelope) {
                        debug!(target: SESSION_TARGET, error = %e, "exit reply not delivered");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(target: SESSION_TARGET, error = %e, "exit callback failed"),
            }
        }
    }
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

impl Phases for SessionDriver {
    fn on_start(&mut self, stop: &StopSignal) {
        let span = self.shared.span.clone();
        let _enter = span.enter();
        info!(target: SESSION_TARGET, mode = %self.shared.config.mode, "client connected");

        if !self.login(stop) {
            stop.stop();
            return;
        }
        self.enter();
        if stop.is_stopped() {
            return;
        }
        if self.shared.config.mode == Mode::Async {
            if let Err(e) = self.spawn_workers() {
                self.shared.fail("spawn workers", &e);
                return;
            }
        }
        self.shared.set_state(SessionState::Active);
    }

    fn on_tick(&mut self, stop: &StopSignal) {
        let span = self.shared.span.clone();
        let _enter = span.enter();
        let envelope = match self.shared.config.mode {
            Mode::Async => self.shared.inbound.pop_timeout(POLL_INTERVAL),
            Mode::Sync => {
                let Some(reader) = self.reader.as_mut() else {
                    stop.stop();
                    return;
                };
                match next_envelope(reader, stop, self.shared.config.io_timeout) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        self.shared.fail("receive", &e);
                        return;
                    }
                }
            }
        };
        let Some(envelope) = envelope else {
            return;
        };
        if let Disposition::End(outcome) = self.shared.dispatch(&envelope) {
            self.shared.end(outcome);
        }
    }

    fn on_stop(&mut self) {
        let span = self.shared.span.clone();
        let _enter = span.enter();
        self.shared.set_state(SessionState::Exiting);

        // Wake a receive blocked mid-frame; the write half stays open for
        // the acknowledgement.
        self.shared.shutdown(Shutdown::Read);
        // Producers first so nothing new is queued, then let the send
        // worker flush before it is stopped.
        shutdown_all(self.routines.iter().chain(self.recv.iter()));
        if !self.drain_outbound() {
            // The peer is not reading; unblock the send worker.
            self.shared.shutdown(Shutdown::Both);
        }
        shutdown_all(self.send.iter());
        self.routines.clear();
        self.recv = None;
        self.send = None;

        if self.entered {
            self.exit();
        }

        self.shared.shutdown(Shutdown::Both);
        let dropped = self.shared.inbound.clear() + self.shared.outbound.clear();
        if dropped > 0 {
            debug!(target: SESSION_TARGET, dropped, "discarded queued messages");
        }
        self.shared.set_state(SessionState::Closed);
        let outcome = lock_recover(&self.shared.outcome)
            .get_or_insert(SessionEnd::Closed)
            .clone();
        info!(target: SESSION_TARGET, outcome = %outcome, "client disconnected");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

/// One accepted connection and the task running it.
pub struct Session {
    shared: Arc<Shared>,
    task: RepeatingTask,
}

impl Session {
    /// Prepare a session for `stream`.  Nothing runs until
    /// [`Session::start`].
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::ConnectionFault`] if the socket cannot be
    /// configured or cloned.
    pub fn new(
        stream: TcpStream,
        registry: Arc<HandlerRegistry>,
        config: SessionConfig,
    ) -> Result<Self, TeleopError> {
        let peer = stream
            .peer_addr()
            .map_err(|e| TeleopError::connection("peer address", e))?;
        stream
            .set_nonblocking(false)
            .map_err(|e| TeleopError::connection("set blocking", e))?;
        stream
            .set_write_timeout(config.io_timeout)
            .map_err(|e| TeleopError::connection("set write timeout", e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: SESSION_TARGET, error = %e, "TCP_NODELAY not set");
        }
        let writer = stream
            .try_clone()
            .map_err(|e| TeleopError::connection("clone stream", e))?;
        let control = stream
            .try_clone()
            .map_err(|e| TeleopError::connection("clone stream", e))?;

        let id = Uuid::new_v4();
        let stop = StopSignal::new();
        let span = info_span!(target: SESSION_TARGET, "session", id = %id, peer = %peer);
        let shared = Arc::new(Shared {
            id,
            peer,
            connected_at: Local::now(),
            registry,
            inbound: BoundedQueue::new(config.queue_capacity),
            outbound: BoundedQueue::new(config.queue_capacity),
            config,
            writer: Mutex::new(writer),
            control,
            state: Mutex::new(SessionState::Connecting),
            last_cmd: Mutex::new(None),
            outcome: Mutex::new(None),
            stop: stop.clone(),
            span,
        });
        let driver = SessionDriver {
            shared: Arc::clone(&shared),
            reader: Some(stream),
            routines: Vec::new(),
            recv: None,
            send: None,
            entered: false,
        };
        let task = RepeatingTask::with_stop_signal(
            format!("session-{}", short_id(&id)),
            Duration::ZERO,
            stop,
            driver,
        );
        Ok(Self { shared, task })
    }

    /// Spawn the session thread.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::TaskFault`] if the thread cannot be spawned.
    pub fn start(&self) -> Result<(), TeleopError> {
        self.task.start()
    }

    /// Ask the session to end.  Non-blocking; the reason is recorded as
    /// [`SessionEnd::Closed`] unless the session already ended.
    ///
    /// The read half is shut down at once, so a peer that stalls halfway
    /// through a frame cannot hold the session open.
    pub fn close(&self) {
        self.shared.end(SessionEnd::Closed);
        self.shared.shutdown(Shutdown::Read);
    }

    /// Wait for the session and all of its workers to finish.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::TaskFault`] if the session thread panicked.
    pub fn join(&self) -> Result<(), TeleopError> {
        self.task.join()
    }

    /// Whether the session thread is still running.
    pub fn is_alive(&self) -> bool {
        self.task.is_alive()
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Why the session ended, once it has.
    pub fn outcome(&self) -> Option<SessionEnd> {
        lock_recover(&self.shared.outcome).clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
        if let Err(e) = self.task.join() {
            warn!(target: SESSION_TARGET, error = %e, "session join failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LoginOutcome;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use teleop_types::commands;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (server, client)
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn echo_registry() -> Arc<HandlerRegistry> {
        HandlerRegistry::builder()
            .on("PING", |env| {
                Ok(Some(Envelope::new("PONG").with("N", env.get_i64("N").unwrap_or(0))))
            })
            .build()
    }

    fn sync_config() -> SessionConfig {
        SessionConfig {
            mode: Mode::Sync,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn async_session_replies_in_order() {
        let (server, mut client) = pair();
        let session = Session::new(server, echo_registry(), SessionConfig::default()).unwrap();
        session.start().unwrap();

        for n in 0..5 {
            codec::send(&mut client, &Envelope::new("PING").with("N", n)).unwrap();
        }
        for n in 0..5 {
            let reply = codec::receive(&mut client).unwrap();
            assert_eq!(reply.cmd(), "PONG");
            assert_eq!(reply.get_i64("N"), Some(n));
        }
        assert_eq!(session.status().last_cmd.as_deref(), Some("PING"));
        assert_eq!(session.status().state, SessionState::Active);
        session.close();
        session.join().unwrap();
        assert_eq!(session.outcome(), Some(SessionEnd::Closed));
    }

    #[test]
    fn unregistered_command_gets_no_reply_and_session_survives() {
        let (server, mut client) = pair();
        let session = Session::new(server, echo_registry(), SessionConfig::default()).unwrap();
        session.start().unwrap();

        codec::send(&mut client, &Envelope::new("UNKNOWN")).unwrap();
        codec::send(&mut client, &Envelope::new("PING").with("N", 7)).unwrap();
        let reply = codec::receive(&mut client).unwrap();
        assert_eq!(reply.cmd(), "PONG");
        assert_eq!(reply.get_i64("N"), Some(7));
        assert!(session.is_alive());
        assert_eq!(session.outcome(), None);
    }

    #[test]
    fn malformed_frame_is_dropped_without_closing() {
        let (server, mut client) = pair();
        let session = Session::new(server, echo_registry(), SessionConfig::default()).unwrap();
        session.start().unwrap();

        let body = b"[1,2]";
        let mut raw = (body.len() as u32).to_be_bytes().to_vec();
        raw.extend_from_slice(body);
        io::Write::write_all(&mut client, &raw).unwrap();
        codec::send(&mut client, &Envelope::new("PING")).unwrap();
        assert_eq!(codec::receive(&mut client).unwrap().cmd(), "PONG");
        assert!(session.is_alive());
    }

    #[test]
    fn failing_handler_does_not_end_session() {
        let (server, mut client) = pair();
        let registry = HandlerRegistry::builder()
            .on("BAD", |env| Err(TeleopError::handler(env.cmd(), "boom")))
            .on("PING", |_| Ok(Some(Envelope::new("PONG"))))
            .build();
        let session = Session::new(server, registry, SessionConfig::default()).unwrap();
        session.start().unwrap();
        codec::send(&mut client, &Envelope::new("BAD")).unwrap();
        codec::send(&mut client, &Envelope::new("PING")).unwrap();
        assert_eq!(codec::receive(&mut client).unwrap().cmd(), "PONG");
    }

    #[test]
    fn control_commands_are_acknowledged_and_end_the_session() {
        for (cmd, ack, end) in [
            (commands::LOGOUT, commands::SYS_LOGOUT, SessionEnd::Logout),
            (commands::EXIT, commands::SYS_EXIT, SessionEnd::Exit),
            (commands::SHUTDOWN, commands::SYS_SHUTDOWN, SessionEnd::Shutdown),
        ] {
            let (server, mut client) = pair();
            let session = Session::new(server, echo_registry(), SessionConfig::default()).unwrap();
            session.start().unwrap();
            codec::send(&mut client, &Envelope::new(cmd)).unwrap();
            assert_eq!(codec::receive(&mut client).unwrap().cmd(), ack);
            assert!(wait_until(Duration::from_secs(2), || !session.is_alive()));
            session.join().unwrap();
            assert_eq!(session.outcome(), Some(end));
            assert_eq!(session.status().state, SessionState::Closed);
        }
    }

    #[test]
    fn peer_disconnect_ends_session_and_fires_exit_hooks() {
        let exits = Arc::new(AtomicUsize::new(0));
        let e = exits.clone();
        let registry = HandlerRegistry::builder()
            .on_enter_with_peer(|peer| Ok(Some(Envelope::new("HELLO").with("PEER", peer.to_string()))))
            .on_exit(move || {
                e.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .build();
        let (server, mut client) = pair();
        let session = Session::new(server, registry, SessionConfig::default()).unwrap();
        session.start().unwrap();

        let hello = codec::receive(&mut client).unwrap();
        assert_eq!(hello.cmd(), "HELLO");
        assert_eq!(hello.get_str("PEER"), Some(client.local_addr().unwrap().to_string().as_str()));
        drop(client);

        assert!(wait_until(Duration::from_secs(2), || !session.is_alive()));
        session.join().unwrap();
        assert_eq!(session.outcome(), Some(SessionEnd::PeerClosed));
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn routines_stream_until_close_and_are_joined() {
        let running = Arc::new(AtomicUsize::new(0));
        let r = running.clone();
        let registry = HandlerRegistry::builder()
            .routine(move || {
                r.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                Ok(Some(Envelope::new("FRAME")))
            })
            .build();
        let (server, mut client) = pair();
        let session = Session::new(server, registry, SessionConfig::default()).unwrap();
        session.start().unwrap();

        for _ in 0..3 {
            assert_eq!(codec::receive(&mut client).unwrap().cmd(), "FRAME");
        }
        session.close();
        session.join().unwrap();

        let calls = running.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(running.load(Ordering::SeqCst), calls, "routine still running after join");
    }

    #[test]
    fn failing_routine_closes_the_session() {
        let registry = HandlerRegistry::builder()
            .routine(|| Err(TeleopError::HardwareFault {
                component: "camera".into(),
                details: "gone".into(),
            }))
            .build();
        let (server, _client) = pair();
        let session = Session::new(server, registry, SessionConfig::default()).unwrap();
        session.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || !session.is_alive()));
        assert!(matches!(session.outcome(), Some(SessionEnd::Fault(_))));
    }

    #[test]
    fn outbound_overflow_closes_the_session() {
        // The peer never reads, so the kernel buffers fill and the single
        // slot in the outbound queue stays occupied.
        let registry = HandlerRegistry::builder()
            .routine(|| Ok(Some(Envelope::new("FRAME").with("IMAGE", "x".repeat(64 * 1024)))))
            .build();
        let config = SessionConfig {
            queue_capacity: 1,
            queue_timeout: Duration::from_millis(20),
            io_timeout: Some(Duration::from_millis(200)),
            ..SessionConfig::default()
        };
        let (server, _client) = pair();
        let session = Session::new(server, registry, config).unwrap();
        session.start().unwrap();
        assert!(wait_until(Duration::from_secs(10), || !session.is_alive()));
        assert!(matches!(session.outcome(), Some(SessionEnd::Fault(_))));
    }

    #[test]
    fn inbound_overflow_drops_commands_and_session_survives() {
        let handled = Arc::new(AtomicUsize::new(0));
        let h = handled.clone();
        let registry = HandlerRegistry::builder()
            .on("SLOW", move |_| {
                thread::sleep(Duration::from_millis(200));
                h.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .on("PING", |_| Ok(Some(Envelope::new("PONG"))))
            .build();
        let config = SessionConfig {
            queue_capacity: 1,
            queue_timeout: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let (server, mut client) = pair();
        let session = Session::new(server, registry, config).unwrap();
        session.start().unwrap();

        for _ in 0..5 {
            codec::send(&mut client, &Envelope::new("SLOW")).unwrap();
        }
        // Let the dispatcher finish whatever was accepted.
        thread::sleep(Duration::from_millis(700));
        codec::send(&mut client, &Envelope::new("PING")).unwrap();
        assert_eq!(codec::receive(&mut client).unwrap().cmd(), "PONG");

        assert!(handled.load(Ordering::SeqCst) < 5);
        assert!(session.is_alive());
        assert_eq!(session.outcome(), None);
    }

    fn assert_close_is_prompt(session: &Session) {
        let start = Instant::now();
        session.close();
        session.join().unwrap();
        let took = start.elapsed();
        assert!(took < Duration::from_secs(1), "close took {took:?}");
        assert_eq!(session.outcome(), Some(SessionEnd::Closed));
    }

    #[test]
    fn stalled_partial_frame_does_not_hold_close() {
        let config = SessionConfig {
            io_timeout: Some(Duration::from_secs(5)),
            ..SessionConfig::default()
        };
        let (server, mut client) = pair();
        let session = Session::new(server, echo_registry(), config).unwrap();
        session.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            session.status().state == SessionState::Active
        }));

        // Half a header, then silence.
        io::Write::write_all(&mut client, &[0, 0]).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_close_is_prompt(&session);
    }

    #[test]
    fn stalled_login_does_not_hold_close() {
        let registry = HandlerRegistry::builder()
            .login(|_, _| LoginOutcome {
                reply: commands::login_info(true),
                verified: true,
            })
            .build();
        let config = SessionConfig {
            mode: Mode::Sync,
            io_timeout: None,
            ..SessionConfig::default()
        };
        let (server, mut client) = pair();
        let session = Session::new(server, registry, config).unwrap();
        session.start().unwrap();

        io::Write::write_all(&mut client, &[0, 0, 0]).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_close_is_prompt(&session);
    }

    #[test]
    fn login_verified_then_entered() {
        let registry = HandlerRegistry::builder()
            .login(|env, _| {
                let verified = env.get_str("PWD") == Some("pw");
                LoginOutcome {
                    reply: commands::login_info(verified),
                    verified,
                }
            })
            .on_enter(|| Ok(Some(Envelope::new("WELCOME"))))
            .on("PING", |_| Ok(Some(Envelope::new("PONG"))))
            .build();
        let (server, mut client) = pair();
        let session = Session::new(server, registry, SessionConfig::default()).unwrap();
        session.start().unwrap();

        codec::send(&mut client, &Envelope::new(commands::LOGIN).with("PWD", "pw")).unwrap();
        let info = codec::receive(&mut client).unwrap();
        assert_eq!(info.cmd(), commands::LOG_INFO);
        assert_eq!(info.get_bool("VERIFY"), Some(true));
        assert_eq!(codec::receive(&mut client).unwrap().cmd(), "WELCOME");
        codec::send(&mut client, &Envelope::new("PING")).unwrap();
        assert_eq!(codec::receive(&mut client).unwrap().cmd(), "PONG");
    }

    #[test]
    fn login_rejected_closes_without_callbacks() {
        let enters = Arc::new(AtomicUsize::new(0));
        let exits = Arc::new(AtomicUsize::new(0));
        let (en, ex) = (enters.clone(), exits.clone());
        let registry = HandlerRegistry::builder()
            .login(|_, _| LoginOutcome {
                reply: commands::login_info(false),
                verified: false,
            })
            .on_enter(move || {
                en.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .on_exit(move || {
                ex.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .build();
        let (server, mut client) = pair();
        let session = Session::new(server, registry, SessionConfig::default()).unwrap();
        session.start().unwrap();

        codec::send(&mut client, &Envelope::new(commands::LOGIN).with("PWD", "nope")).unwrap();
        let info = codec::receive(&mut client).unwrap();
        assert_eq!(info.get_bool("VERIFY"), Some(false));
        assert!(wait_until(Duration::from_secs(2), || !session.is_alive()));
        assert_eq!(session.outcome(), Some(SessionEnd::Rejected));
        assert_eq!(enters.load(Ordering::SeqCst), 0);
        assert_eq!(exits.load(Ordering::SeqCst), 0);
        assert!(codec::receive(&mut client).is_err());
    }

    #[test]
    fn sync_session_alternates_receive_and_reply() {
        let (server, mut client) = pair();
        let session = Session::new(server, echo_registry(), sync_config()).unwrap();
        session.start().unwrap();
        for n in 0..3 {
            codec::send(&mut client, &Envelope::new("PING").with("N", n)).unwrap();
            assert_eq!(codec::receive(&mut client).unwrap().get_i64("N"), Some(n));
        }
        codec::send(&mut client, &Envelope::new(commands::LOGOUT)).unwrap();
        assert_eq!(codec::receive(&mut client).unwrap().cmd(), commands::SYS_LOGOUT);
        assert!(wait_until(Duration::from_secs(2), || !session.is_alive()));
        assert_eq!(session.outcome(), Some(SessionEnd::Logout));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("ASYNC".parse::<Mode>().unwrap(), Mode::Async);
        assert_eq!(" sync ".parse::<Mode>().unwrap(), Mode::Sync);
        assert!("threaded".parse::<Mode>().is_err());
    }

    #[test]
    fn status_display_names_peer_and_last_command() {
        let (server, mut client) = pair();
        let session = Session::new(server, echo_registry(), sync_config()).unwrap();
        session.start().unwrap();
        codec::send(&mut client, &Envelope::new("PING")).unwrap();
        codec::receive(&mut client).unwrap();
        let text = session.status().to_string();
        assert!(text.contains(&client.local_addr().unwrap().to_string()));
        assert!(text.contains("last CMD: PING"));
    }
}
