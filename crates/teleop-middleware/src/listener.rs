//! TCP listener serving one session at a time.
//!
//! The accept loop is a [`RepeatingTask`] polling a non-blocking socket.
//! While a session runs, the loop keeps polling; a new connection first
//! closes and joins the running session (its exit callbacks fire and its
//! workers are joined), then starts a session for the newcomer.  Sessions
//! therefore never overlap.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use teleop_kernel::{Phases, RepeatingTask, StopSignal, lock_recover};
use teleop_types::TeleopError;
use tracing::{info, warn};

use crate::registry::HandlerRegistry;
use crate::session::{Session, SessionConfig, SessionEnd, SessionStatus};

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::listener");

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Stop when no session has been running for this long.  `None` waits
    /// forever.
    pub accept_timeout: Option<Duration>,
    pub session: SessionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5050,
            accept_timeout: None,
            session: SessionConfig::default(),
        }
    }
}

/// Why the listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// [`Listener::close`] was called.
    Closed,
    /// A client sent `EXIT`.
    Exit,
    /// A client sent `SHUTDOWN`; the host should shut down.
    Shutdown,
    /// No connection arrived within the accept timeout.
    AcceptTimeout,
}

struct ListenerShared {
    current: Mutex<Option<Session>>,
    exit: Mutex<Option<ListenerExit>>,
}

impl ListenerShared {
    /// Record why the listener stops.  The first reason wins.
    fn set_exit(&self, reason: ListenerExit) {
        let mut exit = lock_recover(&self.exit);
        if exit.is_none() {
            *exit = Some(reason);
        }
    }
}

struct AcceptLoop {
    socket: TcpListener,
    registry: Arc<HandlerRegistry>,
    config: ListenerConfig,
    shared: Arc<ListenerShared>,
    idle_since: Instant,
    last_error: Option<io::ErrorKind>,
}

impl AcceptLoop {
    /// Join a session that ended by itself and act on how it ended.
    fn reap(&mut self, stop: &StopSignal) {
        let finished = {
            let mut current = lock_recover(&self.shared.current);
            if current.as_ref().is_some_and(|s| !s.is_alive()) {
                current.take()
            } else {
                None
            }
        };
        if let Some(session) = finished {
            self.retire(session, stop);
        }
    }

    /// Join `session`, then stop the listener if the peer asked for it.
    fn retire(&mut self, session: Session, stop: &StopSignal) {
        if let Err(e) = session.join() {
            warn!(target: LISTENER_TARGET, error = %e, "session join failed");
        }
        self.idle_since = Instant::now();
        match session.outcome() {
            Some(SessionEnd::Exit) => {
                info!(target: LISTENER_TARGET, "exit requested by client");
                self.shared.set_exit(ListenerExit::Exit);
                stop.stop();
            }
            Some(SessionEnd::Shutdown) => {
                info!(target: LISTENER_TARGET, "shutdown requested by client");
                self.shared.set_exit(ListenerExit::Shutdown);
                stop.stop();
            }
            _ => {}
        }
    }

    fn accept(&mut self, stop: &StopSignal) {
        let (stream, peer) = match self.socket.accept() {
            Ok(accepted) => {
                self.last_error = None;
                accepted
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                if self.last_error != Some(e.kind()) {
                    warn!(target: LISTENER_TARGET, error = %e, "socket accept error");
                }
                self.last_error = Some(e.kind());
                stop.wait(ERROR_BACKOFF);
                return;
            }
        };

        let previous = lock_recover(&self.shared.current).take();
        if let Some(session) = previous {
            info!(
                target: LISTENER_TARGET,
                old = %session.peer(),
                new = %peer,
                "new connection pre-empts running session"
            );
            session.close();
            self.retire(session, stop);
            if stop.is_stopped() {
                return;
            }
        }

        let session = match Session::new(stream, Arc::clone(&self.registry), self.config.session.clone()) {
            Ok(session) => session,
            Err(e) => {
                warn!(target: LISTENER_TARGET, peer = %peer, error = %e, "cannot set up session");
                return;
            }
        };
        if let Err(e) = session.start() {
            warn!(target: LISTENER_TARGET, peer = %peer, error = %e, "cannot start session");
            return;
        }
        *lock_recover(&self.shared.current) = Some(session);
    }
}

impl Phases for AcceptLoop {
    fn on_start(&mut self, _stop: &StopSignal) {
        info!(
            target: LISTENER_TARGET,
            addr = ?self.socket.local_addr().ok(),
            mode = %self.config.session.mode,
            "listening"
        );
        self.idle_since = Instant::now();
    }

    fn on_tick(&mut self, stop: &StopSignal) {
        self.reap(stop);
        if stop.is_stopped() {
            return;
        }
        self.accept(stop);

        let idle = lock_recover(&self.shared.current).is_none();
        if let Some(timeout) = self.config.accept_timeout
            && idle
            && self.idle_since.elapsed() >= timeout
        {
            info!(target: LISTENER_TARGET, ?timeout, "no connection within accept timeout");
            self.shared.set_exit(ListenerExit::AcceptTimeout);
            stop.stop();
        }
    }

    fn on_stop(&mut self) {
        let current = lock_recover(&self.shared.current).take();
        if let Some(session) = current {
            session.close();
            if let Err(e) = session.join() {
                warn!(target: LISTENER_TARGET, error = %e, "session join failed");
            }
        }
        self.shared.set_exit(ListenerExit::Closed);
        info!(target: LISTENER_TARGET, "listener stopped");
    }
}

/// The bound socket and the task accepting on it.
pub struct Listener {
    local_addr: SocketAddr,
    shared: Arc<ListenerShared>,
    task: RepeatingTask,
}

impl Listener {
    /// Resolve and bind `config.host:config.port`.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::ConnectionFault`] if the address does not
    /// resolve or cannot be bound.
    pub fn bind(config: ListenerConfig, registry: Arc<HandlerRegistry>) -> Result<Self, TeleopError> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| TeleopError::connection(format!("resolve {}:{}", config.host, config.port), e))?
            .next()
            .ok_or_else(|| {
                TeleopError::connection(
                    format!("resolve {}:{}", config.host, config.port),
                    io::Error::new(io::ErrorKind::NotFound, "no addresses"),
                )
            })?;
        let socket = TcpListener::bind(addr).map_err(|e| TeleopError::connection(format!("bind {addr}"), e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TeleopError::connection("set non-blocking", e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TeleopError::connection("local address", e))?;

        let shared = Arc::new(ListenerShared {
            current: Mutex::new(None),
            exit: Mutex::new(None),
        });
        let task = RepeatingTask::new(
            "listener",
            ACCEPT_BACKOFF,
            AcceptLoop {
                socket,
                registry,
                config,
                shared: Arc::clone(&shared),
                idle_since: Instant::now(),
                last_error: None,
            },
        );
        Ok(Self {
            local_addr,
            shared,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::TaskFault`] if the thread cannot be spawned.
    pub fn start(&self) -> Result<(), TeleopError> {
        self.task.start()
    }

    /// Stop accepting and close the running session.  Non-blocking.
    pub fn close(&self) {
        self.task.close();
    }

    /// Wait for the listener and its last session to finish.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::TaskFault`] if the listener thread panicked.
    pub fn join(&self) -> Result<(), TeleopError> {
        self.task.join()
    }

    pub fn is_alive(&self) -> bool {
        self.task.is_alive()
    }

    /// Block until the listener stops by itself or `poll` returns true.
    pub fn wait_until(&self, mut poll: impl FnMut() -> bool) {
        while self.task.is_alive() && !poll() {
            thread::sleep(ACCEPT_BACKOFF);
        }
    }

    /// Why the listener stopped, once it has.
    pub fn exit_reason(&self) -> Option<ListenerExit> {
        *lock_recover(&self.shared.exit)
    }

    /// Status of the running session, if any.
    pub fn active_session(&self) -> Option<SessionStatus> {
        lock_recover(&self.shared.current)
            .as_ref()
            .filter(|s| s.is_alive())
            .map(Session::status)
    }
}
