//! Handler registration.
//!
//! A [`HandlerRegistry`] maps opcodes to handlers and holds the enter, exit
//! and routine hooks plus the optional login handler.  It is assembled once
//! at startup through [`RegistryBuilder`] and shared read-only with every
//! session as an `Arc`.
//!
//! Handlers are closures; any collaborator they need (motor controller,
//! streamer, display) is captured when the closure is built, so nothing is
//! looked up per call.
//!
//! ```
//! use teleop_middleware::registry::HandlerRegistry;
//! use teleop_types::Envelope;
//!
//! let registry = HandlerRegistry::builder()
//!     .on("PING", |_env| Ok(Some(Envelope::new("PONG"))))
//!     .build();
//!
//! let peer = "127.0.0.1:9000".parse().unwrap();
//! let reply = registry.dispatch(&Envelope::new("PING"), peer).unwrap().unwrap();
//! assert_eq!(reply.unwrap().cmd(), "PONG");
//! assert!(registry.dispatch(&Envelope::new("NOPE"), peer).is_none());
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use teleop_types::{Envelope, TeleopError};

/// What a handler or hook produces: an optional envelope to send back.
pub type Reply = Result<Option<Envelope>, TeleopError>;

type MessageFn = dyn Fn(&Envelope) -> Reply + Send + Sync;
type MessagePeerFn = dyn Fn(&Envelope, SocketAddr) -> Reply + Send + Sync;
type HookFn = dyn Fn() -> Reply + Send + Sync;
type HookPeerFn = dyn Fn(SocketAddr) -> Reply + Send + Sync;
type LoginFn = dyn Fn(&Envelope, SocketAddr) -> LoginOutcome + Send + Sync;

/// A command handler, with or without access to the peer address.
pub enum Handler {
    Message(Box<MessageFn>),
    WithPeer(Box<MessagePeerFn>),
}

impl Handler {
    pub fn call(&self, envelope: &Envelope, peer: SocketAddr) -> Reply {
        match self {
            Handler::Message(f) => f(envelope),
            Handler::WithPeer(f) => f(envelope, peer),
        }
    }
}

/// An enter, exit or routine hook.  Cloneable so a session can move one
/// into a worker thread.
#[derive(Clone)]
pub enum Hook {
    Plain(Arc<HookFn>),
    WithPeer(Arc<HookPeerFn>),
}

impl Hook {
    pub fn call(&self, peer: SocketAddr) -> Reply {
        match self {
            Hook::Plain(f) => f(),
            Hook::WithPeer(f) => f(peer),
        }
    }
}

/// Result of the login exchange.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Sent back to the peer whether or not it verified.
    pub reply: Envelope,
    /// Whether the session may proceed.
    pub verified: bool,
}

/// Immutable opcode → handler table plus lifecycle hooks.
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
    enter: Vec<Hook>,
    exit: Vec<Hook>,
    routines: Vec<Hook>,
    login: Option<Box<LoginFn>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Run the handler registered for `envelope`'s opcode.
    ///
    /// `None` when no handler is registered.
    pub fn dispatch(&self, envelope: &Envelope, peer: SocketAddr) -> Option<Reply> {
        self.handlers
            .get(envelope.cmd())
            .map(|h| h.call(envelope, peer))
    }

    pub fn is_registered(&self, cmd: &str) -> bool {
        self.handlers.contains_key(cmd)
    }

    /// Registered opcodes, sorted.
    pub fn opcodes(&self) -> Vec<&str> {
        let mut cmds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        cmds.sort_unstable();
        cmds
    }

    pub fn enter_hooks(&self) -> &[Hook] {
        &self.enter
    }

    pub fn exit_hooks(&self) -> &[Hook] {
        &self.exit
    }

    pub fn routines(&self) -> &[Hook] {
        &self.routines
    }

    /// Run the login handler, or `None` when login is disabled.
    pub fn login(&self, envelope: &Envelope, peer: SocketAddr) -> Option<LoginOutcome> {
        self.login.as_ref().map(|f| f(envelope, peer))
    }

    pub fn has_login(&self) -> bool {
        self.login.is_some()
    }
}

/// Builder for [`HandlerRegistry`].  Registering an opcode twice keeps the
/// last handler.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, Handler>,
    enter: Vec<Hook>,
    exit: Vec<Hook>,
    routines: Vec<Hook>,
    login: Option<Box<LoginFn>>,
}

impl RegistryBuilder {
    /// Handle `cmd` with `f`.
    pub fn on<F>(mut self, cmd: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Envelope) -> Reply + Send + Sync + 'static,
    {
        self.handlers.insert(cmd.into(), Handler::Message(Box::new(f)));
        self
    }

    /// Handle `cmd` with `f`, which also receives the peer address.
    pub fn on_with_peer<F>(mut self, cmd: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Envelope, SocketAddr) -> Reply + Send + Sync + 'static,
    {
        self.handlers.insert(cmd.into(), Handler::WithPeer(Box::new(f)));
        self
    }

    pub fn on_enter<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Reply + Send + Sync + 'static,
    {
        self.enter.push(Hook::Plain(Arc::new(f)));
        self
    }

    pub fn on_enter_with_peer<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr) -> Reply + Send + Sync + 'static,
    {
        self.enter.push(Hook::WithPeer(Arc::new(f)));
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Reply + Send + Sync + 'static,
    {
        self.exit.push(Hook::Plain(Arc::new(f)));
        self
    }

    pub fn on_exit_with_peer<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr) -> Reply + Send + Sync + 'static,
    {
        self.exit.push(Hook::WithPeer(Arc::new(f)));
        self
    }

    /// Add a routine producer.  Each session calls it in a loop on its own
    /// thread for as long as the session is active.
    pub fn routine<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Reply + Send + Sync + 'static,
    {
        self.routines.push(Hook::Plain(Arc::new(f)));
        self
    }

    pub fn routine_with_peer<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr) -> Reply + Send + Sync + 'static,
    {
        self.routines.push(Hook::WithPeer(Arc::new(f)));
        self
    }

    /// Require a login exchange before a session is entered.
    pub fn login<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope, SocketAddr) -> LoginOutcome + Send + Sync + 'static,
    {
        self.login = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            handlers: self.handlers,
            enter: self.enter,
            exit: self.exit,
            routines: self.routines,
            login: self.login,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer() -> SocketAddr {
        "10.0.0.7:41000".parse().unwrap()
    }

    #[test]
    fn peer_handlers_receive_the_address() {
        let registry = HandlerRegistry::builder()
            .on_with_peer("WHO", |_env, peer| {
                Ok(Some(Envelope::new("YOU").with("ADDR", peer.to_string())))
            })
            .build();
        let reply = registry
            .dispatch(&Envelope::new("WHO"), peer())
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.get_str("ADDR"), Some("10.0.0.7:41000"));
    }

    #[test]
    fn handler_errors_are_returned_not_swallowed() {
        let registry = HandlerRegistry::builder()
            .on("BAD", |env| Err(TeleopError::handler(env.cmd(), "no")))
            .build();
        let result = registry.dispatch(&Envelope::new("BAD"), peer()).unwrap();
        assert!(matches!(result, Err(TeleopError::HandlerFault { .. })));
    }

    #[test]
    fn hooks_are_kept_in_registration_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let registry = HandlerRegistry::builder()
            .on_enter(|| Ok(Some(Envelope::new("FIRST"))))
            .on_enter_with_peer(|p| Ok(Some(Envelope::new("SECOND").with("P", p.port()))))
            .on_exit(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .build();

        let cmds: Vec<String> = registry
            .enter_hooks()
            .iter()
            .map(|h| h.call(peer()).unwrap().unwrap().cmd().to_string())
            .collect();
        assert_eq!(cmds, ["FIRST", "SECOND"]);

        registry.exit_hooks()[0].call(peer()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.routines().is_empty());
    }

    #[test]
    fn login_is_optional() {
        let open = HandlerRegistry::builder().build();
        assert!(!open.has_login());
        assert!(open.login(&Envelope::new("LOGIN"), peer()).is_none());

        let guarded = HandlerRegistry::builder()
            .login(|env, _| {
                let verified = env.get_str("PWD") == Some("secret");
                LoginOutcome {
                    reply: Envelope::new("LOG_INFO").with("VERIFY", verified),
                    verified,
                }
            })
            .build();
        let ok = guarded
            .login(&Envelope::new("LOGIN").with("PWD", "secret"), peer())
            .unwrap();
        assert!(ok.verified);
        let bad = guarded.login(&Envelope::new("LOGIN"), peer()).unwrap();
        assert!(!bad.verified);
        assert_eq!(bad.reply.get_bool("VERIFY"), Some(false));
    }

    #[test]
    fn opcodes_are_sorted() {
        let registry = HandlerRegistry::builder()
            .on("MOV", |_| Ok(None))
            .on("GET_SYS_INFO", |_| Ok(None))
            .build();
        assert_eq!(registry.opcodes(), ["GET_SYS_INFO", "MOV"]);
        assert!(registry.is_registered("MOV"));
    }
}
