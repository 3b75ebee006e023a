//! Core server lifecycle.
//!
//! Provides the shutdown-signal plumbing shared by the login binary: a
//! small state flag plus an optional termination callback, set from a
//! spawned signal-listener task and polled by the accept loop.

use std::sync::{Arc, Mutex};

/// Type alias for termination callback functions.
/// Called once, when a shutdown signal is first observed.
pub type TermFunc = Box<dyn Fn() + Send + 'static>;

/// Process-wide shutdown state.
pub struct ServerState {
    shutdown_requested: bool,
    term_func: Option<TermFunc>,
}

impl ServerState {
    pub fn new() -> Self {
        ServerState {
            shutdown_requested: false,
            term_func: None,
        }
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_requested
    }

    pub fn set_term_func<F>(&mut self, func: F)
    where
        F: Fn() + Send + 'static,
    {
        self.term_func = Some(Box::new(func));
    }

    pub fn call_term_func(&self) {
        if let Some(ref func) = self.term_func {
            func();
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe shared server state, handed to the signal-listener task
/// and read by the accept loop between connections.
pub type SharedServerState = Arc<Mutex<ServerState>>;

pub fn create_server_state() -> SharedServerState {
    Arc::new(Mutex::new(ServerState::new()))
}

/// Shutdown-triggering signals this process responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM (graceful shutdown, e.g. from an orchestrator)
    Terminate,
}

impl Signal {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, Signal::Interrupt | Signal::Terminate)
    }
}

/// Spawns a task that waits for SIGINT/SIGTERM and marks `state` for
/// shutdown, calling its termination callback exactly once.
#[cfg(unix)]
pub fn spawn_signal_listener(state: SharedServerState) {
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("[core] [signal_setup_failed] {}", e);
                return;
            }
        };
        let signal = tokio::select! {
            _ = tokio::signal::ctrl_c() => Signal::Interrupt,
            _ = term.recv() => Signal::Terminate,
        };
        tracing::info!("[core] [signal_received] {:?}", signal);
        let mut s = state.lock().unwrap();
        s.request_shutdown();
        s.call_term_func();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_state_creation() {
        let state = ServerState::new();
        assert!(!state.should_shutdown());
    }

    #[test]
    fn test_server_state_shutdown() {
        let mut state = ServerState::new();
        assert!(!state.should_shutdown());

        state.request_shutdown();
        assert!(state.should_shutdown());
    }

    #[test]
    fn test_term_func() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let mut state = ServerState::new();
        state.set_term_func(move || {
            called_clone.store(true, Ordering::SeqCst);
        });

        assert!(!called.load(Ordering::SeqCst));
        state.call_term_func();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_signal_should_shutdown() {
        assert!(Signal::Interrupt.should_shutdown());
        assert!(Signal::Terminate.should_shutdown());
    }

    #[test]
    fn test_shared_server_state() {
        let state = create_server_state();

        {
            let mut s = state.lock().unwrap();
            assert!(!s.should_shutdown());
            s.request_shutdown();
        }

        {
            let s = state.lock().unwrap();
            assert!(s.should_shutdown());
        }
    }
}
