//! Graceful shutdown.
//!
//! ```text
//! Running -> ShutdownRequested -> HooksExecuting -> Draining -> Exited
//!                                                            \-> FatalTimeout
//! ```
//!
//! A [`Coordinator`] waits for a termination signal, runs every registered
//! [`ShutdownHooks`] entry in registration order, then drains the server
//! within a fixed deadline. A failing or panicking hook is recorded and the
//! remaining hooks still run. Missing the drain deadline is fatal.

use std::{any::Any, borrow::Cow, fmt, future::Future, io, mem, process, time::Duration};

use tower::BoxError;
use tracing::{debug, error, info, warn};

/// A cleanup callback run once on shutdown.
pub type Hook = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

/// Ordered collection of shutdown hooks. Hooks run in registration order;
/// the same hook may be registered twice and nothing is ever removed.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Vec<(Cow<'static, str>, Hook)>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook. `name` only shows up in logs and failure reports.
    pub fn register<F>(&mut self, name: impl Into<Cow<'static, str>>, hook: F) -> &mut Self
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.hooks.push((name.into(), Box::new(hook)));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.iter().map(|(name, _)| name.as_ref())
    }

    /// Appends all hooks of `other`, keeping their order.
    pub fn append(&mut self, other: ShutdownHooks) {
        self.hooks.extend(other.hooks);
    }
}

impl fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Something that stops accepting work and finishes what is in flight.
pub trait Drain {
    fn drain(self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShutdownRequested,
    HooksExecuting,
    Draining,
    Exited,
    FatalTimeout,
    /// The signal listener or the drain itself failed.
    Failed,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("cannot listen for termination signals: {0}")]
    Signal(#[source] io::Error),

    #[error("server did not drain within {0:?}")]
    DrainTimeout(Duration),

    #[error("server drain failed: {0}")]
    Drain(#[source] BoxError),
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(#[source] BoxError),

    #[error("panicked: {0}")]
    Panicked(String),
}

/// A hook that returned an error or panicked.
#[derive(Debug)]
pub struct HookFailure {
    pub name: Cow<'static, str>,
    pub error: HookError,
}

/// Outcome of a successful shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub hooks_run: usize,
    pub hook_failures: Vec<HookFailure>,
}

pub struct Coordinator {
    hooks: ShutdownHooks,
    drain_timeout: Duration,
    state: ShutdownState,
}

impl Coordinator {
    pub fn new(hooks: ShutdownHooks, drain_timeout: Duration) -> Self {
        Coordinator {
            hooks,
            drain_timeout,
            state: ShutdownState::Running,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Waits for `signal`, runs the hooks and drains `server`.
    ///
    /// Shutdown is attempted exactly once. Hook failures end up in the
    /// report; only the signal listener and the drain can fail the shutdown.
    pub async fn run<F, D>(&mut self, signal: F, server: D) -> Result<ShutdownReport, ShutdownError>
    where
        F: Future<Output = io::Result<()>>,
        D: Drain,
    {
        if let Err(err) = signal.await {
            self.transition(ShutdownState::Failed);
            return Err(ShutdownError::Signal(err));
        }
        self.transition(ShutdownState::ShutdownRequested);
        info!("shutting down server");

        self.transition(ShutdownState::HooksExecuting);
        let report = run_hooks(mem::take(&mut self.hooks)).await;

        self.transition(ShutdownState::Draining);
        match tokio::time::timeout(self.drain_timeout, server.drain()).await {
            Ok(Ok(())) => {
                self.transition(ShutdownState::Exited);
                Ok(report)
            }
            Ok(Err(err)) => {
                self.transition(ShutdownState::Failed);
                Err(ShutdownError::Drain(err))
            }
            Err(_) => {
                self.transition(ShutdownState::FatalTimeout);
                Err(ShutdownError::DrainTimeout(self.drain_timeout))
            }
        }
    }

    fn transition(&mut self, next: ShutdownState) {
        debug!(from = %self.state, to = %next, "shutdown state");
        self.state = next;
    }
}

async fn run_hooks(hooks: ShutdownHooks) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for (name, hook) in hooks.hooks {
        report.hooks_run += 1;
        let error = match tokio::task::spawn_blocking(hook).await {
            Ok(Ok(())) => {
                debug!(hook = %name, "shutdown hook done");
                continue;
            }
            Ok(Err(err)) => HookError::Failed(err),
            Err(err) if err.is_panic() => HookError::Panicked(panic_message(err.into_panic())),
            Err(err) => HookError::Failed(err.into()),
        };

        warn!(hook = %name, %error, "shutdown hook failed");
        report.hook_failures.push(HookFailure { name, error });
    }

    report
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resolves once the process receives SIGINT or SIGTERM (Ctrl-C off unix).
pub async fn termination_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = terminate.recv() => info!("received SIGTERM"),
            _ = interrupt.recv() => info!("received SIGINT"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl-C");
        Ok(())
    }
}

/// Blocks until a termination signal arrives, then shuts down gracefully.
///
/// This is meant to be the last call of `main`. If the server cannot be
/// drained within `drain_timeout`, the error is logged and the process exits
/// with status 1.
pub async fn await_and_shutdown<D: Drain>(server: D, hooks: ShutdownHooks, drain_timeout: Duration) {
    let mut coordinator = Coordinator::new(hooks, drain_timeout);

    match coordinator.run(termination_signal(), server).await {
        Ok(report) => info!(
            hooks = report.hooks_run,
            failed_hooks = report.hook_failures.len(),
            "server exiting"
        ),
        Err(err) => {
            error!(error = %err, "server forced to shutdown");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<String>>>);

    impl Events {
        fn push(&self, event: impl Into<String>) {
            self.0.lock().unwrap().push(event.into());
        }

        fn take(&self) -> Vec<String> {
            mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct FakeServer {
        events: Events,
        takes: Duration,
        fails: bool,
    }

    impl FakeServer {
        fn new(events: &Events) -> Self {
            FakeServer {
                events: events.clone(),
                takes: Duration::ZERO,
                fails: false,
            }
        }
    }

    impl Drain for FakeServer {
        fn drain(self) -> impl Future<Output = Result<(), BoxError>> + Send {
            async move {
                self.events.push("drain");
                tokio::time::sleep(self.takes).await;
                if self.fails {
                    Err("listener gone".into())
                } else {
                    Ok(())
                }
            }
        }
    }

    fn recording_hooks(events: &Events, count: usize) -> ShutdownHooks {
        let mut hooks = ShutdownHooks::new();
        for i in 0..count {
            let events = events.clone();
            hooks.register(format!("hook-{i}"), move || {
                events.push(format!("hook-{i}"));
                Ok(())
            });
        }
        hooks
    }

    async fn signalled() -> io::Result<()> {
        Ok(())
    }

    #[tokio::test]
    async fn hooks_run_in_order_before_drain() {
        let events = Events::default();
        let mut coordinator = Coordinator::new(recording_hooks(&events, 3), Duration::from_secs(5));

        let report = coordinator
            .run(signalled(), FakeServer::new(&events))
            .await
            .unwrap();

        assert_eq!(events.take(), ["hook-0", "hook-1", "hook-2", "drain"]);
        assert_eq!(report.hooks_run, 3);
        assert!(report.hook_failures.is_empty());
        assert_eq!(coordinator.state(), ShutdownState::Exited);
    }

    #[tokio::test]
    async fn failing_hooks_do_not_stop_the_rest() {
        let events = Events::default();
        let mut hooks = ShutdownHooks::new();
        hooks
            .register("tracer", || Err("exporter unreachable".into()))
            .register("db", || panic!("pool poisoned"))
            .append(recording_hooks(&events, 1));

        let mut coordinator = Coordinator::new(hooks, Duration::from_secs(5));
        let report = coordinator
            .run(signalled(), FakeServer::new(&events))
            .await
            .unwrap();

        assert_eq!(events.take(), ["hook-0", "drain"]);
        assert_eq!(report.hooks_run, 3);
        assert_eq!(report.hook_failures.len(), 2);
        assert_eq!(report.hook_failures[0].name, "tracer");
        assert!(matches!(report.hook_failures[0].error, HookError::Failed(_)));
        assert_eq!(report.hook_failures[1].name, "db");
        assert!(
            matches!(&report.hook_failures[1].error, HookError::Panicked(message) if message == "pool poisoned")
        );
    }

    #[tokio::test]
    async fn drain_timeout_is_fatal() {
        let events = Events::default();
        let server = FakeServer {
            takes: Duration::from_secs(30),
            ..FakeServer::new(&events)
        };
        let mut coordinator =
            Coordinator::new(recording_hooks(&events, 2), Duration::from_millis(20));

        let err = coordinator.run(signalled(), server).await.unwrap_err();

        assert!(matches!(err, ShutdownError::DrainTimeout(timeout) if timeout == Duration::from_millis(20)));
        assert_eq!(coordinator.state(), ShutdownState::FatalTimeout);
        assert_eq!(events.take(), ["hook-0", "hook-1", "drain"]);
    }

    #[tokio::test]
    async fn drain_error_fails_shutdown() {
        let events = Events::default();
        let server = FakeServer {
            fails: true,
            ..FakeServer::new(&events)
        };
        let mut coordinator = Coordinator::new(ShutdownHooks::new(), Duration::from_secs(5));

        let err = coordinator.run(signalled(), server).await.unwrap_err();

        assert!(matches!(err, ShutdownError::Drain(_)));
        assert_eq!(coordinator.state(), ShutdownState::Failed);
    }

    #[tokio::test]
    async fn nothing_happens_before_the_signal() {
        let events = Events::default();
        let mut coordinator = Coordinator::new(recording_hooks(&events, 2), Duration::from_secs(5));

        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            coordinator.run(future::pending(), FakeServer::new(&events)),
        )
        .await;

        assert!(waited.is_err());
        assert!(events.take().is_empty());
        assert_eq!(coordinator.state(), ShutdownState::Running);
    }

    #[tokio::test]
    async fn signal_listener_failure_skips_hooks() {
        let events = Events::default();
        let mut coordinator = Coordinator::new(recording_hooks(&events, 1), Duration::from_secs(5));

        let err = coordinator
            .run(
                async { Err(io::Error::new(io::ErrorKind::Other, "no signals")) },
                FakeServer::new(&events),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ShutdownError::Signal(_)));
        assert!(events.take().is_empty());
    }

    #[test]
    fn hooks_keep_registration_order_and_duplicates() {
        let mut hooks = ShutdownHooks::new();
        hooks
            .register("tracer", || Ok(()))
            .register("metrics", || Ok(()))
            .register("tracer", || Ok(()));

        assert_eq!(hooks.len(), 3);
        assert_eq!(hooks.names().collect::<Vec<_>>(), ["tracer", "metrics", "tracer"]);
    }
}
