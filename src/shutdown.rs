//! Graceful shutdown: drain, then sweep.
//!
//! `Running -> Draining -> Stopped`. Draining refuses new executions and
//! gives in-flight ones the grace period to finish and clean up after
//! themselves. Anything still registered afterwards is force-removed
//! through [`InstanceRegistry::cleanup_all`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::ShutdownConfig;
use crate::sandbox::InstanceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownState::Running => write!(f, "running"),
            ShutdownState::Draining => write!(f, "draining"),
            ShutdownState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of [`ShutdownCoordinator::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether in-flight work finished within the grace period.
    pub drained: bool,
    /// Instances force-removed by the registry sweep.
    pub swept: usize,
}

pub struct ShutdownCoordinator {
    state: watch::Sender<ShutdownState>,
    registry: Arc<InstanceRegistry>,
    grace_period: Duration,
    teardown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        config: &ShutdownConfig,
        teardown_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state,
            registry,
            grace_period: config.grace_period,
            teardown_timeout,
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Whether new executions may start.
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Stop accepting work. Returns `false` if shutdown had already begun.
    pub fn begin_drain(&self) -> bool {
        let began = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
        if began {
            tracing::info!(
                grace_secs = self.grace_period.as_secs(),
                in_flight = self.registry.len(),
                "Draining in-flight executions"
            );
        }
        began
    }

    /// Resolves once the coordinator leaves `Running`. Suitable for
    /// `axum::serve(..).with_graceful_shutdown(..)`.
    pub fn drain_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|state| *state != ShutdownState::Running).await;
        }
    }

    /// Wait up to the grace period for `drained` (typically the server
    /// task) to complete, sweep the registry if anything is left, and
    /// move to `Stopped`.
    pub async fn finish<F>(&self, drained: F) -> ShutdownReport
    where
        F: Future,
    {
        self.begin_drain();

        let drained = tokio::time::timeout(self.grace_period, drained)
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                grace_secs = self.grace_period.as_secs(),
                "Grace period elapsed before in-flight requests finished"
            );
        }

        let swept = if !drained || !self.registry.is_empty() {
            self.registry.cleanup_all(self.teardown_timeout).await
        } else {
            0
        };

        self.state.send_replace(ShutdownState::Stopped);
        tracing::info!(drained, swept, "Shutdown complete");

        ShutdownReport { drained, swept }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
