//! Shutdown coordination for a client's background tasks

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Broadcasts one shutdown signal to every subscribed task
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
        }
    }

    /// Subscribe to shutdown notifications.
    ///
    /// Subscribe before spawning the task: a receiver created after the
    /// signal was sent never sees it.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every task to stop. Returns false if shutdown already began.
    pub async fn shutdown(&self) -> bool {
        let mut state = self.state.write().await;
        if *state != ShutdownState::Running {
            debug!("Shutdown already in progress");
            return false;
        }
        *state = ShutdownState::ShuttingDown;
        drop(state);

        info!("Initiating graceful shutdown");
        if self.shutdown_tx.send(ShutdownSignal::Graceful).is_err() {
            debug!("No tasks subscribed to shutdown");
        }

        *self.state.write().await = ShutdownState::Shutdown;
        true
    }
}

/// Runs one background component until it finishes or shutdown is signalled
pub struct ShutdownHandler {
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    component_name: &'static str,
}

impl ShutdownHandler {
    pub fn new(coordinator: &ShutdownCoordinator, component_name: &'static str) -> Self {
        Self {
            shutdown_rx: coordinator.subscribe(),
            component_name,
        }
    }

    pub async fn run<Fut>(mut self, component: Fut)
    where
        Fut: std::future::Future<Output = ()>,
    {
        debug!("Starting component: {}", self.component_name);

        tokio::select! {
            _ = component => {
                debug!("Component {} completed normally", self.component_name);
            }
            signal = self.shutdown_rx.recv() => {
                match signal {
                    Ok(ShutdownSignal::Graceful) => {
                        debug!("Component {} received graceful shutdown signal", self.component_name);
                    }
                    Err(e) => {
                        error!("Component {} shutdown channel error: {}", self.component_name, e);
                    }
                }
            }
        }

        debug!("Component {} shutdown complete", self.component_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        assert!(coordinator.shutdown().await);
        assert_eq!(rx.recv().await.unwrap(), ShutdownSignal::Graceful);

        // Second call is a no-op
        assert!(!coordinator.shutdown().await);
    }

    #[tokio::test]
    async fn test_shutdown_handler_stops_component() {
        let coordinator = ShutdownCoordinator::new();
        let handler = ShutdownHandler::new(&coordinator, "test_component");

        let task = tokio::spawn(handler.run(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));

        coordinator.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("component should stop")
            .unwrap();
    }
}
