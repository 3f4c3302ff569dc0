//! Worker pool: keeps a fixed number of tunnels open to the broker

use lanbridge_forward::ForwardTarget;
use lanbridge_transport::TunnelConnector;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::TunnelAgent;
use crate::config::AgentConfig;
use crate::error::AgentError;

/// Runs `workers` independent tunnels. Each one reconnects after a fixed
/// delay when its tunnel ends, until [`AgentPool::stop`] is called.
pub struct AgentPool {
    config: AgentConfig,
    connector: Arc<dyn TunnelConnector>,
    target: ForwardTarget,
    shutdown: watch::Sender<bool>,
}

impl AgentPool {
    pub fn new(config: AgentConfig, connector: Arc<dyn TunnelConnector>) -> Result<Self, AgentError> {
        config.validate()?;
        let target = ForwardTarget::new(config.target.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            connector,
            target,
            shutdown,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Forward target shared by every worker; `SetConfig` on any tunnel changes it for all
    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// Ask all workers to stop. Each worker ends its running flow and closes
    /// its tunnel before [`AgentPool::run`] returns.
    pub fn stop(&self) {
        info!("Stopping agent workers");
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Spawn the workers and wait for all of them to exit
    pub async fn run(self: Arc<Self>) {
        info!(
            broker = %self.connector.endpoint(),
            target = %self.target.get(),
            workers = self.config.workers,
            "Starting agent"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let pool = self.clone();
            workers.spawn(async move { pool.worker(id).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Agent worker panicked: {}", e);
            }
        }
        info!("All agent workers stopped");
    }

    async fn worker(&self, id: usize) {
        let agent = TunnelAgent::new(format!("worker-{}", id), self.target.clone())
            .with_dial_timeout(self.config.dial_timeout)
            .with_forward(self.config.forward);
        let mut shutdown = self.shutdown.subscribe();

        while !*shutdown.borrow() {
            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(connection) => {
                    info!(agent = %agent.name(), broker = %self.connector.endpoint(), "Connected to broker");
                    // The agent closes its own flow and tunnel on stop
                    match agent.run_until(connection, stopped(self.shutdown.subscribe())).await {
                        Ok(()) => info!(worker = id, "Tunnel closed"),
                        Err(e) => warn!(worker = id, "Tunnel failed: {}", e),
                    }
                }
                Err(e) => warn!(worker = id, "Failed to connect to broker: {}", e),
            }

            if *shutdown.borrow() {
                break;
            }
            debug!(worker = id, "Reconnecting in {:?}", self.config.reconnect_delay);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        debug!(worker = id, "Worker exiting");
    }
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
