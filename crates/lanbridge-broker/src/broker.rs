//! Broker: public listener, flow dispatch and the tunnel HTTP server

use bytes::Bytes;
use lanbridge_forward::{ForwardSession, ForwardTarget, ForwardTasks, Teardown};
use lanbridge_proto::{new_connection_frame, ControlFrame, FrameType};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::registry::{AgentRegistry, RegisteredAgent};

/// Public side of the tunnel
pub struct Broker {
    config: BrokerConfig,
    registry: AgentRegistry,
    target: ForwardTarget,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("public_addr", &self.config.public_addr)
            .field("tunnel_addr", &self.config.tunnel_addr)
            .field("agents", &self.registry.count())
            .finish()
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: AgentRegistry::new(),
            target: ForwardTarget::default(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// The agents' forward target as last reported to (or set by) the broker
    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// Hand an external connection to a free agent.
    ///
    /// On success the flow is running and the returned tasks finish with it.
    /// On failure the error text has already been written to `stream` and
    /// the stream is closed.
    pub async fn dispatch<S>(&self, mut stream: S) -> Result<ForwardTasks, BrokerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let forward = self.config.forward;
        let bound = self.registry.select_free_and_bind(|agent| {
            ForwardSession::new(
                format!("flow@{}", agent.identity()),
                agent.tunnel().clone(),
                forward,
            )
        });

        let (agent, session) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                reject(&mut stream, &e.to_string()).await;
                return Err(e.into());
            }
        };

        if let Err(e) = agent.tunnel().send_text(new_connection_frame()).await {
            warn!(agent = %agent.identity(), "Failed to announce new connection: {}", e);
            self.release(&agent, None).await;
            reject(&mut stream, &e.to_string()).await;
            return Err(e.into());
        }

        debug!(agent = %agent.identity(), "New-Conn sent, starting flow");
        Ok(session.start(stream)?)
    }

    /// Free the agent and finish whatever flow was bound to it. `message`
    /// is written to the external stream first.
    pub async fn release(&self, agent: &RegisteredAgent, message: Option<&str>) {
        let Some(session) = self.registry.release_agent(agent) else {
            if let Some(text) = message {
                warn!(agent = %agent.identity(), "No flow bound, dropping message: {}", text);
            }
            return;
        };

        if let Some(text) = message {
            if let Err(e) = session.deliver(Bytes::copy_from_slice(text.as_bytes())).await {
                debug!(agent = %agent.identity(), "Could not relay message to client: {}", e);
            }
        }
        session.finish(Teardown::Peer { acknowledge: false }).await;
    }

    /// Push a new forward target to one free agent. The agent process
    /// applies it to all of its workers.
    pub async fn push_target(&self, address: &str) -> Result<(), BrokerError> {
        let agent = self.registry.select_free()?;
        let frame = ControlFrame::with_content(FrameType::SetConfig, address);
        let sent = agent.tunnel().send_text(frame.encode()).await;
        self.registry.release_agent(&agent);
        sent?;

        info!(agent = %agent.identity(), "Sent new forward target {}", address);
        self.target.set(address);
        Ok(())
    }

    /// Bind both listeners from the configuration
    pub async fn bind(&self) -> Result<(TcpListener, TcpListener), BrokerError> {
        let public = bind_listener(self.config.public_addr).await?;
        let tunnel = bind_listener(self.config.tunnel_addr).await?;
        Ok((public, tunnel))
    }

    /// Accept loop of the public listener
    pub async fn serve_public(self: Arc<Self>, listener: TcpListener) -> Result<(), BrokerError> {
        info!("Public TCP listener on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept public connection: {}", e);
                    continue;
                }
            };
            debug!(client = %peer_addr, "Accepted public connection");
            let _ = stream.set_nodelay(true);

            let broker = self.clone();
            tokio::spawn(async move {
                match broker.dispatch(stream).await {
                    Ok(tasks) => match tasks.join().await {
                        Ok(stats) => debug!(
                            client = %peer_addr,
                            bytes_up = stats.bytes_up,
                            bytes_down = stats.bytes_down,
                            "Flow finished"
                        ),
                        Err(e) => warn!(client = %peer_addr, "Flow task failed: {}", e),
                    },
                    Err(e) => warn!(client = %peer_addr, "Rejected connection: {}", e),
                }
            });
        }
    }

    /// HTTP server for tunnel upgrades and the admin page
    pub async fn serve_tunnels(self: Arc<Self>, listener: TcpListener) -> Result<(), BrokerError> {
        info!(
            "Tunnel listener on ws://{}{}",
            listener.local_addr()?,
            self.config.websocket.path
        );
        let app = crate::http::router(self.clone());
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    /// Run until one of the listeners fails
    pub async fn run(self: Arc<Self>) -> Result<(), BrokerError> {
        let (public, tunnel) = self.bind().await?;
        tokio::try_join!(
            self.clone().serve_public(public),
            self.clone().serve_tunnels(tunnel),
        )?;
        Ok(())
    }
}

async fn bind_listener(address: SocketAddr) -> Result<TcpListener, BrokerError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| BrokerError::BindError {
            address,
            port: address.port(),
            source,
        })
}

/// Best effort: tell the rejected client why, then close
async fn reject<S>(stream: &mut S, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream.write_all(reason.as_bytes()).await;
    let _ = stream.shutdown().await;
}
