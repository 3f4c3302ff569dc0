//! Per-tunnel session loop on the broker

use bytes::Bytes;
use lanbridge_proto::{get_config_frame, ControlFrame, FrameType};
use lanbridge_transport::{TunnelConnection, TunnelMessage};
use tracing::{debug, info, trace, warn};

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::registry::RegisteredAgent;

/// Written to the external client when the agent reports it is busy
pub const CLIENT_BUSY_MESSAGE: &str = "current client was busy, pls try another.";

impl Broker {
    /// Drive one agent tunnel until it closes.
    ///
    /// # Errors
    ///
    /// Only registration fails; a duplicate identity means the registry lost
    /// track of a closed tunnel and the caller should stop the process.
    pub async fn run_tunnel(&self, connection: TunnelConnection) -> Result<(), BrokerError> {
        let identity = connection.remote_address();
        let (sender, mut receiver) = connection.split();

        let agent = self.registry().register(identity, sender.clone())?;

        if !self.target().is_set() {
            info!(agent = %identity, "Forward target unknown, asking agent for its config");
            if let Err(e) = sender.send_text(get_config_frame()).await {
                warn!(agent = %identity, "Failed to send Get-Config: {}", e);
            }
        }

        while let Some(next) = receiver.recv().await {
            match next {
                Ok(TunnelMessage::Text(text)) => self.handle_control(&agent, &text).await,
                Ok(TunnelMessage::Binary(data)) => self.handle_payload(&agent, data).await,
                Ok(TunnelMessage::Ping(_)) => {
                    // Answered by the WebSocket layer
                    trace!(agent = %identity, "Ping");
                }
                Ok(TunnelMessage::Pong(payload)) => {
                    trace!(agent = %identity, "Unsolicited pong, echoing");
                    if let Err(e) = sender.send(TunnelMessage::Pong(payload)).await {
                        debug!(agent = %identity, "Failed to echo pong: {}", e);
                    }
                }
                Ok(TunnelMessage::Close) => {
                    info!(agent = %identity, "Agent closed the tunnel");
                    break;
                }
                Err(e) if e.is_closed() => {
                    debug!(agent = %identity, "Tunnel closed");
                    break;
                }
                Err(e) => {
                    warn!(agent = %identity, "Tunnel error: {}", e);
                    break;
                }
            }
        }

        self.release(&agent, None).await;
        self.registry().remove(&agent);
        sender.close().await;

        let stats = sender.stats();
        info!(
            agent = %identity,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            uptime_secs = stats.uptime_secs,
            "Agent session ended"
        );
        Ok(())
    }

    async fn handle_control(&self, agent: &RegisteredAgent, text: &str) {
        let frame = match ControlFrame::decode(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(agent = %agent.identity(), "Dropping text frame that is not a control frame: {} (frame={})", e, text);
                return;
            }
        };

        debug!(
            agent = %agent.identity(),
            frame = %frame.kind,
            content = %frame.content,
            index = frame.index,
            "Control frame"
        );

        match frame.kind {
            FrameType::RequestFinish => self.release(agent, None).await,
            FrameType::ClientBusy => {
                debug!(
                    agent = %agent.identity(),
                    "Agent reports busy; it may still be forwarding an earlier flow whose Req-finish is pending"
                );
                self.release(agent, Some(CLIENT_BUSY_MESSAGE)).await;
            }
            FrameType::SysErr => self.release(agent, Some(frame.content.as_str())).await,
            FrameType::GetConfig => {
                if frame.content.is_empty() {
                    warn!(agent = %agent.identity(), "Agent has no forward target configured");
                } else {
                    info!(agent = %agent.identity(), "Agent forwards to {}", frame.content);
                    self.target().set(frame.content);
                }
            }
            FrameType::SysOk => {
                info!(agent = %agent.identity(), "Agent acknowledged: {}", frame.content);
            }
            FrameType::NewConnection | FrameType::SetConfig | FrameType::Unknown(_) => {
                warn!(agent = %agent.identity(), "No handler for {} frame", frame.kind);
            }
        }
    }

    async fn handle_payload(&self, agent: &RegisteredAgent, data: Bytes) {
        let Some(session) = agent.binding() else {
            warn!(agent = %agent.identity(), bytes = data.len(), "Payload without a bound flow, dropping");
            return;
        };

        trace!(agent = %agent.identity(), bytes = data.len(), "Payload for client");
        if let Err(e) = session.deliver(data).await {
            debug!(agent = %agent.identity(), "Flow no longer accepts payload: {}", e);
        }
    }
}
