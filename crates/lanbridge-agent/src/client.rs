//! One agent tunnel: reacts to broker commands and drives at most one flow

use lanbridge_forward::{ForwardConfig, ForwardSession, ForwardTarget, Teardown};
use lanbridge_proto::{client_busy_frame, ControlFrame, FrameType};
use lanbridge_transport::{TunnelConnection, TunnelMessage, TunnelSender};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::AgentError;

/// Where a tunnel stands with respect to its flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Dialing,
    Forwarding,
}

/// Command handler for a single tunnel
#[derive(Debug, Clone)]
pub struct TunnelAgent {
    name: String,
    target: ForwardTarget,
    dial_timeout: Duration,
    forward: ForwardConfig,
}

impl TunnelAgent {
    pub fn new(name: impl Into<String>, target: ForwardTarget) -> Self {
        Self {
            name: name.into(),
            target,
            dial_timeout: Duration::from_secs(10),
            forward: ForwardConfig::default(),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_forward(mut self, forward: ForwardConfig) -> Self {
        self.forward = forward;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process broker messages until the tunnel ends. A flow still running
    /// at that point is torn down.
    pub async fn run(&self, connection: TunnelConnection) -> Result<(), AgentError> {
        self.run_until(connection, std::future::pending()).await
    }

    /// Like [`TunnelAgent::run`], also returning once `stop` completes. The
    /// running flow and the tunnel are closed either way.
    pub async fn run_until<F>(&self, connection: TunnelConnection, stop: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        let (sender, mut receiver) = connection.split();
        let mut flow = Flow::default();
        info!(agent = %self.name, broker = %sender.remote_address(), "Waiting for broker commands");
        tokio::pin!(stop);

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = &mut stop => {
                    info!(agent = %self.name, "Stop requested, closing tunnel");
                    break Ok(());
                }
                next = receiver.recv() => next,
            };
            let Some(next) = next else {
                debug!(agent = %self.name, "Tunnel stream ended");
                break Ok(());
            };

            match next {
                Ok(TunnelMessage::Text(text)) => {
                    self.handle_control(&sender, &mut flow, &text).await;
                }
                Ok(TunnelMessage::Binary(data)) => match flow.active() {
                    Some(session) => {
                        if let Err(e) = session.deliver(data).await {
                            debug!(agent = %self.name, "Flow no longer accepts payload: {}", e);
                        }
                    }
                    None => {
                        warn!(agent = %self.name, bytes = data.len(), "Payload while idle, dropping");
                    }
                },
                Ok(TunnelMessage::Ping(_)) => trace!(agent = %self.name, "Ping"),
                Ok(TunnelMessage::Pong(_)) => trace!(agent = %self.name, "Pong"),
                Ok(TunnelMessage::Close) => {
                    info!(agent = %self.name, "Broker closed the tunnel");
                    break Ok(());
                }
                Err(e) if e.is_closed() => break Ok(()),
                Err(e) => break Err(AgentError::from(e)),
            }
        };

        if let Some(session) = flow.session.take() {
            // Nobody left to acknowledge
            session.finish(Teardown::Peer { acknowledge: false }).await;
        }
        sender.close().await;
        result
    }

    async fn handle_control(&self, sender: &TunnelSender, flow: &mut Flow, text: &str) {
        let frame = match ControlFrame::decode(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(agent = %self.name, "Dropping text frame that is not a control frame: {} (frame={})", e, text);
                return;
            }
        };
        debug!(agent = %self.name, frame = %frame.kind, content = %frame.content, "Control frame");

        match frame.kind {
            FrameType::NewConnection => self.open_flow(sender, flow).await,
            FrameType::RequestFinish => match flow.session.take() {
                Some(session) => session.finish(Teardown::Peer { acknowledge: true }).await,
                None => trace!(agent = %self.name, "Req-finish while idle"),
            },
            FrameType::GetConfig => {
                let reply = ControlFrame::with_content(FrameType::GetConfig, self.target.get());
                reply_with(sender, reply).await;
            }
            FrameType::SetConfig => {
                let reply = if frame.content.trim().is_empty() {
                    warn!(agent = %self.name, "Refusing empty forward target");
                    ControlFrame::error("forward target must not be empty")
                } else {
                    let target = frame.content.trim().to_string();
                    self.target.set(target.clone());
                    ControlFrame::with_content(FrameType::SysOk, target)
                };
                reply_with(sender, reply).await;
            }
            FrameType::SysOk | FrameType::SysErr | FrameType::ClientBusy | FrameType::Unknown(_) => {
                warn!(agent = %self.name, "No handler for {} frame", frame.kind);
            }
        }
    }

    async fn open_flow(&self, sender: &TunnelSender, flow: &mut Flow) {
        if flow.state() != AgentState::Idle {
            warn!(agent = %self.name, "Busy with a flow, refusing new connection");
            if let Err(e) = sender.send_text(client_busy_frame()).await {
                debug!(agent = %self.name, "Failed to send Cli-Busy: {}", e);
            }
            return;
        }

        flow.dialing = true;
        let dialed = self.target.dial(self.dial_timeout).await;
        flow.dialing = false;

        let stream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                warn!(agent = %self.name, "Could not reach local target: {}", e);
                reply_with(sender, ControlFrame::error(e.to_string())).await;
                return;
            }
        };

        let label = match stream.peer_addr() {
            Ok(peer) => format!("{}->{}", self.name, peer),
            Err(_) => self.name.clone(),
        };
        let session = ForwardSession::new(label, sender.clone(), self.forward);
        match session.start(stream) {
            Ok(tasks) => {
                info!(agent = %self.name, session = %session.label(), "Forwarding new connection");
                let name = self.name.clone();
                tokio::spawn(async move {
                    if let Ok(stats) = tasks.join().await {
                        debug!(
                            agent = %name,
                            bytes_up = stats.bytes_up,
                            bytes_down = stats.bytes_down,
                            "Flow finished"
                        );
                    }
                });
                flow.session = Some(session);
            }
            Err(e) => {
                warn!(agent = %self.name, "Could not start flow: {}", e);
                reply_with(sender, ControlFrame::error(e.to_string())).await;
            }
        }
    }
}

/// The flow owned by the dispatch loop
#[derive(Debug, Default)]
struct Flow {
    dialing: bool,
    session: Option<ForwardSession>,
}

impl Flow {
    fn state(&self) -> AgentState {
        if self.dialing {
            AgentState::Dialing
        } else if self.active().is_some() {
            AgentState::Forwarding
        } else {
            AgentState::Idle
        }
    }

    /// The bound session, unless it already finished on its own
    fn active(&self) -> Option<&ForwardSession> {
        self.session.as_ref().filter(|session| !session.is_closed())
    }
}

async fn reply_with(sender: &TunnelSender, frame: ControlFrame) {
    let kind = frame.kind;
    if let Err(e) = sender.send_text(frame.encode()).await {
        debug!("Failed to send {} reply: {}", kind, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanbridge_transport::memory;

    #[test]
    fn test_idle_flow_state() {
        let flow = Flow::default();
        assert_eq!(flow.state(), AgentState::Idle);
        assert!(flow.active().is_none());
    }

    #[tokio::test]
    async fn test_closed_session_counts_as_idle() {
        let (a, _b) = memory::pair();
        let (tx, _rx) = a.split();
        let session = ForwardSession::new("done", tx, ForwardConfig::default());

        let mut flow = Flow {
            dialing: false,
            session: Some(session.clone()),
        };
        assert_eq!(flow.state(), AgentState::Forwarding);

        session.finish(Teardown::Uplink).await;
        assert_eq!(flow.state(), AgentState::Idle);

        flow.dialing = true;
        assert_eq!(flow.state(), AgentState::Dialing);
    }
}
