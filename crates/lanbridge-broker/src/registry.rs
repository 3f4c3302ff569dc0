//! Registry of connected tunnel agents
//!
//! Every agent is keyed by the remote address of its tunnel. An agent is
//! either free or `working`; a working agent may carry the forward session
//! it is bound to. The map lock and the per-agent lock are never held at
//! the same time: selection snapshots the map first, then claims one agent
//! under that agent's own lock.

use chrono::{DateTime, Utc};
use lanbridge_forward::ForwardSession;
use lanbridge_transport::TunnelSender;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::error::RegistryError;

#[derive(Debug, Default)]
struct AgentState {
    working: bool,
    binding: Option<ForwardSession>,
}

/// A connected agent
#[derive(Debug)]
pub struct RegisteredAgent {
    identity: SocketAddr,
    tunnel: TunnelSender,
    connected_at: DateTime<Utc>,
    state: RwLock<AgentState>,
}

impl RegisteredAgent {
    fn new(identity: SocketAddr, tunnel: TunnelSender) -> Self {
        Self {
            identity,
            tunnel,
            connected_at: Utc::now(),
            state: RwLock::new(AgentState::default()),
        }
    }

    pub fn identity(&self) -> SocketAddr {
        self.identity
    }

    /// Send path of the agent's tunnel
    pub fn tunnel(&self) -> &TunnelSender {
        &self.tunnel
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_working(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .working
    }

    /// The flow currently bound to this agent, if any
    pub fn binding(&self) -> Option<ForwardSession> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .binding
            .clone()
    }

    /// Claim the agent if it is free. `bind` runs inside the claim.
    fn try_claim<F>(&self, bind: F) -> Option<Option<ForwardSession>>
    where
        F: FnOnce(&RegisteredAgent) -> Option<ForwardSession>,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.working || self.tunnel.is_closed() {
            return None;
        }
        state.working = true;
        state.binding = bind(self);
        Some(state.binding.clone())
    }

    fn release(&self) -> Option<ForwardSession> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.working = false;
        state.binding.take()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            identity: self.identity.to_string(),
            working: self.is_working(),
            connected_at: self.connected_at,
        }
    }
}

/// Point-in-time view of an agent for the admin API
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub identity: String,
    pub working: bool,
    pub connected_at: DateTime<Utc>,
}

/// Registry for managing connected agents
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<SocketAddr, Arc<RegisteredAgent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the agent behind a freshly accepted tunnel.
    ///
    /// # Errors
    ///
    /// `DuplicateIdentity` if an agent with the same identity is present and
    /// its tunnel is still open. An entry whose tunnel already closed is
    /// replaced.
    pub fn register(
        &self,
        identity: SocketAddr,
        tunnel: TunnelSender,
    ) -> Result<Arc<RegisteredAgent>, RegistryError> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = agents.get(&identity) {
            if !existing.tunnel.is_closed() {
                warn!(agent = %identity, working = existing.is_working(), "Agent identity already registered");
                return Err(RegistryError::DuplicateIdentity(identity));
            }
            warn!(agent = %identity, "Replacing stale agent whose tunnel already closed");
        }

        let agent = Arc::new(RegisteredAgent::new(identity, tunnel));
        agents.insert(identity, agent.clone());
        info!(agent = %identity, total = agents.len(), "Registered agent");
        Ok(agent)
    }

    /// Remove an agent by identity. No-op if absent.
    pub fn unregister(&self, identity: &SocketAddr) -> Option<Arc<RegisteredAgent>> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        let removed = agents.remove(identity);
        if removed.is_some() {
            info!(agent = %identity, total = agents.len(), "Unregistered agent");
        }
        removed
    }

    /// Remove this exact agent, leaving a newer registration under the same identity alone
    pub fn remove(&self, agent: &Arc<RegisteredAgent>) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        match agents.get(&agent.identity) {
            Some(current) if Arc::ptr_eq(current, agent) => {
                agents.remove(&agent.identity);
                info!(agent = %agent.identity, total = agents.len(), "Unregistered agent");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, identity: &SocketAddr) -> Option<Arc<RegisteredAgent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    fn candidates(&self) -> Vec<Arc<RegisteredAgent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Claim the first free agent, marking it `working`
    pub fn select_free(&self) -> Result<Arc<RegisteredAgent>, RegistryError> {
        for agent in self.candidates() {
            if agent.try_claim(|_| None).is_some() {
                debug!(agent = %agent.identity, "Selected free agent");
                return Ok(agent);
            }
        }
        Err(RegistryError::NoFreeAgent)
    }

    /// Claim the first free agent and bind a session to it in the same critical section
    pub fn select_free_and_bind<F>(
        &self,
        mut make_session: F,
    ) -> Result<(Arc<RegisteredAgent>, ForwardSession), RegistryError>
    where
        F: FnMut(&RegisteredAgent) -> ForwardSession,
    {
        for agent in self.candidates() {
            if let Some(Some(session)) = agent.try_claim(|agent| Some(make_session(agent))) {
                debug!(agent = %agent.identity, session = %session.label(), "Bound flow to agent");
                return Ok((agent, session));
            }
        }
        Err(RegistryError::NoFreeAgent)
    }

    /// Mark the agent free again. Returns the session that was bound, if any;
    /// the caller finishes it outside the lock. Idempotent.
    pub fn release_agent(&self, agent: &RegisteredAgent) -> Option<ForwardSession> {
        let session = agent.release();
        debug!(agent = %agent.identity, had_session = session.is_some(), "Released agent");
        session
    }

    pub fn list(&self) -> Vec<AgentSnapshot> {
        let mut snapshots: Vec<AgentSnapshot> =
            self.candidates().iter().map(|a| a.snapshot()).collect();
        snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshots
    }

    pub fn count(&self) -> usize {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn free_count(&self) -> usize {
        self.candidates()
            .iter()
            .filter(|agent| !agent.is_working())
            .count()
    }
}
