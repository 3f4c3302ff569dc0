//! The local forward target shared by every worker of a process

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::ForwardError;

/// `host:port` the agent dials for each new flow. Clones share the value,
/// so a `SetConfig` handled by one worker is seen by all of them.
#[derive(Debug, Clone, Default)]
pub struct ForwardTarget {
    address: Arc<RwLock<String>>,
}

impl ForwardTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Arc::new(RwLock::new(address.into())),
        }
    }

    /// Current target, possibly empty
    pub fn get(&self) -> String {
        self.address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the target; returns the previous value
    pub fn set(&self, address: impl Into<String>) -> String {
        let address = address.into();
        let mut guard = self
            .address
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *guard != address {
            info!("Forward target changed: '{}' -> '{}'", guard, address);
        }
        std::mem::replace(&mut *guard, address)
    }

    pub fn is_set(&self) -> bool {
        !self
            .address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Open a TCP connection to the current target
    pub async fn dial(&self, timeout: Duration) -> Result<TcpStream, ForwardError> {
        let address = self.get();
        if address.is_empty() {
            return Err(ForwardError::NoTarget);
        }

        debug!("Dialing local target {}", address);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ForwardError::ConnectionFailed { address, source }),
            Err(_) => return Err(ForwardError::ConnectTimeout { address, timeout }),
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}
