//! Forced reconnection with bounded retry.
//!
//! A reconnect runs, in order:
//!
//! 1. stop active output (best effort)
//! 2. close the transport
//! 3. re-open up to `max_attempts` times, sleeping `cooldown` between attempts
//! 4. fall back to simulation when every attempt failed
//!
//! Reconnects are single-flight per device through [`ReconnectGate`].

use crate::error::DeviceError;
use crate::hardware::capabilities::Device;
use crate::hardware::connection::DeviceId;
use crate::limits::{RECONNECT_ATTEMPTS, RECONNECT_COOLDOWN};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// How often and how patiently a reconnect retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of open attempts before giving up. 0 goes straight to simulation.
    pub max_attempts: u32,

    /// Sleep between two attempts. Not applied after the last one.
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RECONNECT_ATTEMPTS,
            cooldown: RECONNECT_COOLDOWN,
        }
    }
}

/// Something that can try to re-establish its link.
#[async_trait]
pub trait Recoverable {
    /// One recovery attempt. Returns the identity of what was reached.
    async fn recover(&self) -> Result<String, DeviceError>;
}

#[async_trait]
impl<D: Device + ?Sized> Recoverable for D {
    async fn recover(&self) -> Result<String, DeviceError> {
        self.try_open().await
    }
}

/// Result of a reconnect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectOutcome {
    /// Real hardware answered.
    Connected {
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed; the device now serves synthetic data.
    FellBackToSimulation {
        /// Attempts made.
        attempts: u32,
    },
    /// Another reconnect of the same device is still running.
    AlreadyInProgress,
}

/// Retry `recoverable` according to `policy`.
///
/// Returns the number of attempts used on success, or the last error.
pub async fn handle_recoverable_error<R: Recoverable + ?Sized>(
    recoverable: &R,
    policy: &RetryPolicy,
) -> Result<u32, (u32, Option<DeviceError>)> {
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match recoverable.recover().await {
            Ok(identity) => {
                debug!(attempt, identity = %identity, "Recovery attempt succeeded");
                return Ok(attempt);
            }
            Err(err) => {
                warn!(attempt, max = policy.max_attempts, error = %err, "Recovery attempt failed");
                last_error = Some(err);
            }
        }
        if attempt < policy.max_attempts {
            sleep(policy.cooldown).await;
        }
    }
    Err((policy.max_attempts, last_error))
}

/// Run the full reconnect sequence on one device.
pub async fn reconnect_device(device: &dyn Device, policy: &RetryPolicy) -> ReconnectOutcome {
    let id = device.id();
    info!(device = %id, attempts = policy.max_attempts, "Reconnecting");

    if let Err(err) = device.stop_output().await {
        debug!(device = %id, error = %err, "Could not stop output before reconnect");
    }
    device.disconnect().await;

    match handle_recoverable_error(device, policy).await {
        Ok(attempts) => {
            info!(device = %id, attempts, "Reconnected to hardware");
            ReconnectOutcome::Connected { attempts }
        }
        Err((attempts, last_error)) => {
            warn!(
                device = %id,
                attempts,
                error = ?last_error.map(|e| e.message),
                "Reconnect failed, falling back to simulation"
            );
            device.enter_simulation().await;
            ReconnectOutcome::FellBackToSimulation { attempts }
        }
    }
}

/// Per-device single-flight guard.
#[derive(Debug, Clone)]
pub struct ReconnectGate {
    locks: Arc<HashMap<DeviceId, Arc<Mutex<()>>>>,
}

impl ReconnectGate {
    /// A gate covering every device.
    pub fn new() -> Self {
        let locks = DeviceId::ALL
            .iter()
            .map(|id| (*id, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            locks: Arc::new(locks),
        }
    }

    /// Claim the device, or `None` when a reconnect is already running.
    pub fn try_acquire(&self, device: DeviceId) -> Option<OwnedMutexGuard<()>> {
        self.locks
            .get(&device)
            .and_then(|lock| lock.clone().try_lock_owned().ok())
    }
}

impl Default for ReconnectGate {
    fn default() -> Self {
        Self::new()
    }
}
