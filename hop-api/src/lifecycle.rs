//! Starting and controlling tunnels

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::EngineSlot;
use crate::error::{Error, Result};
use crate::profile::{Profile, ProfileStore};

/// Whether this process must be granted tunnel rights before starting one
pub trait TunnelPermission: Send + Sync {
    fn needs_grant(&self) -> bool;
}

/// Tunnel rights require running as root
#[derive(Debug, Default, Clone, Copy)]
pub struct RootPermission;

impl TunnelPermission for RootPermission {
    fn needs_grant(&self) -> bool {
        !nix::unistd::geteuid().is_root()
    }
}

/// Why a start needs the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchReason {
    /// Tunnel rights have not been granted yet
    TunnelPermission,
    /// The profile needs credentials
    UserInput,
}

/// Minimal confirmation flow for one profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub uuid: Uuid,
    pub reason: LaunchReason,
    /// Show only the confirmation, not the connection log
    pub hide_log: bool,
}

/// Hands a launch request to the interactive side; must not block
pub trait InteractiveLauncher: Send + Sync {
    fn launch(&self, request: LaunchRequest);
}

/// Launcher that only records the request in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLauncher;

impl InteractiveLauncher for LoggingLauncher {
    fn launch(&self, request: LaunchRequest) {
        log::info!(
            "Profile {} needs interaction before it can start ({:?})",
            request.uuid,
            request.reason
        );
    }
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Handed to the engine
    Started,
    /// Handed to the interactive launcher; the caller is not blocked on it
    NeedsInteraction(LaunchRequest),
}

/// Decides how a profile gets started and forwards tunnel controls
pub struct LifecycleController {
    engine: Arc<EngineSlot>,
    store: Arc<dyn ProfileStore>,
    permission: Arc<dyn TunnelPermission>,
    launcher: Arc<dyn InteractiveLauncher>,
}

impl LifecycleController {
    pub fn new(
        engine: Arc<EngineSlot>,
        store: Arc<dyn ProfileStore>,
        permission: Arc<dyn TunnelPermission>,
        launcher: Arc<dyn InteractiveLauncher>,
    ) -> Self {
        Self {
            engine,
            store,
            permission,
            launcher,
        }
    }

    /// Replace the tunnel permission check
    pub fn with_permission(mut self, permission: Arc<dyn TunnelPermission>) -> Self {
        self.permission = permission;
        self
    }

    /// Replace the interactive launcher
    pub fn with_launcher(mut self, launcher: Arc<dyn InteractiveLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Whether tunnel rights still have to be granted
    pub fn needs_permission(&self) -> bool {
        self.permission.needs_grant()
    }

    /// Start a validated profile, or hand it to the interactive flow
    pub async fn start(&self, profile: Profile) -> Result<StartOutcome> {
        let reason = if self.permission.needs_grant() {
            Some(LaunchReason::TunnelPermission)
        } else if profile.needs_user_input() {
            Some(LaunchReason::UserInput)
        } else {
            None
        };

        if let Some(reason) = reason {
            let request = LaunchRequest {
                uuid: profile.uuid,
                reason,
                hide_log: true,
            };
            self.launcher.launch(request.clone());
            return Ok(StartOutcome::NeedsInteraction(request));
        }

        let engine = self.engine.get().ok_or(Error::EngineUnavailable)?;

        self.store.take_temporary(&profile.uuid);
        self.store.set_last_connected(profile.uuid);
        engine.start(&profile).await?;
        Ok(StartOutcome::Started)
    }

    pub async fn stop(&self) {
        match self.engine.get() {
            Some(engine) => engine.stop().await,
            None => log::debug!("Ignoring stop, engine not bound"),
        }
    }

    pub async fn pause(&self) {
        match self.engine.get() {
            Some(engine) => engine.pause().await,
            None => log::debug!("Ignoring pause, engine not bound"),
        }
    }

    pub async fn resume(&self) {
        match self.engine.get() {
            Some(engine) => engine.resume().await,
            None => log::debug!("Ignoring resume, engine not bound"),
        }
    }
}
