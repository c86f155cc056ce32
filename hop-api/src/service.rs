//! The externally callable control surface
//!
//! Every operation except [`ApiService::check_pre_approved`] first runs the
//! [`AuthorizationGuard`] and fails with [`Error::Unauthorized`] before
//! touching any state.

use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::auth::{AuthorizationGuard, CallerIdentity};
use crate::engine::{EngineSlot, StateListener};
use crate::error::{Error, Result};
use crate::hub::{ObserverId, StatusHub, StatusObserver};
use crate::lifecycle::{
    InteractiveLauncher, LifecycleController, LoggingLauncher, RootPermission, StartOutcome,
    TunnelPermission,
};
use crate::profile::{ConfigImporter, Profile, ProfileRef, ProfileStore, TomlConfigImporter};
use crate::protocol::Intent;
use crate::status::{ConnectionLevel, StatusSnapshot};

/// Control surface shared by all API connections
pub struct ApiService {
    guard: AuthorizationGuard,
    store: Arc<dyn ProfileStore>,
    importer: Arc<dyn ConfigImporter>,
    engine: Arc<EngineSlot>,
    lifecycle: LifecycleController,
    hub: StatusHub,
}

impl ApiService {
    /// Create the service and start its status hub
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        guard: AuthorizationGuard,
        store: Arc<dyn ProfileStore>,
        engine: Arc<EngineSlot>,
        delivery_timeout: Duration,
    ) -> Self {
        let lifecycle = LifecycleController::new(
            engine.clone(),
            store.clone(),
            Arc::new(RootPermission),
            Arc::new(LoggingLauncher),
        );
        Self {
            guard,
            store,
            importer: Arc::new(TomlConfigImporter),
            engine,
            lifecycle,
            hub: StatusHub::start(delivery_timeout),
        }
    }

    pub fn with_importer(mut self, importer: Arc<dyn ConfigImporter>) -> Self {
        self.importer = importer;
        self
    }

    pub fn with_permission(mut self, permission: Arc<dyn TunnelPermission>) -> Self {
        self.lifecycle = self.lifecycle.with_permission(permission);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn InteractiveLauncher>) -> Self {
        self.lifecycle = self.lifecycle.with_launcher(launcher);
        self
    }

    /// Slot the tunnel engine binds to
    pub fn engine_slot(&self) -> &Arc<EngineSlot> {
        &self.engine
    }

    pub fn hub(&self) -> &StatusHub {
        &self.hub
    }

    /// Run the guard alone; returns the allow-list name of the caller
    pub fn authorize(&self, caller: CallerIdentity) -> Result<String> {
        self.guard.authorize(caller)
    }

    /// All profiles not marked as deleted
    pub fn list_profiles(&self, caller: CallerIdentity) -> Result<Vec<ProfileRef>> {
        self.guard.authorize(caller)?;
        let mut profiles: Vec<ProfileRef> = self
            .store
            .profiles()
            .into_iter()
            .filter(|profile| !profile.deleted)
            .map(|profile| profile.to_ref())
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name).then(a.uuid.cmp(&b.uuid)));
        Ok(profiles)
    }

    /// Import `config` and register it as a profile owned by the caller
    ///
    /// Import and store failures are logged and yield `None`.
    pub fn add_profile_detailed(
        &self,
        caller: CallerIdentity,
        name: &str,
        user_editable: bool,
        config: &str,
    ) -> Result<Option<ProfileRef>> {
        let creator = self.guard.authorize(caller)?;

        match self.import_and_register(creator, name, user_editable, config) {
            Ok(profile) => Ok(Some(profile)),
            Err(e) => {
                log::warn!("Failed to add profile '{}': {}", name, e);
                Ok(None)
            }
        }
    }

    /// Like [`ApiService::add_profile_detailed`] with an editable profile
    pub fn add_profile(&self, caller: CallerIdentity, name: &str, config: &str) -> Result<bool> {
        Ok(self
            .add_profile_detailed(caller, name, true, config)?
            .is_some())
    }

    fn import_and_register(
        &self,
        creator: String,
        name: &str,
        user_editable: bool,
        config: &str,
    ) -> Result<ProfileRef> {
        let mut profile = self.importer.import(config)?;
        profile.name = name.to_string();
        profile.user_editable = user_editable;
        profile.creator = Some(creator);

        let uuid = profile.uuid;
        self.store.add(profile.clone())?;

        let saved = self
            .store
            .save_profile(&profile)
            .and_then(|()| self.store.save_listing());
        if let Err(e) = saved {
            let _ = self.store.remove(&uuid);
            return Err(e);
        }

        log::info!("Added profile '{}' ({})", profile.name, uuid);
        Ok(profile.to_ref())
    }

    /// Remove a profile; unknown ids are ignored
    pub fn remove_profile(&self, caller: CallerIdentity, uuid: Uuid) -> Result<()> {
        self.guard.authorize(caller)?;
        if let Some(profile) = self.store.get(&uuid) {
            self.store.remove(&profile.uuid)?;
            log::info!("Removed profile '{}' ({})", profile.name, uuid);
        }
        Ok(())
    }

    /// Start a stored profile
    ///
    /// Returns the interaction the user has to complete when the profile
    /// cannot be started headlessly.
    pub async fn start_profile(
        &self,
        caller: CallerIdentity,
        uuid: Uuid,
    ) -> Result<Option<Intent>> {
        self.guard.authorize(caller)?;
        let profile = self
            .store
            .get(&uuid)
            .ok_or_else(|| Error::Validation(format!("unknown profile {}", uuid)))?;
        validate(&profile)?;
        self.launch(profile).await
    }

    /// Start a one-off profile parsed from `config`
    pub async fn start_inline_config(
        &self,
        caller: CallerIdentity,
        name: &str,
        config: &str,
    ) -> Result<Option<Intent>> {
        self.guard.authorize(caller)?;
        let mut profile = self.importer.import(config)?;
        profile.name = name.to_string();
        validate(&profile)?;

        self.store.set_temporary(profile.clone());
        self.launch(profile).await
    }

    async fn launch(&self, profile: Profile) -> Result<Option<Intent>> {
        log::info!("Starting profile '{}' ({})", profile.name, profile.uuid);
        Ok(match self.lifecycle.start(profile).await? {
            StartOutcome::Started => None,
            StartOutcome::NeedsInteraction(request) => Some(Intent::LaunchProfile {
                uuid: request.uuid,
                hide_log: request.hide_log,
            }),
        })
    }

    /// Exempt `fd` from tunnel routing
    pub fn protect_socket(&self, caller: CallerIdentity, fd: BorrowedFd<'_>) -> Result<bool> {
        self.guard.authorize(caller)?;
        let engine = self.engine.get().ok_or(Error::EngineUnavailable)?;
        engine.protect(fd)
    }

    /// Consent flow `caller_name` has to go through before using the API
    ///
    /// Not guarded; `None` means the name is already allowed.
    pub fn check_pre_approved(&self, caller_name: &str) -> Option<Intent> {
        if self.guard.store().is_allowed(caller_name) {
            None
        } else {
            Some(Intent::ConfirmApi)
        }
    }

    /// Grant flow needed before this process may open tunnels, if any
    pub fn check_tunnel_permission(&self, caller: CallerIdentity) -> Result<Option<Intent>> {
        self.guard.authorize(caller)?;
        Ok(self
            .lifecycle
            .needs_permission()
            .then_some(Intent::GrantTunnelPermission))
    }

    /// Register `observer` and deliver the current snapshot to it
    ///
    /// Fails with [`Error::ShutDown`] after [`ApiService::shutdown`].
    pub async fn register_observer(
        &self,
        caller: CallerIdentity,
        observer: Arc<dyn StatusObserver>,
    ) -> Result<()> {
        self.guard.authorize(caller)?;
        log::debug!("Registering {}", observer.id());
        if !self.hub.register(observer).await {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    pub fn unregister_observer(&self, caller: CallerIdentity, id: ObserverId) -> Result<()> {
        self.guard.authorize(caller)?;
        if self.hub.unregister(id) {
            log::debug!("Unregistered {}", id);
        }
        Ok(())
    }

    /// Current snapshot and whether it counts as connected or connecting
    pub fn status(&self, caller: CallerIdentity) -> Result<(StatusSnapshot, bool)> {
        self.guard.authorize(caller)?;
        Ok((self.hub.snapshot(), self.hub.is_connected_or_connecting()))
    }

    pub async fn stop(&self, caller: CallerIdentity) -> Result<()> {
        self.guard.authorize(caller)?;
        self.lifecycle.stop().await;
        Ok(())
    }

    pub async fn pause(&self, caller: CallerIdentity) -> Result<()> {
        self.guard.authorize(caller)?;
        self.lifecycle.pause().await;
        Ok(())
    }

    pub async fn resume(&self, caller: CallerIdentity) -> Result<()> {
        self.guard.authorize(caller)?;
        self.lifecycle.resume().await;
        Ok(())
    }

    /// Drop every observer and detach from the engine
    pub fn shutdown(&self) {
        self.hub.shutdown();
        self.engine.unbind();
        log::info!("API service shut down");
    }
}

fn validate(profile: &Profile) -> Result<()> {
    profile
        .check()
        .map_err(|issue| Error::Validation(issue.to_string()))
}

impl StateListener for ApiService {
    fn on_state(&self, state: &str, message: &str, level: ConnectionLevel) {
        log::debug!("Tunnel state {} ({}): {}", state, level, message);
        let snapshot =
            StatusSnapshot::new(state, message, level).with_profile(self.store.last_connected());
        self.hub.on_transition(snapshot);
    }
}
