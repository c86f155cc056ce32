//! Hop API
//!
//! This crate lets local client processes control and observe the hop VPN
//! client without handling keys, profiles or the tunnel themselves. Every
//! request is checked against an allow-list of system accounts before it
//! touches any state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  API clients (any local user)               │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             │ unix socket, JSON lines
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ApiServer ──► ApiService                                   │
//! │                  │  AuthorizationGuard (allow-list)          │
//! │                  ├─► profiles (ProfileStore, importer)      │
//! │                  ├─► LifecycleController ──► EngineSlot ─┐  │
//! │                  └─► StatusHub ──► observers             │  │
//! │                        ▲                                 │  │
//! │                        └──── state transitions ──────────┤  │
//! └──────────────────────────────────────────────────────────┼──┘
//!                                                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Tunnel engine (ProcessEngine running ruhop)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod profile;
pub mod protocol;
pub mod server;
pub mod service;
pub mod status;

pub use auth::{
    AllowList, AuthorizationGuard, AuthorizationStore, CallerIdentity, IdentityResolver,
    SystemIdentityResolver,
};
pub use client::ApiClient;
pub use config::{ApiConfig, Config, EngineConfig, DEFAULT_SOCKET_PATH};
pub use engine::{EngineHandle, EngineSlot, ProcessEngine, StateListener};
pub use error::{DeliveryError, Error, ErrorKind, Result};
pub use hub::{ObserverId, StatusHub, StatusObserver};
pub use lifecycle::{
    InteractiveLauncher, LaunchReason, LaunchRequest, LifecycleController, LoggingLauncher,
    RootPermission, StartOutcome, TunnelPermission,
};
pub use profile::{
    ConfigImporter, MemoryProfileStore, Profile, ProfileRef, ProfileStore, TomlConfigImporter,
};
pub use protocol::{ApiRequest, ApiResponse, Intent, StatusUpdate};
pub use server::ApiServer;
pub use service::ApiService;
pub use status::{ConnectionLevel, StatusSnapshot};
