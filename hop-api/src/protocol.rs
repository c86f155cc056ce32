//! Messages exchanged on the API control socket
//!
//! Every message is one JSON object on its own line. Clients send
//! [`ApiRequest`]s; the server answers each with one [`ApiResponse`] and, on
//! connections registered as observers, interleaves
//! [`ApiResponse::StatusUpdate`] pushes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::profile::ProfileRef;
use crate::status::{ConnectionLevel, StatusSnapshot};

/// Request messages sent to the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiRequest {
    /// List stored profiles
    ListProfiles,
    /// Start a stored profile
    StartProfile {
        /// Profile to start
        uuid: Uuid,
    },
    /// Start a configuration without storing it
    StartInlineConfig {
        /// Display name of the one-off profile
        name: String,
        /// Tunnel configuration text (TOML)
        config: String,
    },
    /// Import a configuration as an editable profile
    AddProfile {
        /// Display name
        name: String,
        /// Tunnel configuration text (TOML)
        config: String,
    },
    /// Import a configuration and reply with the new profile
    AddProfileDetailed {
        /// Display name
        name: String,
        /// Whether the user may edit the profile
        user_editable: bool,
        /// Tunnel configuration text (TOML)
        config: String,
    },
    /// Remove a profile; unknown ids are ignored
    RemoveProfile {
        /// Profile to remove
        uuid: Uuid,
    },
    /// Exempt a socket from tunnel routing
    ///
    /// The socket travels as an `SCM_RIGHTS` descriptor.
    ProtectSocket,
    /// Ask which consent flow a caller needs; answered without authorization
    CheckPreApproved {
        /// Account name of the prospective caller
        caller_name: String,
    },
    /// Ask whether tunnel rights still have to be granted
    CheckTunnelPermission,
    /// Subscribe this connection to status pushes
    RegisterObserver,
    /// Stop status pushes to this connection
    UnregisterObserver,
    /// Get the current status
    Status,
    /// Stop the tunnel
    Stop,
    /// Pause the tunnel
    Pause,
    /// Resume a paused tunnel
    Resume,
}

impl ApiRequest {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ApiRequest::ListProfiles => "list_profiles",
            ApiRequest::StartProfile { .. } => "start_profile",
            ApiRequest::StartInlineConfig { .. } => "start_inline_config",
            ApiRequest::AddProfile { .. } => "add_profile",
            ApiRequest::AddProfileDetailed { .. } => "add_profile_detailed",
            ApiRequest::RemoveProfile { .. } => "remove_profile",
            ApiRequest::ProtectSocket => "protect_socket",
            ApiRequest::CheckPreApproved { .. } => "check_pre_approved",
            ApiRequest::CheckTunnelPermission => "check_tunnel_permission",
            ApiRequest::RegisterObserver => "register_observer",
            ApiRequest::UnregisterObserver => "unregister_observer",
            ApiRequest::Status => "status",
            ApiRequest::Stop => "stop",
            ApiRequest::Pause => "pause",
            ApiRequest::Resume => "resume",
        }
    }
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResponse {
    /// Success acknowledgment
    Ok,
    /// Boolean result
    Bool {
        value: bool,
    },
    /// Profile list
    Profiles {
        profiles: Vec<ProfileRef>,
    },
    /// Newly added profile; `None` when the import failed
    Profile {
        profile: Option<ProfileRef>,
    },
    /// Interaction the caller has to complete, if any
    Intent {
        intent: Option<Intent>,
    },
    /// Status response
    Status {
        /// Current status
        status: StatusUpdate,
        /// Whether the status counts as connected or connecting
        connected_or_connecting: bool,
    },
    /// Error response
    Error {
        /// Error category
        kind: ErrorKind,
        /// Error message without the category prefix
        message: String,
    },
    /// Pushed to observers, never a reply
    StatusUpdate(StatusUpdate),
}

impl ApiResponse {
    /// `error` reply for `error`
    pub fn from_error(error: &Error) -> Self {
        ApiResponse::Error {
            kind: error.kind(),
            message: error.detail(),
        }
    }

    /// Turn an `error` reply back into an [`Error`]
    pub fn into_result(self) -> Result<Self> {
        match self {
            ApiResponse::Error { kind, message } => Err(Error::from_remote(kind, message)),
            other => Ok(other),
        }
    }
}

/// Interactive flows a caller may have to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Intent {
    /// Ask the user to approve this caller for API use
    ConfirmApi,
    /// Ask the user to grant tunnel rights
    GrantTunnelPermission,
    /// Confirm and start a profile
    LaunchProfile { uuid: Uuid, hide_log: bool },
}

/// Status as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Profile the status belongs to, if known
    pub vpn_uuid: Option<Uuid>,
    /// Tunnel state, e.g. `CONNECTED`
    pub state: String,
    /// Human-readable detail
    pub message: String,
    /// Level name, e.g. `LEVEL_CONNECTED`
    pub level: String,
}

impl StatusUpdate {
    /// Parse back into a snapshot
    pub fn to_snapshot(&self) -> Result<StatusSnapshot> {
        let level: ConnectionLevel = self.level.parse().map_err(Error::Protocol)?;
        Ok(StatusSnapshot::new(self.state.clone(), self.message.clone(), level)
            .with_profile(self.vpn_uuid))
    }
}

impl From<&StatusSnapshot> for StatusUpdate {
    fn from(status: &StatusSnapshot) -> Self {
        Self {
            vpn_uuid: status.vpn_uuid,
            state: status.state.clone(),
            message: status.message.clone(),
            level: status.level.name().to_string(),
        }
    }
}

/// Serialize a message as one line
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
