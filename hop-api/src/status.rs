//! Connection status values shared by the hub, the engine and the wire protocol

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Connection level reported to observers
///
/// Levels are monotonic within one connection attempt and re-entered on
/// the next one: `NotConnected -> ConnectingNoReply -> ConnectingServerReplied
/// -> Connected -> NotConnected | AuthFailed | NoNetwork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionLevel {
    /// Tunnel is up
    Connected,
    /// Paused by the user
    VpnPaused,
    /// Server answered, handshake in progress
    ConnectingServerReplied,
    /// Tunnel process started, nothing heard from the server yet
    ConnectingNoReply,
    /// No usable network
    NoNetwork,
    /// Not connected
    NotConnected,
    /// Engine is starting up
    Start,
    /// Server rejected the credentials
    AuthFailed,
    /// Engine waits for credentials from the user
    WaitingForUserInput,
    /// Anything the engine reported that has no mapping
    Unknown,
}

impl ConnectionLevel {
    /// True for the levels in which a tunnel attempt is live
    pub fn is_connected_or_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionLevel::Connected
                | ConnectionLevel::ConnectingNoReply
                | ConnectionLevel::ConnectingServerReplied
        )
    }

    /// Name used on the wire for this level
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionLevel::Connected => "LEVEL_CONNECTED",
            ConnectionLevel::VpnPaused => "LEVEL_VPNPAUSED",
            ConnectionLevel::ConnectingServerReplied => "LEVEL_CONNECTING_SERVER_REPLIED",
            ConnectionLevel::ConnectingNoReply => "LEVEL_CONNECTING_NO_SERVER_REPLY_YET",
            ConnectionLevel::NoNetwork => "LEVEL_NONETWORK",
            ConnectionLevel::NotConnected => "LEVEL_NOTCONNECTED",
            ConnectionLevel::Start => "LEVEL_START",
            ConnectionLevel::AuthFailed => "LEVEL_AUTH_FAILED",
            ConnectionLevel::WaitingForUserInput => "LEVEL_WAITING_FOR_USER_INPUT",
            ConnectionLevel::Unknown => "UNKNOWN_LEVEL",
        }
    }

    const ALL: [ConnectionLevel; 10] = [
        ConnectionLevel::Connected,
        ConnectionLevel::VpnPaused,
        ConnectionLevel::ConnectingServerReplied,
        ConnectionLevel::ConnectingNoReply,
        ConnectionLevel::NoNetwork,
        ConnectionLevel::NotConnected,
        ConnectionLevel::Start,
        ConnectionLevel::AuthFailed,
        ConnectionLevel::WaitingForUserInput,
        ConnectionLevel::Unknown,
    ];
}

impl fmt::Display for ConnectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConnectionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.name() == s)
            .ok_or_else(|| format!("unknown connection level: {}", s))
    }
}

/// The most recent connection state, as delivered to observers
///
/// Held process-wide by the hub and replaced as a whole on every
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Profile of the most recent connection attempt, if known
    pub vpn_uuid: Option<Uuid>,
    /// Opaque engine state tag
    pub state: String,
    /// Human readable message
    pub message: String,
    /// Severity / level
    pub level: ConnectionLevel,
}

impl StatusSnapshot {
    /// Create a snapshot without an associated profile
    pub fn new(
        state: impl Into<String>,
        message: impl Into<String>,
        level: ConnectionLevel,
    ) -> Self {
        Self {
            vpn_uuid: None,
            state: state.into(),
            message: message.into(),
            level,
        }
    }

    /// Attach the profile of the most recent connection attempt
    pub fn with_profile(mut self, uuid: Option<Uuid>) -> Self {
        self.vpn_uuid = uuid;
        self
    }

    /// The value held before the engine reported anything
    pub fn initial() -> Self {
        Self::new("NOPROCESS", "No process running", ConnectionLevel::NotConnected)
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::initial()
    }
}

/// Translate a tunnel engine state name into a state tag and level
///
/// The names are the ones the `ruhop` engine reports on its control socket.
pub fn level_for_engine_state(state: &str) -> (&'static str, ConnectionLevel) {
    match state {
        "Connecting" => ("CONNECTING", ConnectionLevel::ConnectingNoReply),
        "Reconnecting" => ("RECONNECTING", ConnectionLevel::ConnectingNoReply),
        "Handshaking" => ("AUTH", ConnectionLevel::ConnectingServerReplied),
        "Connected" => ("CONNECTED", ConnectionLevel::Connected),
        "Disconnecting" => ("EXITING", ConnectionLevel::NotConnected),
        "Disconnected" => ("NOPROCESS", ConnectionLevel::NotConnected),
        "Error" => ("ERROR", ConnectionLevel::NoNetwork),
        _ => ("UNKNOWN", ConnectionLevel::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_or_connecting_set() {
        let live: Vec<_> = ConnectionLevel::ALL
            .iter()
            .filter(|l| l.is_connected_or_connecting())
            .copied()
            .collect();
        assert_eq!(live.len(), 3);
        assert!(live.contains(&ConnectionLevel::Connected));
        assert!(live.contains(&ConnectionLevel::ConnectingNoReply));
        assert!(live.contains(&ConnectionLevel::ConnectingServerReplied));
        assert!(!ConnectionLevel::VpnPaused.is_connected_or_connecting());
    }

    #[test]
    fn test_level_names_parse_back() {
        for level in ConnectionLevel::ALL {
            assert_eq!(level.name().parse::<ConnectionLevel>().unwrap(), level);
        }
        assert!("LEVEL_BOGUS".parse::<ConnectionLevel>().is_err());
    }

    #[test]
    fn test_engine_state_mapping() {
        assert_eq!(level_for_engine_state("Connected").1, ConnectionLevel::Connected);
        assert_eq!(
            level_for_engine_state("Handshaking").1,
            ConnectionLevel::ConnectingServerReplied
        );
        assert_eq!(level_for_engine_state("Disconnected").0, "NOPROCESS");
        assert_eq!(level_for_engine_state("???").1, ConnectionLevel::Unknown);
    }

    #[test]
    fn test_initial_snapshot_is_not_connected() {
        let snap = StatusSnapshot::default();
        assert_eq!(snap.level, ConnectionLevel::NotConnected);
        assert!(snap.vpn_uuid.is_none());
    }
}
