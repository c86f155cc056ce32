//! VPN profiles, the profile store and the configuration importer
//!
//! A profile wraps a tunnel configuration in the TOML format understood by
//! the `ruhop` client:
//!
//! ```toml
//! [common]
//! key = "my-secret-key"
//! mtu = 1400
//!
//! [client]
//! server = ["vpn1.example.com", "vpn2.example.com"]
//! port_range = [4096, 4196]
//! route_all_traffic = true
//! ```
//!
//! Leaving out `key` and setting `ask_key = true` makes the profile require
//! interactive input before it can be started.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Smallest MTU the tunnel accepts
pub const MIN_MTU: u16 = 576;

/// Public view of a profile, as listed to API callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub uuid: Uuid,
    pub name: String,
    pub user_editable: bool,
    /// Name of the API caller that created the profile
    pub creator: Option<String>,
}

/// A VPN profile record
#[derive(Debug, Clone)]
pub struct Profile {
    /// Immutable unique id
    pub uuid: Uuid,
    pub name: String,
    pub user_editable: bool,
    pub creator: Option<String>,
    /// Marked for deletion; hidden from listings
    pub deleted: bool,
    /// Parsed tunnel configuration
    pub config: TunnelConfig,
    /// Configuration text the profile was imported from
    pub source: String,
}

impl Profile {
    /// Create a profile with a fresh id from a parsed configuration
    pub fn new(config: TunnelConfig, source: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: String::new(),
            user_editable: true,
            creator: None,
            deleted: false,
            config,
            source: source.into(),
        }
    }

    /// Public reference to this profile
    pub fn to_ref(&self) -> ProfileRef {
        ProfileRef {
            uuid: self.uuid,
            name: self.name.clone(),
            user_editable: self.user_editable,
            creator: self.creator.clone(),
        }
    }

    /// Semantic self-check; `Ok(())` means "no error"
    pub fn check(&self) -> std::result::Result<(), ProfileIssue> {
        self.config.check()
    }

    /// Whether starting this profile needs credentials from the user
    pub fn needs_user_input(&self) -> bool {
        self.config.common.ask_key && self.config.common.key.as_deref().map_or(true, str::is_empty)
    }
}

/// Reason a profile failed its self-check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileIssue {
    NoServer,
    NoKey,
    InvalidPortRange { start: u16, end: u16 },
    MtuTooSmall(u16),
}

impl std::fmt::Display for ProfileIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileIssue::NoServer => write!(f, "server address is required"),
            ProfileIssue::NoKey => write!(f, "key is required (or set ask_key)"),
            ProfileIssue::InvalidPortRange { start, end } => {
                write!(f, "port_range start {} must be <= end {}", start, end)
            }
            ProfileIssue::MtuTooSmall(mtu) => {
                write!(f, "MTU {} is too small (minimum {})", mtu, MIN_MTU)
            }
        }
    }
}

/// Tunnel configuration carried by a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub common: CommonSection,
    pub client: ClientSection,
}

impl TunnelConfig {
    fn check(&self) -> std::result::Result<(), ProfileIssue> {
        if self.client.server.is_empty() {
            return Err(ProfileIssue::NoServer);
        }

        let [start, end] = self.client.port_range;
        if start > end {
            return Err(ProfileIssue::InvalidPortRange { start, end });
        }

        if self.common.mtu < MIN_MTU {
            return Err(ProfileIssue::MtuTooSmall(self.common.mtu));
        }

        if self.common.key.as_deref().map_or(true, str::is_empty) && !self.common.ask_key {
            return Err(ProfileIssue::NoKey);
        }

        Ok(())
    }
}

/// Settings shared with the tunnel's `[common]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonSection {
    /// Pre-shared key
    #[serde(default)]
    pub key: Option<String>,

    /// Ask the user for the key when the profile starts
    #[serde(default)]
    pub ask_key: bool,

    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for CommonSection {
    fn default() -> Self {
        Self {
            key: None,
            ask_key: false,
            mtu: default_mtu(),
        }
    }
}

/// The tunnel's `[client]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Server host(s), ports come from `port_range`
    pub server: ServerAddress,

    #[serde(default = "default_port_range")]
    pub port_range: [u16; 2],

    /// Requested tunnel address, assigned by the server when unset
    #[serde(default)]
    pub tunnel_ip: Option<Ipv4Addr>,

    #[serde(default = "default_true")]
    pub route_all_traffic: bool,
}

/// Server address configuration, one host or several
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerAddress {
    Single(String),
    Multiple(Vec<String>),
}

impl ServerAddress {
    /// Get all hosts as a slice
    pub fn hosts(&self) -> Vec<&str> {
        match self {
            ServerAddress::Single(s) => vec![s.as_str()],
            ServerAddress::Multiple(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        match self {
            ServerAddress::Single(s) => s.is_empty(),
            ServerAddress::Multiple(v) => v.is_empty() || v.iter().all(|s| s.is_empty()),
        }
    }
}

fn default_mtu() -> u16 {
    1400
}

fn default_port_range() -> [u16; 2] {
    [4096, 4196]
}

fn default_true() -> bool {
    true
}

/// Parses configuration text into a profile
pub trait ConfigImporter: Send + Sync {
    /// Parse `text`; the returned profile has a fresh id and no name
    fn import(&self, text: &str) -> Result<Profile>;
}

/// Importer for the TOML tunnel configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct TomlConfigImporter;

impl ConfigImporter for TomlConfigImporter {
    fn import(&self, text: &str) -> Result<Profile> {
        let config: TunnelConfig =
            toml::from_str(text).map_err(|e| Error::Import(e.message().to_string()))?;
        Ok(Profile::new(config, text))
    }
}

/// Storage of profile records
///
/// `add` only registers a profile in memory; it is considered registered
/// once `save_profile` and `save_listing` have succeeded as well.
pub trait ProfileStore: Send + Sync {
    /// All stored profiles, deleted ones included
    fn profiles(&self) -> Vec<Profile>;

    /// Look up a stored profile, or the pending temporary one
    fn get(&self, uuid: &Uuid) -> Option<Profile>;

    fn add(&self, profile: Profile) -> Result<()>;

    /// Persist one profile record
    fn save_profile(&self, profile: &Profile) -> Result<()>;

    /// Persist the list of profiles
    fn save_listing(&self) -> Result<()>;

    /// Remove a profile; unknown ids are ignored
    fn remove(&self, uuid: &Uuid) -> Result<()>;

    /// Hold a profile for exactly one subsequent start
    fn set_temporary(&self, profile: Profile);

    /// Take the temporary profile if it has this id
    fn take_temporary(&self, uuid: &Uuid) -> Option<Profile>;

    /// Remember the profile of the most recent connection attempt
    fn set_last_connected(&self, uuid: Uuid);

    fn last_connected(&self) -> Option<Uuid>;
}

/// In-memory profile store
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<Uuid, Profile>>,
    temporary: Mutex<Option<Profile>>,
    last_connected: Mutex<Option<Uuid>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn temporary(&self) -> MutexGuard<'_, Option<Profile>> {
        self.temporary.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProfileStore for MemoryProfileStore {
    fn profiles(&self) -> Vec<Profile> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        profiles.values().cloned().collect()
    }

    fn get(&self, uuid: &Uuid) -> Option<Profile> {
        let stored = self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned();
        stored.or_else(|| {
            self.temporary()
                .as_ref()
                .filter(|p| &p.uuid == uuid)
                .cloned()
        })
    }

    fn add(&self, profile: Profile) -> Result<()> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        if profiles.contains_key(&profile.uuid) {
            return Err(Error::Store(format!("profile {} already exists", profile.uuid)));
        }
        profiles.insert(profile.uuid, profile);
        Ok(())
    }

    fn save_profile(&self, profile: &Profile) -> Result<()> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        match profiles.get_mut(&profile.uuid) {
            Some(stored) => {
                *stored = profile.clone();
                Ok(())
            }
            None => Err(Error::Store(format!("profile {} is not stored", profile.uuid))),
        }
    }

    fn save_listing(&self) -> Result<()> {
        Ok(())
    }

    fn remove(&self, uuid: &Uuid) -> Result<()> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        profiles.remove(uuid);
        Ok(())
    }

    fn set_temporary(&self, profile: Profile) {
        *self.temporary() = Some(profile);
    }

    fn take_temporary(&self, uuid: &Uuid) -> Option<Profile> {
        let mut temporary = self.temporary();
        if temporary.as_ref().is_some_and(|p| &p.uuid == uuid) {
            temporary.take()
        } else {
            None
        }
    }

    fn set_last_connected(&self, uuid: Uuid) {
        *self.last_connected.lock().unwrap_or_else(PoisonError::into_inner) = Some(uuid);
    }

    fn last_connected(&self) -> Option<Uuid> {
        *self.last_connected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[common]
key = "test-key"

[client]
server = "127.0.0.1"
"#;

    #[test]
    fn test_import_minimal_config() {
        let profile = TomlConfigImporter.import(MINIMAL).unwrap();
        assert!(profile.check().is_ok());
        assert!(!profile.needs_user_input());
        assert_eq!(profile.config.client.port_range, [4096, 4196]);
        assert_eq!(profile.config.common.mtu, 1400);
        assert_eq!(profile.source, MINIMAL);
    }

    #[test]
    fn test_import_rejects_malformed_text() {
        let result = TomlConfigImporter.import("this is [not toml");
        assert!(matches!(result, Err(Error::Import(_))));

        // Well-formed TOML without a client table
        let result = TomlConfigImporter.import("[common]\nkey = \"k\"\n");
        assert!(matches!(result, Err(Error::Import(_))));
    }

    #[test]
    fn test_import_multiple_hosts() {
        let text = r#"
[common]
key = "k"

[client]
server = ["10.0.0.1", "10.0.0.2"]
port_range = [5000, 5009]
"#;
        let profile = TomlConfigImporter.import(text).unwrap();
        assert!(matches!(profile.config.client.server, ServerAddress::Multiple(_)));
        assert_eq!(profile.config.client.server.hosts().len(), 2);
    }

    #[test]
    fn test_check_reports_missing_key() {
        let text = "[client]\nserver = \"127.0.0.1\"\n";
        let profile = TomlConfigImporter.import(text).unwrap();
        assert_eq!(profile.check(), Err(ProfileIssue::NoKey));
    }

    #[test]
    fn test_check_reports_bad_port_range_and_mtu() {
        let text = "[common]\nkey = \"k\"\n[client]\nserver = \"h\"\nport_range = [10, 5]\n";
        let profile = TomlConfigImporter.import(text).unwrap();
        assert_eq!(
            profile.check(),
            Err(ProfileIssue::InvalidPortRange { start: 10, end: 5 })
        );

        let text = "[common]\nkey = \"k\"\nmtu = 500\n[client]\nserver = \"h\"\n";
        let profile = TomlConfigImporter.import(text).unwrap();
        assert_eq!(profile.check(), Err(ProfileIssue::MtuTooSmall(500)));
    }

    #[test]
    fn test_ask_key_needs_user_input() {
        let text = "[common]\nask_key = true\n[client]\nserver = \"h\"\n";
        let profile = TomlConfigImporter.import(text).unwrap();
        assert!(profile.check().is_ok());
        assert!(profile.needs_user_input());
    }

    #[test]
    fn test_store_temporary_is_taken_once() {
        let store = MemoryProfileStore::new();
        let profile = TomlConfigImporter.import(MINIMAL).unwrap();
        let uuid = profile.uuid;

        store.set_temporary(profile);
        assert!(store.get(&uuid).is_some());
        assert!(store.profiles().is_empty());

        assert!(store.take_temporary(&uuid).is_some());
        assert!(store.take_temporary(&uuid).is_none());
        assert!(store.get(&uuid).is_none());
    }

    #[test]
    fn test_store_remove_unknown_is_noop() {
        let store = MemoryProfileStore::new();
        let profile = TomlConfigImporter.import(MINIMAL).unwrap();
        store.add(profile).unwrap();

        store.remove(&Uuid::new_v4()).unwrap();
        assert_eq!(store.profiles().len(), 1);
    }

    #[test]
    fn test_store_rejects_duplicate_add() {
        let store = MemoryProfileStore::new();
        let profile = TomlConfigImporter.import(MINIMAL).unwrap();
        store.add(profile.clone()).unwrap();
        assert!(matches!(store.add(profile), Err(Error::Store(_))));
    }
}
