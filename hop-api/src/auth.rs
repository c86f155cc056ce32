//! Caller authorization
//!
//! API callers are identified by the uid of the process on the other end of
//! the control socket. The allow-list names system accounts; a caller is
//! authorized when one of the listed names resolves to its uid. Names that no
//! longer resolve are dropped from the list while checking.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nix::unistd::User;

use crate::error::{Error, Result};

/// OS-level identity of an API caller, resolved per request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    pub uid: u32,
}

impl CallerIdentity {
    pub fn new(uid: u32) -> Self {
        Self { uid }
    }

    /// Identity of the current process
    pub fn current() -> Self {
        Self::new(nix::unistd::getuid().as_raw())
    }
}

/// Maps an allow-list name to the identity it stands for
pub trait IdentityResolver: Send + Sync {
    /// `None` when the name no longer exists on the system
    fn resolve(&self, name: &str) -> Option<CallerIdentity>;
}

/// Resolves names through the system account database
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentityResolver;

impl IdentityResolver for SystemIdentityResolver {
    fn resolve(&self, name: &str) -> Option<CallerIdentity> {
        match User::from_name(name) {
            Ok(Some(user)) => Some(CallerIdentity::new(user.uid.as_raw())),
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to look up account '{}': {}", name, e);
                None
            }
        }
    }
}

/// Membership store of pre-approved caller names
pub trait AuthorizationStore: Send + Sync {
    /// Snapshot of all entries
    fn entries(&self) -> Vec<String>;

    fn is_allowed(&self, name: &str) -> bool;

    fn allow(&self, name: &str) -> Result<()>;

    /// Remove an entry; absent names are ignored
    fn remove(&self, name: &str) -> Result<()>;
}

/// Allow-list persisted as a JSON array of names
#[derive(Debug, Default)]
pub struct AllowList {
    path: Option<PathBuf>,
    names: RwLock<BTreeSet<String>>,
}

impl AllowList {
    /// Load the list from `path`; a missing file is an empty list
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let names = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<BTreeSet<String>>(&content)
                .map_err(|e| Error::Store(format!("invalid allow-list {:?}: {}", path, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            names: RwLock::new(names),
        })
    }

    /// A list that is never written to disk
    pub fn in_memory<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: None,
            names: RwLock::new(names.into_iter().map(Into::into).collect()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeSet<String>> {
        self.names.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeSet<String>> {
        self.names.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, names: &BTreeSet<String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(names)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl AuthorizationStore for AllowList {
    fn entries(&self) -> Vec<String> {
        self.read().iter().cloned().collect()
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.read().contains(name)
    }

    fn allow(&self, name: &str) -> Result<()> {
        let mut names = self.write();
        if names.insert(name.to_string()) {
            self.persist(&names)?;
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut names = self.write();
        if names.remove(name) {
            self.persist(&names)?;
        }
        Ok(())
    }
}

/// Checks API callers against the allow-list
#[derive(Clone)]
pub struct AuthorizationGuard {
    store: Arc<dyn AuthorizationStore>,
    resolver: Arc<dyn IdentityResolver>,
}

impl AuthorizationGuard {
    pub fn new(store: Arc<dyn AuthorizationStore>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { store, resolver }
    }

    /// The underlying allow-list
    pub fn store(&self) -> &Arc<dyn AuthorizationStore> {
        &self.store
    }

    /// Return the allow-list name matching `caller`
    ///
    /// Entries whose name no longer resolves are removed and skipped.
    pub fn authorize(&self, caller: CallerIdentity) -> Result<String> {
        for name in self.store.entries() {
            match self.resolver.resolve(&name) {
                Some(identity) if identity == caller => return Ok(name),
                Some(_) => {}
                None => {
                    log::info!("Removing stale allow-list entry '{}'", name);
                    if let Err(e) = self.store.remove(&name) {
                        log::warn!("Failed to remove stale entry '{}': {}", name, e);
                    }
                }
            }
        }

        log::warn!("Unauthorized API caller (uid {})", caller.uid);
        Err(Error::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedResolver(HashMap<String, u32>);

    impl FixedResolver {
        fn new(pairs: &[(&str, u32)]) -> Self {
            Self(pairs.iter().map(|(n, u)| (n.to_string(), *u)).collect())
        }
    }

    impl IdentityResolver for FixedResolver {
        fn resolve(&self, name: &str) -> Option<CallerIdentity> {
            self.0.get(name).copied().map(CallerIdentity::new)
        }
    }

    fn guard(entries: &[&str], pairs: &[(&str, u32)]) -> (AuthorizationGuard, Arc<AllowList>) {
        let store = Arc::new(AllowList::in_memory(entries.iter().copied()));
        let guard = AuthorizationGuard::new(store.clone(), Arc::new(FixedResolver::new(pairs)));
        (guard, store)
    }

    #[test]
    fn test_authorize_matching_caller() {
        let (guard, _) = guard(&["alice", "bob"], &[("alice", 1000), ("bob", 1001)]);
        assert_eq!(guard.authorize(CallerIdentity::new(1001)).unwrap(), "bob");
    }

    #[test]
    fn test_unknown_caller_is_rejected() {
        let (guard, store) = guard(&["alice"], &[("alice", 1000)]);
        let result = guard.authorize(CallerIdentity::new(4242));
        assert!(matches!(result, Err(Error::Unauthorized)));
        assert_eq!(store.entries(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_stale_entries_are_removed_without_failing_others() {
        // "ghost" sorts before "zed" and no longer exists
        let (guard, store) = guard(&["ghost", "zed"], &[("zed", 1000)]);
        assert_eq!(guard.authorize(CallerIdentity::new(1000)).unwrap(), "zed");
        assert!(!store.is_allowed("ghost"));
        assert!(store.is_allowed("zed"));
    }

    #[test]
    fn test_empty_list_rejects_everyone() {
        let (guard, _) = guard(&[], &[("alice", 1000)]);
        assert!(guard.authorize(CallerIdentity::new(1000)).is_err());
    }

    #[test]
    fn test_allow_list_persists_to_file() {
        let dir = std::env::temp_dir().join(format!("hop-api-allow-{}", uuid::Uuid::new_v4()));
        let path = dir.join("allowed.json");

        let list = AllowList::load(&path).unwrap();
        assert!(list.entries().is_empty());
        list.allow("alice").unwrap();
        list.allow("bob").unwrap();
        list.remove("bob").unwrap();
        list.remove("nobody").unwrap();

        let reloaded = AllowList::load(&path).unwrap();
        assert_eq!(reloaded.entries(), vec!["alice".to_string()]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_system_resolver_knows_root() {
        assert_eq!(SystemIdentityResolver.resolve("root"), Some(CallerIdentity::new(0)));
        assert!(SystemIdentityResolver
            .resolve("no-such-account-hop-api")
            .is_none());
    }
}
