//! The tunnel engine seen from the control API
//!
//! The API never owns the engine. It reaches it through an [`EngineSlot`]
//! holding a weak reference, so the engine may be unbound or torn down at
//! any time and lifecycle requests then do nothing.

mod process;

use std::os::fd::BorrowedFd;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::error::Result;
use crate::profile::Profile;
use crate::status::ConnectionLevel;

pub use process::ProcessEngine;

/// Control handle of a tunnel engine
#[async_trait::async_trait]
pub trait EngineHandle: Send + Sync {
    /// Start a tunnel for `profile`, replacing any running one
    async fn start(&self, profile: &Profile) -> Result<()>;

    /// Ask the tunnel to stop; returns before it has stopped
    async fn stop(&self);

    async fn pause(&self);

    async fn resume(&self);

    /// Exempt a socket from tunnel routing
    ///
    /// Returns `Ok(false)` when the platform cannot protect sockets.
    fn protect(&self, fd: BorrowedFd<'_>) -> Result<bool>;
}

/// Receiver of engine state transitions
pub trait StateListener: Send + Sync {
    fn on_state(&self, state: &str, message: &str, level: ConnectionLevel);
}

/// Weak binding to the current engine
#[derive(Default)]
pub struct EngineSlot {
    engine: RwLock<Option<Weak<dyn EngineHandle>>>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `engine` without extending its lifetime
    pub fn bind(&self, engine: &Arc<dyn EngineHandle>) {
        *self.engine.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(engine));
    }

    pub fn unbind(&self) {
        *self.engine.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The engine, if bound and still alive
    pub fn get(&self) -> Option<Arc<dyn EngineHandle>> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn is_bound(&self) -> bool {
        self.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEngine;

    #[async_trait::async_trait]
    impl EngineHandle for NullEngine {
        async fn start(&self, _profile: &Profile) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn pause(&self) {}
        async fn resume(&self) {}
        fn protect(&self, _fd: BorrowedFd<'_>) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_slot_does_not_keep_engine_alive() {
        let slot = EngineSlot::new();
        assert!(!slot.is_bound());

        let engine: Arc<dyn EngineHandle> = Arc::new(NullEngine);
        slot.bind(&engine);
        assert!(slot.is_bound());

        drop(engine);
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_unbind() {
        let slot = EngineSlot::new();
        let engine: Arc<dyn EngineHandle> = Arc::new(NullEngine);
        slot.bind(&engine);
        slot.unbind();
        assert!(!slot.is_bound());
    }
}
