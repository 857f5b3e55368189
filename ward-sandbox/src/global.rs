//! Process-wide sandbox manager
//!
//! Lifecycle: constructed once (explicitly with [`install`] or lazily by the
//! first [`global`] call), shared as an `Arc`, retired by [`shutdown`].
//! A retired manager is never rebuilt behind the caller's back.

use crate::error::{Result, SandboxError};
use crate::manager::SandboxManager;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

enum Slot {
    Empty,
    Installed(Arc<SandboxManager>),
    ShutDown,
}

struct GlobalManager {
    slot: Mutex<Slot>,
}

impl GlobalManager {
    const fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn install(&self, manager: SandboxManager) -> Result<Arc<SandboxManager>> {
        let mut slot = self.lock();
        match *slot {
            Slot::Empty => {
                let manager = Arc::new(manager);
                *slot = Slot::Installed(manager.clone());
                Ok(manager)
            }
            Slot::Installed(_) => Err(SandboxError::AlreadyInstalled),
            Slot::ShutDown => Err(SandboxError::ShutDown),
        }
    }

    fn get(&self) -> Result<Arc<SandboxManager>> {
        let mut slot = self.lock();
        match &*slot {
            Slot::Installed(manager) => Ok(manager.clone()),
            Slot::ShutDown => Err(SandboxError::ShutDown),
            Slot::Empty => {
                let manager = Arc::new(SandboxManager::builder().build()?);
                info!("Initialized default process-wide sandbox manager");
                *slot = Slot::Installed(manager.clone());
                Ok(manager)
            }
        }
    }

    fn shutdown(&self) -> usize {
        let previous = std::mem::replace(&mut *self.lock(), Slot::ShutDown);
        match previous {
            Slot::Installed(manager) => {
                let terminated = manager.terminate_all();
                info!(terminated, "Process-wide sandbox manager shut down");
                terminated
            }
            Slot::Empty | Slot::ShutDown => 0,
        }
    }
}

static GLOBAL: GlobalManager = GlobalManager::new();

/// Install `manager` as the process-wide instance
pub fn install(manager: SandboxManager) -> Result<Arc<SandboxManager>> {
    GLOBAL.install(manager)
}

/// The process-wide manager, created with defaults on first use.
///
/// Fails with [`SandboxError::ShutDown`] once [`shutdown`] has run.
pub fn global() -> Result<Arc<SandboxManager>> {
    GLOBAL.get()
}

/// Terminate every active execution and retire the process-wide manager.
///
/// Returns the number of executions asked to terminate. Idempotent.
pub fn shutdown() -> usize {
    GLOBAL.shutdown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfiguration;
    use assert_matches::assert_matches;

    #[test]
    fn test_lazy_default_is_shared() {
        let global = GlobalManager::new();
        let first = global.get().unwrap();
        let second = global.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_matches!(
            global.install(SandboxManager::builder().build().unwrap()),
            Err(SandboxError::AlreadyInstalled)
        );
    }

    #[test]
    fn test_install_then_get() {
        let global = GlobalManager::new();
        let manager = SandboxManager::builder()
            .config(SandboxConfiguration::strict())
            .build()
            .unwrap();
        let installed = global.install(manager).unwrap();
        let fetched = global.get().unwrap();
        assert!(Arc::ptr_eq(&installed, &fetched));
        assert_eq!(fetched.config().mode, crate::policy::SandboxMode::Strict);
    }

    #[test]
    fn test_shutdown_is_permanent() {
        let global = GlobalManager::new();
        global.get().unwrap();
        assert_eq!(global.shutdown(), 0);
        assert_matches!(global.get(), Err(SandboxError::ShutDown));
        assert_matches!(
            global.install(SandboxManager::builder().build().unwrap()),
            Err(SandboxError::ShutDown)
        );
        assert_eq!(global.shutdown(), 0);
    }
}
