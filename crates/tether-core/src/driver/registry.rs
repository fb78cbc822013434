//! Driver registry: the drivers available at runtime, keyed by computing
//! resource kind.

use std::collections::HashMap;
use std::sync::Arc;

use tether_db::models::ComputingKind;

use super::{Driver, LocalDriver, RemoteDriver, RemoteHopDriver, SlurmDriver};
use crate::settings::Settings;
use crate::shell::Shell;

#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<ComputingKind, Box<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a driver for every [`ComputingKind`].
    pub fn with_builtin(shell: Arc<dyn Shell>, settings: Arc<Settings>) -> Self {
        let mut registry = Self::new();
        registry.register(LocalDriver::new(shell.clone(), settings.local.clone()));
        registry.register(RemoteDriver::new(shell.clone(), settings.clone()));
        registry.register(SlurmDriver::new(shell.clone(), settings.clone()));
        registry.register(RemoteHopDriver::new(shell, settings));
        registry
    }

    /// Register a driver under [`Driver::kind`], returning the one it
    /// replaces.
    pub fn register(&mut self, driver: impl Driver + 'static) -> Option<Box<dyn Driver>> {
        self.drivers.insert(driver.kind(), Box::new(driver))
    }

    pub fn get(&self, kind: ComputingKind) -> Option<&dyn Driver> {
        self.drivers.get(&kind).map(|d| d.as_ref())
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<ComputingKind> {
        ComputingKind::ALL
            .iter()
            .copied()
            .filter(|k| self.drivers.contains_key(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use tether_db::models::TaskStatus;
    use tether_db::queries::tasks::Launch;

    use super::*;
    use crate::driver::TaskContext;
    use crate::error::Result;
    use crate::shell::MockShell;

    struct FakeLocal;

    #[async_trait]
    impl Driver for FakeLocal {
        fn kind(&self) -> ComputingKind {
            ComputingKind::Local
        }

        async fn start(&self, _ctx: &TaskContext) -> Result<Launch> {
            Ok(Launch::default())
        }

        async fn stop(&self, _ctx: &TaskContext) -> Result<()> {
            Ok(())
        }

        async fn fetch_log(&self, _ctx: &TaskContext) -> Result<String> {
            Ok("fake".into())
        }

        async fn probe(&self, _ctx: &TaskContext) -> Result<Option<TaskStatus>> {
            Ok(None)
        }
    }

    #[test]
    fn empty_registry() {
        let registry = DriverRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(ComputingKind::Local).is_none());
    }

    #[test]
    fn builtin_covers_every_kind() {
        let registry =
            DriverRegistry::with_builtin(Arc::new(MockShell::new()), Arc::new(Settings::default()));
        assert_eq!(registry.len(), ComputingKind::ALL.len());
        assert_eq!(registry.kinds(), ComputingKind::ALL.to_vec());
        for kind in ComputingKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn register_replaces_same_kind() {
        let mut registry =
            DriverRegistry::with_builtin(Arc::new(MockShell::new()), Arc::new(Settings::default()));
        let old = registry.register(FakeLocal);
        assert_eq!(old.map(|d| d.kind()), Some(ComputingKind::Local));
        assert_eq!(registry.len(), ComputingKind::ALL.len());
    }

    #[test]
    fn debug_lists_kinds() {
        let mut registry = DriverRegistry::new();
        registry.register(FakeLocal);
        assert_eq!(format!("{registry:?}"), "DriverRegistry { kinds: [Local] }");
    }
}
