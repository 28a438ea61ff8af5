//! Module → service access control
//!
//! The table is an immutable snapshot behind [`ArcSwap`]: `has_permission`
//! never blocks, and writers publish a whole new table under a short mutex.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::PermissionsConfig;
use crate::core::{ModuleId, ServiceId};

type Table = BTreeMap<ModuleId, BTreeSet<ServiceId>>;

/// Full permission table plus its reverse index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionsReport {
    /// Services each module may read
    pub modules: BTreeMap<ModuleId, BTreeSet<ServiceId>>,
    /// Modules that may read each service
    pub services: BTreeMap<ServiceId, BTreeSet<ModuleId>>,
}

/// Which modules may read which services' keys
#[derive(Debug)]
pub struct PermissionRegistry {
    table: ArcSwap<Table>,
    admin: Option<ModuleId>,
    write: Mutex<()>,
}

impl PermissionRegistry {
    /// Empty registry, optionally with an admin module
    pub fn new(admin: Option<ModuleId>) -> Self {
        let mut table = Table::new();
        if let Some(admin) = &admin {
            table.insert(admin.clone(), BTreeSet::new());
        }
        Self {
            table: ArcSwap::from_pointee(table),
            admin,
            write: Mutex::new(()),
        }
    }

    /// Least-privilege registry: the configured grants, plus the admin
    /// module granted every service in `services`
    pub fn least_privilege<'a>(
        config: &PermissionsConfig,
        services: impl IntoIterator<Item = &'a ServiceId>,
    ) -> Self {
        let registry = Self::new(config.admin_module.clone());
        for (module, granted) in &config.modules {
            registry.set_permissions(module.clone(), granted.iter().cloned());
        }
        registry.grant_admin(services.into_iter().cloned());
        registry
    }

    /// Replaces a module's grants
    pub fn set_permissions(
        &self,
        module: ModuleId,
        services: impl IntoIterator<Item = ServiceId>,
    ) {
        let services: BTreeSet<ServiceId> = services.into_iter().collect();
        tracing::info!(%module, count = services.len(), "permissions replaced");
        self.update(|table| {
            table.insert(module, services);
        });
    }

    /// Adds grants; already-granted services are left untouched
    pub fn add_permissions(
        &self,
        module: ModuleId,
        services: impl IntoIterator<Item = ServiceId>,
    ) {
        self.update(|table| {
            table.entry(module).or_default().extend(services);
        });
    }

    /// Revokes grants; the module entry stays even when emptied
    pub fn remove_permissions<'a>(
        &self,
        module: &ModuleId,
        services: impl IntoIterator<Item = &'a ServiceId>,
    ) {
        self.update(|table| {
            if let Some(granted) = table.get_mut(module) {
                for service in services {
                    granted.remove(service);
                }
            }
        });
    }

    /// Grants `services` to the admin module, if one is configured
    pub fn grant_admin(&self, services: impl IntoIterator<Item = ServiceId>) {
        if let Some(admin) = &self.admin {
            self.add_permissions(admin.clone(), services);
        }
    }

    /// Drops `service` from every module
    pub fn revoke_service(&self, service: &ServiceId) {
        self.update(|table| {
            for granted in table.values_mut() {
                granted.remove(service);
            }
        });
    }

    /// Whether `module` may read `service`'s key
    pub fn has_permission(&self, module: &ModuleId, service: &ServiceId) -> bool {
        self.table
            .load()
            .get(module)
            .is_some_and(|granted| granted.contains(service))
    }

    /// Modules allowed to read `service`, sorted
    pub fn get_modules_with_access(&self, service: &ServiceId) -> Vec<ModuleId> {
        self.table
            .load()
            .iter()
            .filter(|(_, granted)| granted.contains(service))
            .map(|(module, _)| module.clone())
            .collect()
    }

    /// Snapshot of the table and its reverse index
    pub fn generate_permissions_report(&self) -> PermissionsReport {
        let modules = Table::clone(&self.table.load());
        let mut services: BTreeMap<ServiceId, BTreeSet<ModuleId>> = BTreeMap::new();
        for (module, granted) in &modules {
            for service in granted {
                services
                    .entry(service.clone())
                    .or_default()
                    .insert(module.clone());
            }
        }
        PermissionsReport { modules, services }
    }

    fn update(&self, apply: impl FnOnce(&mut Table)) {
        let _guard = self.write.lock();
        let mut next = Table::clone(&self.table.load());
        apply(&mut next);
        self.table.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn module(id: &str) -> ModuleId {
        ModuleId::new(id).unwrap()
    }

    fn service(id: &str) -> ServiceId {
        ServiceId::new(id).unwrap()
    }

    fn default_registry() -> PermissionRegistry {
        let services = [
            service("openRouteService"),
            service("openWeather"),
            service("strava"),
            service("mapbox"),
            service("openRouter"),
        ];
        PermissionRegistry::least_privilege(&PermissionsConfig::default(), &services)
    }

    #[test]
    fn test_least_privilege_defaults() {
        let registry = default_registry();
        assert!(registry.has_permission(&module("map-module"), &service("mapbox")));
        assert!(!registry.has_permission(&module("weather-module"), &service("mapbox")));
        assert!(!registry.has_permission(&module("unknown-module"), &service("mapbox")));
        for id in ["openRouteService", "openWeather", "strava", "mapbox", "openRouter"] {
            assert!(registry.has_permission(&module("admin"), &service(id)));
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = PermissionRegistry::new(None);
        registry.add_permissions(module("m"), [service("a")]);
        registry.add_permissions(module("m"), [service("a"), service("b")]);
        let report = registry.generate_permissions_report();
        assert_eq!(
            report.modules[&module("m")],
            BTreeSet::from([service("a"), service("b")])
        );
    }

    #[test]
    fn test_set_replaces_and_remove_revokes() {
        let registry = PermissionRegistry::new(None);
        registry.set_permissions(module("m"), [service("a"), service("b")]);
        registry.set_permissions(module("m"), [service("c")]);
        assert!(!registry.has_permission(&module("m"), &service("a")));
        assert!(registry.has_permission(&module("m"), &service("c")));

        registry.remove_permissions(&module("m"), [&service("c")]);
        assert!(!registry.has_permission(&module("m"), &service("c")));
        assert!(registry.generate_permissions_report().modules.contains_key(&module("m")));
    }

    #[test]
    fn test_reverse_index() {
        let registry = default_registry();
        assert_eq!(
            registry.get_modules_with_access(&service("mapbox")),
            vec![module("admin"), module("map-module")]
        );

        let report = registry.generate_permissions_report();
        assert_eq!(
            report.services[&service("strava")],
            BTreeSet::from([module("activity-module"), module("admin")])
        );
    }

    #[test]
    fn test_revoke_service_everywhere() {
        let registry = default_registry();
        registry.revoke_service(&service("mapbox"));
        assert!(registry.get_modules_with_access(&service("mapbox")).is_empty());
    }
}
