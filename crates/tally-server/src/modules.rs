// ABOUTME: Static registry of optional handler modules and their mount prefixes.
// ABOUTME: Present modules are nested under /api/*; absent ones are skipped with a log line.

use std::fmt;
use std::str::FromStr;

use axum::Router;
use thiserror::Error;

use crate::api;
use crate::app_state::SharedState;

/// Optional request-handling capabilities the service knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    ApiKeys,
    Auth,
    User,
    Admin,
    Usage,
    Metrics,
    Debug,
}

#[derive(Debug, Error)]
#[error("unknown module: {0}")]
pub struct UnknownCapability(pub String);

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::ApiKeys,
        Capability::Auth,
        Capability::User,
        Capability::Admin,
        Capability::Usage,
        Capability::Metrics,
        Capability::Debug,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::ApiKeys => "apikeys",
            Capability::Auth => "auth",
            Capability::User => "user",
            Capability::Admin => "admin",
            Capability::Usage => "usage",
            Capability::Metrics => "metrics",
            Capability::Debug => "debug",
        }
    }

    /// URL prefix the module is nested under.
    pub fn mount_path(&self) -> &'static str {
        match self {
            Capability::ApiKeys => "/api/apikeys",
            Capability::Auth => "/api/auth",
            Capability::User => "/api/user",
            Capability::Admin => "/api/admin",
            Capability::Usage => "/api/usage",
            Capability::Metrics => "/api/metrics",
            Capability::Debug => "/api/debug",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Capability::ALL
            .into_iter()
            .find(|cap| cap.name() == wanted)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// One slot per capability, each either a router or absent.
pub struct ModuleRegistry {
    slots: Vec<(Capability, Option<Router<SharedState>>)>,
}

impl ModuleRegistry {
    /// Every capability absent.
    pub fn empty() -> Self {
        Self {
            slots: Capability::ALL.into_iter().map(|cap| (cap, None)).collect(),
        }
    }

    /// The modules this build ships. Auth, admin, usage, and metrics are
    /// deployed separately and are absent here.
    pub fn standard() -> Self {
        Self::empty()
            .with(Capability::ApiKeys, api::apikeys::router())
            .with(Capability::User, api::users::router())
            .with(Capability::Debug, api::debug::router())
    }

    pub fn with(mut self, capability: Capability, router: Router<SharedState>) -> Self {
        self.slot(capability).replace(router);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.slot(capability).take();
        self
    }

    /// Capabilities that will be mounted, in declaration order.
    pub fn present(&self) -> Vec<Capability> {
        self.slots
            .iter()
            .filter(|(_, module)| module.is_some())
            .map(|(cap, _)| *cap)
            .collect()
    }

    /// Nest every present module under its prefix.
    pub fn mount(self, mut router: Router<SharedState>) -> Router<SharedState> {
        for (capability, module) in self.slots {
            match module {
                Some(module) => {
                    router = router.nest(capability.mount_path(), module);
                    tracing::info!(
                        module = %capability,
                        path = capability.mount_path(),
                        "mounted module"
                    );
                }
                None => {
                    tracing::info!(
                        module = %capability,
                        path = capability.mount_path(),
                        "skipping absent module"
                    );
                }
            }
        }
        router
    }

    // Slots are built from Capability::ALL, which follows declaration order.
    fn slot(&mut self, capability: Capability) -> &mut Option<Router<SharedState>> {
        &mut self.slots[capability as usize].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for cap in Capability::ALL {
            assert_eq!(cap.name().parse::<Capability>().unwrap(), cap);
            assert!(cap.mount_path().starts_with("/api/"));
        }
        assert_eq!(" Metrics ".parse::<Capability>().unwrap(), Capability::Metrics);
        assert!("billing".parse::<Capability>().is_err());
    }

    #[test]
    fn standard_registry_ships_three_modules() {
        let registry = ModuleRegistry::standard();
        assert_eq!(
            registry.present(),
            vec![Capability::ApiKeys, Capability::User, Capability::Debug]
        );
        assert!(!registry.present().contains(&Capability::Metrics));
    }

    #[test]
    fn without_withdraws_a_module() {
        let registry = ModuleRegistry::standard().without(Capability::Debug);
        assert!(!registry.present().contains(&Capability::Debug));
        assert!(registry.present().contains(&Capability::ApiKeys));

        let registry = ModuleRegistry::empty();
        assert!(registry.present().is_empty());
    }
}
