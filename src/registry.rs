//! Process-wide registry of project types.
//!
//! Populated once per type, typically at program start, before any call to
//! [`crate::loader::load`]. Read-only thereafter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Result, SowError};
use crate::project_type::ProjectTypeConfig;

fn registry() -> &'static Mutex<HashMap<String, Arc<ProjectTypeConfig>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<ProjectTypeConfig>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `config` under `name`. Fails if `name` is already registered.
pub fn register(name: impl Into<String>, config: Arc<ProjectTypeConfig>) -> Result<()> {
    let name = name.into();
    let mut map = registry().lock().expect("registry mutex poisoned");
    if map.contains_key(&name) {
        return Err(SowError::DuplicateRegistration(name));
    }
    map.insert(name, config);
    Ok(())
}

/// Retrieve a registered type's config.
pub fn get(name: &str) -> Result<Arc<ProjectTypeConfig>> {
    let map = registry().lock().expect("registry mutex poisoned");
    map.get(name)
        .cloned()
        .ok_or_else(|| SowError::TypeNotRegistered(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_type::ProjectTypeBuilder;

    fn config(name: &str) -> Arc<ProjectTypeConfig> {
        Arc::new(
            ProjectTypeBuilder::new(name)
                .set_initial_state("Idle")
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn register_then_get_round_trips() {
        let name = "registry_test_round_trip";
        register(name, config(name)).unwrap();
        let got = get(name).unwrap();
        assert_eq!(got.type_name(), name);
    }

    #[test]
    fn duplicate_registration_fails() {
        let name = "registry_test_duplicate";
        register(name, config(name)).unwrap();
        let err = register(name, config(name)).unwrap_err();
        assert!(matches!(err, SowError::DuplicateRegistration(_)));
    }

    #[test]
    fn unregistered_type_is_not_registered() {
        let err = get("registry_test_never_registered").unwrap_err();
        assert!(matches!(err, SowError::TypeNotRegistered(_)));
    }
}
