//! Registry of live proxy registrations
//!
//! Both indexes (name and exclusive public port) live behind one lock so a
//! registration either lands in full or not at all, and a session sweep
//! removes every owned entry in one pass.

use chrono::{DateTime, Utc};
use portbridge_proto::{ProxyKind, PublicSpec};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// A live proxy registration owned by one agent session
#[derive(Debug, Clone, Serialize)]
pub struct ProxyRegistration {
    /// Cluster-wide unique proxy name
    pub proxy_name: String,
    pub kind: ProxyKind,
    pub public_spec: PublicSpec,
    /// Address the agent dials on its side
    pub local_target: String,
    /// Owning session (non-owning back-reference; the session itself lives
    /// with its control task)
    pub session_id: String,
    /// Public address once the listener is bound
    pub remote_addr: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl ProxyRegistration {
    /// Whether a resubmission carries the same parameters as this entry
    fn same_shape(&self, other: &ProxyRegistration) -> bool {
        self.session_id == other.session_id
            && self.kind == other.kind
            && self.public_spec == other.public_spec
            && self.local_target == other.local_target
    }
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Proxy name already registered: {0}")]
    NameConflict(String),

    #[error("Public port already claimed: {0}")]
    BindConflict(u16),

    #[error("Proxy kind not supported by this server: {0}")]
    UnsupportedKind(&'static str),

    #[error("Failed to bind public listener: {0}")]
    BindFailed(String),

    #[error("Proxy not found: {0}")]
    NotFound(String),
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, ProxyRegistration>,
    /// Exclusive TCP ports claimed by name; OS-allocated ports are recorded
    /// here once known so later explicit claims collide correctly.
    tcp_ports: HashMap<u16, String>,
}

/// Registry for managing proxy registrations
pub struct ProxyRegistry {
    inner: RwLock<Inner>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register a proxy, enforcing name and public-port uniqueness.
    ///
    /// Returns `Ok(Some(existing))` when the same session resubmits an
    /// identical registration (idempotent retry), `Ok(None)` for a fresh
    /// entry, and an error when the name or port is claimed by anyone else.
    pub fn register(
        &self,
        registration: ProxyRegistration,
    ) -> Result<Option<ProxyRegistration>, RegistryError> {
        let mut inner = self.inner.write().unwrap();

        if let Some(existing) = inner.by_name.get(&registration.proxy_name) {
            if existing.same_shape(&registration) {
                tracing::debug!(
                    proxy_name = %registration.proxy_name,
                    session_id = %registration.session_id,
                    "Idempotent re-registration"
                );
                return Ok(Some(existing.clone()));
            }
            tracing::warn!(
                proxy_name = %registration.proxy_name,
                session_id = %registration.session_id,
                owner = %existing.session_id,
                "Proxy name conflict"
            );
            return Err(RegistryError::NameConflict(registration.proxy_name));
        }

        if let PublicSpec::Port(port) = registration.public_spec {
            if port != 0 {
                if let Some(owner) = inner.tcp_ports.get(&port) {
                    tracing::warn!(
                        proxy_name = %registration.proxy_name,
                        port,
                        owner = %owner,
                        "Public port conflict"
                    );
                    return Err(RegistryError::BindConflict(port));
                }
                inner
                    .tcp_ports
                    .insert(port, registration.proxy_name.clone());
            }
        }

        tracing::info!(
            proxy_name = %registration.proxy_name,
            kind = registration.kind.as_str(),
            session_id = %registration.session_id,
            local_target = %registration.local_target,
            "Registered proxy"
        );

        inner
            .by_name
            .insert(registration.proxy_name.clone(), registration);
        Ok(None)
    }

    /// Record the bound public address (and OS-allocated port) for a proxy
    pub fn confirm_bound(
        &self,
        proxy_name: &str,
        remote_addr: String,
        bound_port: u16,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();
        let Inner { by_name, tcp_ports } = &mut *inner;

        let entry = by_name
            .get_mut(proxy_name)
            .ok_or_else(|| RegistryError::NotFound(proxy_name.to_string()))?;

        tcp_ports.insert(bound_port, proxy_name.to_string());
        entry.remote_addr = Some(remote_addr);
        Ok(())
    }

    /// Look up a registration by proxy name
    pub fn lookup(&self, proxy_name: &str) -> Option<ProxyRegistration> {
        let inner = self.inner.read().unwrap();
        inner.by_name.get(proxy_name).cloned()
    }

    /// Remove a single registration, releasing its port claim
    pub fn remove(&self, proxy_name: &str) -> Result<ProxyRegistration, RegistryError> {
        let mut inner = self.inner.write().unwrap();
        let removed = inner
            .by_name
            .remove(proxy_name)
            .ok_or_else(|| RegistryError::NotFound(proxy_name.to_string()))?;

        inner.tcp_ports.retain(|_, name| name != proxy_name);

        tracing::info!(proxy_name = %proxy_name, session_id = %removed.session_id, "Removed proxy");
        Ok(removed)
    }

    /// Remove every registration owned by a session in one atomic pass
    ///
    /// Returns the removed registrations so the caller can release their
    /// public listeners.
    pub fn remove_session(&self, session_id: &str) -> Vec<ProxyRegistration> {
        let mut inner = self.inner.write().unwrap();

        let names: Vec<String> = inner
            .by_name
            .values()
            .filter(|reg| reg.session_id == session_id)
            .map(|reg| reg.proxy_name.clone())
            .collect();

        let mut removed = Vec::with_capacity(names.len());
        for name in &names {
            if let Some(reg) = inner.by_name.remove(name) {
                removed.push(reg);
            }
            inner.tcp_ports.retain(|_, owner| owner != name);
        }

        if !removed.is_empty() {
            tracing::info!(
                session_id = %session_id,
                count = removed.len(),
                "Removed all proxies for session"
            );
        }

        removed
    }

    /// Read-only view of every live registration
    pub fn snapshot(&self) -> Vec<ProxyRegistration> {
        let inner = self.inner.read().unwrap();
        inner.by_name.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.by_name.len()
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(name: &str, session: &str, port: u16) -> ProxyRegistration {
        ProxyRegistration {
            proxy_name: name.to_string(),
            kind: ProxyKind::Tcp,
            public_spec: PublicSpec::Port(port),
            local_target: "127.0.0.1:8080".to_string(),
            session_id: session.to_string(),
            remote_addr: None,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 6000)).unwrap();

        let found = registry.lookup("web").unwrap();
        assert_eq!(found.session_id, "s-1");
        assert_eq!(found.public_spec, PublicSpec::Port(6000));
    }

    #[test]
    fn test_name_conflict_between_sessions() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 6000)).unwrap();

        let result = registry.register(registration("web", "s-2", 6001));
        assert!(matches!(result, Err(RegistryError::NameConflict(_))));

        // The loser must not have disturbed the winner.
        assert_eq!(registry.lookup("web").unwrap().session_id, "s-1");
    }

    #[test]
    fn test_idempotent_retry_same_session() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 6000)).unwrap();

        let retried = registry.register(registration("web", "s-1", 6000)).unwrap();
        assert!(retried.is_some());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_retry_with_different_params_conflicts() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 6000)).unwrap();

        let mut changed = registration("web", "s-1", 6000);
        changed.local_target = "127.0.0.1:9090".to_string();
        let result = registry.register(changed);
        assert!(matches!(result, Err(RegistryError::NameConflict(_))));
    }

    #[test]
    fn test_port_conflict() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 6000)).unwrap();

        let result = registry.register(registration("api", "s-2", 6000));
        assert!(matches!(result, Err(RegistryError::BindConflict(6000))));
        assert!(registry.lookup("api").is_none());
    }

    #[test]
    fn test_port_zero_never_conflicts_at_claim() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 0)).unwrap();
        registry.register(registration("api", "s-2", 0)).unwrap();
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_confirm_bound_records_allocated_port() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 0)).unwrap();
        registry
            .confirm_bound("web", "0.0.0.0:49152".to_string(), 49152)
            .unwrap();

        // The allocated port now blocks explicit claims.
        let result = registry.register(registration("api", "s-2", 49152));
        assert!(matches!(result, Err(RegistryError::BindConflict(49152))));

        let found = registry.lookup("web").unwrap();
        assert_eq!(found.remote_addr.as_deref(), Some("0.0.0.0:49152"));
    }

    #[test]
    fn test_remove_releases_port() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 6000)).unwrap();
        registry.remove("web").unwrap();

        assert!(registry.lookup("web").is_none());
        registry.register(registration("api", "s-2", 6000)).unwrap();
    }

    #[test]
    fn test_remove_unknown() {
        let registry = ProxyRegistry::new();
        let result = registry.remove("ghost");
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_remove_session_sweeps_everything() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 6000)).unwrap();
        registry.register(registration("api", "s-1", 6001)).unwrap();
        registry.register(registration("db", "s-2", 6002)).unwrap();

        let removed = registry.remove_session("s-1");
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.count(), 1);
        assert!(registry.lookup("web").is_none());
        assert!(registry.lookup("api").is_none());
        assert!(registry.lookup("db").is_some());

        // Swept ports are free again.
        registry.register(registration("web2", "s-3", 6000)).unwrap();
        registry.register(registration("api2", "s-3", 6001)).unwrap();
    }

    #[test]
    fn test_snapshot() {
        let registry = ProxyRegistry::new();
        registry.register(registration("web", "s-1", 6000)).unwrap();
        registry.register(registration("api", "s-2", 6001)).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        let names: Vec<&str> = snapshot.iter().map(|r| r.proxy_name.as_str()).collect();
        assert!(names.contains(&"web"));
        assert!(names.contains(&"api"));
    }
}
