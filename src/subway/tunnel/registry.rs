use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use super::session::{Session, SessionInfo};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("subdomain {0:?} is already in use")]
    Conflict(String),
    #[error("no tunnel registered for subdomain {0:?}")]
    NotFound(String),
}

/// Validates and lowercases a DNS label used as a tunnel name.
pub fn normalize_subdomain(raw: &str) -> Option<String> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() || s.len() > 63 {
        return None;
    }
    if s.starts_with('-') || s.ends_with('-') {
        return None;
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return None;
    }
    Some(s)
}

/// Maps subdomains to live sessions. At most one session per subdomain.
#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` under `subdomain`. A closed session still holding
    /// the name is replaced.
    pub fn register(&self, subdomain: &str, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut map = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(subdomain) {
            if !existing.is_closed() {
                return Err(RegistryError::Conflict(subdomain.to_string()));
            }
        }
        map.insert(subdomain.to_string(), session);
        Ok(())
    }

    pub fn lookup(&self, subdomain: &str) -> Result<Arc<Session>, RegistryError> {
        let map = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match map.get(subdomain) {
            Some(s) if !s.is_closed() => Ok(s.clone()),
            _ => Err(RegistryError::NotFound(subdomain.to_string())),
        }
    }

    /// Removes the mapping only if it still points at `session`. Returns
    /// whether anything was removed.
    pub fn unregister(&self, subdomain: &str, session: &Session) -> bool {
        let mut map = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match map.get(subdomain) {
            Some(existing) if std::ptr::eq(Arc::as_ptr(existing), session) => {
                map.remove(subdomain);
                true
            }
            _ => false,
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let map = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        map.values().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.sessions().iter().map(|s| s.info()).collect();
        out.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}
