//! Server pool
//!
//! An ordered, deduplicated list of candidate endpoints. The entry at the
//! front is tried first; a failed or disconnected server is rotated to the
//! back (or dropped once its reconnect budget is spent). Servers discovered
//! through INFO are added as implicit entries and pruned when the cluster
//! stops advertising them.

mod server;

pub use server::{Scheme, ServerUrl, Srv};

use tracing::debug;

use crate::error::{NatsError, Result};

/// Ordered collection of [`Srv`] entries plus the current server marker
#[derive(Debug, Default)]
pub struct ServerPool {
    servers: Vec<Srv>,
    current: Option<u64>,
    next_id: u64,
}

impl ServerPool {
    /// Build the pool from configured URLs
    ///
    /// Duplicates are dropped. Unless `no_randomize` is set the order is
    /// shuffled so clients spread across the cluster. The first entry becomes
    /// current.
    pub fn new<S: AsRef<str>>(urls: &[S], no_randomize: bool) -> Result<Self> {
        let mut pool = Self::default();
        for url in urls {
            let parsed = ServerUrl::parse(url.as_ref())?;
            pool.push_unique(parsed, false);
        }
        if pool.servers.is_empty() {
            return Err(NatsError::NoServers);
        }
        if !no_randomize {
            fastrand::shuffle(&mut pool.servers);
        }
        pool.current = pool.servers.first().map(|s| s.id);
        Ok(pool)
    }

    fn push_unique(&mut self, url: ServerUrl, implicit: bool) -> bool {
        if self.servers.iter().any(|s| s.url.same_endpoint(&url)) {
            return false;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.servers.push(Srv::new(id, url, implicit));
        true
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Srv> {
        self.servers.iter()
    }

    #[must_use]
    pub fn first(&self) -> Option<&Srv> {
        self.servers.first()
    }

    /// The server currently connected to (or being attempted)
    #[must_use]
    pub fn current(&self) -> Option<&Srv> {
        self.current
            .and_then(|id| self.position(id))
            .map(|i| &self.servers[i])
    }

    pub fn current_mut(&mut self) -> Option<&mut Srv> {
        let idx = self.current.and_then(|id| self.position(id))?;
        Some(&mut self.servers[idx])
    }

    /// Mark the entry with `id` as current
    pub(crate) fn set_current(&mut self, id: u64) {
        if self.position(id).is_some() {
            self.current = Some(id);
        }
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Srv> {
        let idx = self.position(id)?;
        Some(&mut self.servers[idx])
    }

    /// Ids in trial order, snapshotted for a connect pass
    pub(crate) fn ids(&self) -> Vec<u64> {
        self.servers.iter().map(|s| s.id).collect()
    }

    /// Rotate past the current server and return the next candidate
    ///
    /// The current entry moves to the back, or is removed if `max_reconnect`
    /// is non-negative and its reconnect count has reached it. Returns `None`
    /// once the pool is empty.
    pub fn select_next_server(&mut self, max_reconnect: i64) -> Option<&Srv> {
        if let Some(idx) = self.current.and_then(|id| self.position(id)) {
            let srv = self.servers.remove(idx);
            if max_reconnect < 0 || i64::from(srv.reconnects) < max_reconnect {
                self.servers.push(srv);
            } else {
                debug!("Removing {} from pool after {} reconnects", srv.url, srv.reconnects);
            }
        }

        self.current = self.servers.first().map(|s| s.id);
        self.servers.first()
    }

    /// Add servers, skipping endpoints already present
    ///
    /// Returns `true` if the pool grew.
    pub fn add<S: AsRef<str>>(&mut self, urls: &[S], implicit: bool) -> bool {
        let mut grew = false;
        for url in urls {
            match ServerUrl::parse(url.as_ref()) {
                Ok(parsed) => grew |= self.push_unique(parsed, implicit),
                Err(_) => debug!("Ignoring unparsable server URL {:?}", url.as_ref()),
            }
        }
        grew
    }

    /// Drop implicit servers missing from the latest advertised list
    ///
    /// Explicitly configured servers and the current server are never pruned.
    pub fn prune_out_of_date<S: AsRef<str>>(&mut self, discovered: &[S]) {
        let advertised: Vec<ServerUrl> = discovered
            .iter()
            .filter_map(|u| ServerUrl::parse(u.as_ref()).ok())
            .collect();
        let current = self.current;

        self.servers.retain(|srv| {
            let keep = !srv.is_implicit
                || Some(srv.id) == current
                || advertised.iter().any(|u| u.same_endpoint(&srv.url));
            if !keep {
                debug!("Pruning server {} no longer advertised", srv.url);
            }
            keep
        });
    }

    /// URLs in pool order, optionally limited to discovered servers
    #[must_use]
    pub fn server_list(&self, implicit_only: bool) -> Vec<String> {
        self.servers
            .iter()
            .filter(|s| !implicit_only || s.is_implicit)
            .map(|s| s.url.to_string())
            .collect()
    }

    /// Check if any entry demands TLS by scheme
    #[must_use]
    pub fn has_secure_server(&self) -> bool {
        self.servers.iter().any(|s| s.url.requires_tls())
    }
}
