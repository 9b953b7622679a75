//! Local port allocation and the process-wide port claim registry.
//!
//! Both managers share one [`PortClaims`]. A tunnel claims its local port for
//! as long as it is `STARTING` or `ACTIVE`; every terminal transition releases
//! the claim. Allocation for `local_port == 0` excludes every claimed port, so
//! a TCP forwarder and a gateway proxy can never be handed the same port.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::TunnelError;

/// Bind attempts made by [`allocate`] before settling for a colliding port.
const ALLOCATE_ATTEMPTS: usize = 10;

/// Return a free loopback port that is not in `excluded`.
///
/// Binds `127.0.0.1:0`, reads the OS-chosen port and closes the listener
/// immediately. Up to ten attempts are made; if every one lands on an
/// excluded port the last one is returned anyway.
pub fn allocate(excluded: &HashSet<u16>) -> Result<u16, TunnelError> {
    let mut last = 0;
    for attempt in 0..ALLOCATE_ATTEMPTS {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| TunnelError::PortUnavailable(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| TunnelError::PortUnavailable(e.to_string()))?
            .port();
        drop(listener);
        if !excluded.contains(&port) {
            return Ok(port);
        }
        debug!(port, attempt, "allocated port collides with a live tunnel");
        last = port;
    }
    Ok(last)
}

/// Registry of local ports held by live tunnels, keyed by port with the
/// owning tunnel id as value.
///
/// Cloneable — all clones share the same map.
#[derive(Clone, Default)]
pub struct PortClaims {
    inner: Arc<Mutex<HashMap<u16, String>>>,
}

impl PortClaims {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `requested`, or allocate and claim a free port when it is 0.
    ///
    /// `owner` builds the tunnel id from the final port. Check and insert
    /// happen under one lock so two concurrent starts cannot both win.
    pub fn claim(
        &self,
        requested: u16,
        owner: impl FnOnce(u16) -> String,
    ) -> Result<(u16, String), TunnelError> {
        let mut claims = self.lock();
        let port = if requested == 0 {
            let excluded: HashSet<u16> = claims.keys().copied().collect();
            allocate(&excluded)?
        } else {
            requested
        };
        if let Some(holder) = claims.get(&port) {
            return Err(TunnelError::PortInUse {
                port,
                owner: holder.clone(),
            });
        }
        let id = owner(port);
        claims.insert(port, id.clone());
        Ok((port, id))
    }

    /// Record an existing claim (adopted tunnels on reload). Does not fail;
    /// an existing holder is left in place.
    pub fn adopt(&self, port: u16, owner: &str) {
        self.lock()
            .entry(port)
            .or_insert_with(|| owner.to_string());
    }

    /// Release `port` if it is still held by `owner`.
    pub fn release(&self, port: u16, owner: &str) {
        let mut claims = self.lock();
        if claims.get(&port).is_some_and(|holder| holder == owner) {
            claims.remove(&port);
        }
    }

    pub fn holder(&self, port: u16) -> Option<String> {
        self.lock().get(&port).cloned()
    }

    pub fn claimed(&self) -> HashSet<u16> {
        self.lock().keys().copied().collect()
    }
}
