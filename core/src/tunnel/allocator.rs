//! Local port allocation.
//!
//! A reservation binds the listening socket immediately, so "is it free?"
//! and "take it" are a single step. The allocator lives inside the
//! registry's state and is only touched under the registry lock.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr, TcpListener};

use tracing::debug;

use crate::error::{Error, Result};

/// Attempts at finding an ephemeral port the allocator does not already hold.
const EPHEMERAL_BIND_ATTEMPTS: usize = 16;

/// A reserved local port together with its bound listener.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    listener: TcpListener,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hands over the bound, non-blocking listener.
    pub fn into_listener(self) -> TcpListener {
        self.listener
    }
}

/// Table of local ports held by active tunnels.
#[derive(Debug)]
pub struct PortAllocator {
    bind_address: IpAddr,
    reserved: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(bind_address: IpAddr) -> Self {
        Self {
            bind_address,
            reserved: BTreeSet::new(),
        }
    }

    /// Reserves `preferred`, or an ephemeral port when no preference is given.
    ///
    /// A preferred port is mandatory: if another tunnel holds it, or the OS
    /// refuses the bind, this fails with [`Error::PortUnavailable`].
    pub fn reserve(&mut self, preferred: Option<u16>) -> Result<PortLease> {
        match preferred.filter(|p| *p != 0) {
            Some(port) => self.reserve_exact(port),
            None => self.reserve_ephemeral(),
        }
    }

    /// Returns a port to the pool. Returns `false` if it was not reserved.
    pub fn release(&mut self, port: u16) -> bool {
        let released = self.reserved.remove(&port);
        if released {
            debug!(port = port, "Released local port");
        }
        released
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    /// Currently held ports, ascending.
    pub fn reserved_ports(&self) -> Vec<u16> {
        self.reserved.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    fn reserve_exact(&mut self, port: u16) -> Result<PortLease> {
        if self.reserved.contains(&port) {
            return Err(Error::PortUnavailable {
                port,
                reason: "already held by another tunnel".to_string(),
            });
        }

        let listener = self.bind(port).map_err(|e| Error::PortUnavailable {
            port,
            reason: e.to_string(),
        })?;

        self.reserved.insert(port);
        debug!(port = port, "Reserved requested local port");
        Ok(PortLease { port, listener })
    }

    fn reserve_ephemeral(&mut self) -> Result<PortLease> {
        for _ in 0..EPHEMERAL_BIND_ATTEMPTS {
            let listener = self.bind(0).map_err(|e| Error::PortUnavailable {
                port: 0,
                reason: e.to_string(),
            })?;
            let port = listener.local_addr()?.port();

            // A port we still hold can come back if its listener was abandoned.
            if self.reserved.insert(port) {
                debug!(port = port, "Reserved ephemeral local port");
                return Ok(PortLease { port, listener });
            }
        }

        Err(Error::PortUnavailable {
            port: 0,
            reason: "no free ephemeral port found".to_string(),
        })
    }

    fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_address, port))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}
