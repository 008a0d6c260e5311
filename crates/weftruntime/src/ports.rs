use crate::RuntimeConfig;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    #[error("No free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

/// Expiry per leased port; `None` means held until released.
type Leases = HashMap<u16, Option<Instant>>;

/// Hands out free TCP ports from a fixed range for local services.
#[derive(Clone)]
pub struct PortAllocator {
    host: IpAddr,
    range: RangeInclusive<u16>,
    leases: Arc<Mutex<Leases>>,
}

impl PortAllocator {
    pub fn new(host: IpAddr, range: RangeInclusive<u16>) -> Self {
        Self {
            host,
            range,
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            config.service_port_start..=config.service_port_end,
        )
    }

    /// Lease a port until the lease is dropped.
    pub fn acquire(&self) -> Result<PortLease, PortError> {
        self.lease(None)
    }

    /// Lease a port that may be handed out again after `ttl`.
    pub fn acquire_for(&self, ttl: Duration) -> Result<PortLease, PortError> {
        self.lease(Some(Instant::now() + ttl))
    }

    pub fn release(&self, port: u16) {
        if self.lock().remove(&port).is_some() {
            tracing::debug!("Released port {}", port);
        }
    }

    pub fn in_use(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|expiry| expiry.map_or(true, |at| at > now))
            .count()
    }

    fn lease(&self, expiry: Option<Instant>) -> Result<PortLease, PortError> {
        let now = Instant::now();
        let mut leases = self.lock();
        leases.retain(|_, at| at.map_or(true, |at| at > now));

        for port in self.range.clone() {
            if leases.contains_key(&port) {
                continue;
            }
            if TcpListener::bind(SocketAddr::new(self.host, port)).is_err() {
                continue;
            }
            leases.insert(port, expiry);
            tracing::debug!("Leased port {}", port);
            return Ok(PortLease {
                port,
                allocator: self.clone(),
            });
        }

        tracing::warn!(
            "Port range {}-{} exhausted",
            self.range.start(),
            self.range.end()
        );
        Err(PortError::Exhausted {
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A leased port; released when dropped
pub struct PortLease {
    port: u16,
    allocator: PortAllocator,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), start..=end)
    }

    #[test]
    fn test_leases_are_distinct() {
        let ports = allocator(41000, 41100);
        let a = ports.acquire().unwrap();
        let b = ports.acquire().unwrap();
        assert_ne!(a.port(), b.port());
        assert_eq!(ports.in_use(), 2);
    }

    #[test]
    fn test_drop_releases() {
        let ports = allocator(41200, 41300);
        {
            let _lease = ports.acquire().unwrap();
            assert_eq!(ports.in_use(), 1);
        }
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn test_bound_port_is_skipped() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let ports = allocator(port, port);
        assert_eq!(
            ports.acquire().err(),
            Some(PortError::Exhausted {
                start: port,
                end: port
            })
        );
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let ports = allocator(41400, 41500);
        let first = ports.acquire_for(Duration::from_millis(0)).unwrap();
        let port = first.port();
        std::mem::forget(first);
        std::thread::sleep(Duration::from_millis(5));
        let second = ports.acquire().unwrap();
        assert_eq!(second.port(), port);
    }
}
