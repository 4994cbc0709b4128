use std::collections::HashSet;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Result, SfuError};

pub const MIN_PORT: u16 = 20000;
pub const MAX_PORT: u16 = 30000;
pub const MAX_ATTEMPTS: u32 = 10_000;

/// Checks whether a UDP port can currently be bound.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_free(&self, ip: IpAddr, port: u16) -> bool;
}

/// Binds a throwaway UDP socket and releases it immediately.
pub struct UdpProbe;

#[async_trait]
impl PortProbe for UdpProbe {
    async fn is_free(&self, ip: IpAddr, port: u16) -> bool {
        tokio::net::UdpSocket::bind((ip, port)).await.is_ok()
    }
}

/// Hands out ephemeral UDP ports for outbound plain transports.
///
/// A probed port is released before the real consumer binds it, so another
/// process can still take it in between. Within this process a port stays
/// claimed until its [`PortLease`] is dropped.
pub struct PortAllocator {
    ip: IpAddr,
    range: RangeInclusive<u16>,
    max_attempts: u32,
    probe: Arc<dyn PortProbe>,
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(ip: IpAddr) -> Self {
        Self::with_probe(ip, Arc::new(UdpProbe))
    }

    pub fn with_probe(ip: IpAddr, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            ip,
            range: MIN_PORT..=MAX_PORT,
            max_attempts: MAX_ATTEMPTS,
            probe,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    pub async fn allocate(&self) -> Result<PortLease> {
        for attempt in 1..=self.max_attempts {
            let port = self.random_port();

            if self.claimed.lock().contains(&port) {
                continue;
            }

            if self.probe.is_free(self.ip, port).await && self.claimed.lock().insert(port) {
                tracing::debug!(port, attempt, "Allocated port");
                return Ok(PortLease {
                    port,
                    claimed: self.claimed.clone(),
                });
            }
        }

        Err(SfuError::NoAvailablePort {
            attempts: self.max_attempts,
        })
    }

    fn random_port(&self) -> u16 {
        rand::thread_rng().gen_range(self.range.clone())
    }
}

/// A port handed out by [`PortAllocator`]; released on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.port);
    }
}
