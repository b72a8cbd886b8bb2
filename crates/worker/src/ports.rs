//! Bounded pool of localhost ports for worker command endpoints.

use std::collections::BTreeSet;

use tokio::net::TcpListener;

/// Leases ports from `[base_port, base_port + capacity - 1]`.
///
/// State lives only as long as the process. The allocator is not
/// internally synchronised; the manager keeps it behind a mutex.
#[derive(Debug)]
pub struct PortAllocator {
    base_port: u16,
    capacity: usize,
    leased: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base_port: u16, capacity: usize) -> Self {
        Self {
            base_port,
            capacity,
            leased: BTreeSet::new(),
        }
    }

    /// Lease the lowest free port in the range.
    ///
    /// Each candidate is bind-tested on `127.0.0.1` first so ports held
    /// by unrelated processes are skipped. Returns `None` when every
    /// port is leased or occupied.
    pub async fn acquire(&mut self) -> Option<u16> {
        for port in self.range() {
            if self.leased.contains(&port) {
                continue;
            }
            if !is_bindable(port).await {
                tracing::debug!(port, "Port occupied externally, skipping");
                continue;
            }
            self.leased.insert(port);
            return Some(port);
        }
        None
    }

    /// Free a lease. Returns `false` if the port was not leased.
    pub fn release(&mut self, port: u16) -> bool {
        self.leased.remove(&port)
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.contains(&port)
    }

    /// Currently leased ports, ascending.
    pub fn leased(&self) -> Vec<u16> {
        self.leased.iter().copied().collect()
    }

    /// Number of ports not currently leased (occupied or not).
    pub fn available(&self) -> usize {
        self.range().count().saturating_sub(self.leased.len())
    }

    /// Pool ports, truncated at `u16::MAX`.
    fn range(&self) -> impl Iterator<Item = u16> {
        let start = u32::from(self.base_port);
        let capacity = self.capacity.min(usize::from(u16::MAX) + 1) as u32;
        let end = (start + capacity).min(u32::from(u16::MAX) + 1);
        (start..end).filter_map(|port| u16::try_from(port).ok())
    }
}

async fn is_bindable(port: u16) -> bool {
    // The listener is dropped immediately, releasing the port for the worker.
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}
