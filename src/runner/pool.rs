//! Host pool for reusing hosts across batches and retry rounds.

use crate::host::ExecutionHost;

/// A pool of reusable execution hosts.
///
/// Hosts go back into the pool after a batch finishes so retry rounds
/// skip the creation cost. Call [`terminate_all`](Self::terminate_all)
/// when the run is over.
pub struct HostPool<H: ExecutionHost> {
    hosts: Vec<H>,
}

impl<H: ExecutionHost> HostPool<H> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self { hosts: Vec::new() }
    }

    /// Adds a host to the pool.
    pub fn add(&mut self, host: H) {
        self.hosts.push(host);
    }

    /// Takes one host from the pool, if available.
    pub fn take_one(&mut self) -> Option<H> {
        self.hosts.pop()
    }

    /// Number of available hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Terminates all pooled hosts.
    ///
    /// Termination errors are logged and do not stop the remaining
    /// hosts from being terminated.
    pub async fn terminate_all(&mut self) {
        for host in self.hosts.drain(..) {
            if let Err(e) = host.terminate().await {
                tracing::warn!("failed to terminate host {}: {}", host.id(), e);
            }
        }
    }
}

impl<H: ExecutionHost> Default for HostPool<H> {
    fn default() -> Self {
        Self::new()
    }
}
