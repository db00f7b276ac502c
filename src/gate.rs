//! Global bound on the number of concurrently executing checks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{System, SystemExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, info};

const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Default gate size: online CPUs plus two.
pub fn default_size() -> usize {
    let mut system = System::new();
    system.refresh_cpu();
    let cpus = system.cpus().len().max(1);
    cpus + 2
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    size: usize,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    peak: AtomicUsize,
}

/// Held while a check executes. Returns the slot on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        info!(size, "concurrency gate initialised");
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            in_flight: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held permits seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Waits for a free slot. `None` only if the gate was closed.
    pub async fn acquire(self: &Arc<Self>, name: &str) -> Option<GatePermit> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let acquire = self.semaphore.clone().acquire_owned();
        tokio::pin!(acquire);

        let permit = loop {
            match time::timeout(WAIT_LOG_INTERVAL, &mut acquire).await {
                Ok(result) => break result.ok(),
                Err(_) => info!(
                    check = name,
                    in_flight = self.in_flight(),
                    "still waiting for a free execution slot"
                ),
            }
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        let permit = permit?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        debug!(check = name, in_flight = now, "execution slot acquired");
        Some(GatePermit {
            gate: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Stops handing out permits. Waiters get `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_size_is_cpus_plus_two() {
        assert!(default_size() >= 3);
    }

    #[tokio::test]
    async fn never_exceeds_size() {
        let gate = ConcurrencyGate::new(2);
        let mut handles = Vec::new();
        for i in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(&format!("check{i}")).await.unwrap();
                time::sleep(Duration::from_millis(50)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(gate.peak(), 2);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test]
    async fn closed_gate_refuses() {
        let gate = ConcurrencyGate::new(1);
        gate.close();
        assert!(gate.acquire("late").await.is_none());
    }
}
