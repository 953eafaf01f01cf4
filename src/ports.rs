//! Port allocation for dev servers
//!
//! A port is handed out only when (a) it is inside the configured range,
//! (b) no other project holds a reservation on it, and (c) nothing on the
//! host is currently listening on it. The kernel check is a bind-and-drop
//! attempt, which also covers listeners the daemon never started.

use crate::config::Settings;
use crate::error::StartError;
use crate::store::{ProjectStatus, StateStore};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use tracing::{debug, info};

/// In-process reservation set over the configured port range
#[derive(Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed reservations from projects the store says are running.
    ///
    /// Called once at startup, before orphan reconciliation, so adopted
    /// processes keep the ports they already hold.
    pub fn initialize_from_state(&self, store: &StateStore) -> anyhow::Result<usize> {
        let states = store.all_states()?;
        let mut reserved = self.reserved.lock();
        let mut seeded = 0;
        for (name, state) in &states {
            if state.status == ProjectStatus::Running {
                if let Some(port) = state.port {
                    reserved.insert(port);
                    seeded += 1;
                    debug!(name = name.as_str(), port, "Seeded port reservation from state");
                }
            }
        }
        if seeded > 0 {
            info!(count = seeded, "Port reservations restored from state store");
        }
        Ok(seeded)
    }

    /// Find and reserve a free port in the configured range
    pub fn find_available(&self, settings: &Settings) -> Result<u16, StartError> {
        let (min, max) = (settings.port_min(), settings.port_max());

        for port in min..=max {
            if self.reserved.lock().contains(&port) {
                continue;
            }
            if !kernel_port_free(port) {
                continue;
            }
            // Re-check under the lock: another allocation may have claimed
            // the port while we were probing the kernel.
            let mut reserved = self.reserved.lock();
            if reserved.insert(port) {
                debug!(port, "Port reserved");
                return Ok(port);
            }
        }

        Err(StartError::NoPortsAvailable { min, max })
    }

    /// Return a port to the pool
    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            debug!(port, "Port released");
        }
    }

    /// Reserve a specific port, e.g. for an adopted orphan
    pub fn mark_used(&self, port: u16) {
        self.reserved.lock().insert(port);
    }

    /// Whether a port is currently reserved (for diagnostics and tests)
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }
}

/// Probe the kernel for a listener by attempting to bind the port.
///
/// Children bind `0.0.0.0`, so the probe does too; a successful bind is
/// dropped immediately.
fn kernel_port_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StatePatch;

    fn settings(min: u16, max: u16) -> Settings {
        Settings {
            port_range: [min, max],
            ..Settings::default()
        }
    }

    #[test]
    fn test_allocates_within_range() {
        let allocator = PortAllocator::new();
        let port = allocator.find_available(&settings(42000, 42010)).unwrap();
        assert!((42000..=42010).contains(&port));
        assert!(allocator.is_reserved(port));
    }

    #[test]
    fn test_reserved_ports_are_skipped() {
        let allocator = PortAllocator::new();
        let first = allocator.find_available(&settings(42020, 42030)).unwrap();
        let second = allocator.find_available(&settings(42020, 42030)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_release_makes_port_available_again() {
        let allocator = PortAllocator::new();
        let settings = settings(42040, 42040);

        let port = allocator.find_available(&settings).unwrap();
        assert!(allocator.find_available(&settings).is_err());

        allocator.release(port);
        assert_eq!(allocator.find_available(&settings).unwrap(), port);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = PortAllocator::new();
        allocator.mark_used(42050);
        allocator.mark_used(42051);

        let err = allocator.find_available(&settings(42050, 42051)).unwrap_err();
        match err {
            StartError::NoPortsAvailable { min, max } => {
                assert_eq!((min, max), (42050, 42051));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_kernel_listener_is_skipped() {
        let listener = TcpListener::bind("0.0.0.0:42060").unwrap();

        let allocator = PortAllocator::new();
        let port = allocator.find_available(&settings(42060, 42061)).unwrap();
        assert_eq!(port, 42061);
        drop(listener);
    }

    #[test]
    fn test_initialize_from_state_marks_running_ports() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .set_state(
                "alpha",
                StatePatch::new().status(ProjectStatus::Running).port(Some(42070)),
            )
            .unwrap();
        store
            .set_state(
                "beta",
                StatePatch::new().status(ProjectStatus::Stopped).port(Some(42071)),
            )
            .unwrap();

        let allocator = PortAllocator::new();
        let seeded = allocator.initialize_from_state(&store).unwrap();
        assert_eq!(seeded, 1);
        assert!(allocator.is_reserved(42070));
        assert!(!allocator.is_reserved(42071));
    }
}
