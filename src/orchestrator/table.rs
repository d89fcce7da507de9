use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::process::Child;
use tracing::debug;

use crate::config::model::{Role, SupervisorConfig};

struct ProcessSlot {
    child: Option<Child>,
    pid: Option<u32>,
    preferred_port: u16,
    detected_port: Option<u16>,
}

impl ProcessSlot {
    /// Reap the handle if the OS reports it exited. Keeps the invariant that
    /// a stored handle always refers to a live process.
    fn refresh(&mut self, role: Role) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(role = %role, pid = ?self.pid, %status, "child exited");
                self.child = None;
                self.pid = None;
                false
            }
            Err(e) => {
                debug!(role = %role, error = %e, "try_wait failed, dropping handle");
                self.child = None;
                self.pid = None;
                false
            }
        }
    }
}

/// Point-in-time view of one slot, safe to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub role: Role,
    pub pid: Option<u32>,
    pub preferred_port: u16,
    pub detected_port: Option<u16>,
}

/// Result of [`ProcessTable::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Installed {
    pub pid: Option<u32>,
    /// The previous child, still alive when it lost its slot.
    pub displaced: Option<u32>,
}

/// The children this supervisor spawned, one slot per [`Role`].
///
/// Every operation takes the single lock for an in-memory read or write
/// only. Spawning, port scans and kills happen outside it.
pub struct ProcessTable {
    slots: Mutex<BTreeMap<Role, ProcessSlot>>,
}

impl ProcessTable {
    pub fn new(config: &SupervisorConfig) -> Self {
        let slots = Role::ALL
            .into_iter()
            .map(|role| {
                (
                    role,
                    ProcessSlot {
                        child: None,
                        pid: None,
                        preferred_port: config.preferred_port(role),
                        detected_port: None,
                    },
                )
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Role, ProcessSlot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Install a freshly spawned child. A live child already in the slot is
    /// displaced and its PID handed back so the caller can terminate it.
    pub fn set(&self, role: Role, child: Child) -> Installed {
        let pid = child.id();
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(&role) else {
            return Installed {
                pid,
                displaced: None,
            };
        };
        let displaced = if slot.refresh(role) { slot.pid } else { None };
        slot.child = Some(child);
        slot.pid = pid;
        slot.detected_port = None;
        Installed { pid, displaced }
    }

    /// Empty the slot. Returns the PID if the removed child was still alive,
    /// so the caller can terminate it outside the lock.
    pub fn clear(&self, role: Role) -> Option<u32> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&role)?;
        let alive = slot.refresh(role);
        let pid = slot.pid.take().filter(|_| alive);
        slot.child = None;
        pid
    }

    /// True iff a handle is present and the OS reports it has not exited.
    pub fn is_alive(&self, role: Role) -> bool {
        self.lock()
            .get_mut(&role)
            .is_some_and(|slot| slot.refresh(role))
    }

    /// PID of the live child for `role`.
    pub fn pid(&self, role: Role) -> Option<u32> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&role)?;
        if slot.refresh(role) {
            slot.pid
        } else {
            None
        }
    }

    pub fn detected_port(&self, role: Role) -> Option<u16> {
        self.lock().get(&role).and_then(|s| s.detected_port)
    }

    pub fn set_detected_port(&self, role: Role, port: u16) {
        if let Some(slot) = self.lock().get_mut(&role) {
            slot.detected_port = Some(port);
        }
    }

    pub fn snapshot(&self) -> Vec<SlotView> {
        let mut slots = self.lock();
        slots
            .iter_mut()
            .map(|(&role, slot)| {
                let alive = slot.refresh(role);
                SlotView {
                    role,
                    pid: if alive { slot.pid } else { None },
                    preferred_port: slot.preferred_port,
                    detected_port: slot.detected_port,
                }
            })
            .collect()
    }
}
