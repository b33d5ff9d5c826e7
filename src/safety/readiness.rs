//! Two-bit readiness registry (database, bus) gating the control loop.

use parking_lot::Mutex;

/// Read-only readiness view.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessSnapshot {
    pub db_ready: bool,
    pub db_reason: Option<String>,
    pub bus_ready: bool,
    pub bus_reason: Option<String>,
    /// Last bus error observed, kept across reconnects for health output.
    pub bus_last_error: Option<String>,
}

struct Inner {
    db_ready: bool,
    db_reason: Option<String>,
    bus_ready: bool,
    bus_reason: Option<String>,
    bus_last_error: Option<String>,
}

/// Registry consulted before each control cycle; the loop refuses to run
/// while either bit is false.
pub struct Readiness {
    inner: Mutex<Inner>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    /// Starts with both bits down; subsystems raise them as they come up.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                db_ready: false,
                db_reason: Some("starting".to_string()),
                bus_ready: false,
                bus_reason: Some("starting".to_string()),
                bus_last_error: None,
            }),
        }
    }

    pub fn set_db_ready(&self, ready: bool, reason: Option<String>) {
        let mut inner = self.inner.lock();
        inner.db_ready = ready;
        inner.db_reason = reason;
    }

    pub fn set_bus_ready(&self, ready: bool, reason: Option<String>) {
        let mut inner = self.inner.lock();
        inner.bus_ready = ready;
        if !ready {
            if let Some(ref r) = reason {
                inner.bus_last_error = Some(r.clone());
            }
        }
        inner.bus_reason = reason;
    }

    /// Both bits up.
    pub fn is_ready(&self) -> bool {
        let inner = self.inner.lock();
        inner.db_ready && inner.bus_ready
    }

    /// Why the registry is not ready, if it is not.
    pub fn not_ready_reason(&self) -> Option<String> {
        let inner = self.inner.lock();
        if !inner.db_ready {
            Some(format!(
                "db:{}",
                inner.db_reason.as_deref().unwrap_or("not ready")
            ))
        } else if !inner.bus_ready {
            Some(format!(
                "bus:{}",
                inner.bus_reason.as_deref().unwrap_or("not ready")
            ))
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> ReadinessSnapshot {
        let inner = self.inner.lock();
        ReadinessSnapshot {
            db_ready: inner.db_ready,
            db_reason: inner.db_reason.clone(),
            bus_ready: inner.bus_ready,
            bus_reason: inner.bus_reason.clone(),
            bus_last_error: inner.bus_last_error.clone(),
        }
    }
}
