//! The process-global data-distribution enable record.
//!
//! Two parties flip this flag: the operator (persistently, through the mode
//! key) and the snapshot orchestrator (transiently, around a snapshot).
//! Transitions are acknowledged compare-and-set operations so the two
//! cannot race each other.

use std::sync::Mutex;

use strand_core::Uid;

#[derive(Debug)]
struct Inner {
    enabled: bool,
    /// Who disabled us, when disabled. Only that owner may re-enable.
    status_uid: Uid,
}

#[derive(Debug)]
pub struct DdEnabledState {
    inner: Mutex<Inner>,
}

impl Default for DdEnabledState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                enabled: true,
                status_uid: Uid::default(),
            }),
        }
    }
}

impl DdEnabledState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Attempt a transition. Disabling fails if already disabled (another
    /// snapshot is in progress); enabling fails unless `uid` matches the
    /// disabler.
    pub fn set_enabled(&self, enabled: bool, uid: Uid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !enabled {
            if !inner.enabled {
                return false;
            }
            inner.enabled = false;
            inner.status_uid = uid;
            true
        } else {
            if inner.status_uid != uid {
                return false;
            }
            inner.enabled = true;
            true
        }
    }
}
