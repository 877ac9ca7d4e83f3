//! Environment access behind a trait, so configuration can be resolved in tests
//! without touching the process environment.

use std::collections::HashMap;
use std::env::VarError;
use std::sync::{Mutex, PoisonError};

pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, VarError>;
}

/// Reads the real process environment.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, VarError> {
        std::env::var(key)
    }
}

/// Won't touch the global process environment.
///
/// Backed by a `Mutex` so it is `Send + Sync` and can be moved into server
/// tasks in multi-threaded `#[tokio::test]`s.
#[derive(Default)]
pub struct InMemoryEnv {
    vars: Mutex<HashMap<String, String>>,
}

impl InMemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl ReadEnv for InMemoryEnv {
    fn var(&self, key: &str) -> Result<String, VarError> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or(VarError::NotPresent)
    }
}
