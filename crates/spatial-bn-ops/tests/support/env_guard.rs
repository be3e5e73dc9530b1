//! Environment variable management for tests
//!
//! Values are restored when the guard drops. Tests that set variables read by
//! operator constructors should also carry `#[serial(spatial_bn_env)]`.

use std::{
    env as std_env,
    sync::{Mutex, OnceLock},
};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> &'static Mutex<()> {
    ENV_LOCK.get_or_init(|| Mutex::new(()))
}

/// RAII guard that sets or removes a variable and restores the prior value.
pub struct EnvVarGuard {
    key: &'static str,
    prior: Option<String>,
}

impl EnvVarGuard {
    pub fn set(key: &'static str, val: &str) -> Self {
        let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let prior = std_env::var(key).ok();
        // SAFETY: writers are serialised by ENV_LOCK and #[serial].
        unsafe { std_env::set_var(key, val) };
        Self { key, prior }
    }

    pub fn remove(key: &'static str) -> Self {
        let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let prior = std_env::var(key).ok();
        // SAFETY: writers are serialised by ENV_LOCK and #[serial].
        unsafe { std_env::remove_var(key) };
        Self { key, prior }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: writers are serialised by ENV_LOCK and #[serial].
        unsafe {
            match &self.prior {
                Some(v) => std_env::set_var(self.key, v),
                None => std_env::remove_var(self.key),
            }
        }
    }
}
