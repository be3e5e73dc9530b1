//! Rate-limited warnings.
//!
//! The first occurrence of a key is logged at WARN level, later ones at
//! DEBUG. Operators use it for conditions that repeat on every call with the
//! same arguments, such as a clamped epsilon.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

static WARN_REGISTRY: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn get_registry() -> &'static Mutex<HashSet<String>> {
    WARN_REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Log `message` at WARN the first time `key` is seen, at DEBUG afterwards.
///
/// Returns `true` when the message was emitted at WARN level.
pub fn warn_once_fn(key: &str, message: &str) -> bool {
    // A panic while holding the lock leaves the set intact.
    let mut seen = match get_registry().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if seen.insert(key.to_string()) {
        tracing::warn!(key = %key, "{}", message);
        true
    } else {
        tracing::debug!(key = %key, "(rate-limited) {}", message);
        false
    }
}

/// Formatted front-end for [`warn_once_fn`].
///
/// ```
/// use spatial_bn_common::warn_once;
///
/// let eps = 0.0_f32;
/// warn_once!("doc_epsilon", "epsilon {} below minimum", eps);
/// ```
#[macro_export]
macro_rules! warn_once {
    ($key:expr, $($arg:tt)*) => {
        $crate::warn_once_fn($key, &format!($($arg)*))
    };
}

/// Forget every key seen so far.
pub fn clear_registry() {
    let mut seen = match get_registry().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    seen.clear();
}

/// Whether `key` has already been warned about.
pub fn has_warned(key: &str) -> bool {
    let seen = match get_registry().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    seen.contains(key)
}
