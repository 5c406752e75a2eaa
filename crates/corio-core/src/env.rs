//! Environment variable helpers
//!
//! Typed getters used by `RuntimeConfig::from_env` and the log setup.
//!
//! # Usage
//!
//! ```ignore
//! use corio_core::env::{env_get, env_get_bool, env_get_opt};
//!
//! let threads: usize = env_get("CORIO_IO_THREADS", 4);
//! let stack: Option<usize> = env_get_opt("CORIO_STACK_SIZE");
//! let flush: bool = env_get_bool("CORIO_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;

/// Parse an environment variable as `T`, falling back to `default`
/// when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse an environment variable as a boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) mean true; any other set
/// value means false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parse an environment variable as `Option<T>`: `Some` only when set
/// and parsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__CORIO_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_set_and_invalid() {
        std::env::set_var("__CORIO_TEST_NUM__", "123");
        let val: usize = env_get("__CORIO_TEST_NUM__", 0);
        assert_eq!(val, 123);

        std::env::set_var("__CORIO_TEST_NUM__", "not_a_number");
        let val: usize = env_get("__CORIO_TEST_NUM__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__CORIO_TEST_NUM__");
    }

    #[test]
    fn test_env_get_opt() {
        let val: Option<usize> = env_get_opt("__CORIO_TEST_UNSET__");
        assert!(val.is_none());

        std::env::set_var("__CORIO_TEST_OPT__", "7");
        let val: Option<usize> = env_get_opt("__CORIO_TEST_OPT__");
        assert_eq!(val, Some(7));
        std::env::remove_var("__CORIO_TEST_OPT__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        assert!(env_get_bool("__CORIO_TEST_UNSET__", true));
        assert!(!env_get_bool("__CORIO_TEST_UNSET__", false));

        for truthy in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__CORIO_TEST_BOOL__", truthy);
            assert!(env_get_bool("__CORIO_TEST_BOOL__", false), "{}", truthy);
        }
        for falsy in ["0", "false", "garbage"] {
            std::env::set_var("__CORIO_TEST_BOOL__", falsy);
            assert!(!env_get_bool("__CORIO_TEST_BOOL__", true), "{}", falsy);
        }
        std::env::remove_var("__CORIO_TEST_BOOL__");
    }
}
