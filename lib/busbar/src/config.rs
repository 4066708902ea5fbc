use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_RQUEUE_MAX: usize = 1024;
pub const DEFAULT_WQUEUE_MAX: usize = 1024;
pub const DEFAULT_CALL_TIMEOUT_USEC: u64 = 25_000_000;
pub const DEFAULT_AUTH_TIMEOUT_USEC: u64 = 25_000_000;

/// Per-connection resource limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub rqueue_max: usize,
    pub wqueue_max: usize,
    pub call_timeout_usec: u64,
    pub auth_timeout_usec: u64,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            rqueue_max: DEFAULT_RQUEUE_MAX,
            wqueue_max: DEFAULT_WQUEUE_MAX,
            call_timeout_usec: DEFAULT_CALL_TIMEOUT_USEC,
            auth_timeout_usec: DEFAULT_AUTH_TIMEOUT_USEC,
        }
    }
}

impl Limits {
    pub fn load<P: AsRef<Path>>(path: P) -> Limits {
        serdeconv::from_toml_file(path).expect("Error loading connection limits file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = Limits::default();

        assert_eq!(limits.rqueue_max, DEFAULT_RQUEUE_MAX);
        assert_eq!(limits.wqueue_max, DEFAULT_WQUEUE_MAX);
        assert_eq!(limits.call_timeout_usec, DEFAULT_CALL_TIMEOUT_USEC);
        assert_eq!(limits.auth_timeout_usec, DEFAULT_AUTH_TIMEOUT_USEC);
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml = serdeconv::to_toml_string(&Limits::default()).unwrap();
        let limits: Limits = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(limits.rqueue_max, DEFAULT_RQUEUE_MAX);
    }
}
