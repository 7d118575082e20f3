//! Connection admission limits: at most `sessions × streams` concurrent
//! streams per remote address; the excess is refused, not queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("connections limited")]
pub struct ConnLimited;

/// Per-address stream admission counter.
#[derive(Clone)]
pub struct ConnLimiter {
    max_per_address: usize,
    in_use: Arc<Mutex<HashMap<String, usize>>>,
}

impl ConnLimiter {
    pub fn new(max_session_per_address: usize, max_stream_per_session: usize) -> Self {
        Self {
            max_per_address: max_session_per_address.max(1) * max_stream_per_session.max(1),
            in_use: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit one stream to `addr`, or refuse with [`ConnLimited`].
    pub fn acquire(&self, addr: &str) -> Result<ConnGuard, ConnLimited> {
        let mut in_use = self.in_use.lock().expect("conn limiter lock poisoned");
        let count = in_use.entry(addr.to_string()).or_insert(0);
        if *count >= self.max_per_address {
            return Err(ConnLimited);
        }
        *count += 1;
        Ok(ConnGuard {
            addr: addr.to_string(),
            in_use: Arc::clone(&self.in_use),
        })
    }

    pub fn in_use(&self, addr: &str) -> usize {
        self.in_use
            .lock()
            .expect("conn limiter lock poisoned")
            .get(addr)
            .copied()
            .unwrap_or(0)
    }
}

/// Releases its admission slot on drop.
#[derive(Debug)]
pub struct ConnGuard {
    addr: String,
    in_use: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let mut in_use = self.in_use.lock().expect("conn limiter lock poisoned");
        if let Some(count) = in_use.get_mut(&self.addr) {
            *count -= 1;
            if *count == 0 {
                in_use.remove(&self.addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_is_bounded_per_address() {
        let limiter = ConnLimiter::new(2, 3);
        let guards: Vec<_> = (0..6).map(|_| limiter.acquire("10.0.0.1:9100").unwrap()).collect();
        assert_eq!(limiter.acquire("10.0.0.1:9100").unwrap_err(), ConnLimited);
        // A different address has its own budget.
        let _other = limiter.acquire("10.0.0.2:9100").unwrap();
        drop(guards);
        assert!(limiter.acquire("10.0.0.1:9100").is_ok());
    }

    #[test]
    fn guard_releases_on_drop() {
        let limiter = ConnLimiter::new(1, 1);
        let guard = limiter.acquire("a").unwrap();
        assert_eq!(limiter.in_use("a"), 1);
        drop(guard);
        assert_eq!(limiter.in_use("a"), 0);
    }
}
