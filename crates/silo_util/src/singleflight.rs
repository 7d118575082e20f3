//! Single-flight execution: concurrent callers with the same key share one
//! in-flight execution and all observe its completion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Default)]
struct Call {
    finished: AtomicBool,
    notify: Notify,
}

/// Keyed single-flight group.
#[derive(Default)]
pub struct Group {
    calls: Mutex<HashMap<String, Arc<Call>>>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` if no execution for `key` is in flight, otherwise wait
    /// for the in-flight one. Returns whether this caller executed.
    pub async fn do_once<F, Fut>(&self, key: &str, body: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock().expect("singleflight lock poisoned");
            match calls.get(key) {
                Some(call) => (Arc::clone(call), false),
                None => {
                    let call = Arc::new(Call::default());
                    calls.insert(key.to_string(), Arc::clone(&call));
                    (call, true)
                }
            }
        };

        if leader {
            body().await;
            call.finished.store(true, Ordering::Release);
            call.notify.notify_waiters();
            self.calls
                .lock()
                .expect("singleflight lock poisoned")
                .remove(key);
            return true;
        }

        loop {
            // Register before checking the flag so a completion between the
            // check and the await still wakes us.
            let notified = call.notify.notified();
            if call.finished.load(Ordering::Acquire) {
                return false;
            }
            notified.await;
        }
    }
}
