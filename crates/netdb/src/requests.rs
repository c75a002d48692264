//! Pending netDb lookups
//!
//! A `RequestedDestination` tracks one in-flight lookup: the floodfills
//! already tried, the attempt count and the completion channels waiting on
//! the answer. Attempts walk outward through the floodfill set until the
//! entry is found or the retry cap is hit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use garlicnet_core::{now_ms, IdentHash, LeaseSet, RouterInfo};

use crate::messages::LookupKind;

/// Attempts give up after this cap
pub const MAX_LOOKUP_ATTEMPTS: u32 = 7;

/// A single attempt waits this long before trying the next floodfill
pub const ATTEMPT_TIMEOUT_MS: u64 = 5_000;

/// The whole request fails after this long
pub const REQUEST_TIMEOUT_MS: u64 = 45_000;

/// What a completed lookup yields
#[derive(Debug, Clone)]
pub enum LookupResult {
    Router(Arc<RouterInfo>),
    LeaseSet(Arc<LeaseSet>),
}

/// One in-flight lookup
pub struct RequestedDestination {
    pub key: IdentHash,
    pub kind: LookupKind,
    pub excluded: HashSet<IdentHash>,
    pub created_ms: u64,
    pub last_attempt_ms: u64,
    pub attempts: u32,
    completions: Vec<oneshot::Sender<Option<LookupResult>>>,
}

impl RequestedDestination {
    fn new(key: IdentHash, kind: LookupKind) -> Self {
        Self {
            key,
            kind,
            excluded: HashSet::new(),
            created_ms: now_ms(),
            last_attempt_ms: 0,
            attempts: 0,
            completions: Vec::new(),
        }
    }

    pub fn mark_attempt(&mut self, floodfill: IdentHash) {
        self.excluded.insert(floodfill);
        self.attempts += 1;
        self.last_attempt_ms = now_ms();
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= MAX_LOOKUP_ATTEMPTS
            || self.created_ms + REQUEST_TIMEOUT_MS < now_ms()
    }

    pub fn attempt_timed_out(&self, now_ms: u64) -> bool {
        self.last_attempt_ms + ATTEMPT_TIMEOUT_MS < now_ms
    }

    fn complete(self, result: Option<LookupResult>) {
        for completion in self.completions {
            let _ = completion.send(result.clone());
        }
    }
}

/// Table of in-flight lookups keyed by target hash
#[derive(Default)]
pub struct RequestManager {
    requests: HashMap<IdentHash, RequestedDestination>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a key. Returns true when this is a new request
    /// (the caller should fire the first attempt).
    pub fn insert(
        &mut self,
        key: IdentHash,
        kind: LookupKind,
        completion: oneshot::Sender<Option<LookupResult>>,
    ) -> bool {
        match self.requests.get_mut(&key) {
            Some(existing) => {
                existing.completions.push(completion);
                false
            }
            None => {
                let mut request = RequestedDestination::new(key, kind);
                request.completions.push(completion);
                self.requests.insert(key, request);
                true
            }
        }
    }

    pub fn get_mut(&mut self, key: &IdentHash) -> Option<&mut RequestedDestination> {
        self.requests.get_mut(key)
    }

    pub fn contains(&self, key: &IdentHash) -> bool {
        self.requests.contains_key(key)
    }

    /// Deliver a result to every waiter and drop the request.
    pub fn complete(&mut self, key: &IdentHash, result: Option<LookupResult>) {
        if let Some(request) = self.requests.remove(key) {
            debug!(
                "lookup {} completed after {} attempts ({})",
                hex::encode(&key[..8]),
                request.attempts,
                if result.is_some() { "found" } else { "not found" }
            );
            request.complete(result);
        }
    }

    /// Keys whose current attempt timed out and which can still retry.
    /// Exhausted requests are completed with `None` and removed.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<IdentHash> {
        let mut retry = Vec::new();
        let mut exhausted = Vec::new();
        for (key, request) in &self.requests {
            if !request.attempt_timed_out(now_ms) {
                continue;
            }
            if request.exhausted() {
                exhausted.push(*key);
            } else {
                retry.push(*key);
            }
        }
        for key in exhausted {
            self.complete(&key, None);
        }
        retry
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_dedups() {
        let mut mgr = RequestManager::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        assert!(mgr.insert([1u8; 32], LookupKind::RouterInfo, tx1));
        assert!(!mgr.insert([1u8; 32], LookupKind::RouterInfo, tx2));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_complete_notifies_all_waiters() {
        let mut mgr = RequestManager::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        mgr.insert([1u8; 32], LookupKind::Any, tx1);
        mgr.insert([1u8; 32], LookupKind::Any, tx2);

        mgr.complete(&[1u8; 32], None);
        assert!(mgr.is_empty());
        assert!(matches!(rx1.try_recv(), Ok(None)));
        assert!(matches!(rx2.try_recv(), Ok(None)));
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let mut request = RequestedDestination::new([1u8; 32], LookupKind::Any);
        for i in 0..MAX_LOOKUP_ATTEMPTS {
            assert!(!request.exhausted());
            let mut ff = [0u8; 32];
            ff[0] = i as u8;
            request.mark_attempt(ff);
        }
        assert!(request.exhausted());
        assert_eq!(request.excluded.len(), MAX_LOOKUP_ATTEMPTS as usize);
    }

    #[test]
    fn test_sweep_retries_timed_out() {
        let mut mgr = RequestManager::new();
        let (tx, _rx) = oneshot::channel();
        mgr.insert([1u8; 32], LookupKind::Any, tx);
        mgr.get_mut(&[1u8; 32]).unwrap().mark_attempt([9u8; 32]);

        assert!(mgr.sweep(now_ms()).is_empty());
        let retry = mgr.sweep(now_ms() + ATTEMPT_TIMEOUT_MS + 1);
        assert_eq!(retry, vec![[1u8; 32]]);
    }

    #[test]
    fn test_sweep_completes_exhausted_with_none() {
        let mut mgr = RequestManager::new();
        let (tx, mut rx) = oneshot::channel();
        mgr.insert([1u8; 32], LookupKind::Any, tx);
        {
            let request = mgr.get_mut(&[1u8; 32]).unwrap();
            for i in 0..MAX_LOOKUP_ATTEMPTS {
                let mut ff = [0u8; 32];
                ff[0] = i as u8;
                request.mark_attempt(ff);
            }
        }
        mgr.sweep(now_ms() + ATTEMPT_TIMEOUT_MS + 1);
        assert!(mgr.is_empty());
        assert!(matches!(rx.try_recv(), Ok(None)));
    }
}
