use std::collections::HashMap;
use std::time::{Duration, Instant};

use uavo::{ObjectId, ObjectInstance};

/// Completion of an object request: the object, or `None` when the request
/// expired, was refused or the session ended.
pub type Callback = Box<dyn FnOnce(Option<ObjectInstance>) + Send>;

pub type RequestKey = (ObjectId, u16);

struct PendingRequest {
    retries_left: u32,
    deadline: Instant,
    callbacks: Vec<Callback>,
}

/// In-flight object requests, at most one per key.
#[derive(Default)]
pub struct PendingRequests {
    requests: HashMap<RequestKey, PendingRequest>,
}

/// Work found by [`PendingRequests::poll`].
#[derive(Default)]
pub struct Poll {
    pub retransmit: Option<RequestKey>,
    pub expired: Vec<(RequestKey, Vec<Callback>)>,
}

impl PendingRequests {
    /// Registers a request. A request already in flight for `key` keeps its
    /// callbacks, gains `callback` and has its retry budget and deadline
    /// refreshed.
    pub fn register(&mut self, key: RequestKey, callback: Callback, retries: u32, deadline: Instant) {
        let entry = self.requests.entry(key).or_insert_with(|| PendingRequest {
            retries_left: retries,
            deadline,
            callbacks: Vec::new(),
        });
        entry.retries_left = retries;
        entry.deadline = deadline;
        entry.callbacks.push(callback);
    }

    pub fn complete(&mut self, key: RequestKey) -> Option<Vec<Callback>> {
        self.requests.remove(&key).map(|r| r.callbacks)
    }

    /// Expires requests past their deadline with no retries left and picks
    /// the one with the oldest elapsed deadline for retransmission.
    pub fn poll(&mut self, now: Instant, retry_interval: Duration) -> Poll {
        let mut poll = Poll::default();
        let expired: Vec<RequestKey> = self
            .requests
            .iter()
            .filter(|(_, r)| r.deadline <= now && r.retries_left == 0)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(r) = self.requests.remove(&key) {
                poll.expired.push((key, r.callbacks));
            }
        }

        let oldest = self
            .requests
            .iter_mut()
            .filter(|(_, r)| r.deadline <= now)
            .min_by_key(|(_, r)| r.deadline);
        if let Some((key, request)) = oldest {
            request.retries_left -= 1;
            request.deadline = now + retry_interval;
            poll.retransmit = Some(*key);
        }
        poll
    }

    pub fn drain(&mut self) -> Vec<(RequestKey, Vec<Callback>)> {
        self.requests.drain().map(|(k, r)| (k, r.callbacks)).collect()
    }

    pub fn contains(&self, key: RequestKey) -> bool {
        self.requests.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
