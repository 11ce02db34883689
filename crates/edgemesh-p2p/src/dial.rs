//! Two-priority dial queue.
//!
//! Explicitly requested dials are served before dials triggered by
//! routing-table churn; within a priority the order is FIFO. Tasks can be
//! cancelled while still queued, and enqueuing the same peer twice is
//! collapsed into one task.

use std::{
    collections::{HashSet, VecDeque},
    sync::Mutex,
};

use libp2p::PeerId;
use tokio::sync::Notify;

use crate::addr::AddrInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPriority {
    /// Explicit dial (bootnode connect, operator request).
    RequestedDial,
    /// Dial caused by routing-table churn.
    RandomDial,
}

#[derive(Debug, Clone)]
pub struct DialTask {
    pub info: AddrInfo,
    pub priority: DialPriority,
}

#[derive(Debug, Default)]
struct Inner {
    requested: VecDeque<AddrInfo>,
    random: VecDeque<AddrInfo>,
    /// Peers with a live (not yet popped, not cancelled) task.
    pending: HashSet<PeerId>,
}

#[derive(Debug, Default)]
pub struct DialQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl DialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a dial. A peer that is already queued is not queued again.
    pub fn add_task(&self, info: AddrInfo, priority: DialPriority) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.pending.insert(info.peer_id) {
                return;
            }
            match priority {
                DialPriority::RequestedDial => inner.requested.push_back(info),
                DialPriority::RandomDial => inner.random.push_back(info),
            }
        }
        self.notify.notify_one();
    }

    /// Cancel a still-queued dial for `id`. Popped tasks are unaffected.
    pub fn delete_task(&self, id: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&id);
    }

    /// Pop the next live task, requested priority first.
    ///
    /// Cancelled entries are skipped lazily here, which keeps
    /// `delete_task` O(1).
    pub fn pop(&self) -> Option<DialTask> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let (info, priority) = if let Some(info) = inner.requested.pop_front() {
                (info, DialPriority::RequestedDial)
            } else if let Some(info) = inner.random.pop_front() {
                (info, DialPriority::RandomDial)
            } else {
                return None;
            };
            if inner.pending.remove(&info.peer_id) {
                return Some(DialTask { info, priority });
            }
        }
    }

    /// Await the next task, parking until one is enqueued.
    pub async fn wait_pop(&self) -> DialTask {
        loop {
            if let Some(task) = self.pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(port: u16) -> AddrInfo {
        let id = libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        AddrInfo::new(id, vec![format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()])
    }

    #[test]
    fn requested_beats_random_fifo_within_priority() {
        let q = DialQueue::new();
        let (a, b, c) = (info(1), info(2), info(3));

        q.add_task(a.clone(), DialPriority::RandomDial);
        q.add_task(b.clone(), DialPriority::RequestedDial);
        q.add_task(c.clone(), DialPriority::RequestedDial);

        assert_eq!(q.pop().unwrap().info.peer_id, b.peer_id);
        assert_eq!(q.pop().unwrap().info.peer_id, c.peer_id);
        assert_eq!(q.pop().unwrap().info.peer_id, a.peer_id);
        assert!(q.pop().is_none());
    }

    #[test]
    fn duplicate_peer_is_queued_once() {
        let q = DialQueue::new();
        let a = info(1);
        q.add_task(a.clone(), DialPriority::RandomDial);
        q.add_task(a.clone(), DialPriority::RequestedDial);

        assert_eq!(q.len(), 1);
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
    }

    #[test]
    fn deleted_task_is_never_popped() {
        let q = DialQueue::new();
        let (a, b) = (info(1), info(2));
        q.add_task(a.clone(), DialPriority::RandomDial);
        q.add_task(b.clone(), DialPriority::RandomDial);

        q.delete_task(a.peer_id);
        assert_eq!(q.pop().unwrap().info.peer_id, b.peer_id);
        assert!(q.pop().is_none());
    }

    #[tokio::test]
    async fn wait_pop_wakes_on_enqueue() {
        use std::sync::Arc;

        let q = Arc::new(DialQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_pop().await })
        };

        tokio::task::yield_now().await;
        let a = info(1);
        q.add_task(a.clone(), DialPriority::RequestedDial);

        let task = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.info.peer_id, a.peer_id);
    }
}
