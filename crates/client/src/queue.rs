//! 断线期间的待发送队列

use std::collections::VecDeque;

use config::OverflowPolicy;
use domain::Envelope;
use tokio::time::Instant;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub envelope: Envelope,
    pub enqueued_at: Instant,
}

/// 有界 FIFO。满了以后按溢出策略丢最旧的或拒绝新的。
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingEntry>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl PendingQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            policy,
        }
    }

    /// 入队。`DropOldest` 下返回被挤掉的条目。
    pub fn push(
        &mut self,
        envelope: Envelope,
        now: Instant,
    ) -> Result<Option<PendingEntry>, ClientError> {
        let mut dropped = None;
        if self.entries.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => dropped = self.entries.pop_front(),
                OverflowPolicy::RejectNew => {
                    return Err(ClientError::QueueFull {
                        capacity: self.capacity,
                    })
                }
            }
        }

        self.entries.push_back(PendingEntry {
            envelope,
            enqueued_at: now,
        });
        Ok(dropped)
    }

    pub fn pop_front(&mut self) -> Option<PendingEntry> {
        self.entries.pop_front()
    }

    /// 发送失败的条目放回队首，保持原有顺序
    pub fn push_front(&mut self, entry: PendingEntry) {
        self.entries.push_front(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ChatSendData, UserId};

    fn chat(id: &str) -> Envelope {
        Envelope::chat_send(Some(id.to_string()), ChatSendData::direct(UserId(2), id))
    }

    fn ids(queue: &mut PendingQueue) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(entry) = queue.pop_front() {
            out.push(entry.envelope.msg_id.unwrap_or_default());
        }
        out
    }

    #[test]
    fn keeps_fifo_order() {
        let mut queue = PendingQueue::new(8, OverflowPolicy::DropOldest);
        let now = Instant::now();
        for id in ["m1", "m2", "m3"] {
            assert!(queue.push(chat(id), now).unwrap().is_none());
        }
        assert_eq!(ids(&mut queue), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let mut queue = PendingQueue::new(2, OverflowPolicy::DropOldest);
        let now = Instant::now();
        queue.push(chat("m1"), now).unwrap();
        queue.push(chat("m2"), now).unwrap();

        let dropped = queue.push(chat("m3"), now).unwrap().expect("dropped entry");
        assert_eq!(dropped.envelope.msg_id.as_deref(), Some("m1"));
        assert_eq!(ids(&mut queue), vec!["m2", "m3"]);
    }

    #[test]
    fn reject_new_keeps_existing() {
        let mut queue = PendingQueue::new(1, OverflowPolicy::RejectNew);
        let now = Instant::now();
        queue.push(chat("m1"), now).unwrap();

        let err = queue.push(chat("m2"), now).unwrap_err();
        assert!(matches!(err, ClientError::QueueFull { capacity: 1 }));
        assert_eq!(ids(&mut queue), vec!["m1"]);
    }

    #[test]
    fn requeued_entry_goes_back_to_front() {
        let mut queue = PendingQueue::new(4, OverflowPolicy::DropOldest);
        let now = Instant::now();
        queue.push(chat("m1"), now).unwrap();
        queue.push(chat("m2"), now).unwrap();

        let head = queue.pop_front().unwrap();
        queue.push_front(head);
        assert_eq!(queue.len(), 2);
        assert_eq!(ids(&mut queue), vec!["m1", "m2"]);
    }
}
