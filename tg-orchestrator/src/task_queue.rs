//! FIFO backlog of tasks waiting for worker capacity.
//!
//! The queue is a doubly linked list over slab storage with an id index,
//! so a task can be withdrawn by id in constant time (client disconnects,
//! stage aborts) without disturbing the order of the remaining entries.

use std::collections::HashMap;

use common::{ClientId, TaskId};

/// Locator for one task record: the owning job plus the task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRef {
    pub client_id: ClientId,
    pub task_id: TaskId,
}

#[derive(Debug)]
struct Node {
    entry: TaskRef,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<TaskId, usize>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task at the tail. Returns false if the task is already
    /// queued.
    pub fn push(&mut self, entry: TaskRef) -> bool {
        if self.index.contains_key(&entry.task_id) {
            return false;
        }

        let node = Node {
            entry,
            prev: self.tail,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(node) = self.slots[tail].as_mut() {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.index.insert(entry.task_id, slot);
        true
    }

    /// Append a batch of tasks in iteration order.
    pub fn push_all<I: IntoIterator<Item = TaskRef>>(&mut self, entries: I) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Remove and return the task at the head of the queue.
    pub fn pop_front(&mut self) -> Option<TaskRef> {
        let slot = self.head?;
        self.unlink(slot)
    }

    /// The task at the head of the queue, left in place.
    pub fn peek_front(&self) -> Option<TaskRef> {
        let slot = self.head?;
        self.slots.get(slot)?.as_ref().map(|node| node.entry)
    }

    /// Withdraw a queued task by id. Returns false if it was not queued.
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        match self.index.get(&task_id).copied() {
            Some(slot) => self.unlink(slot).is_some(),
            None => false,
        }
    }

    /// Withdraw every queued entry belonging to one client, returning
    /// them in queue order.
    pub fn remove_client(&mut self, client_id: ClientId) -> Vec<TaskRef> {
        let mut removed = Vec::new();
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let (entry, next) = match self.slots.get(slot).and_then(|node| node.as_ref()) {
                Some(node) => (node.entry, node.next),
                None => break,
            };
            cursor = next;
            if entry.client_id == client_id {
                self.unlink(slot);
                removed.push(entry);
            }
        }
        removed
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.index.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn unlink(&mut self, slot: usize) -> Option<TaskRef> {
        let node = self.slots.get_mut(slot)?.take()?;

        match node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.slots[prev].as_mut() {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next_node) = self.slots[next].as_mut() {
                    next_node.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }

        self.free.push(slot);
        self.index.remove(&node.entry.task_id);
        Some(node.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(client: u64, task: u64) -> TaskRef {
        TaskRef {
            client_id: ClientId::from(client),
            task_id: TaskId::from(task),
        }
    }

    #[test]
    fn test_push_pop_is_fifo() {
        let mut queue = TaskQueue::new();
        assert!(queue.push(entry(1, 1)));
        assert!(queue.push(entry(1, 2)));
        assert!(queue.push(entry(2, 3)));

        assert_eq!(queue.pop_front(), Some(entry(1, 1)));
        assert_eq!(queue.pop_front(), Some(entry(1, 2)));
        assert_eq!(queue.pop_front(), Some(entry(2, 3)));
        assert_eq!(queue.pop_front(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_push_is_rejected() {
        let mut queue = TaskQueue::new();
        assert!(queue.push(entry(1, 7)));
        assert!(!queue.push(entry(1, 7)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_preserves_order_of_remaining() {
        let mut queue = TaskQueue::new();
        queue.push_all([entry(1, 1), entry(1, 2), entry(1, 3), entry(1, 4)]);

        assert!(queue.remove(TaskId::from(2)));
        assert!(!queue.remove(TaskId::from(2)));
        assert!(!queue.contains(TaskId::from(2)));

        assert_eq!(queue.pop_front(), Some(entry(1, 1)));
        assert_eq!(queue.pop_front(), Some(entry(1, 3)));
        assert_eq!(queue.pop_front(), Some(entry(1, 4)));
    }

    #[test]
    fn test_remove_head_and_tail() {
        let mut queue = TaskQueue::new();
        queue.push_all([entry(1, 1), entry(1, 2), entry(1, 3)]);

        assert!(queue.remove(TaskId::from(1)));
        assert!(queue.remove(TaskId::from(3)));
        assert_eq!(queue.peek_front(), Some(entry(1, 2)));

        queue.push(entry(1, 9));
        assert_eq!(queue.pop_front(), Some(entry(1, 2)));
        assert_eq!(queue.pop_front(), Some(entry(1, 9)));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn test_slots_are_reused_after_pop() {
        let mut queue = TaskQueue::new();
        queue.push(entry(1, 1));
        queue.push(entry(1, 2));
        queue.pop_front();
        queue.push(entry(1, 3));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front(), Some(entry(1, 2)));
        assert_eq!(queue.pop_front(), Some(entry(1, 3)));
    }

    #[test]
    fn test_remove_client_keeps_other_clients_queued() {
        let mut queue = TaskQueue::new();
        queue.push_all([entry(1, 1), entry(2, 2), entry(1, 3), entry(2, 4)]);

        let removed = queue.remove_client(ClientId::from(1));
        assert_eq!(removed, vec![entry(1, 1), entry(1, 3)]);

        assert_eq!(queue.pop_front(), Some(entry(2, 2)));
        assert_eq!(queue.pop_front(), Some(entry(2, 4)));
        assert_eq!(queue.pop_front(), None);
    }
}
