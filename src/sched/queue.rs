use super::Priority;
use std::collections::VecDeque;

pub(super) type Job = Box<dyn FnOnce() + Send + 'static>;

/// FIFO per priority, highest priority first.
#[derive(Default)]
pub(super) struct PriorityQueue {
    lanes: [VecDeque<Job>; 3],
}

impl PriorityQueue {
    fn lane(priority: Priority) -> usize {
        match priority {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub(super) fn push(&mut self, priority: Priority, job: Job) {
        self.lanes[Self::lane(priority)].push_back(job);
    }

    pub(super) fn pop(&mut self) -> Option<Job> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    pub(super) fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}
