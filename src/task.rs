use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use crate::event_loop::LoopCtx;

/// Why a task callback is being invoked.
///
/// Canceled tasks are still invoked so whatever the closure owns gets a
/// chance to release or report before it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    RunReady,
    Canceled,
}

pub(crate) type LocalTaskFn = Box<dyn FnOnce(&mut LoopCtx<'_>, TaskStatus)>;

/// A unit of deferred work submitted to an event loop from any thread.
///
/// Tasks submitted through an [`EventLoop`](crate::event_loop::EventLoop)
/// handle cross threads, so their callbacks must be `Send`. Work scheduled
/// from on-thread via [`LoopCtx`] has no such bound.
pub struct Task {
    pub(crate) label: &'static str,
    pub(crate) callback: Box<dyn FnOnce(&mut LoopCtx<'_>, TaskStatus) + Send>,
}

impl Task {
    /// Create a task. `label` shows up in trace logs only.
    pub fn new(
        label: &'static str,
        callback: impl FnOnce(&mut LoopCtx<'_>, TaskStatus) + Send + 'static,
    ) -> Task {
        Task {
            label,
            callback: Box::new(callback),
        }
    }
}

/// Identifies a scheduled task for cancellation. Only valid on the loop
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

pub(crate) struct ScheduledTask {
    pub(crate) label: &'static str,
    pub(crate) callback: LocalTaskFn,
}

/// Per-loop task scheduler: an intrusive FIFO for immediate tasks plus a
/// min-heap of timers, with an id map so cancellation is idempotent and
/// stale heap entries can be skipped on pop.
pub(crate) struct Scheduler {
    next_seq: u64,
    ready: VecDeque<TaskId>,
    timed: BinaryHeap<Reverse<(u64, u64)>>,
    tasks: HashMap<u64, ScheduledTask>,
}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler {
            next_seq: 0,
            ready: VecDeque::new(),
            timed: BinaryHeap::new(),
            tasks: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> TaskId {
        let id = TaskId(self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Schedule for the next turn, ahead of any timer due at the same time.
    pub(crate) fn schedule_now(&mut self, label: &'static str, callback: LocalTaskFn) -> TaskId {
        let id = self.next_id();
        self.tasks.insert(id.0, ScheduledTask { label, callback });
        self.ready.push_back(id);
        id
    }

    /// Schedule at an absolute time. `run_at_ns == 0` is immediate.
    pub(crate) fn schedule_at(
        &mut self,
        label: &'static str,
        callback: LocalTaskFn,
        run_at_ns: u64,
    ) -> TaskId {
        if run_at_ns == 0 {
            return self.schedule_now(label, callback);
        }
        let id = self.next_id();
        self.tasks.insert(id.0, ScheduledTask { label, callback });
        self.timed.push(Reverse((run_at_ns, id.0)));
        id
    }

    /// Remove a task before dispatch. Returns the task so the caller can
    /// invoke it with [`TaskStatus::Canceled`]. Idempotent: a second cancel
    /// (or a cancel after dispatch) returns `None`.
    pub(crate) fn cancel(&mut self, id: TaskId) -> Option<ScheduledTask> {
        // FIFO and heap entries for this id become stale and are skipped on pop.
        self.tasks.remove(&id.0)
    }

    /// Soonest pending work: 0 if an immediate task is queued, the earliest
    /// timer otherwise, `None` when idle.
    pub(crate) fn next_due_ns(&mut self) -> Option<u64> {
        if !self.ready.is_empty() {
            return Some(0);
        }
        while let Some(Reverse((run_at, seq))) = self.timed.peek().copied() {
            if self.tasks.contains_key(&seq) {
                return Some(run_at);
            }
            self.timed.pop();
        }
        None
    }

    /// Take every task due at `now_ns`, immediate tasks first, then timers
    /// in (time, insertion) order. Tasks scheduled while the returned batch
    /// runs land in the next turn.
    pub(crate) fn take_due(&mut self, now_ns: u64) -> Vec<(TaskId, ScheduledTask)> {
        let mut due = Vec::new();
        for id in std::mem::take(&mut self.ready) {
            if let Some(task) = self.tasks.remove(&id.0) {
                due.push((id, task));
            }
        }
        while let Some(Reverse((run_at, seq))) = self.timed.peek().copied() {
            if run_at > now_ns {
                break;
            }
            self.timed.pop();
            if let Some(task) = self.tasks.remove(&seq) {
                due.push((TaskId(seq), task));
            }
        }
        due
    }

    /// Remove everything; used at loop teardown to dispatch the remainder
    /// with [`TaskStatus::Canceled`].
    pub(crate) fn drain_all(&mut self) -> Vec<(TaskId, ScheduledTask)> {
        self.ready.clear();
        self.timed.clear();
        let mut rest: Vec<_> = self
            .tasks
            .drain()
            .map(|(seq, task)| (TaskId(seq), task))
            .collect();
        rest.sort_by_key(|(id, _)| id.0);
        rest
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> LocalTaskFn {
        Box::new(|_, _| {})
    }

    #[test]
    fn immediate_tasks_run_in_submission_order() {
        let mut sched = Scheduler::new();
        sched.schedule_now("a", noop());
        sched.schedule_now("b", noop());
        sched.schedule_now("c", noop());

        let due = sched.take_due(0);
        let labels: Vec<_> = due.iter().map(|(_, t)| t.label).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert!(sched.is_empty());
    }

    #[test]
    fn timers_run_in_time_then_insertion_order() {
        let mut sched = Scheduler::new();
        sched.schedule_at("late", noop(), 300);
        sched.schedule_at("early", noop(), 100);
        sched.schedule_at("early2", noop(), 100);

        let due = sched.take_due(300);
        let labels: Vec<_> = due.iter().map(|(_, t)| t.label).collect();
        assert_eq!(labels, vec!["early", "early2", "late"]);
    }

    #[test]
    fn immediate_precedes_equal_timers() {
        let mut sched = Scheduler::new();
        sched.schedule_at("timer", noop(), 100);
        sched.schedule_now("now", noop());

        let due = sched.take_due(100);
        let labels: Vec<_> = due.iter().map(|(_, t)| t.label).collect();
        assert_eq!(labels, vec!["now", "timer"]);
    }

    #[test]
    fn future_timers_stay_queued() {
        let mut sched = Scheduler::new();
        sched.schedule_at("future", noop(), 1_000);

        assert!(sched.take_due(999).is_empty());
        assert_eq!(sched.next_due_ns(), Some(1_000));

        let due = sched.take_due(1_000);
        assert_eq!(due.len(), 1);
        assert_eq!(sched.next_due_ns(), None);
    }

    #[test]
    fn past_timers_run_on_next_take() {
        let mut sched = Scheduler::new();
        sched.schedule_at("past", noop(), 50);
        let due = sched.take_due(200);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_removes() {
        let mut sched = Scheduler::new();
        let id = sched.schedule_at("victim", noop(), 100);

        assert!(sched.cancel(id).is_some());
        assert!(sched.cancel(id).is_none());
        assert!(sched.take_due(100).is_empty());
        assert_eq!(sched.next_due_ns(), None);
    }

    #[test]
    fn next_due_skips_canceled_heap_entries() {
        let mut sched = Scheduler::new();
        let early = sched.schedule_at("early", noop(), 100);
        sched.schedule_at("late", noop(), 500);

        sched.cancel(early);
        assert_eq!(sched.next_due_ns(), Some(500));
    }

    #[test]
    fn schedule_at_zero_is_immediate() {
        let mut sched = Scheduler::new();
        sched.schedule_at("timer", noop(), 10);
        sched.schedule_at("zero", noop(), 0);
        assert_eq!(sched.next_due_ns(), Some(0));

        let due = sched.take_due(10);
        let labels: Vec<_> = due.iter().map(|(_, t)| t.label).collect();
        assert_eq!(labels, vec!["zero", "timer"]);
    }

    #[test]
    fn drain_all_returns_everything_in_id_order() {
        let mut sched = Scheduler::new();
        sched.schedule_now("a", noop());
        sched.schedule_at("b", noop(), 1_000_000);

        let rest = sched.drain_all();
        let labels: Vec<_> = rest.iter().map(|(_, t)| t.label).collect();
        assert_eq!(labels, vec!["a", "b"]);
        assert!(sched.is_empty());
    }
}
