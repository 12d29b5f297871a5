//! Task lifecycle and the per-logical-unit task set
//!
//! A task moves Pending -> Running -> WritingResponse -> Done, or jumps to
//! Aborted from any state before WritingResponse. The transition into
//! WritingResponse is the point of no return: an abort after it fails, which
//! is what makes "abort() returned true" mean "the initiator will not see a
//! response".
//!
//! The task set serializes admitted tasks by SAM-2 attribute: SIMPLE tasks
//! run concurrently, an ORDERED task waits for everything admitted before it
//! and blocks everything admitted after it, HEAD OF QUEUE runs immediately.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::pdu::TaskAttribute;
use crate::task::Nexus;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const WRITING_RESPONSE: u8 = 2;
const DONE: u8 = 3;
const ABORTED: u8 = 4;

#[derive(Debug)]
pub struct Task {
    pub nexus: Nexus,
    state: AtomicU8,
}

impl Task {
    pub fn new(nexus: Nexus) -> Self {
        Task {
            nexus,
            state: AtomicU8::new(PENDING),
        }
    }

    /// Pending -> Running. False if the task was aborted first; the runner
    /// must then do nothing.
    pub fn begin_run(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Running -> WritingResponse, the point after which abort fails. False
    /// if the task was aborted mid-run; no response may be written then.
    pub fn begin_response(&self) -> bool {
        self.state
            .compare_exchange(
                RUNNING,
                WRITING_RESPONSE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish(&self) {
        self.state.store(DONE, Ordering::Release);
    }

    /// Attempts to abort. True only if the task had not started writing its
    /// response; from then on the response is on the wire and the abort is
    /// too late.
    pub fn abort(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= WRITING_RESPONSE {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                ABORTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.load(Ordering::Acquire) == ABORTED
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }
}

struct Entry {
    seq: u64,
    attribute: TaskAttribute,
    task: Arc<Task>,
}

#[derive(Default)]
struct SetState {
    next_seq: u64,
    active: Vec<Entry>,
}

/// Admission ticket returned by [`TaskSet::admit`]; passed back to
/// `wait_runnable` and `complete`.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    seq: u64,
}

pub struct TaskSet {
    state: Mutex<SetState>,
    cond: Condvar,
    queue_depth: usize,
}

impl TaskSet {
    pub fn new(queue_depth: usize) -> Self {
        TaskSet {
            state: Mutex::new(SetState::default()),
            cond: Condvar::new(),
            queue_depth,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admits a task, or refuses immediately when the set is at its queue
    /// depth. Refusal never blocks; the caller answers with TASK SET FULL.
    pub fn admit(&self, task: Arc<Task>, attribute: TaskAttribute) -> Option<Admission> {
        let mut state = self.state.lock().unwrap();
        if state.active.len() >= self.queue_depth {
            log::warn!("task set full ({} tasks), refusing {}", self.queue_depth, task.nexus);
            return None;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.active.push(Entry {
            seq,
            attribute,
            task,
        });
        Some(Admission { seq })
    }

    fn runnable(state: &SetState, admission: Admission) -> bool {
        let me = state
            .active
            .iter()
            .find(|e| e.seq == admission.seq)
            .expect("admitted task left the set while waiting");
        match me.attribute {
            // Jumps the queue.
            TaskAttribute::HeadOfQueue | TaskAttribute::Aca => true,
            // Barrier: everything admitted earlier must have drained.
            TaskAttribute::Ordered => state.active.iter().all(|e| e.seq >= admission.seq),
            // Concurrent, but held back by an earlier ORDERED barrier.
            TaskAttribute::Simple | TaskAttribute::Untagged => state
                .active
                .iter()
                .all(|e| e.attribute != TaskAttribute::Ordered || e.seq >= admission.seq),
        }
    }

    /// Blocks until the task may run. Returns false if the task was aborted
    /// while queued; the caller must still call [`TaskSet::complete`].
    pub fn wait_runnable(&self, admission: Admission) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            let me = state
                .active
                .iter()
                .find(|e| e.seq == admission.seq)
                .expect("admitted task left the set while waiting");
            if me.task.is_aborted() {
                return false;
            }
            if Self::runnable(&state, admission) {
                return true;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Removes a finished (or aborted) task and wakes waiters.
    pub fn complete(&self, admission: Admission) {
        let mut state = self.state.lock().unwrap();
        state.active.retain(|e| e.seq != admission.seq);
        self.cond.notify_all();
    }

    /// Aborts every task in the set and wakes queued waiters so they can
    /// observe the abort.
    pub fn abort_all(&self) {
        let state = self.state.lock().unwrap();
        for entry in &state.active {
            entry.task.abort();
        }
        self.cond.notify_all();
    }

    /// Wakes waiters after an external state change (e.g. a single abort).
    pub fn interrupt(&self) {
        let _state = self.state.lock().unwrap();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Isid;
    use std::sync::mpsc;
    use std::time::Duration;

    fn task(tag: u32) -> Arc<Task> {
        Arc::new(Task::new(Nexus {
            isid: Isid::default(),
            tsih: 1,
            lun: 0,
            task_tag: tag,
        }))
    }

    #[test]
    fn test_task_lifecycle() {
        let t = task(1);
        assert!(t.begin_run());
        assert!(t.begin_response());
        t.finish();
        assert!(t.is_done());
        // Too late to abort once the response started.
        assert!(!t.abort());
    }

    #[test]
    fn test_abort_before_response_wins() {
        let t = task(2);
        assert!(t.begin_run());
        assert!(t.abort());
        assert!(t.is_aborted());
        assert!(!t.begin_response());
    }

    #[test]
    fn test_abort_pending_task() {
        let t = task(3);
        assert!(t.abort());
        assert!(!t.begin_run());
    }

    #[test]
    fn test_queue_depth_refusal() {
        let set = TaskSet::new(2);
        let a = set.admit(task(1), TaskAttribute::Simple).unwrap();
        let _b = set.admit(task(2), TaskAttribute::Simple).unwrap();
        assert!(set.admit(task(3), TaskAttribute::Simple).is_none());

        set.complete(a);
        assert!(set.admit(task(3), TaskAttribute::Simple).is_some());
    }

    #[test]
    fn test_ordered_waits_for_earlier_simple() {
        let set = Arc::new(TaskSet::new(8));
        let simple = set.admit(task(1), TaskAttribute::Simple).unwrap();
        assert!(set.wait_runnable(simple));

        let ordered_task = task(2);
        let ordered = set.admit(ordered_task, TaskAttribute::Ordered).unwrap();

        let (tx, rx) = mpsc::channel();
        let set2 = Arc::clone(&set);
        let handle = std::thread::spawn(move || {
            let runnable = set2.wait_runnable(ordered);
            tx.send(runnable).unwrap();
            set2.complete(ordered);
        });

        // The barrier holds while the simple task is active.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        set.complete(simple);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_simple_after_ordered_is_held() {
        let set = Arc::new(TaskSet::new(8));
        let ordered = set.admit(task(1), TaskAttribute::Ordered).unwrap();
        assert!(set.wait_runnable(ordered));

        let late = set.admit(task(2), TaskAttribute::Simple).unwrap();
        let (tx, rx) = mpsc::channel();
        let set2 = Arc::clone(&set);
        let handle = std::thread::spawn(move || {
            tx.send(set2.wait_runnable(late)).unwrap();
            set2.complete(late);
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        set.complete(ordered);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_head_of_queue_skips_barrier() {
        let set = TaskSet::new(8);
        let _ordered = set.admit(task(1), TaskAttribute::Ordered).unwrap();
        let hoq = set.admit(task(2), TaskAttribute::HeadOfQueue).unwrap();
        // Runs without waiting even though an ORDERED task is active.
        assert!(set.wait_runnable(hoq));
    }

    #[test]
    fn test_abort_wakes_queued_waiter() {
        let set = Arc::new(TaskSet::new(8));
        let ordered = set.admit(task(1), TaskAttribute::Ordered).unwrap();
        assert!(set.wait_runnable(ordered));

        let queued_task = task(2);
        let queued = set.admit(Arc::clone(&queued_task), TaskAttribute::Simple).unwrap();

        let (tx, rx) = mpsc::channel();
        let set2 = Arc::clone(&set);
        let handle = std::thread::spawn(move || {
            tx.send(set2.wait_runnable(queued)).unwrap();
            set2.complete(queued);
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        queued_task.abort();
        set.interrupt();
        // Waiter observes the abort instead of becoming runnable.
        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
        set.complete(ordered);
    }
}
