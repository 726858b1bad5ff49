//! The unbuffered task queue (§4.3, §5): a rendezvous channel plus an
//! in-flight counter. Posting a task increments the counter; marking it
//! done decrements, and the queue closes itself once the counter returns
//! to zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;

use crate::task::Task;

enum QueueMessage {
    Work(Task),
    Stop,
}

/// Callers MUST post any follow-on tasks a completed task implies *before*
/// calling [`WorkQueue::mark_done`] for it — otherwise the in-flight count
/// can transiently hit zero and close the queue while more work was about
/// to be posted.
pub struct WorkQueue {
    sender: mpsc::SyncSender<QueueMessage>,
    receiver: Mutex<mpsc::Receiver<QueueMessage>>,
    in_flight: AtomicUsize,
    num_workers: usize,
}

impl WorkQueue {
    pub fn new(num_workers: usize) -> WorkQueue {
        let (sender, receiver) = mpsc::sync_channel(0);
        WorkQueue {
            sender,
            receiver: Mutex::new(receiver),
            in_flight: AtomicUsize::new(0),
            num_workers: num_workers.max(1),
        }
    }

    /// Posts a task, blocking (the channel is unbuffered) until a worker is
    /// ready to take it.
    pub fn post(&self, task: Task) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(QueueMessage::Work(task));
    }

    /// Blocks until a task is available or the queue has closed.
    pub fn next(&self) -> Option<Task> {
        match self.receiver.lock().unwrap().recv() {
            Ok(QueueMessage::Work(task)) => Some(task),
            _ => None,
        }
    }

    /// Marks one previously-posted task complete. If this was the last
    /// outstanding task, wakes every worker with a `Stop` message so the
    /// pool winds down.
    pub fn mark_done(&self) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            for _ in 0..self.num_workers {
                let _ = self.sender.send(QueueMessage::Stop);
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::Label;
    use crate::task::TaskKind;

    fn task(name: &str) -> Task {
        let l = Label::parse(&format!("//a:{name}"), None).unwrap();
        Task::new(l.clone(), l, TaskKind::Build)
    }

    #[test]
    fn single_task_drains_and_closes() {
        let queue = WorkQueue::new(1);
        queue.post(task("x"));
        let t = queue.next().unwrap();
        assert_eq!(t.label.name(), "x");
        queue.mark_done();
        assert!(queue.next().is_none());
    }

    #[test]
    fn posting_before_marking_done_keeps_queue_open() {
        let queue = std::sync::Arc::new(WorkQueue::new(1));
        queue.post(task("a"));

        let q2 = queue.clone();
        let worker = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(t) = q2.next() {
                seen.push(t.label.name().to_string());
                if seen.len() == 1 {
                    q2.post(task("b"));
                }
                q2.mark_done();
            }
            seen
        });

        let seen = worker.join().unwrap();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
    }
}
