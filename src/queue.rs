//! Re-render queue
//!
//! One queue per UI thread. Tasks run in FIFO order at the next drain; a task
//! that is already pending is not enqueued twice. `add` returns a future that
//! resolves once the drain that runs the task has finished.

use futures::channel::oneshot;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

pub type Task = Rc<dyn Fn()>;

#[derive(Default)]
struct QueueState {
    tasks: Vec<Task>,
    waiters: Vec<oneshot::Sender<()>>,
    draining: bool,
}

thread_local! {
    static QUEUE: RefCell<QueueState> = RefCell::new(QueueState::default());
}

fn same_task(a: &Task, b: &Task) -> bool {
    std::ptr::eq(Rc::as_ptr(a) as *const (), Rc::as_ptr(b) as *const ())
}

/// Resolves after the drain that ran the task.
#[must_use = "the queue runs the task whether or not this future is awaited"]
pub struct Drained(oneshot::Receiver<()>);

impl Future for Drained {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

/// Schedules `task` for the next drain.
pub fn add(task: &Task) -> Drained {
    let (sender, receiver) = oneshot::channel();
    QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        if !queue.tasks.iter().any(|pending| same_task(pending, task)) {
            queue.tasks.push(task.clone());
        }
        queue.waiters.push(sender);
    });
    Drained(receiver)
}

pub fn is_idle() -> bool {
    QUEUE.with(|queue| queue.borrow().tasks.is_empty())
}

/// Runs every pending task, including tasks enqueued while draining, then
/// resolves the waiters. Returns how many tasks ran. A nested call made from
/// inside a task returns 0 and leaves the work to the outer drain.
pub fn drain() -> usize {
    let already_draining = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        std::mem::replace(&mut queue.draining, true)
    });
    if already_draining {
        return 0;
    }

    let mut ran = 0;
    loop {
        let next = QUEUE.with(|queue| {
            let mut queue = queue.borrow_mut();
            if queue.tasks.is_empty() {
                None
            } else {
                Some(queue.tasks.remove(0))
            }
        });
        let Some(task) = next else {
            break;
        };
        task();
        ran += 1;
    }

    let waiters = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        queue.draining = false;
        std::mem::take(&mut queue.waiters)
    });
    for waiter in waiters {
        // The receiver may have been dropped; nothing to notify then.
        let _ = waiter.send(());
    }
    if ran > 0 {
        tracing::trace!(tasks = ran, "render queue drained");
    }
    ran
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::cell::Cell;

    #[test]
    fn test_duplicate_tasks_coalesce() {
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let task: Task = Rc::new(move || counter.set(counter.get() + 1));
        let first = add(&task);
        let second = add(&task);
        assert!(!is_idle());
        assert_eq!(drain(), 1);
        assert_eq!(count.get(), 1);
        assert!(first.now_or_never().is_some());
        assert!(second.now_or_never().is_some());
        assert!(is_idle());
    }

    #[test]
    fn test_future_pending_until_drain() {
        let task: Task = Rc::new(|| {});
        let mut drained = add(&task);
        assert!((&mut drained).now_or_never().is_none());
        drain();
        assert!(drained.now_or_never().is_some());
    }

    #[test]
    fn test_tasks_added_while_draining_run_in_same_drain() {
        let log = Rc::new(RefCell::new(vec![]));
        let inner_log = log.clone();
        let inner: Task = Rc::new(move || inner_log.borrow_mut().push("inner"));
        let outer_log = log.clone();
        let outer: Task = Rc::new(move || {
            outer_log.borrow_mut().push("outer");
            let _ = add(&inner);
            assert_eq!(drain(), 0);
        });
        let _ = add(&outer);
        assert_eq!(drain(), 2);
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_block_on_after_drain() {
        let task: Task = Rc::new(|| {});
        let drained = add(&task);
        drain();
        futures::executor::block_on(drained);
    }
}
