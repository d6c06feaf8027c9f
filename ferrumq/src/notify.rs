//! Implements the work notifier: the level-triggered "has pending work"
//! flag and the async task queue that hands outbound work from arbitrary
//! tasks onto the connection's I/O task
//!
//! Producers (timers, queue deliveries, management commands) never touch
//! engine state directly: they enqueue an [`Action`] and the notifier
//! wakes the I/O task, which drains the queue between reads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// A deferred unit of work executed with exclusive access to the engine
/// state `E`.
pub type Action<E> = Box<dyn FnOnce(&mut E) + Send>;

/// Callback invoked on `notify_work`, typically the engine waker.
pub type WorkListener = Box<dyn Fn() + Send + Sync>;

/// Level-triggered work flag plus the async task FIFO.
pub struct WorkNotifier<E> {
    pending: AtomicBool,
    listener: Mutex<Option<WorkListener>>,
    tasks: Mutex<VecDeque<Action<E>>>,
    io_task: Mutex<Option<tokio::task::Id>>,
}

impl<E> std::fmt::Debug for WorkNotifier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkNotifier")
            .field("pending", &self.has_work())
            .field("queued_tasks", &self.tasks.lock().len())
            .finish()
    }
}

impl<E> Default for WorkNotifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> WorkNotifier<E> {
    /// An idle notifier with no listener.
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            listener: Mutex::new(None),
            tasks: Mutex::new(VecDeque::new()),
            io_task: Mutex::new(None),
        }
    }

    /// True while work is pending. Level-triggered: stays set until
    /// [`clear_work`](Self::clear_work).
    pub fn has_work(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Raises the work flag and wakes the listener.
    pub fn notify_work(&self) {
        self.pending.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().as_ref() {
            listener();
        }
    }

    /// Lowers the work flag; called by the I/O task once drained.
    pub fn clear_work(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    /// Installs the wake-up callback.
    pub fn set_work_listener(&self, listener: WorkListener) {
        *self.listener.lock() = Some(listener);
    }

    /// Queues an action for the I/O task and wakes it.
    pub fn enqueue(&self, action: Action<E>) {
        self.tasks.lock().push_back(action);
        self.notify_work();
    }

    /// Pops the next queued action, if any.
    pub(crate) fn pop_task(&self) -> Option<Action<E>> {
        self.tasks.lock().pop_front()
    }

    /// Binds the notifier to the current tokio task; only that task may
    /// drain pending work.
    pub fn bind_io_task(&self) {
        *self.io_task.lock() = tokio::task::try_id();
    }

    /// True when the caller runs on the bound I/O task.
    pub fn is_io_task(&self) -> bool {
        match (*self.io_task.lock(), tokio::task::try_id()) {
            (Some(bound), Some(current)) => bound == current,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn flag_is_level_triggered() {
        let notifier: WorkNotifier<()> = WorkNotifier::new();
        assert!(!notifier.has_work());
        notifier.notify_work();
        notifier.notify_work();
        assert!(notifier.has_work());
        notifier.clear_work();
        assert!(!notifier.has_work());
    }

    #[test]
    fn listener_fires_per_notification() {
        let notifier: WorkNotifier<()> = WorkNotifier::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        notifier.set_work_listener(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        notifier.notify_work();
        notifier.enqueue(Box::new(|_| {}));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tasks_drain_in_fifo_order() {
        let notifier: WorkNotifier<Vec<u32>> = WorkNotifier::new();
        notifier.enqueue(Box::new(|v| v.push(1)));
        notifier.enqueue(Box::new(|v| v.push(2)));
        notifier.enqueue(Box::new(|v| v.push(3)));

        let mut state = Vec::new();
        while let Some(task) = notifier.pop_task() {
            task(&mut state);
        }
        assert_eq!(state, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn io_task_binding_excludes_other_tasks() {
        let notifier: Arc<WorkNotifier<()>> = Arc::new(WorkNotifier::new());
        notifier.bind_io_task();
        assert!(notifier.is_io_task());

        let other = notifier.clone();
        let from_other_task = tokio::spawn(async move { other.is_io_task() })
            .await
            .unwrap();
        assert!(!from_other_task);
    }
}
