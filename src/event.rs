//! Event: a fan-out notifier over a subscription list.
//!
//! Unlike [`crate::mutex::Mutex`]/[`crate::semaphore::Semaphore`], an
//! event's trigger doesn't wake a single waiter — it runs the
//! subscription list's `trigger_all` synchronously, under the CPU lock,
//! so every subscriber (each a caller-owned action, typically a waiting
//! process's own action, see [`Event::wait`]) is notified in one pass.
//! The action's trigger is `event_trigger` from registration onward —
//! `trigger_all` over an empty subscription list is already a no-op, so
//! there's no empty-list case worth a separate stub for, and a stub would
//! leave [`Event::trigger`] silently inert for any subscriber that joined
//! only through [`Event::wait`] (which, unlike [`Event::subscribe`],
//! inserts directly via [`scheduler::suspend`] rather than through a path
//! that would swap the stub out).
use crate::{
    action::Action,
    error::Signal,
    klock::{lock_cpu, CpuLockTokenRefMut},
    queue::{ActionQueue, QueueOrder, Strictness},
    scheduler::{self, ScheduleConfig},
    time::TimeUnit,
    Port, Priority,
};

unsafe fn event_trigger<P: Port>(
    action: &'static Action<P>,
    signal: Signal,
    lock: CpuLockTokenRefMut<'_, P>,
) {
    let event_addr = *action.arg_owner.read(&*lock);
    let event: &'static Event<P> = unsafe { &*(event_addr as *const Event<P>) };
    event.subscribers.trigger_all(signal, lock);
}

unsafe fn event_priority_changed<P: Port>(
    queue: &'static ActionQueue<P>,
    lock: CpuLockTokenRefMut<'_, P>,
) {
    let event_addr = queue.owner(&lock);
    let event: &'static Event<P> = unsafe { &*(event_addr as *const Event<P>) };
    let new_priority = queue.cached_head_priority(&lock);
    scheduler::change_priority(&event.action, new_priority, lock);
}

/// Fan-out event.
pub struct Event<P: Port> {
    pub action: Action<P>,
    subscribers: ActionQueue<P>,
}

impl<P: Port> Event<P> {
    pub const fn new() -> Self {
        Self {
            action: Action::new(Priority::new(0), event_trigger::<P>),
            subscribers: ActionQueue::new(QueueOrder::Sorted, Strictness::Lax),
        }
    }

    pub fn register(&'static self) {
        let mut lock = lock_cpu::<P>();
        self.action
            .arg_owner
            .replace(&mut *lock, self as *const Self as usize);
        self.subscribers
            .set_owner(self as *const Self as usize, lock.borrow_mut());
        self.subscribers
            .set_on_head_priority_changed(lock.borrow_mut(), event_priority_changed::<P>);
    }

    /// Add `action` to the subscription list. `action` is triggered directly
    /// in whatever context [`Event::trigger`] runs from; a caller that wants
    /// the signal handled back in its own process context instead should
    /// subscribe a [`crate::subscription::Subscription`]'s proxy action
    /// rather than its own action.
    pub fn subscribe(&'static self, action: &'static Action<P>) {
        let mut lock = lock_cpu::<P>();
        self.subscribers.insert(action, lock.borrow_mut());
    }

    /// Dispose the event: unlink its action and wake every subscriber with
    /// [`Signal::DISPOSED_RESOURCE_ACCESS`]. Idempotent.
    pub fn dispose(&'static self) {
        let mut lock = lock_cpu::<P>();
        self.action.dispose(lock.borrow_mut());
        self.subscribers.close(Signal::DISPOSED_RESOURCE_ACCESS, lock.borrow_mut());
    }

    /// Post `signal` to every current subscriber.
    pub fn trigger(&'static self, signal: Signal) {
        let lock = lock_cpu::<P>();
        unsafe { self.action.trigger(signal, lock.borrow_mut()) };
    }

    /// Subscribe the calling process's own action and block until posted
    /// to or timed out.
    pub fn wait(
        &'static self,
        timeout: Option<TimeUnit>,
        config: Option<ScheduleConfig>,
    ) -> Result<Signal, crate::error::ScheduleError> {
        scheduler::suspend::<P>(Some(&self.subscribers), timeout, config)
    }
}

impl<P: Port> Default for Event<P> {
    fn default() -> Self {
        Self::new()
    }
}
