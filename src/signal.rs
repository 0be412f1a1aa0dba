//! Action Signal: a reusable notifier that posts a value
//! into one target process's pending-signal queue, coalescing bursts of
//! triggers into a single handler invocation per burst.
//!
//! Mutex and Semaphore wake their waiters directly through the waiter's
//! own process action (the same mechanism [`crate::process::Process`] uses
//! for `wait_for`), since each waiter already names the process to wake.
//! `ActionSignal` exists for the cases where the thing to notify isn't
//! "the process blocked right here" but some fixed, possibly distant,
//! process context — an event's owner, a periodic timer's target, or any
//! general-purpose producer/consumer pair. The built-in [`SignalProcessor`]
//! is the default target when the caller doesn't need handling in its own
//! process context.
use crate::{
    action::Action,
    error::Signal,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    process::Process,
    scheduler::{self, ScheduleConfig},
    Port, Priority,
};

/// The default trigger installed on every [`ActionSignal`]'s action: store
/// the value, post into the target's pending-signal queue, wake the
/// target if it's parked in [`scheduler::wait`].
unsafe fn action_signal_trigger<P: Port>(
    action: &'static Action<P>,
    value: Signal,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    let owner_addr = *action.arg_owner.read(&*lock);
    let this: &'static ActionSignal<P> = unsafe { &*(owner_addr as *const ActionSignal<P>) };
    this.post(value, lock.borrow_mut());
}

unsafe fn action_signal_on_handled<P: Port>(action: &'static Action<P>, _value: Signal) -> bool {
    let mut lock = crate::klock::lock_cpu::<P>();
    let owner_addr = *action.arg_owner.read(&*lock);
    let this: &'static ActionSignal<P> = unsafe { &*(owner_addr as *const ActionSignal<P>) };
    let count = this.unhandled_count.write(&mut *lock);
    *count = count.saturating_sub(1);
    *count > 0
}

unsafe fn action_signal_on_released<P: Port>(
    action: &'static Action<P>,
    from_queue: bool,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    if !from_queue {
        return;
    }
    let owner_addr = *action.arg_owner.read(&*lock);
    let this: &'static ActionSignal<P> = unsafe { &*(owner_addr as *const ActionSignal<P>) };
    let count = this.unhandled_count.write(&mut *lock);
    *count = count.saturating_sub(1);
}

/// A reusable, single-target post-and-coalesce notifier.
pub struct ActionSignal<P: Port> {
    pub action: Action<P>,
    target: CpuLockCell<P, Option<&'static Process<P>>>,
    unhandled_count: CpuLockCell<P, u32>,
    schedule_config: CpuLockCell<P, ScheduleConfig>,
    keep_priority_while_handled: CpuLockCell<P, bool>,
}

impl<P: Port> ActionSignal<P> {
    pub const fn new() -> Self {
        Self {
            action: Action::new(Priority::new(0), action_signal_trigger::<P>),
            target: CpuLockCell::new(None),
            unhandled_count: CpuLockCell::new(0),
            schedule_config: CpuLockCell::new(ScheduleConfig {
                priority: Priority::new(0),
            }),
            keep_priority_while_handled: CpuLockCell::new(false),
        }
    }

    /// Bind this signal to `target` and wire up its default handler/
    /// released hooks. Priority at registration inherits
    /// `max(target.original_priority, schedule_config.priority)`.
    pub fn bind(&'static self, target: &'static Process<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
        self.target.replace(&mut *lock, Some(target));
        self.action
            .arg_owner
            .replace(&mut *lock, self as *const Self as usize);
        self.action.set_handler(lock.borrow_mut(), action_signal_on_handled::<P>);
        self.action
            .set_on_released(lock.borrow_mut(), action_signal_on_released::<P>);
        let original = *target.original_priority.read(&*lock);
        let config_priority = self.schedule_config.read(&*lock).priority;
        self.action
            .set_priority_field(&mut lock, original.max(config_priority));
    }

    pub fn set_schedule_config(&'static self, config: ScheduleConfig, mut lock: CpuLockTokenRefMut<'_, P>) {
        self.schedule_config.replace(&mut *lock, config);
        let current = self.action.priority(&lock);
        if config.priority > current {
            self.action.set_priority_field(&mut lock, config.priority);
        }
    }

    pub fn set_keep_priority_while_handled(&self, keep: bool, mut lock: CpuLockTokenRefMut<'_, P>) {
        self.keep_priority_while_handled.replace(&mut *lock, keep);
    }

    /// Post `value`: stash it in the action's auxiliary slot, insert into
    /// the target's pending-signal queue (incrementing the unhandled
    /// count), and wake the target if it is parked in [`scheduler::wait`].
    pub fn post(&'static self, value: Signal, mut lock: CpuLockTokenRefMut<'_, P>) {
        let Some(target) = *self.target.read(&*lock) else {
            return;
        };
        self.action.arg_aux.replace(&mut *lock, value.0 as usize);
        let count = self.unhandled_count.write(&mut *lock);
        *count += 1;
        if *self.keep_priority_while_handled.read(&*lock) {
            let config = *self.schedule_config.read(&*lock);
            target.schedule_config.replace(&mut *lock, config);
        }
        target.pending_signal.insert(&self.action, lock.borrow_mut());
        if *target.waiting.read(&*lock) && *target.suspended.read(&*lock) {
            target.wakeup_signal.replace(&mut *lock, value);
            scheduler::schedule(target, lock);
        }
    }
}

impl<P: Port> Default for ActionSignal<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's built-in general-purpose signal-handling process: the
/// default target for an [`ActionSignal`] when the caller doesn't need
/// handling in its own process context (e.g. the timed-signal wheel's two
/// helper signals).
pub struct SignalProcessor<P: Port> {
    pub process: Process<P>,
}

impl<P: Port> SignalProcessor<P> {
    pub const fn new() -> Self {
        Self {
            process: Process::new(),
        }
    }
}

impl<P: Port> Default for SignalProcessor<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// The signal processor's entry point: drain `pending_signal` forever.
/// A port wires this up as the initial program counter for the stack it
/// allocates for [`SignalProcessor::process`] (stack init is out of scope
/// here).
pub fn signal_processor_main<P: Port>(_proc: &'static Process<P>) -> ! {
    loop {
        let _ = scheduler::wait::<P>(None, None);
    }
}
