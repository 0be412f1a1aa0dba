//! The scheduler: process readiness, the priority-change protocol, and the
//! blocking primitives (`wait`, `suspend`) every synchronization object is
//! built on.
//!
//! [`change_priority`] propagates a priority change through a chain of
//! queues via an explicit, bounded-depth trampoline rather than plain
//! recursion, so the stack depth stays bounded regardless of chain length.
use core::ptr::NonNull;

use crate::{
    error::{ScheduleError, Signal},
    klock::{lock_cpu, CpuLockGuard, CpuLockTokenRefMut},
    process::Process,
    queue::ActionQueue,
    time::TimeUnit,
    Port, Priority, PRIORITY_RESET,
};

/// Per-wait configuration: a temporary priority floor applied for the
/// duration of a single blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleConfig {
    pub priority: Priority,
}

/// Make `process` runnable, inserting it into the runnable queue and
/// cancelling any pending wait-timeout. No-op if already runnable.
pub(crate) fn schedule<P: Port>(process: &'static Process<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
    if !*process.suspended.read(&*lock) {
        return;
    }
    process.suspended.replace(&mut *lock, false);
    process.wait_timeout.cancel(lock.borrow_mut());
    let kernel = P::kernel_state();
    kernel.runnable_queue.insert(&process.action, lock.borrow_mut());
    request_context_switch_if_needed(&lock);
}

/// Installed as the trigger of every [`Process`]'s own action and of its
/// wait-timeout's action: decodes `arg_owner` back into the owning
/// `Process` and wakes it, regardless of which of the two triggered.
///
/// # Safety
/// `action.arg_owner` must hold a live `*const Process<P>` set by
/// [`Process::register`].
pub unsafe fn schedule_handler<P: Port>(
    action: &'static crate::action::Action<P>,
    signal: Signal,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    let owner_addr = *action.arg_owner.read(&*lock);
    let process: &'static Process<P> = unsafe { &*(owner_addr as *const Process<P>) };
    process.wakeup_signal.replace(&mut *lock, signal);
    process.waiting.replace(&mut *lock, false);
    schedule(process, lock);
}

/// Give up the remainder of the current time slice, dropping to whatever
/// priority [`schedulable_state_reset`] computes and re-queuing behind
/// same-priority peers.
pub fn yield_now<P: Port>() {
    let mut guard = lock_cpu::<P>();
    let kernel = P::kernel_state();
    let running = *kernel.running.read(&*guard);
    if let Some(running) = running {
        running
            .schedule_config
            .replace(&mut *guard, ScheduleConfig::default());
        schedulable_state_reset(running, PRIORITY_RESET, guard.borrow_mut());
    }
}

/// Recompute `process`'s effective priority as the maximum of its original
/// (registered) priority, `priority_lowest` (a floor — `PRIORITY_RESET`
/// means "no floor, always re-insert behind peers"), its current
/// [`ScheduleConfig`] priority, and the head priorities of its own
/// on-exit and pending-signal queues (transitive priority inheritance from
/// whoever is waiting on this process).
pub(crate) fn schedulable_state_reset<P: Port>(
    process: &'static Process<P>,
    priority_lowest: Priority,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    let floor = if priority_lowest == PRIORITY_RESET {
        Priority::new(0)
    } else {
        priority_lowest
    };
    let original = *process.original_priority.read(&*lock);
    let config_priority = process.schedule_config.read(&*lock).priority;
    let on_exit_priority = process.on_exit.cached_head_priority(&lock);
    let pending_priority = process.pending_signal.cached_head_priority(&lock);
    let new_priority = original
        .max(floor)
        .max(config_priority)
        .max(on_exit_priority)
        .max(pending_priority);
    change_priority(&process.action, new_priority, lock.borrow_mut());
    request_context_switch_if_needed(&lock);
}

/// Change `action`'s priority within whatever queue currently holds it,
/// using a one-slot trampoline so a priority-change hook that itself
/// issues another priority-change request never grows the call stack.
/// At most one further request may be queued from within a hook; a second
/// one is a bug in the hook and trips the assertion below.
pub(crate) fn change_priority<P: Port>(
    action: &'static crate::action::Action<P>,
    new_priority: Priority,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    let kernel = P::kernel_state();
    if kernel.trampoline.read(&*lock).active {
        let slot = kernel.trampoline.write(&mut *lock);
        debug_assert!(
            slot.pending.is_none(),
            "more than one set_priority request issued from within a priority-change hook"
        );
        slot.pending = Some((NonNull::from(action), new_priority));
        return;
    }

    kernel.trampoline.write(&mut *lock).active = true;
    let mut next = Some((NonNull::from(action), new_priority));
    while let Some((action_ptr, priority)) = next.take() {
        let action: &'static crate::action::Action<P> = unsafe { action_ptr.as_ref() };
        match action.link.read(&*lock).container {
            Some(queue_ptr) => {
                let queue: &'static ActionQueue<P> = unsafe { queue_ptr.as_ref() };
                queue.set_action_priority(action, priority, lock.borrow_mut());
            }
            None => action.set_priority_field(&mut lock, priority),
        }
        next = kernel.trampoline.write(&mut *lock).pending.take();
    }
    kernel.trampoline.write(&mut *lock).active = false;
}

/// Called from the context-switch ISR: pick the runnable
/// queue's head as the new running process and return it so the port can
/// restore its context. Returns `None` if nothing is runnable (the port's
/// idle loop should run).
///
/// # Safety
/// Must be called only from the context-switch ISR, with the previous
/// running process's context already saved.
pub unsafe fn choose_next_running_process<P: Port>() -> Option<&'static Process<P>> {
    let mut lock = lock_cpu::<P>();
    let kernel = P::kernel_state();
    let head = kernel.runnable_queue.head(&lock.borrow_mut());
    let next = head.map(|action| {
        let owner_addr = *action.arg_owner.read(&*lock);
        unsafe { &*(owner_addr as *const Process<P>) }
    });
    kernel.running.replace(&mut *lock, next);
    next
}

fn request_context_switch_if_needed<P: Port>(lock: &CpuLockTokenRefMut<'_, P>) {
    let kernel = P::kernel_state();
    let head = kernel.runnable_queue.head(lock);
    let running = *kernel.running.read(&**lock);
    let switch_needed = match (head, running) {
        (Some(head), Some(running)) => !core::ptr::eq(head, &running.action),
        (Some(_), None) => true,
        (None, _) => false,
    };
    if switch_needed {
        P::request_context_switch();
    }
}

/// Block the calling process until it is no longer suspended: release the
/// CPU lock, yield, reacquire, check state, loop.
fn block_until_running<P: Port>(process: &'static Process<P>) {
    loop {
        P::yield_cpu();
        let guard = lock_cpu::<P>();
        let still_suspended = *process.suspended.read(&*guard);
        drop(guard);
        if !still_suspended {
            break;
        }
    }
}

fn current_process<P: Port>(lock: &CpuLockGuard<P>) -> Result<&'static Process<P>, ScheduleError> {
    if P::is_interrupt_context() {
        return Err(ScheduleError::BadContext);
    }
    P::kernel_state()
        .running
        .read(&**lock)
        .ok_or(ScheduleError::BadContext)
}

/// Block the calling process, draining its pending-signal queue as
/// entries arrive, until a handler returns `false` or the optional
/// `timeout` elapses. This is the operation every `Event`/`Semaphore`/
/// `Mutex` wait ultimately calls into.
pub fn wait<P: Port>(
    timeout: Option<TimeUnit>,
    config: Option<ScheduleConfig>,
) -> Result<Signal, ScheduleError> {
    let mut lock = lock_cpu::<P>();
    let running = current_process::<P>(&lock)?;
    if let Some(config) = config {
        running.schedule_config.replace(&mut *lock, config);
        schedulable_state_reset(running, PRIORITY_RESET, lock.borrow_mut());
    }
    running.waiting.replace(&mut *lock, true);

    loop {
        let pending = running.pending_signal.head(&lock.borrow_mut());
        match pending {
            Some(action) => {
                let signal_value = Signal(*action.arg_aux.read(&*lock) as i32);
                drop(lock);
                let keep_going = unsafe { action.invoke_handler(signal_value) };
                lock = lock_cpu::<P>();
                running.pending_signal.release(action, false, lock.borrow_mut());
                if !keep_going {
                    running.waiting.replace(&mut *lock, false);
                    return Ok(signal_value);
                }
            }
            None => {
                if !*running.waiting.read(&*lock) {
                    // A wakeup raced us between the loop check and here.
                    let signal = *running.wakeup_signal.read(&*lock);
                    return Ok(signal);
                }
                running.suspended.replace(&mut *lock, true);
                if let Some(delay) = timeout {
                    running.wait_timeout.schedule_after(delay, lock.borrow_mut());
                }
                request_context_switch_if_needed(&lock);
                drop(lock);
                block_until_running(running);
                lock = lock_cpu::<P>();
                if !*running.waiting.read(&*lock) {
                    let signal = *running.wakeup_signal.read(&*lock);
                    return Ok(signal);
                }
            }
        }
    }
}

/// Remove the calling process from the runnable queue, optionally link it
/// into `queue` (a mutex/semaphore/event waiter list), and block until
/// [`schedule`] (triggered on the calling process's own action, e.g. by a
/// mutex unlock or a timeout firing) makes it runnable again.
///
/// Callers that can resolve immediately without blocking (e.g. a
/// `try_lock`-style fast path) should not call this at all.
pub fn suspend<P: Port>(
    queue: Option<&'static ActionQueue<P>>,
    timeout: Option<TimeUnit>,
    config: Option<ScheduleConfig>,
) -> Result<Signal, ScheduleError> {
    let mut lock = lock_cpu::<P>();
    let running = current_process::<P>(&lock)?;

    if let Some(config) = config {
        running.schedule_config.replace(&mut *lock, config);
    }
    running.waiting.replace(&mut *lock, true);
    running.suspended.replace(&mut *lock, true);
    P::kernel_state()
        .runnable_queue
        .release(&running.action, false, lock.borrow_mut());
    if let Some(queue) = queue {
        queue.insert(&running.action, lock.borrow_mut());
    }
    if let Some(delay) = timeout {
        running.wait_timeout.schedule_after(delay, lock.borrow_mut());
    }
    schedulable_state_reset(running, PRIORITY_RESET, lock.borrow_mut());
    drop(lock);

    block_until_running(running);

    let mut lock = lock_cpu::<P>();
    running.waiting.replace(&mut *lock, false);
    let signal = *running.wakeup_signal.read(&*lock);
    Ok(signal)
}
