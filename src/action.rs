//! The triggerable descriptor ([`Action`]) at the root of the kernel's
//! polymorphism.
//!
//! Every other synchronization primitive (process, mutex, semaphore, event,
//! timed signal) embeds an [`Action`] and supplies its own trigger/handler
//! functions. Rather than a `dyn` trait object (which would need a second
//! allocation-free vtable scheme on top of the intrusive link), `Action`
//! uses a plain function-pointer idiom for polymorphic callbacks — an
//! `unsafe fn(usize)`-shaped entry point plus a `usize` parameter —
//! generalized to the handful of call sites this kernel needs. The
//! "owner"/"auxiliary" argument words double as that callback's context.
use core::ptr::NonNull;

use crate::{
    error::Signal,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    Port, Priority,
};

/// Called by [`Action::trigger`]. Implementations either run a handler
/// inline (when invoked from interrupt context and immediacy is required)
/// or insert `action` into some queue for later handling.
pub type TriggerFn<P> =
    unsafe fn(action: &'static Action<P>, signal: Signal, lock: CpuLockTokenRefMut<'_, P>);

/// A caller-supplied function invoked in its owner process's context.
/// Returns `false` to signal the process's wait loop should stop iterating
/// and return the current blocked-state signal.
pub type HandlerFn<P> = unsafe fn(action: &'static Action<P>, signal: Signal) -> bool;

/// Invoked when `action` is released from whatever queue was holding it.
/// `from_queue` is `true` when the release happened because the queue's own
/// machinery evicted the action (pop, close, or re-homing into another
/// queue), `false` when a caller explicitly removed it.
pub type OnReleasedFn<P> =
    unsafe fn(action: &'static Action<P>, from_queue: bool, lock: CpuLockTokenRefMut<'_, P>);

/// Runs when the owning object is disposed. Typically unlinks cross-object
/// back-pointers the dispose sequence wouldn't otherwise reach.
pub type DisposeFn<P> = unsafe fn(action: &'static Action<P>, lock: CpuLockTokenRefMut<'_, P>);

/// Intrusive link state. `container` is the queue currently holding this
/// action, or `None` if unlinked.
///
/// Invariant: `container.is_none() <=> prev.is_none() && next.is_none()`.
pub(crate) struct Link<P: Port> {
    pub(crate) prev: Option<NonNull<Action<P>>>,
    pub(crate) next: Option<NonNull<Action<P>>>,
    pub(crate) container: Option<NonNull<crate::queue::ActionQueue<P>>>,
}

impl<P: Port> Clone for Link<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for Link<P> {}

impl<P: Port> Default for Link<P> {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
            container: None,
        }
    }
}

/// The stub trigger installed on disposal. Always reports
/// [`Signal::DISPOSED_RESOURCE_ACCESS`] by construction at each call site
/// rather than by invoking this directly — see [`Action::dispose`].
unsafe fn disposed_trigger<P: Port>(
    _action: &'static Action<P>,
    _signal: Signal,
    _lock: CpuLockTokenRefMut<'_, P>,
) {
}

/// The central polymorphic, triggerable descriptor.
pub struct Action<P: Port> {
    pub(crate) link: CpuLockCell<P, Link<P>>,
    pub(crate) priority: CpuLockCell<P, Priority>,
    pub arg_owner: CpuLockCell<P, usize>,
    pub arg_aux: CpuLockCell<P, usize>,
    pub(crate) handler: CpuLockCell<P, Option<HandlerFn<P>>>,
    pub(crate) trigger: CpuLockCell<P, TriggerFn<P>>,
    pub(crate) on_released: CpuLockCell<P, Option<OnReleasedFn<P>>>,
    pub(crate) dispose: CpuLockCell<P, Option<DisposeFn<P>>>,
    pub(crate) disposed: CpuLockCell<P, bool>,
}

impl<P: Port> Action<P> {
    /// Construct a new, unlinked action.
    pub const fn new(priority: Priority, trigger: TriggerFn<P>) -> Self {
        Self {
            link: CpuLockCell::new(Link {
                prev: None,
                next: None,
                container: None,
            }),
            priority: CpuLockCell::new(priority),
            arg_owner: CpuLockCell::new(0),
            arg_aux: CpuLockCell::new(0),
            handler: CpuLockCell::new(None),
            trigger: CpuLockCell::new(trigger),
            on_released: CpuLockCell::new(None),
            dispose: CpuLockCell::new(None),
            disposed: CpuLockCell::new(false),
        }
    }

    pub fn set_handler(&self, mut lock: CpuLockTokenRefMut<'_, P>, handler: HandlerFn<P>) {
        self.handler.replace(&mut *lock, Some(handler));
    }

    pub fn set_on_released(&self, mut lock: CpuLockTokenRefMut<'_, P>, f: OnReleasedFn<P>) {
        self.on_released.replace(&mut *lock, Some(f));
    }

    pub fn set_dispose(&self, mut lock: CpuLockTokenRefMut<'_, P>, f: DisposeFn<P>) {
        self.dispose.replace(&mut *lock, Some(f));
    }

    pub fn priority(&self, lock: &CpuLockTokenRefMut<'_, P>) -> Priority {
        *self.priority.read(&**lock)
    }

    /// Overwrite the cached priority field directly, without touching queue
    /// membership. Used by [`crate::queue::ActionQueue::set_action_priority`],
    /// which handles re-linking itself per the queue's strictness policy.
    pub(crate) fn set_priority_field(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, P>,
        new_priority: Priority,
    ) {
        *self.priority.write(&mut **lock) = new_priority;
    }

    pub fn is_in_queue(&self, lock: &CpuLockTokenRefMut<'_, P>) -> bool {
        self.link.read(&**lock).container.is_some()
    }

    pub fn is_disposed(&self, lock: &CpuLockTokenRefMut<'_, P>) -> bool {
        *self.disposed.read(&**lock)
    }

    /// Invoke this action's trigger function.
    ///
    /// # Safety
    /// `self` must have `'static` lifetime in the sense that it outlives any
    /// queue it might be inserted into by the trigger.
    pub unsafe fn trigger(&'static self, signal: Signal, mut lock: CpuLockTokenRefMut<'_, P>) {
        let f = *self.trigger.read(&*lock);
        unsafe { f(self, signal, lock.borrow_mut()) }
    }

    /// Invoke this action's handler, if any, returning `true` to keep
    /// iterating a wait loop.
    ///
    /// # Safety
    /// Must be called from the action's execution-context process, with no
    /// interrupts suspended (handlers may run arbitrary process-context
    /// code).
    pub unsafe fn invoke_handler(&'static self, signal: Signal) -> bool {
        let f = {
            let lock = crate::klock::lock_cpu::<P>();
            *self.handler.read(&*lock)
        };
        match f {
            Some(f) => unsafe { f(self, signal) },
            None => true,
        }
    }

    pub(crate) fn notify_released(
        &'static self,
        from_queue: bool,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) {
        let f = *self.on_released.read(&*lock);
        if let Some(f) = f {
            unsafe { f(self, from_queue, lock.borrow_mut()) };
        }
    }

    /// Detach this action from whatever queue currently holds it. No-op if
    /// unlinked. Used by [`Self::dispose`] and by non-persistent action
    /// proxies releasing themselves after a single forward.
    pub(crate) fn unlink_from_container(&'static self, mut lock: CpuLockTokenRefMut<'_, P>) {
        if let Some(queue_ptr) = self.link.read(&*lock).container {
            let queue: &'static crate::queue::ActionQueue<P> = unsafe { queue_ptr.as_ref() };
            queue.release(self, false, lock.borrow_mut());
        }
    }

    /// Replace this action's trigger with a stub, mark it disposed, and
    /// unlink it from whatever queue currently holds it, so every
    /// subsequent operation on it reports
    /// [`Signal::DISPOSED_RESOURCE_ACCESS`] instead of touching real state.
    /// Idempotent.
    pub fn dispose(&'static self, mut lock: CpuLockTokenRefMut<'_, P>) {
        if *self.disposed.read(&*lock) {
            return;
        }
        self.disposed.replace(&mut *lock, true);
        let hook = self.dispose.replace(&mut *lock, None);
        self.on_released.replace(&mut *lock, None);
        self.trigger.replace(&mut *lock, disposed_trigger::<P>);
        self.unlink_from_container(lock.borrow_mut());
        if let Some(hook) = hook {
            unsafe { hook(self, lock.borrow_mut()) };
        }
    }
}
