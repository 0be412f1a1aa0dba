//! Action Proxy: a triggerable that forwards to another action, optionally
//! filtering the signal first, and detaches itself from its queue after a
//! single forward unless marked persistent.
//!
//! This is the mechanism behind a typical event subscription
//! ([`crate::event::Event::subscribe`]): rather than enqueue the subscribing
//! process's own action directly (which would run any handler in whatever
//! context the event happened to trigger from), a caller enqueues a proxy
//! whose target is an [`crate::signal::ActionSignal`] bound to the
//! subscriber's own process, so the forwarded signal is handled back in the
//! subscriber's process context. See [`crate::subscription::Subscription`]
//! for that specific composition.
use crate::{
    action::Action,
    error::Signal,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    Port, Priority,
};

/// Filters a signal before it reaches a proxy's target. Returns `false` to
/// swallow the signal; the proxy still self-releases afterward if not
/// persistent.
pub type SignalInterceptorFn<P> = unsafe fn(owner: usize, signal: &mut Signal) -> bool;

unsafe fn action_proxy_trigger<P: Port>(
    action: &'static Action<P>,
    mut signal: Signal,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    let proxy_addr = *action.arg_owner.read(&*lock);
    let proxy: &'static ActionProxy<P> = unsafe { &*(proxy_addr as *const ActionProxy<P>) };

    let accepted = match *proxy.interceptor.read(&*lock) {
        Some(interceptor) => {
            let owner = *action.arg_aux.read(&*lock);
            unsafe { interceptor(owner, &mut signal) }
        }
        None => true,
    };

    if accepted {
        if let Some(target) = *proxy.target.read(&*lock) {
            unsafe { target.trigger(signal, lock.borrow_mut()) };
        }
    }

    if !*proxy.persistent.read(&*lock) {
        action.unlink_from_container(lock);
    }
}

/// A triggerable that forwards to another [`Action`].
///
/// Non-persistent proxies (the common case) detach themselves from whatever
/// queue holds them the first time they fire, so a one-shot subscription
/// doesn't need a separate unsubscribe call.
pub struct ActionProxy<P: Port> {
    pub action: Action<P>,
    target: CpuLockCell<P, Option<&'static Action<P>>>,
    persistent: CpuLockCell<P, bool>,
    interceptor: CpuLockCell<P, Option<SignalInterceptorFn<P>>>,
}

impl<P: Port> ActionProxy<P> {
    pub const fn new() -> Self {
        Self {
            action: Action::new(Priority::new(0), action_proxy_trigger::<P>),
            target: CpuLockCell::new(None),
            persistent: CpuLockCell::new(false),
            interceptor: CpuLockCell::new(None),
        }
    }

    /// Bind this proxy to forward to `target`, carrying `owner` through to
    /// `interceptor` (if any) as an opaque caller-defined value.
    pub fn register(
        &'static self,
        target: &'static Action<P>,
        owner: usize,
        persistent: bool,
        interceptor: Option<SignalInterceptorFn<P>>,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) {
        self.action
            .arg_owner
            .replace(&mut *lock, self as *const Self as usize);
        self.action.arg_aux.replace(&mut *lock, owner);
        self.target.replace(&mut *lock, Some(target));
        self.persistent.replace(&mut *lock, persistent);
        self.interceptor.replace(&mut *lock, interceptor);
    }
}

impl<P: Port> Default for ActionProxy<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        klock::lock_cpu,
        queue::{ActionQueue, QueueOrder, Strictness},
        test_support::{leak, TestPort},
    };
    use core::sync::atomic::{AtomicI32, Ordering};

    static FORWARDED: AtomicI32 = AtomicI32::new(0);

    unsafe fn record_trigger(
        _action: &'static Action<TestPort>,
        signal: Signal,
        _lock: CpuLockTokenRefMut<'_, TestPort>,
    ) {
        FORWARDED.store(signal.0, Ordering::SeqCst);
    }

    #[test]
    fn non_persistent_proxy_forwards_once_then_unlinks_itself() {
        FORWARDED.store(0, Ordering::SeqCst);
        let queue: &'static ActionQueue<TestPort> =
            leak(ActionQueue::new(QueueOrder::Fifo, Strictness::Lax));
        let target: &'static Action<TestPort> = leak(Action::new(Priority::new(0), record_trigger));
        let proxy: &'static ActionProxy<TestPort> = leak(ActionProxy::new());

        let mut lock = lock_cpu::<TestPort>();
        proxy.register(target, 0, false, None, lock.borrow_mut());
        queue.insert(&proxy.action, lock.borrow_mut());
        assert!(!queue.is_empty(&lock.borrow_mut()));

        unsafe { proxy.action.trigger(Signal::SUCCESS, lock.borrow_mut()) };
        assert_eq!(FORWARDED.load(Ordering::SeqCst), Signal::SUCCESS.0);
        assert!(queue.is_empty(&lock.borrow_mut()));
    }

    #[test]
    fn interceptor_can_swallow_the_signal_before_it_reaches_the_target() {
        FORWARDED.store(0, Ordering::SeqCst);
        unsafe fn swallow_all(_owner: usize, _signal: &mut Signal) -> bool {
            false
        }

        let target: &'static Action<TestPort> = leak(Action::new(Priority::new(0), record_trigger));
        let proxy: &'static ActionProxy<TestPort> = leak(ActionProxy::new());

        let mut lock = lock_cpu::<TestPort>();
        proxy.register(target, 0, true, Some(swallow_all), lock.borrow_mut());
        unsafe { proxy.action.trigger(Signal::SUCCESS, lock.borrow_mut()) };
        assert_eq!(FORWARDED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn persistent_proxy_stays_linked_after_firing() {
        let queue: &'static ActionQueue<TestPort> =
            leak(ActionQueue::new(QueueOrder::Fifo, Strictness::Lax));
        let target: &'static Action<TestPort> = leak(Action::new(Priority::new(0), record_trigger));
        let proxy: &'static ActionProxy<TestPort> = leak(ActionProxy::new());

        let mut lock = lock_cpu::<TestPort>();
        proxy.register(target, 0, true, None, lock.borrow_mut());
        queue.insert(&proxy.action, lock.borrow_mut());

        unsafe { proxy.action.trigger(Signal::SUCCESS, lock.borrow_mut()) };
        assert!(!queue.is_empty(&lock.borrow_mut()));
    }
}
