//! Subscription: the common [`crate::proxy::ActionProxy`] composition for
//! [`crate::event::Event::subscribe`] — a proxy whose target is an
//! [`crate::signal::ActionSignal`] bound to one process, so a signal fired
//! from anywhere is handled back in that process's own context instead of
//! wherever the firing happened to run.
use crate::{
    action::HandlerFn,
    klock::{lock_cpu, CpuLockTokenRefMut},
    process::Process,
    proxy::{ActionProxy, SignalInterceptorFn},
    scheduler::ScheduleConfig,
    signal::ActionSignal,
    Port,
};

/// A proxy bound to a single target process's context.
pub struct Subscription<P: Port> {
    pub proxy: ActionProxy<P>,
    on_publish: ActionSignal<P>,
}

impl<P: Port> Subscription<P> {
    pub const fn new() -> Self {
        Self {
            proxy: ActionProxy::new(),
            on_publish: ActionSignal::new(),
        }
    }

    /// Bind this subscription to deliver to `target`'s process context via
    /// `handler`, forwarding through the proxy. A non-`persistent`
    /// subscription (the common case) unsubscribes itself the first time it
    /// fires; a persistent one keeps receiving until explicitly unlinked or
    /// disposed.
    pub fn register(
        &'static self,
        target: &'static Process<P>,
        handler: HandlerFn<P>,
        persistent: bool,
        interceptor: Option<SignalInterceptorFn<P>>,
        config: Option<ScheduleConfig>,
    ) {
        let mut lock = lock_cpu::<P>();
        self.on_publish.bind(target, lock.borrow_mut());
        self.on_publish.action.set_handler(lock.borrow_mut(), handler);
        if let Some(config) = config {
            self.on_publish.set_schedule_config(config, lock.borrow_mut());
        }
        let target_addr = target as *const Process<P> as usize;
        self.proxy.register(
            &self.on_publish.action,
            target_addr,
            persistent,
            interceptor,
            lock.borrow_mut(),
        );
    }

    /// Dispose both the proxy and the underlying signal, unlinking either
    /// wherever it currently sits. Idempotent.
    pub fn dispose(&'static self) {
        let mut lock = lock_cpu::<P>();
        self.proxy.action.dispose(lock.borrow_mut());
        self.on_publish.action.dispose(lock.borrow_mut());
    }
}

impl<P: Port> Default for Subscription<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Signal,
        event::Event,
        test_support::{leak, TestPort},
    };
    use core::sync::atomic::{AtomicI32, Ordering};

    static HANDLED: AtomicI32 = AtomicI32::new(0);

    unsafe fn record_handler(_action: &'static crate::action::Action<TestPort>, signal: Signal) -> bool {
        HANDLED.store(signal.0, Ordering::SeqCst);
        false
    }

    #[test]
    fn event_subscription_forwards_into_the_subscribers_own_process_context() {
        HANDLED.store(0, Ordering::SeqCst);
        let event: &'static Event<TestPort> = leak(Event::new());
        event.register();

        let subscriber: &'static Process<TestPort> = leak(Process::new());
        subscriber.register(Default::default(), 0);

        let subscription: &'static Subscription<TestPort> = leak(Subscription::new());
        subscription.register(subscriber, record_handler, false, None, None);

        event.subscribe(&subscription.proxy.action);
        event.trigger(Signal::SUCCESS);

        let mut lock = lock_cpu::<TestPort>();
        let pending = subscriber
            .pending_signal
            .head(&lock.borrow_mut())
            .expect("the subscriber's pending-signal queue should carry the forwarded signal");
        let value = Signal(*pending.arg_aux.read(&*lock) as i32);
        assert_eq!(value, Signal::SUCCESS);
    }
}
