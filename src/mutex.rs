//! Reentrant mutex with priority inheritance.
//!
//! Ownership is tracked in the action's auxiliary slot rather than a
//! separate field. The waiter queue's on-head-priority-changed
//! hook pushes the mutex's own priority up to its highest waiter; that
//! priority change propagates into the owner's `on_exit` queue (where the
//! mutex's action sits while held) and from there into the owner process's
//! effective priority — the transitive priority-inheritance chain.
use crate::{
    action::Action,
    error::{MutexError, Signal},
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    process::Process,
    queue::{ActionQueue, QueueOrder, Strictness},
    scheduler::{self, ScheduleConfig},
    time::TimeUnit,
    Port, Priority,
};

unsafe fn mutex_release_trigger<P: Port>(
    action: &'static Action<P>,
    _signal: Signal,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    let mutex_addr = *action.arg_owner.read(&*lock);
    let mutex: &'static Mutex<P> = unsafe { &*(mutex_addr as *const Mutex<P>) };
    let owner_addr = *action.arg_aux.read(&*lock);
    if owner_addr != 0 {
        let owner: &'static Process<P> = unsafe { &*(owner_addr as *const Process<P>) };
        owner.on_exit.release(&mutex.action, false, lock);
    }
}

unsafe fn mutex_on_released<P: Port>(
    action: &'static Action<P>,
    _from_queue: bool,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    let mutex_addr = *action.arg_owner.read(&*lock);
    let mutex: &'static Mutex<P> = unsafe { &*(mutex_addr as *const Mutex<P>) };
    match mutex.waiter_queue.pop(lock.borrow_mut()) {
        Some(waiter_action) => {
            let new_owner_addr = *waiter_action.arg_owner.read(&*lock);
            let new_owner: &'static Process<P> = unsafe { &*(new_owner_addr as *const Process<P>) };
            action.arg_aux.replace(&mut *lock, new_owner_addr);
            mutex.nesting.replace(&mut *lock, 1);
            new_owner.on_exit.insert(&mutex.action, lock.borrow_mut());
            unsafe { waiter_action.trigger(Signal::SUCCESS, lock) };
        }
        None => {
            action.arg_aux.replace(&mut *lock, 0);
            mutex.nesting.replace(&mut *lock, 0);
        }
    }
}

unsafe fn mutex_waiter_priority_changed<P: Port>(
    queue: &'static ActionQueue<P>,
    lock: CpuLockTokenRefMut<'_, P>,
) {
    let mutex_addr = queue.owner(&lock);
    let mutex: &'static Mutex<P> = unsafe { &*(mutex_addr as *const Mutex<P>) };
    let new_priority = queue.cached_head_priority(&lock);
    scheduler::change_priority(&mutex.action, new_priority, lock);
}

pub struct Mutex<P: Port> {
    pub action: Action<P>,
    waiter_queue: ActionQueue<P>,
    nesting: CpuLockCell<P, u32>,
}

impl<P: Port> Mutex<P> {
    pub const fn new() -> Self {
        Self {
            action: Action::new(Priority::new(0), mutex_release_trigger::<P>),
            waiter_queue: ActionQueue::new(QueueOrder::Sorted, Strictness::Strict),
            nesting: CpuLockCell::new(0),
        }
    }

    pub fn register(&'static self) {
        let mut lock = lock_cpu::<P>();
        let self_addr = self as *const Self as usize;
        self.action.arg_owner.replace(&mut *lock, self_addr);
        self.action.arg_aux.replace(&mut *lock, 0);
        self.action
            .set_on_released(lock.borrow_mut(), mutex_on_released::<P>);
        self.waiter_queue.set_owner(self_addr, lock.borrow_mut());
        self.waiter_queue
            .set_on_head_priority_changed(lock.borrow_mut(), mutex_waiter_priority_changed::<P>);
    }

    fn running(&self, lock: &CpuLockGuard<P>) -> Result<&'static Process<P>, MutexError> {
        if P::is_interrupt_context() {
            return Err(MutexError::BadContext);
        }
        P::kernel_state()
            .running
            .read(&**lock)
            .ok_or(MutexError::BadContext)
    }

    /// Claim the mutex if unowned or already owned by the caller,
    /// otherwise return [`MutexError::Locked`] without blocking.
    pub fn try_lock(&'static self) -> Result<(), MutexError> {
        let mut lock = lock_cpu::<P>();
        if self.action.is_disposed(&lock.borrow_mut()) {
            return Err(MutexError::Disposed);
        }
        let running = self.running(&lock)?;
        let owner_addr = *self.action.arg_aux.read(&*lock);
        let running_addr = running as *const Process<P> as usize;
        if owner_addr == 0 {
            self.action.arg_aux.replace(&mut *lock, running_addr);
            self.nesting.replace(&mut *lock, 1);
            running.on_exit.insert(&self.action, lock.borrow_mut());
            Ok(())
        } else if owner_addr == running_addr {
            let n = self.nesting.write(&mut *lock);
            *n += 1;
            Ok(())
        } else {
            Err(MutexError::Locked)
        }
    }

    /// Try to lock; on contention, block in the waiter queue.
    pub fn lock(
        &'static self,
        timeout: Option<TimeUnit>,
        config: Option<ScheduleConfig>,
    ) -> Result<Signal, MutexError> {
        match self.try_lock() {
            Ok(()) => Ok(Signal::SUCCESS),
            Err(MutexError::Locked) => scheduler::suspend::<P>(Some(&self.waiter_queue), timeout, config)
                .map_err(|_| MutexError::BadContext),
            Err(e) => Err(e),
        }
    }

    /// Dispose the mutex: unlink its action from wherever it sits (the
    /// runnable queue if contended for, or an owner's `on_exit` queue if
    /// held) and wake every waiter with [`Signal::DISPOSED_RESOURCE_ACCESS`].
    /// Idempotent.
    pub fn dispose(&'static self) {
        let mut lock = lock_cpu::<P>();
        self.action.dispose(lock.borrow_mut());
        self.waiter_queue.close(Signal::DISPOSED_RESOURCE_ACCESS, lock.borrow_mut());
    }

    pub fn unlock(&'static self) -> Result<(), MutexError> {
        let mut lock = lock_cpu::<P>();
        if self.action.is_disposed(&lock.borrow_mut()) {
            return Err(MutexError::Disposed);
        }
        let running = self.running(&lock)?;
        let running_addr = running as *const Process<P> as usize;
        let owner_addr = *self.action.arg_aux.read(&*lock);
        if owner_addr != running_addr {
            return Err(MutexError::InvalidOwner);
        }
        let n = self.nesting.write(&mut *lock);
        *n -= 1;
        if *n == 0 {
            unsafe { self.action.trigger(Signal::SUCCESS, lock.borrow_mut()) };
            scheduler::schedulable_state_reset(running, Priority::new(0), lock.borrow_mut());
        }
        Ok(())
    }
}

impl<P: Port> Default for Mutex<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        klock::lock_cpu,
        process::Process,
        test_support::{leak, TestPort},
    };

    fn set_running(process: &'static Process<TestPort>) {
        let mut lock = lock_cpu::<TestPort>();
        TestPort::kernel_state().running.replace(&mut *lock, Some(process));
    }

    #[test]
    fn try_lock_is_reentrant_for_the_owner_and_rejects_other_contenders() {
        let mutex: &'static Mutex<TestPort> = leak(Mutex::new());
        mutex.register();
        let owner: &'static Process<TestPort> = leak(Process::new());
        owner.register(Default::default(), 0);
        let other: &'static Process<TestPort> = leak(Process::new());
        other.register(Default::default(), 0);

        set_running(owner);
        mutex.try_lock().unwrap();
        mutex.try_lock().unwrap(); // reentrant

        set_running(other);
        assert_eq!(mutex.try_lock(), Err(MutexError::Locked));

        set_running(owner);
        mutex.unlock().unwrap(); // drops nesting 2 -> 1, still owned
        let lock = lock_cpu::<TestPort>();
        assert_eq!(*mutex.action.arg_aux.read(&*lock), owner as *const _ as usize);
        drop(lock);
        mutex.unlock().unwrap(); // drops nesting 1 -> 0, releases ownership

        let lock = lock_cpu::<TestPort>();
        assert_eq!(*mutex.action.arg_aux.read(&*lock), 0);
    }

    #[test]
    fn dispose_unlinks_the_mutex_and_wakes_waiters_with_disposed_resource_access() {
        use core::sync::atomic::{AtomicI32, Ordering};
        static WAITER_SIGNAL: AtomicI32 = AtomicI32::new(0);

        unsafe fn record_trigger(
            _action: &'static Action<TestPort>,
            signal: Signal,
            _lock: crate::klock::CpuLockTokenRefMut<'_, TestPort>,
        ) {
            WAITER_SIGNAL.store(signal.0, Ordering::SeqCst);
        }

        let mutex: &'static Mutex<TestPort> = leak(Mutex::new());
        mutex.register();
        let owner: &'static Process<TestPort> = leak(Process::new());
        owner.register(Default::default(), 0);

        set_running(owner);
        mutex.try_lock().unwrap();

        let waiter: &'static Action<TestPort> = leak(Action::new(Priority::new(0), record_trigger));
        {
            let mut lock = lock_cpu::<TestPort>();
            mutex.waiter_queue.insert(waiter, lock.borrow_mut());
        }

        mutex.dispose();

        assert_eq!(
            WAITER_SIGNAL.load(Ordering::SeqCst),
            Signal::DISPOSED_RESOURCE_ACCESS.0
        );
        let mut lock = lock_cpu::<TestPort>();
        assert!(mutex.action.is_disposed(&lock.borrow_mut()));
        assert!(mutex.waiter_queue.is_empty(&lock.borrow_mut()));
        assert!(!mutex.action.is_in_queue(&lock.borrow_mut()));
        drop(lock);
        assert_eq!(mutex.try_lock(), Err(MutexError::Disposed));
    }

    #[test]
    fn unlock_from_non_owner_is_rejected() {
        let mutex: &'static Mutex<TestPort> = leak(Mutex::new());
        mutex.register();
        let owner: &'static Process<TestPort> = leak(Process::new());
        owner.register(Default::default(), 0);
        let other: &'static Process<TestPort> = leak(Process::new());
        other.register(Default::default(), 0);

        set_running(owner);
        mutex.try_lock().unwrap();

        set_running(other);
        assert_eq!(mutex.unlock(), Err(MutexError::InvalidOwner));
    }
}
