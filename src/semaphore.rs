//! Counting semaphore, built on the same waiter-queue idiom as [`crate::mutex::Mutex`]:
//! waiters are parked via their own process action rather than a separate
//! notifier object, so a release can wake one directly.
use crate::{
    action::Action,
    error::{Signal, SemaphoreError},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    queue::{ActionQueue, QueueOrder, Strictness},
    scheduler::{self, ScheduleConfig},
    time::TimeUnit,
    Port, Priority,
};

unsafe fn semaphore_trigger<P: Port>(
    action: &'static Action<P>,
    _value: Signal,
    mut lock: CpuLockTokenRefMut<'_, P>,
) {
    let sem_addr = *action.arg_owner.read(&*lock);
    let sem: &'static Semaphore<P> = unsafe { &*(sem_addr as *const Semaphore<P>) };
    match sem.waiter_queue.pop(lock.borrow_mut()) {
        Some(waiter) => unsafe { waiter.trigger(Signal::SUCCESS, lock) },
        None => {
            let permits = sem.permits.write(&mut *lock);
            *permits += 1;
        }
    }
}

/// Counting semaphore.
pub struct Semaphore<P: Port> {
    pub action: Action<P>,
    waiter_queue: ActionQueue<P>,
    permits: CpuLockCell<P, u32>,
    max_permits: CpuLockCell<P, u32>,
}

impl<P: Port> Semaphore<P> {
    pub const fn new(initial_permits: u32, max_permits: u32) -> Self {
        Self {
            action: Action::new(Priority::new(0), semaphore_trigger::<P>),
            waiter_queue: ActionQueue::new(QueueOrder::Sorted, Strictness::Strict),
            permits: CpuLockCell::new(initial_permits),
            max_permits: CpuLockCell::new(max_permits),
        }
    }

    pub fn register(&'static self) {
        let mut lock = lock_cpu::<P>();
        self.action
            .arg_owner
            .replace(&mut *lock, self as *const Self as usize);
        self.waiter_queue
            .set_owner(self as *const Self as usize, lock.borrow_mut());
    }

    /// Decrement without blocking if a permit is available.
    pub fn try_acquire(&'static self) -> Result<(), SemaphoreError> {
        let mut lock = lock_cpu::<P>();
        if self.action.is_disposed(&lock.borrow_mut()) {
            return Err(SemaphoreError::Disposed);
        }
        let permits = self.permits.write(&mut *lock);
        if *permits == 0 {
            return Err(SemaphoreError::NoPermits);
        }
        *permits -= 1;
        Ok(())
    }

    /// Decrement, blocking on the waiter queue if no permit is available.
    pub fn acquire(
        &'static self,
        timeout: Option<TimeUnit>,
        config: Option<ScheduleConfig>,
    ) -> Result<Signal, SemaphoreError> {
        match self.try_acquire() {
            Ok(()) => Ok(Signal::SUCCESS),
            Err(SemaphoreError::NoPermits) => {
                scheduler::suspend::<P>(Some(&self.waiter_queue), timeout, config)
                    .map_err(|_| SemaphoreError::BadContext)
            }
            Err(e) => Err(e),
        }
    }

    /// Insert `action` into the waiter queue without blocking the caller;
    /// if a permit is already available, immediately triggers the queue's
    /// new head (which may or may not be `action`, depending on relative
    /// priority).
    pub fn acquire_async(&'static self, action: &'static Action<P>) -> Result<(), SemaphoreError> {
        let mut lock = lock_cpu::<P>();
        if self.action.is_disposed(&lock.borrow_mut()) {
            return Err(SemaphoreError::Disposed);
        }
        self.waiter_queue.insert(action, lock.borrow_mut());
        let permits = *self.permits.read(&*lock);
        if permits > 0 {
            if let Some(head) = self.waiter_queue.pop(lock.borrow_mut()) {
                let permits = self.permits.write(&mut *lock);
                *permits -= 1;
                unsafe { head.trigger(Signal::SUCCESS, lock) };
            }
        }
        Ok(())
    }

    /// Dispose the semaphore: unlink its action and wake every waiter with
    /// [`Signal::DISPOSED_RESOURCE_ACCESS`]. Idempotent.
    pub fn dispose(&'static self) {
        let mut lock = lock_cpu::<P>();
        self.action.dispose(lock.borrow_mut());
        self.waiter_queue.close(Signal::DISPOSED_RESOURCE_ACCESS, lock.borrow_mut());
    }

    /// Increment the permit count, or wake the highest-priority waiter if
    /// any are queued.
    pub fn release(&'static self) -> Result<(), SemaphoreError> {
        let mut lock = lock_cpu::<P>();
        if self.action.is_disposed(&lock.borrow_mut()) {
            return Err(SemaphoreError::Disposed);
        }
        let permits = *self.permits.read(&*lock);
        let max = *self.max_permits.read(&*lock);
        if self.waiter_queue.is_empty(&lock.borrow_mut()) && permits >= max {
            return Err(SemaphoreError::InvalidArgument);
        }
        unsafe { self.action.trigger(Signal::SUCCESS, lock.borrow_mut()) };
        Ok(())
    }
}

impl<P: Port> Default for Semaphore<P> {
    fn default() -> Self {
        Self::new(0, u32::MAX)
    }
}
