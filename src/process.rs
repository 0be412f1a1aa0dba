//! The Process Control Block ([`Process`]).
use crate::{
    action::Action,
    error::{ProcessError, Signal},
    klock::CpuLockCell,
    queue::{ActionQueue, QueueOrder, Strictness},
    scheduler::{self, ScheduleConfig},
    timed_signal::TimedSignal,
    time::TimeUnit,
    Port, Priority,
};

/// Registration-time configuration for a [`Process`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessConfig {
    pub priority: Priority,
}

/// Process Control Block.
///
/// Must be `'static` and non-movable once [`Process::register`] has run,
/// like every other kernel object here: it is linked by intrusive pointers
/// from the runnable queue and from any wait queue it joins.
pub struct Process<P: Port> {
    /// The process's own triggerable descriptor. Its trigger is
    /// [`scheduler::schedule_handler`]; anything holding a reference to
    /// this process's action (a mutex waiter queue, an explicit waker) can
    /// wake it by triggering this action directly.
    pub action: Action<P>,
    pub(crate) original_priority: CpuLockCell<P, Priority>,
    pub(crate) schedule_config: CpuLockCell<P, ScheduleConfig>,
    /// `true` while the process is off the runnable queue.
    pub(crate) suspended: CpuLockCell<P, bool>,
    /// `true` while [`scheduler::wait`] is blocked waiting for a wakeup.
    pub(crate) waiting: CpuLockCell<P, bool>,
    pub(crate) wakeup_signal: CpuLockCell<P, Signal>,
    pub(crate) exit_code: CpuLockCell<P, Option<Signal>>,
    /// Opaque stack-pointer slot, read and written only by the port's
    /// context-switch ISR. The kernel core never interprets its contents.
    pub stack_pointer: CpuLockCell<P, usize>,
    /// Exit actions registered via [`Process::wait_for_async`] and waiters
    /// parked via [`Process::wait_for`]; closed with the exit code on
    /// [`Process::exit`].
    pub on_exit: ActionQueue<P>,
    /// Pending signal-handler invocations, drained by [`scheduler::wait`].
    pub pending_signal: ActionQueue<P>,
    pub(crate) wait_timeout: TimedSignal<P>,
}

impl<P: Port> Process<P> {
    pub const fn new() -> Self {
        Self {
            action: Action::new(Priority::new(0), scheduler::schedule_handler::<P>),
            original_priority: CpuLockCell::new(Priority::new(0)),
            schedule_config: CpuLockCell::new(ScheduleConfig {
                priority: Priority::new(0),
            }),
            suspended: CpuLockCell::new(true),
            waiting: CpuLockCell::new(false),
            wakeup_signal: CpuLockCell::new(Signal::SUCCESS),
            exit_code: CpuLockCell::new(None),
            stack_pointer: CpuLockCell::new(0),
            on_exit: ActionQueue::new(QueueOrder::Sorted, Strictness::Strict),
            pending_signal: ActionQueue::new(QueueOrder::Sorted, Strictness::Strict),
            wait_timeout: TimedSignal::new(),
        }
    }

    pub(crate) fn is_alive(&'static self) -> bool {
        let lock = crate::klock::lock_cpu::<P>();
        self.exit_code.read(&*lock).is_none()
    }

    /// Register this PCB: install `schedule_handler` as its trigger, set
    /// its original priority, initialize its exit-action and
    /// pending-signal queues, and prepare its wait-timeout signal. The
    /// process starts suspended — the caller must explicitly schedule it
    /// (or rely on it being woken by something else) for it to run.
    ///
    /// `stack_pointer` is the initial stack-pointer value a port-level
    /// stack-init collaborator produced (or the adopted current stack, for
    /// the process registering itself).
    pub fn register(&'static self, config: ProcessConfig, stack_pointer: usize) {
        let mut lock = crate::klock::lock_cpu::<P>();
        let self_addr = self as *const Self as usize;
        self.action.arg_owner.replace(&mut *lock, self_addr);
        self.action.priority.replace(&mut *lock, config.priority);
        self.original_priority.replace(&mut *lock, config.priority);
        self.schedule_config.replace(
            &mut *lock,
            ScheduleConfig {
                priority: Priority::new(0),
            },
        );
        self.stack_pointer.replace(&mut *lock, stack_pointer);
        self.exit_code.replace(&mut *lock, None);
        self.suspended.replace(&mut *lock, true);

        self.on_exit.set_owner(self_addr, lock.borrow_mut());
        self.on_exit
            .set_on_head_priority_changed(lock.borrow_mut(), process_queue_priority_changed::<P>);
        self.pending_signal.set_owner(self_addr, lock.borrow_mut());
        self.pending_signal
            .set_on_head_priority_changed(lock.borrow_mut(), process_queue_priority_changed::<P>);

        self.wait_timeout.register_for(self_addr, lock.borrow_mut());
    }

    /// Terminate the process: store `code`, close the on-exit action queue
    /// (triggering every registered exit action and waking every
    /// `wait_for` waiter), unlink from any other queue, and — if this is
    /// the running process — never return.
    pub fn exit(&'static self, code: Signal) -> ! {
        {
            let mut lock = crate::klock::lock_cpu::<P>();
            self.exit_code.replace(&mut *lock, Some(code));
            let kernel = P::kernel_state();
            if self.action.is_in_queue(&lock.borrow_mut()) {
                // Unlink from whatever queue currently holds us (the
                // runnable queue, most commonly) before closing our own
                // queues, so a released exit-action handler never observes
                // us still runnable.
                kernel
                    .runnable_queue
                    .release(&self.action, false, lock.borrow_mut());
            }
            self.on_exit.close(code, lock.borrow_mut());
        }
        loop {
            P::yield_cpu();
        }
    }

    /// Wait for `target` to exit, blocking with an optional timeout if it
    /// is still alive. Returns immediately with `target`'s exit code if it
    /// has already exited.
    pub fn wait_for(
        &'static self,
        target: &'static Process<P>,
        timeout: Option<TimeUnit>,
        config: Option<ScheduleConfig>,
    ) -> Result<Signal, ProcessError> {
        if core::ptr::eq(self, target) {
            return Err(ProcessError::InvalidArgument);
        }
        let mut lock = crate::klock::lock_cpu::<P>();
        if let Some(code) = *target.exit_code.read(&*lock) {
            return Ok(code);
        }
        target.on_exit.insert(&self.action, lock.borrow_mut());
        drop(lock);
        scheduler::suspend::<P>(None, timeout, config).map_err(|_| ProcessError::BadContext)
    }

    /// Register `action` on `target`'s on-exit queue without blocking.
    /// Returns whether `target` is still alive.
    pub fn wait_for_async(target: &'static Process<P>, action: &'static Action<P>) -> bool {
        let mut lock = crate::klock::lock_cpu::<P>();
        let alive = target.exit_code.read(&*lock).is_none();
        if alive {
            target.on_exit.insert(action, lock.borrow_mut());
        }
        alive
    }

    /// Force `target` through the same termination path [`Self::exit`]
    /// takes: set its exit code, dispose its action (unlinking it from
    /// wherever it currently sits — the runnable queue, a waiter queue, or
    /// an owner's `on_exit` queue if `target` currently holds a mutex), and
    /// close its on-exit queue so every exit action and `wait_for` waiter
    /// fires. No-op on an already-exited `target`. Then wait for it to
    /// finish exiting.
    pub fn kill(&'static self, target: &'static Process<P>) -> Result<Signal, ProcessError> {
        {
            let mut lock = crate::klock::lock_cpu::<P>();
            if target.exit_code.read(&*lock).is_none() {
                let code = Signal::DISPOSED_RESOURCE_ACCESS;
                target.exit_code.replace(&mut *lock, Some(code));
                target.action.dispose(lock.borrow_mut());
                target.on_exit.close(code, lock.borrow_mut());
            }
        }
        self.wait_for(target, None, None)
    }
}

impl<P: Port> Default for Process<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Installed on both `on_exit` and `pending_signal`: whenever either
/// queue's head priority changes, recompute the owning process's
/// effective priority. This is
/// the propagation step of transitive priority inheritance — a mutex
/// raising its own priority through its waiter queue's head-priority hook
/// ultimately lands here, since the mutex's action sits in its owner's
/// `on_exit` queue.
unsafe fn process_queue_priority_changed<P: Port>(
    queue: &'static ActionQueue<P>,
    lock: crate::klock::CpuLockTokenRefMut<'_, P>,
) {
    let owner_addr = queue.owner(&lock);
    let process: &'static Process<P> = unsafe { &*(owner_addr as *const Process<P>) };
    scheduler::schedulable_state_reset(process, Priority::new(0), lock);
}
