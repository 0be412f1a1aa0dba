//! Timed Signal: an absolute-time wheel for scheduling one-shot or periodic
//! wakeups.
//!
//! An event time is derived from a hardware tick count widened against a
//! remembered `(last_tick_count, last_tick_time)` pair — a stable-anchor
//! split that tolerates a free-running hardware counter without needing
//! wide atomic reads of it. Firing a [`TimedSignal`] posts through an
//! embedded [`crate::signal::ActionSignal`] into its bound process's
//! pending-signal queue exactly like any other signal delivery, so
//! [`crate::scheduler::wait`] handles a timeout the same way it handles any
//! other posted signal.
//!
//! The wheel keeps pending signals in a single ascending-trigger-time
//! intrusive list (`TimedSignal::wheel_next`) rather than a binary heap:
//! every insertion already happens under the CPU lock with interrupts
//! suspended, and this kernel bounds the number of concurrently outstanding
//! timed signals to the number of live processes plus a handful of library
//! users, so a linked-list insertion sort stays cheap enough to avoid
//! importing a heap for it.
use core::ptr::NonNull;

use crate::{
    error::Signal,
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    process::Process,
    signal::ActionSignal,
    time::TimeUnit,
    Port,
};

/// A single scheduled wakeup, bound to one target process.
pub struct TimedSignal<P: Port> {
    signal: ActionSignal<P>,
    trigger_time: CpuLockCell<P, TimeUnit>,
    period: CpuLockCell<P, Option<TimeUnit>>,
    fire_signal: CpuLockCell<P, Signal>,
    wheel_next: CpuLockCell<P, Option<NonNull<TimedSignal<P>>>>,
    in_wheel: CpuLockCell<P, bool>,
}

impl<P: Port> TimedSignal<P> {
    pub const fn new() -> Self {
        Self {
            signal: ActionSignal::new(),
            trigger_time: CpuLockCell::new(TimeUnit::ZERO),
            period: CpuLockCell::new(None),
            fire_signal: CpuLockCell::new(Signal::TIMEOUT),
            wheel_next: CpuLockCell::new(None),
            in_wheel: CpuLockCell::new(false),
        }
    }

    /// Bind this timed signal to deliver to the process at `owner_addr`.
    /// Called once, at the owning process's registration time, mirroring
    /// every other embedded object's `set_owner`/`arg_owner` convention.
    pub fn register_for(&'static self, owner_addr: usize, lock: CpuLockTokenRefMut<'_, P>) {
        let target: &'static Process<P> = unsafe { &*(owner_addr as *const Process<P>) };
        self.signal.bind(target, lock);
    }

    /// The signal value delivered when this timed signal fires. Defaults to
    /// [`Signal::TIMEOUT`], the value a blocked wait expects on expiry.
    pub fn set_fire_signal(&self, value: Signal, mut lock: CpuLockTokenRefMut<'_, P>) {
        self.fire_signal.replace(&mut *lock, value);
    }

    /// Arm a one-shot wakeup `delay` from now.
    pub fn schedule_after(&'static self, delay: TimeUnit, mut lock: CpuLockTokenRefMut<'_, P>) {
        let wheel = &P::kernel_state().timed_signal_wheel;
        let now = wheel.current_time(&mut lock);
        let trigger_time = now.checked_add(delay).unwrap_or(TimeUnit::ZERO).masked();
        self.trigger_time.replace(&mut *lock, trigger_time);
        self.period.replace(&mut *lock, None);
        wheel.schedule(self, lock);
    }

    /// Arm a periodic wakeup: fires `period` from now, then re-arms itself
    /// for another `period` every time it fires, until [`Self::cancel`]led.
    pub fn schedule_periodic(&'static self, period: TimeUnit, mut lock: CpuLockTokenRefMut<'_, P>) {
        let wheel = &P::kernel_state().timed_signal_wheel;
        let now = wheel.current_time(&mut lock);
        let trigger_time = now.checked_add(period).unwrap_or(TimeUnit::ZERO).masked();
        self.trigger_time.replace(&mut *lock, trigger_time);
        self.period.replace(&mut *lock, Some(period));
        wheel.schedule(self, lock);
    }

    /// Disarm, if currently scheduled. No-op otherwise.
    pub fn cancel(&'static self, mut lock: CpuLockTokenRefMut<'_, P>) {
        let wheel = &P::kernel_state().timed_signal_wheel;
        wheel.unschedule(self, &mut lock);
    }

    fn fire(&'static self, mut lock: CpuLockTokenRefMut<'_, P>) {
        let value = *self.fire_signal.read(&*lock);
        self.signal.post(value, lock);
    }
}

impl<P: Port> Default for TimedSignal<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's single timed-signal wheel, owned by [`crate::state::KernelState`].
///
/// Tracks wall-clock time via a stable `(anchor_counter, anchor_time)` pair
/// advanced whenever the wheel is touched, per the 15-bit hours wraparound
/// rule documented on [`TimeUnit`]. The hardware timer is started the first
/// time a signal is scheduled and stopped once none remain: the timer is
/// armed if and only if the wheel is non-empty.
pub struct TimedSignalWheel<P: Port> {
    head: CpuLockCell<P, Option<NonNull<TimedSignal<P>>>>,
    refcount: CpuLockCell<P, u32>,
    anchor_counter: CpuLockCell<P, u32>,
    anchor_time: CpuLockCell<P, TimeUnit>,
}

impl<P: Port> TimedSignalWheel<P> {
    pub const fn new() -> Self {
        Self {
            head: CpuLockCell::new(None),
            refcount: CpuLockCell::new(0),
            anchor_counter: CpuLockCell::new(0),
            anchor_time: CpuLockCell::new(TimeUnit::ZERO),
        }
    }

    /// Advance the stable anchor to the current hardware counter reading and
    /// return the resulting absolute time.
    fn advance_to_now(&self, lock: &mut CpuLockTokenRefMut<'_, P>) -> TimeUnit {
        let now_counter = P::timer_read_counter();
        let last_counter = *self.anchor_counter.read(&**lock);
        let elapsed_ticks = now_counter.wrapping_sub(last_counter);
        let elapsed_micros = P::ticks_to_usecs(elapsed_ticks);
        let anchor = *self.anchor_time.read(&**lock);
        let advanced = anchor
            .checked_add(TimeUnit::from_micros(elapsed_micros as u64))
            .unwrap_or(TimeUnit::ZERO)
            .masked();
        self.anchor_time.replace(&mut **lock, advanced);
        self.anchor_counter.replace(&mut **lock, now_counter);
        advanced
    }

    pub(crate) fn current_time(&self, lock: &mut CpuLockTokenRefMut<'_, P>) -> TimeUnit {
        self.advance_to_now(lock)
    }

    /// Re-arm the hardware compare register for the current head's trigger
    /// time, if any signal remains scheduled.
    fn rearm(&self, lock: &mut CpuLockTokenRefMut<'_, P>) {
        let head = match *self.head.read(&**lock) {
            Some(h) => h,
            None => return,
        };
        let head_ref: &'static TimedSignal<P> = unsafe { head.as_ref() };
        let trigger_time = *head_ref.trigger_time.read(&**lock);
        let now = *self.anchor_time.read(&**lock);
        let delay_micros = trigger_time.as_micros().saturating_sub(now.as_micros());
        let delay_ticks = P::usecs_to_ticks(delay_micros.min(u32::MAX as u64) as u32);
        let counter_now = *self.anchor_counter.read(&**lock);
        P::timer_set_compare(counter_now.wrapping_add(delay_ticks));
    }

    /// Unlink `ts` from the wheel if present, adjusting the refcount and
    /// stopping the timer if it was the last one. Returns whether it was
    /// found. Does not re-arm the timer for a new head; callers that need
    /// the new head armed should call [`Self::rearm`] afterward.
    fn unschedule_inner(
        &self,
        ts: &'static TimedSignal<P>,
        lock: &mut CpuLockTokenRefMut<'_, P>,
    ) -> bool {
        if !*ts.in_wheel.read(&**lock) {
            return false;
        }
        let target_ptr = NonNull::from(ts);
        let mut cur = *self.head.read(&**lock);
        let mut prev: Option<NonNull<TimedSignal<P>>> = None;
        while let Some(node) = cur {
            if node == target_ptr {
                let next = *ts.wheel_next.read(&**lock);
                match prev {
                    Some(p) => {
                        let p_ref: &'static TimedSignal<P> = unsafe { p.as_ref() };
                        p_ref.wheel_next.replace(&mut **lock, next);
                    }
                    None => {
                        self.head.replace(&mut **lock, next);
                    }
                }
                ts.wheel_next.replace(&mut **lock, None);
                ts.in_wheel.replace(&mut **lock, false);
                let count = self.refcount.write(&mut **lock);
                *count = count.saturating_sub(1);
                if *count == 0 {
                    P::timer_stop();
                }
                return true;
            }
            prev = cur;
            let node_ref: &'static TimedSignal<P> = unsafe { node.as_ref() };
            cur = *node_ref.wheel_next.read(&**lock);
        }
        false
    }

    /// Remove `ts` from the wheel, re-arming the timer for whatever is now
    /// the head (if any).
    fn unschedule(&self, ts: &'static TimedSignal<P>, lock: &mut CpuLockTokenRefMut<'_, P>) {
        self.unschedule_inner(ts, lock);
        self.rearm(lock);
    }

    /// Insert `ts` (already carrying its `trigger_time`) in ascending
    /// trigger-time order, starting the timer if the wheel was empty and
    /// re-arming the compare register if `ts` became the new head.
    fn schedule(&self, ts: &'static TimedSignal<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
        self.advance_to_now(&mut lock);
        self.unschedule_inner(ts, &mut lock);

        let trigger_time = *ts.trigger_time.read(&*lock);
        let mut cur = *self.head.read(&*lock);
        let mut prev: Option<NonNull<TimedSignal<P>>> = None;
        while let Some(node) = cur {
            let node_ref: &'static TimedSignal<P> = unsafe { node.as_ref() };
            if *node_ref.trigger_time.read(&*lock) > trigger_time {
                break;
            }
            prev = cur;
            cur = *node_ref.wheel_next.read(&*lock);
        }

        ts.wheel_next.replace(&mut *lock, cur);
        ts.in_wheel.replace(&mut *lock, true);
        let became_head = prev.is_none();
        match prev {
            Some(p) => {
                let p_ref: &'static TimedSignal<P> = unsafe { p.as_ref() };
                p_ref.wheel_next.replace(&mut *lock, Some(NonNull::from(ts)));
            }
            None => {
                self.head.replace(&mut *lock, Some(NonNull::from(ts)));
            }
        }

        let count = self.refcount.write(&mut *lock);
        *count += 1;
        if *count == 1 {
            P::timer_start();
        }
        if became_head {
            self.rearm(&mut lock);
        }
    }
}

impl<P: Port> Default for TimedSignalWheel<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// The timer hardware's interrupt entry point. A port's timer ISR calls this
/// after acknowledging the hardware interrupt: fires every timed signal
/// whose trigger time has arrived, re-arming periodic ones, then re-arms the
/// compare register for whatever remains.
///
/// The drain is bounded by the wheel's size at entry rather than looping
/// until the head's trigger time is in the future: a periodic signal with a
/// vanishingly small period re-schedules itself at or before `now` and would
/// otherwise spin the loop for as long as interrupts stay masked. Firing at
/// most as many signals as were scheduled when the interrupt started caps
/// this critical section; any signal a periodic re-arm makes newly due is
/// left for the next interrupt.
pub fn on_timer_interrupt<P: Port>() {
    let mut lock = lock_cpu::<P>();
    let wheel = &P::kernel_state().timed_signal_wheel;
    let now = wheel.advance_to_now(&mut lock);
    let budget = *wheel.refcount.read(&*lock);
    for _ in 0..budget {
        let head = match *wheel.head.read(&*lock) {
            Some(h) => h,
            None => break,
        };
        let head_ref: &'static TimedSignal<P> = unsafe { head.as_ref() };
        if *head_ref.trigger_time.read(&*lock) > now {
            break;
        }
        wheel.unschedule_inner(head_ref, &mut lock);
        let period = *head_ref.period.read(&*lock);
        head_ref.fire(lock.borrow_mut());
        if let Some(period) = period {
            let next_time = now.checked_add(period).unwrap_or(TimeUnit::ZERO).masked();
            head_ref.trigger_time.replace(&mut *lock, next_time);
            head_ref.period.replace(&mut *lock, Some(period));
            wheel.schedule(head_ref, lock.borrow_mut());
        }
    }
    wheel.rearm(&mut lock);
}
