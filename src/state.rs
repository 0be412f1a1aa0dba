//! The kernel's single instance of global mutable state.
//!
//! Every other module reaches shared state through [`Port::kernel_state`]
//! rather than a module-level `static`, so a single binary can host
//! multiple independent kernel instances. Composing the single
//! application-wide [`KernelState`] instance is part of `kernel_start`,
//! which is out of scope for this crate (see the crate docs at the top of
//! `lib.rs`).
use core::ptr::NonNull;

use crate::{
    action::Action,
    klock::CpuLockCell,
    process::Process,
    queue::{ActionQueue, QueueOrder, Strictness},
    timed_signal::TimedSignalWheel,
    Port, Priority,
};

/// The one-slot bounded-stack request buffer for the priority-change
/// protocol.
pub(crate) struct PriorityTrampolineSlot<P: Port> {
    pub(crate) active: bool,
    pub(crate) pending: Option<(NonNull<Action<P>>, Priority)>,
}

impl<P: Port> PriorityTrampolineSlot<P> {
    const fn new() -> Self {
        Self {
            active: false,
            pending: None,
        }
    }
}

/// The kernel's global mutable state: the running process, the runnable
/// queue, the priority-change trampoline slot, and the timed-signal wheel.
///
/// A concrete application declares exactly one `static KERNEL: KernelState<MyPort>`
/// and returns `&KERNEL` from its [`Port::kernel_state`] implementation.
pub struct KernelState<P: Port> {
    pub(crate) running: CpuLockCell<P, Option<&'static Process<P>>>,
    pub(crate) runnable_queue: ActionQueue<P>,
    pub(crate) trampoline: CpuLockCell<P, PriorityTrampolineSlot<P>>,
    pub timed_signal_wheel: TimedSignalWheel<P>,
}

impl<P: Port> KernelState<P> {
    pub const fn new() -> Self {
        Self {
            running: CpuLockCell::new(None),
            runnable_queue: ActionQueue::new(QueueOrder::Sorted, Strictness::Strict),
            trampoline: CpuLockCell::new(PriorityTrampolineSlot::new()),
            timed_signal_wheel: TimedSignalWheel::new(),
        }
    }
}

impl<P: Port> Default for KernelState<P> {
    fn default() -> Self {
        Self::new()
    }
}
