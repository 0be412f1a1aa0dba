//! The collaborators the kernel core requires from a concrete MCU port.
//!
//! Everything in [`Port`] is "external" per the scope note in the crate
//! documentation: the kernel core never implements a context switch, an
//! interrupt vector, or a timer channel itself. A downstream port crate
//! supplies all of it.

/// Opaque interrupt-mask state as returned by [`Port::interrupt_suspend`].
///
/// Ports typically store the previous value of a global interrupt-enable
/// flag/register here. The kernel core never inspects the contents; it only
/// ever passes a value straight back to [`Port::interrupt_restore`].
#[derive(Debug, Clone, Copy)]
pub struct InterruptState(pub usize);

/// A port-defined interrupt line identifier (e.g. an NVIC IRQ number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptLine(pub u16);

/// The collaborators a concrete MCU port must supply.
///
/// `interrupt_suspend`/`interrupt_restore` must nest correctly: every
/// [`Port::interrupt_suspend`] call saves the previous mask state and every
/// matching [`Port::interrupt_restore`] restores exactly that state, so any
/// function may suspend interrupts without knowing whether its caller
/// already did.
pub trait Port: Sized + 'static {
    /// Globally mask interrupts and return the previous mask state.
    ///
    /// Calls nest: an inner `interrupt_suspend`/`interrupt_restore` pair
    /// bracketed within an outer one must leave interrupts exactly as
    /// masked as the outer call left them.
    fn interrupt_suspend() -> InterruptState;

    /// Restore a previously-saved interrupt mask state.
    fn interrupt_restore(state: InterruptState);

    /// Whether the caller is currently executing in interrupt context (as
    /// opposed to a process's own context). Blocking operations
    /// (`wait`, `suspend`, `lock`, `acquire`, ...) are illegal from
    /// interrupt context and return [`crate::error::BadContextError`].
    fn is_interrupt_context() -> bool;

    /// Request the software-triggered context-switch vector.
    ///
    /// The port's context-switch ISR is expected to save the current
    /// process's context, call back into
    /// [`crate::scheduler::choose_next_running_process`], and restore the
    /// new running process's context.
    fn request_context_switch();

    /// Give up the CPU until the calling process becomes the running
    /// process again.
    ///
    /// Must be called with interrupts unmasked (the kernel core always
    /// drops its [`crate::klock::CpuLockGuard`] first). A typical
    /// implementation requests a context switch and then executes the
    /// port's idle/wait-for-interrupt instruction in a loop until control
    /// returns via an actual stack swap performed by the context-switch
    /// ISR. Hosted test ports may instead cooperatively run the scheduler
    /// directly.
    fn yield_cpu();

    /// Enable the given interrupt line.
    fn interrupt_enable(line: InterruptLine);

    /// Disable the given interrupt line.
    fn interrupt_disable(line: InterruptLine);

    /// Software-trigger the given interrupt line (used by tests and by
    /// `request_context_switch`'s default wiring on ports that model the
    /// context-switch vector as an ordinary line).
    fn interrupt_trigger(line: InterruptLine);

    /// Start the single hardware timer channel used by the timed-signal
    /// wheel. No-op if [`Self::MAX_SIGNAL_DELAY_HOURS`] support is unused.
    fn timer_start();

    /// Stop the timer channel. Called when the timed-signal wheel becomes
    /// fully idle: the timer is stopped if and only if both timed-signal
    /// queues are empty and the time-tracking refcount is zero.
    fn timer_stop();

    /// Read the free-running hardware counter.
    fn timer_read_counter() -> u32;

    /// Arm the compare register for the next interrupt.
    fn timer_set_compare(value: u32);

    /// Convert a tick count to microseconds. Identity if the port's counter
    /// already runs at 1 MHz.
    fn ticks_to_usecs(ticks: u32) -> u32 {
        ticks
    }

    /// Convert a microsecond duration to a tick count.
    fn usecs_to_ticks(usecs: u32) -> u32 {
        usecs
    }

    /// Whether multiplying by 1000 should avoid hardware multiplication
    /// (some MCUs lack a fast multiplier); affects only the internal
    /// `usecs_to_ticks`/`ticks_to_usecs` default conversion helpers.
    const AVOID_HARDWARE_MULTIPLICATION: bool = false;

    /// Whether acknowledging the context-switch vector also clears its
    /// pending-interrupt flag as a side effect (so the kernel must not
    /// clear it again).
    const CONTEXT_SWITCH_CLEARS_INTERRUPT_FLAG: bool = false;

    /// Default stack size reserved for the built-in Signal Processor.
    const SIGNAL_PROCESSOR_STACK_SIZE: usize = 254;

    /// Maximum supported signal delay, in hours (~3 years by default).
    const MAX_SIGNAL_DELAY_HOURS: u16 = 26_280;

    /// The single, application-provided instance of the kernel's global
    /// mutable state (running process, runnable queue, priority-change
    /// trampoline, timed-signal wheel). The kernel core never allocates this
    /// itself since `kernel_start`'s composition is out of scope.
    fn kernel_state() -> &'static crate::state::KernelState<Self>;
}
