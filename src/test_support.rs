//! Minimal single-threaded [`Port`] stand-in for in-crate unit tests.
//!
//! Unit tests in this crate exercise pure data-structure logic (queue
//! ordering, priority propagation, time arithmetic) without ever actually
//! blocking a process, so a single OS thread suffices: [`TestPort`] doesn't
//! need real mutual exclusion, only something that satisfies [`Port`]'s
//! shape. Tests that need true concurrent scheduling (processes that really
//! block and get woken from another thread) live under `tests/` instead,
//! driven by the richer harness there.
use core::cell::Cell;

use crate::{
    klock::CpuLockCell, state::KernelState, InterruptLine, InterruptState, Port, Priority,
};

pub(crate) struct TestPort;

static KERNEL: KernelState<TestPort> = KernelState::new();

std::thread_local! {
    static INTERRUPT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

impl Port for TestPort {
    fn interrupt_suspend() -> InterruptState {
        let depth = INTERRUPT_DEPTH.with(|d| {
            let prev = d.get();
            d.set(prev + 1);
            prev
        });
        InterruptState(depth as usize)
    }

    fn interrupt_restore(state: InterruptState) {
        INTERRUPT_DEPTH.with(|d| d.set(state.0 as u32));
    }

    fn is_interrupt_context() -> bool {
        false
    }

    fn request_context_switch() {}

    fn yield_cpu() {
        // Single-threaded unit tests never have more than one process
        // registered as runnable at once, so there is nothing to switch to.
    }

    fn interrupt_enable(_line: InterruptLine) {}
    fn interrupt_disable(_line: InterruptLine) {}
    fn interrupt_trigger(_line: InterruptLine) {}

    fn timer_start() {}
    fn timer_stop() {}
    fn timer_read_counter() -> u32 {
        0
    }
    fn timer_set_compare(_value: u32) {}

    fn kernel_state() -> &'static KernelState<Self> {
        &KERNEL
    }
}

/// Construct a fresh, `'static`, never-freed cell for a test fixture.
/// Kernel objects are non-movable after registration, so tests that need a
/// `'static` reference leak one per fixture — acceptable in a test binary.
pub(crate) fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

#[allow(dead_code)]
pub(crate) type TestPriority = Priority;
#[allow(dead_code)]
pub(crate) type TestCell<T> = CpuLockCell<TestPort, T>;
