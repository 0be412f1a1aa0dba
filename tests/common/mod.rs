//! Host-side scheduling harness for the integration suite.
//!
//! Grounded on `r3_port_std`'s approach of backing every kernel process with
//! a real OS thread and cooperatively handing off which one may run, but
//! simplified from its full user-mode-scheduling thread group down to a
//! single condition variable: every process's OS thread calls
//! [`yield_cpu`], which parks until [`choose_next_running_process`] reports
//! that thread's process as the chosen one. `request_context_switch` just
//! broadcasts the condition variable — there is no true instruction-level
//! preemption here, so a test that needs a lower-priority process to step
//! aside mid-computation must itself call a blocking kernel operation (wait,
//! acquire, lock, sleep) at the handoff point, the same way a real
//! process's own code only yields the CPU at a defined blocking point.
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use primer_kernel::klock::lock_cpu;
use primer_kernel::process::Process;
use primer_kernel::scheduler::choose_next_running_process;
use primer_kernel::state::KernelState;
use primer_kernel::{InterruptLine, InterruptState, Port, Signal};

pub struct TestPort;

static KERNEL: KernelState<TestPort> = KernelState::new();

/// Models "interrupts suspended" as a reentrant claim on a single global
/// mutex: one caller (on any OS thread) at a time may touch kernel state,
/// and the same thread may suspend again without deadlocking itself.
struct ReentrantLock {
    inner: Mutex<Option<(ThreadId, u32)>>,
    cond: Condvar,
}

impl ReentrantLock {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) -> u32 {
        let me = std::thread::current().id();
        let mut state = self.inner.lock().unwrap();
        loop {
            match *state {
                Some((owner, depth)) if owner == me => {
                    *state = Some((owner, depth + 1));
                    return depth;
                }
                None => {
                    *state = Some((me, 1));
                    return 0;
                }
                Some(_) => {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
    }

    fn release_to(&self, prev_depth: u32) {
        let me = std::thread::current().id();
        let mut state = self.inner.lock().unwrap();
        if prev_depth == 0 {
            *state = None;
            self.cond.notify_all();
        } else {
            *state = Some((me, prev_depth));
        }
    }
}

static CPU_LOCK: ReentrantLock = ReentrantLock::new();
static DISPATCH: (Mutex<()>, Condvar) = (Mutex::new(()), Condvar::new());
static VIRTUAL_CLOCK: AtomicU32 = AtomicU32::new(0);
static TIMER_ARMED: AtomicBool = AtomicBool::new(false);

std::thread_local! {
    static CURRENT_PROCESS: Cell<usize> = const { Cell::new(0) };
    static INTERRUPT_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Bind the calling OS thread to `process` for the lifetime of the thread.
/// Call this once at the top of every spawned process thread.
fn bind_current_process(process: &'static Process<TestPort>) {
    CURRENT_PROCESS.with(|c| c.set(process as *const _ as usize));
}

impl Port for TestPort {
    fn interrupt_suspend() -> InterruptState {
        let depth = CPU_LOCK.acquire();
        log::trace!("interrupt_suspend -> depth {depth}");
        InterruptState(depth as usize)
    }

    fn interrupt_restore(state: InterruptState) {
        log::trace!("interrupt_restore(depth = {})", state.0);
        CPU_LOCK.release_to(state.0 as u32);
    }

    fn is_interrupt_context() -> bool {
        INTERRUPT_CONTEXT.with(|c| c.get())
    }

    fn request_context_switch() {
        log::trace!("request_context_switch");
        let _g = DISPATCH.0.lock().unwrap();
        DISPATCH.1.notify_all();
    }

    fn yield_cpu() {
        log::trace!("yield_cpu");
        let my_addr = CURRENT_PROCESS.with(|c| c.get());
        loop {
            let chosen_addr = unsafe { choose_next_running_process::<TestPort>() }
                .map(|p| p as *const _ as usize)
                .unwrap_or(0);
            if my_addr != 0 && chosen_addr == my_addr {
                log::debug!("process {my_addr:#x} is now running");
                return;
            }
            let guard = DISPATCH.0.lock().unwrap();
            let _ = DISPATCH.1.wait_timeout(guard, Duration::from_millis(10)).unwrap();
        }
    }

    fn interrupt_enable(_line: InterruptLine) {}
    fn interrupt_disable(_line: InterruptLine) {}
    fn interrupt_trigger(_line: InterruptLine) {}

    fn timer_start() {
        log::trace!("timer_start");
        TIMER_ARMED.store(true, Ordering::SeqCst);
    }
    fn timer_stop() {
        log::trace!("timer_stop");
        TIMER_ARMED.store(false, Ordering::SeqCst);
    }
    fn timer_read_counter() -> u32 {
        VIRTUAL_CLOCK.load(Ordering::SeqCst)
    }
    fn timer_set_compare(_value: u32) {}

    fn kernel_state() -> &'static KernelState<Self> {
        &KERNEL
    }
}

/// Install `env_logger` so `RUST_LOG=trace` surfaces the above when a test
/// fails. Safe to call from every test; only the first call takes effect.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Whether the port's timer channel is currently armed, per the invariant
/// "armed iff the timed-signal wheel is non-empty".
pub fn timer_armed() -> bool {
    TIMER_ARMED.load(Ordering::SeqCst)
}

/// Advance the virtual hardware tick counter the timed-signal wheel reads.
pub fn advance_clock(usecs: u32) {
    VIRTUAL_CLOCK.fetch_add(usecs, Ordering::SeqCst);
}

/// Construct a fresh, never-freed, `'static` fixture.
pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Spawn an OS thread backing `process`: waits to be scheduled for the
/// first time, then runs `body`. `body` is responsible for calling
/// `process.exit(...)` itself if it wants the process to actually
/// terminate — this harness has no implicit dispose step.
pub fn spawn_process(
    process: &'static Process<TestPort>,
    body: impl FnOnce(&'static Process<TestPort>) + Send + 'static,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        bind_current_process(process);
        TestPort::yield_cpu();
        body(process);
    })
}

/// Make a freshly-registered process runnable for the first time, by
/// triggering its own action directly — the same path any holder of a
/// process's action uses to wake it.
pub fn start_process(process: &'static Process<TestPort>) {
    let mut lock = lock_cpu::<TestPort>();
    unsafe { process.action.trigger(Signal::SUCCESS, lock.borrow_mut()) };
}

/// Poll `predicate` until it's true or `timeout` elapses, sleeping briefly
/// between checks. Used by the test driver thread (which is not itself a
/// registered process and so cannot call blocking kernel operations) to
/// wait for a condition established by process threads.
pub fn poll_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    loop {
        if predicate() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
