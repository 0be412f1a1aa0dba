//! `Process::wait_for` actually parks the caller until the target exits,
//! and hands back its exit code.
mod common;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use common::{init_logging, leak, poll_until, spawn_process, start_process, TestPort};
use primer_kernel::process::{Process, ProcessConfig};
use primer_kernel::{Priority, Signal};

static ABOUT_TO_WAIT: AtomicBool = AtomicBool::new(false);
static MAIN_DONE: AtomicBool = AtomicBool::new(false);
static RECEIVED_CODE: AtomicI32 = AtomicI32::new(i32::MIN);

#[test]
fn wait_for_blocks_until_target_exits_and_returns_its_code() {
    init_logging();
    let worker: &'static Process<TestPort> = leak(Process::new());
    worker.register(
        ProcessConfig {
            priority: Priority::new(2),
        },
        0,
    );

    let main_proc: &'static Process<TestPort> = leak(Process::new());
    main_proc.register(
        ProcessConfig {
            priority: Priority::new(1),
        },
        0,
    );

    spawn_process(main_proc, move |p| {
        ABOUT_TO_WAIT.store(true, Ordering::SeqCst);
        let code = p.wait_for(worker, None, None).unwrap();
        RECEIVED_CODE.store(code.0, Ordering::SeqCst);
        MAIN_DONE.store(true, Ordering::SeqCst);
        p.exit(Signal::SUCCESS);
    });
    spawn_process(worker, move |p| {
        p.exit(Signal(777));
    });

    start_process(main_proc);
    assert!(poll_until(Duration::from_secs(2), || ABOUT_TO_WAIT
        .load(Ordering::SeqCst)));
    // No true preemption in this harness: give `main`'s own OS thread time
    // to actually finish parking in `suspend()` before the target it's
    // waiting on is made runnable, or the wakeup could be missed.
    std::thread::sleep(Duration::from_millis(50));

    start_process(worker);

    assert!(poll_until(Duration::from_secs(2), || MAIN_DONE.load(
        Ordering::SeqCst
    )));
    assert_eq!(RECEIVED_CODE.load(Ordering::SeqCst), 777);
}
