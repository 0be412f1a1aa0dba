//! A semaphore release wakes its highest-priority waiter first, regardless
//! of arrival order.
mod common;

use std::sync::Mutex;
use std::time::Duration;

use common::{init_logging, leak, poll_until, spawn_process, start_process, TestPort};
use primer_kernel::process::{Process, ProcessConfig};
use primer_kernel::semaphore::Semaphore;
use primer_kernel::Priority;

static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn logged(tag: &'static str) -> bool {
    LOG.lock().unwrap().iter().any(|&s| s == tag)
}

#[test]
fn release_wakes_the_highest_priority_waiter_first() {
    init_logging();
    let sem: &'static Semaphore<TestPort> = leak(Semaphore::new(0, 1));
    sem.register();

    let low: &'static Process<TestPort> = leak(Process::new());
    low.register(
        ProcessConfig {
            priority: Priority::new(1),
        },
        0,
    );
    let high: &'static Process<TestPort> = leak(Process::new());
    high.register(
        ProcessConfig {
            priority: Priority::new(5),
        },
        0,
    );

    spawn_process(low, move |p| {
        LOG.lock().unwrap().push("low-waiting");
        sem.acquire(None, None).unwrap();
        LOG.lock().unwrap().push("low-ran");
        p.exit(primer_kernel::Signal::SUCCESS);
    });
    spawn_process(high, move |p| {
        LOG.lock().unwrap().push("high-waiting");
        sem.acquire(None, None).unwrap();
        LOG.lock().unwrap().push("high-ran");
        p.exit(primer_kernel::Signal::SUCCESS);
    });

    start_process(low);
    assert!(poll_until(Duration::from_secs(2), || logged("low-waiting")));
    std::thread::sleep(Duration::from_millis(50));

    start_process(high);
    assert!(poll_until(Duration::from_secs(2), || logged("high-waiting")));
    std::thread::sleep(Duration::from_millis(50));

    sem.release().unwrap();
    assert!(poll_until(Duration::from_secs(2), || logged("high-ran")));
    assert!(
        !logged("low-ran"),
        "lower-priority waiter ran before the higher-priority one"
    );

    sem.release().unwrap();
    assert!(poll_until(Duration::from_secs(2), || logged("low-ran")));
}
