//! The Action Queue: a sorted or FIFO, interrupt-safe, intrusive list of
//! [`Action`]s, plus the priority-change protocol that propagates a priority
//! change through a chain of queues with bounded stack depth.
//!
//! A head/tail intrusive list with `QueueOrder::{Fifo, Sorted}` and a
//! descending-priority insertion search, generalized from task-waiting to
//! arbitrary actions. The priority-change propagation itself uses an explicit
//! trampoline rather than plain recursion, so the stack depth stays bounded
//! regardless of chain length.
use core::ptr::NonNull;

use crate::{
    action::{Action, Link},
    error::Signal,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    Port, Priority,
};

/// Ordering discipline for an [`ActionQueue`], chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// Descending by priority; FIFO among equal priorities.
    Sorted,
    /// Pure insertion order, ignoring priority entirely.
    Fifo,
}

/// Strict vs lax re-sorting policy during [`ActionQueue::trigger_all`].
/// Meaningless for [`QueueOrder::Fifo`] queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// A priority change during iteration re-positions the action,
    /// advancing the iterator as though it had been removed and
    /// re-inserted. Used by the runnable queue and every process-owned
    /// queue (on-exit, pending-signal) so priority inheritance stays
    /// consistent mid-traversal.
    Strict,
    /// A priority change during iteration updates the cached field in
    /// place without re-linking, so each action is triggered exactly once
    /// even though queue order may transiently violate its invariant.
    /// Used by event subscription lists, where traversal order isn't
    /// priority-critical.
    Lax,
}

/// A callback invoked when a sorted queue's head priority changes (on
/// insert, pop, close, or a strict re-sort during `trigger_all`).
pub type OnHeadPriorityChangedFn<P> =
    unsafe fn(queue: &'static ActionQueue<P>, lock: CpuLockTokenRefMut<'_, P>);

struct State<P: Port> {
    head: Option<NonNull<Action<P>>>,
    tail: Option<NonNull<Action<P>>>,
    /// Iterator cursor for `trigger_all`/`close`; `None` when no traversal
    /// is in progress.
    cursor: Option<NonNull<Action<P>>>,
    cached_head_priority: Priority,
    closed: bool,
}

impl<P: Port> Default for State<P> {
    fn default() -> Self {
        Self {
            head: None,
            tail: None,
            cursor: None,
            cached_head_priority: Priority(0),
            closed: false,
        }
    }
}

/// Sorted or FIFO intrusive queue of [`Action`]s.
///
/// Must be `'static` and never moved after its first use (every link into it
/// is a raw pointer to `self`), matching every other kernel object's
/// caller-allocated, non-relocatable lifetime.
pub struct ActionQueue<P: Port> {
    state: CpuLockCell<P, State<P>>,
    order: QueueOrder,
    strictness: Strictness,
    on_head_priority_changed: CpuLockCell<P, Option<OnHeadPriorityChangedFn<P>>>,
    /// Opaque back-pointer to the object embedding this queue, for
    /// [`OnHeadPriorityChangedFn`] implementations that need to reach
    /// sibling fields (e.g. a mutex's owner slot). Mirrors
    /// [`crate::action::Action::arg_owner`]; set once at the embedding
    /// object's registration time, since the address isn't known at const
    /// construction time.
    owner: CpuLockCell<P, usize>,
}

impl<P: Port> ActionQueue<P> {
    pub const fn new(order: QueueOrder, strictness: Strictness) -> Self {
        Self {
            state: CpuLockCell::new(State {
                head: None,
                tail: None,
                cursor: None,
                cached_head_priority: Priority(0),
                closed: false,
            }),
            order,
            strictness,
            on_head_priority_changed: CpuLockCell::new(None),
            owner: CpuLockCell::new(0),
        }
    }

    pub fn set_on_head_priority_changed(
        &self,
        mut lock: CpuLockTokenRefMut<'_, P>,
        f: OnHeadPriorityChangedFn<P>,
    ) {
        self.on_head_priority_changed.replace(&mut *lock, Some(f));
    }

    pub fn set_owner(&self, owner: usize, mut lock: CpuLockTokenRefMut<'_, P>) {
        self.owner.replace(&mut *lock, owner);
    }

    pub fn owner(&self, lock: &CpuLockTokenRefMut<'_, P>) -> usize {
        *self.owner.read(&**lock)
    }

    pub fn cached_head_priority(&self, lock: &CpuLockTokenRefMut<'_, P>) -> Priority {
        self.state.read(&**lock).cached_head_priority
    }

    pub fn is_empty(&self, lock: &CpuLockTokenRefMut<'_, P>) -> bool {
        self.state.read(&**lock).head.is_none()
    }

    fn head_ptr(&self, lock: &CpuLockTokenRefMut<'_, P>) -> Option<NonNull<Action<P>>> {
        self.state.read(&**lock).head
    }

    /// Borrow the head action, if any.
    pub fn head(&'static self, lock: &CpuLockTokenRefMut<'_, P>) -> Option<&'static Action<P>> {
        self.head_ptr(lock)
            .map(|p| unsafe { p.as_ref() } as &'static Action<P>)
    }

    fn recompute_cached_head_priority(
        &'static self,
        lock: &mut CpuLockTokenRefMut<'_, P>,
    ) -> bool {
        let new_priority = match self.head_ptr(lock) {
            Some(head) => unsafe { head.as_ref() }.priority(&*lock),
            None => Priority(0),
        };
        let state = self.state.write(&mut **lock);
        if state.cached_head_priority == new_priority {
            false
        } else {
            state.cached_head_priority = new_priority;
            true
        }
    }

    fn fire_head_priority_changed(&'static self, mut lock: CpuLockTokenRefMut<'_, P>) {
        let f = *self.on_head_priority_changed.read(&*lock);
        if let Some(f) = f {
            unsafe { f(self, lock.borrow_mut()) };
        }
    }

    /// Find the link just before which `action` should be inserted to keep a
    /// sorted queue's descending-priority / FIFO-among-equals invariant.
    fn find_insertion_point(
        &self,
        priority: Priority,
        lock: &CpuLockTokenRefMut<'_, P>,
    ) -> Option<NonNull<Action<P>>> {
        let mut cur = self.state.read(&**lock).head;
        while let Some(node) = cur {
            let node_ref = unsafe { node.as_ref() };
            if node_ref.priority(lock) < priority {
                return Some(node);
            }
            cur = node_ref.link.read(&**lock).next;
        }
        None
    }

    fn link_before(
        &'static self,
        action: &'static Action<P>,
        before: Option<NonNull<Action<P>>>,
        lock: &mut CpuLockTokenRefMut<'_, P>,
    ) {
        let action_ptr = NonNull::from(action);
        let prev = match before {
            Some(b) => unsafe { b.as_ref() }.link.read(&**lock).prev,
            None => self.state.read(&**lock).tail,
        };

        *action.link.write(&mut **lock) = Link {
            prev,
            next: before,
            container: Some(NonNull::from(self)),
        };

        match prev {
            Some(p) => unsafe { p.as_ref() }.link.write(&mut **lock).next = Some(action_ptr),
            None => self.state.write(&mut **lock).head = Some(action_ptr),
        }
        match before {
            Some(b) => unsafe { b.as_ref() }.link.write(&mut **lock).prev = Some(action_ptr),
            None => self.state.write(&mut **lock).tail = Some(action_ptr),
        }
    }

    fn unlink(&'static self, action: &'static Action<P>, lock: &mut CpuLockTokenRefMut<'_, P>) {
        let link = *action.link.read(&**lock);
        let (prev, next) = (link.prev, link.next);

        match prev {
            Some(p) => unsafe { p.as_ref() }.link.write(&mut **lock).next = next,
            None => self.state.write(&mut **lock).head = next,
        }
        match next {
            Some(n) => unsafe { n.as_ref() }.link.write(&mut **lock).prev = prev,
            None => self.state.write(&mut **lock).tail = prev,
        }

        let state = self.state.write(&mut **lock);
        if state.cursor == Some(NonNull::from(action)) {
            state.cursor = next;
        }

        *action.link.write(&mut **lock) = Link {
            prev: None,
            next: None,
            container: None,
        };
    }

    /// Insert `action` into this queue, first releasing it from whatever
    /// queue currently holds it. Returns `true` iff `action` became the new
    /// head.
    pub fn insert(
        &'static self,
        action: &'static Action<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) -> bool {
        if self.state.read(&*lock).closed {
            return false;
        }

        if let Some(prev_queue) = action.link.read(&*lock).container {
            let prev_queue: &'static ActionQueue<P> = unsafe { prev_queue.as_ref() };
            if !core::ptr::eq(prev_queue, self) {
                prev_queue.release(action, true, lock.borrow_mut());
            } else {
                prev_queue.unlink(action, &mut lock);
            }
        }

        let before = match self.order {
            QueueOrder::Fifo => None,
            QueueOrder::Sorted => {
                let priority = action.priority(&lock);
                self.find_insertion_point(priority, &lock)
            }
        };
        self.link_before(action, before, &mut lock);

        let became_head = self.head_ptr(&lock) == Some(NonNull::from(action));
        if matches!(self.order, QueueOrder::Sorted)
            && self.recompute_cached_head_priority(&mut lock)
        {
            self.fire_head_priority_changed(lock);
        }
        became_head
    }

    /// Detach `action` from this queue (no-op if it isn't a member),
    /// running its release hook. `from_queue` should be `true` when the
    /// queue itself initiated the release (pop, close, re-homing), `false`
    /// for a direct caller-initiated removal.
    pub fn release(
        &'static self,
        action: &'static Action<P>,
        from_queue: bool,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) {
        let in_self = action.link.read(&*lock).container == Some(NonNull::from(self));
        if !in_self {
            return;
        }
        self.unlink(action, &mut lock);
        let head_changed = matches!(self.order, QueueOrder::Sorted)
            && self.recompute_cached_head_priority(&mut lock);
        action.notify_released(from_queue, lock.borrow_mut());
        if head_changed {
            self.fire_head_priority_changed(lock);
        }
    }

    /// Detach and return the head action, or `None` if empty.
    pub fn pop(&'static self, mut lock: CpuLockTokenRefMut<'_, P>) -> Option<&'static Action<P>> {
        let head = self.head_ptr(&lock)?;
        let action: &'static Action<P> = unsafe { head.as_ref() };
        self.release(action, true, lock.borrow_mut());
        Some(action)
    }

    /// Iterate head to tail invoking each action's trigger with `signal`.
    /// Safe under concurrent mutation: the cursor advances one step ahead
    /// of the action it is about to trigger.
    pub fn trigger_all(&'static self, signal: Signal, mut lock: CpuLockTokenRefMut<'_, P>) {
        let mut cur = self.head_ptr(&lock);
        self.state.write(&mut *lock).cursor = cur;
        while let Some(node_ptr) = cur {
            let node: &'static Action<P> = unsafe { node_ptr.as_ref() };
            let next = node.link.read(&*lock).next;
            self.state.write(&mut *lock).cursor = next;
            unsafe { node.trigger(signal, lock.borrow_mut()) };
            cur = self.state.read(&*lock).cursor;
        }
        self.state.write(&mut *lock).cursor = None;
    }

    /// Destructive final `trigger_all`: permanently refuses further
    /// [`insert`](Self::insert) calls, then repeatedly pops and triggers the
    /// head until empty, forcibly releasing any action a trigger didn't
    /// release itself.
    pub fn close(&'static self, signal: Signal, mut lock: CpuLockTokenRefMut<'_, P>) {
        self.state.write(&mut *lock).closed = true;
        loop {
            let head = match self.head_ptr(&lock) {
                Some(h) => h,
                None => break,
            };
            let action: &'static Action<P> = unsafe { head.as_ref() };
            unsafe { action.trigger(signal, lock.borrow_mut()) };
            // The trigger may or may not have released the action itself
            // (e.g. a disposed stub never does); force it off the queue
            // either way so `close` always terminates.
            self.release(action, true, lock.borrow_mut());
        }
    }

    /// Change `action`'s priority, re-positioning it within this queue per
    /// the queue's strictness policy, and fire the head-priority-changed
    /// hook if the head priority changed as a result.
    ///
    /// Callers needing the bounded-stack priority-change protocol (a
    /// priority change whose hook itself changes another object's priority)
    /// should route through [`crate::scheduler::change_priority`] instead
    /// of calling this directly from within a hook.
    pub fn set_action_priority(
        &'static self,
        action: &'static Action<P>,
        new_priority: Priority,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) {
        let in_self = action.link.read(&*lock).container == Some(NonNull::from(self));
        if !in_self || !matches!(self.order, QueueOrder::Sorted) {
            action.set_priority_field(&mut lock, new_priority);
            return;
        }

        match self.strictness {
            Strictness::Lax => {
                // Update in place; queue order may transiently violate its
                // invariant until the traversal (if any) ends.
                action.set_priority_field(&mut lock, new_priority);
            }
            Strictness::Strict => {
                // Re-link as though removed and re-inserted, advancing the
                // cursor exactly as `release` would.
                self.unlink(action, &mut lock);
                action.set_priority_field(&mut lock, new_priority);
                let before = self.find_insertion_point(new_priority, &lock);
                self.link_before(action, before, &mut lock);
            }
        }

        if self.recompute_cached_head_priority(&mut lock) {
            self.fire_head_priority_changed(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{klock::lock_cpu, test_support::{leak, TestPort}};

    fn new_action(priority: u16) -> &'static Action<TestPort> {
        unsafe fn noop_trigger(
            _action: &'static Action<TestPort>,
            _signal: Signal,
            _lock: CpuLockTokenRefMut<'_, TestPort>,
        ) {
        }
        leak(Action::new(Priority::new(priority), noop_trigger))
    }

    #[test]
    fn sorted_insert_descending_by_priority() {
        let queue: &'static ActionQueue<TestPort> =
            leak(ActionQueue::new(QueueOrder::Sorted, Strictness::Strict));
        let low = new_action(1);
        let high = new_action(10);
        let mid = new_action(5);

        let mut lock = lock_cpu::<TestPort>();
        queue.insert(low, lock.borrow_mut());
        queue.insert(high, lock.borrow_mut());
        queue.insert(mid, lock.borrow_mut());

        assert_eq!(queue.head(&lock.borrow_mut()).unwrap() as *const _, high as *const _);
        assert_eq!(queue.cached_head_priority(&lock.borrow_mut()), Priority::new(10));

        let popped_high = queue.pop(lock.borrow_mut()).unwrap();
        assert_eq!(popped_high as *const _, high as *const _);
        assert_eq!(queue.cached_head_priority(&lock.borrow_mut()), Priority::new(5));

        let popped_mid = queue.pop(lock.borrow_mut()).unwrap();
        assert_eq!(popped_mid as *const _, mid as *const _);
        let popped_low = queue.pop(lock.borrow_mut()).unwrap();
        assert_eq!(popped_low as *const _, low as *const _);
        assert!(queue.is_empty(&lock.borrow_mut()));
    }

    #[test]
    fn fifo_insert_ignores_priority() {
        let queue: &'static ActionQueue<TestPort> =
            leak(ActionQueue::new(QueueOrder::Fifo, Strictness::Lax));
        let first = new_action(1);
        let second = new_action(99);

        let mut lock = lock_cpu::<TestPort>();
        queue.insert(first, lock.borrow_mut());
        queue.insert(second, lock.borrow_mut());

        let popped_first = queue.pop(lock.borrow_mut()).unwrap();
        assert_eq!(popped_first as *const _, first as *const _);
        let popped_second = queue.pop(lock.borrow_mut()).unwrap();
        assert_eq!(popped_second as *const _, second as *const _);
    }

    #[test]
    fn strict_priority_change_repositions_and_fires_hook() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        unsafe fn on_changed(_queue: &'static ActionQueue<TestPort>, _lock: CpuLockTokenRefMut<'_, TestPort>) {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        let queue: &'static ActionQueue<TestPort> =
            leak(ActionQueue::new(QueueOrder::Sorted, Strictness::Strict));
        let low = new_action(1);
        let high = new_action(10);

        let mut lock = lock_cpu::<TestPort>();
        queue.set_on_head_priority_changed(lock.borrow_mut(), on_changed);
        queue.insert(low, lock.borrow_mut());
        queue.insert(high, lock.borrow_mut());
        assert_eq!(FIRED.load(Ordering::SeqCst), 2); // low became head, then high overtook it

        // Raising `low` above `high` should re-sort it to the head and fire
        // the hook again.
        queue.set_action_priority(low, Priority::new(20), lock.borrow_mut());
        assert_eq!(queue.head(&lock.borrow_mut()).unwrap() as *const _, low as *const _);
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn close_drains_and_refuses_further_inserts() {
        let queue: &'static ActionQueue<TestPort> =
            leak(ActionQueue::new(QueueOrder::Sorted, Strictness::Lax));
        let a = new_action(1);
        let b = new_action(2);

        let mut lock = lock_cpu::<TestPort>();
        queue.insert(a, lock.borrow_mut());
        queue.close(Signal::TIMEOUT, lock.borrow_mut());
        assert!(queue.is_empty(&lock.borrow_mut()));

        let became_head = queue.insert(b, lock.borrow_mut());
        assert!(!became_head);
        assert!(queue.is_empty(&lock.borrow_mut()));
    }

    use quickcheck_macros::quickcheck;

    /// Popping a sorted queue always yields non-increasing priorities, and
    /// equal-priority actions come out in the order they were inserted.
    #[quickcheck]
    fn sorted_pop_order_is_non_increasing_and_fifo_among_equals(priorities: Vec<u16>) {
        let priorities: Vec<u16> = priorities.into_iter().take(16).collect();
        let queue: &'static ActionQueue<TestPort> =
            leak(ActionQueue::new(QueueOrder::Sorted, Strictness::Strict));
        let actions: Vec<(usize, &'static Action<TestPort>)> = priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| (i, new_action(p)))
            .collect();

        let mut lock = lock_cpu::<TestPort>();
        for &(_, action) in &actions {
            queue.insert(action, lock.borrow_mut());
        }

        let mut last_priority = None;
        let mut last_seen_index = None;
        while let Some(popped) = queue.pop(lock.borrow_mut()) {
            let priority = popped.priority(&lock.borrow_mut());
            let (index, _) = actions
                .iter()
                .find(|&&(_, a)| core::ptr::eq(a, popped))
                .unwrap();

            if let Some(last) = last_priority {
                assert!(priority <= last, "pop order was not non-increasing");
                if priority == last {
                    assert!(
                        *index > last_seen_index.unwrap(),
                        "equal-priority actions popped out of insertion order"
                    );
                }
            }
            last_priority = Some(priority);
            last_seen_index = Some(*index);
        }
    }
}
