//! Kernel state locking mechanism.
//!
//! All shared kernel state is protected purely by interrupt suspension:
//! there are no spinlocks. [`CpuLockCell`] is a cell type that can only be
//! accessed while holding a [`CpuLockGuard`], which is acquired by
//! [`lock_cpu`] and represents "interrupts are currently suspended".
//! Acquiring the guard never fails:
//! [`Port::interrupt_suspend`]/[`Port::interrupt_restore`] nest correctly, so
//! any function may call [`lock_cpu`] without knowing whether its caller
//! already holds one.
use core::ops;
use tokenlock::UnsyncTokenLock;

use crate::{Port, InterruptState};

pub(crate) struct CpuLockTag<P>(P);

/// The key that "unlocks" a [`CpuLockCell`].
pub(crate) type CpuLockToken<P> = tokenlock::UnsyncSingletonToken<CpuLockTag<P>>;

type CpuLockKeyhole<P> = tokenlock::SingletonTokenId<CpuLockTag<P>>;

/// Cell type that can only be read or written while holding a
/// [`CpuLockGuard`] (or a borrowed [`CpuLockTokenRefMut`]/[`CpuLockTokenRef`]
/// thereof).
pub struct CpuLockCell<P, T>(UnsyncTokenLock<T, CpuLockKeyhole<P>>);

impl<P, T> CpuLockCell<P, T> {
    pub const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::<P>::INIT, x))
    }
}

impl<P, T> ops::Deref for CpuLockCell<P, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<P>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P, T> ops::DerefMut for CpuLockCell<P, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<P, T: Default> Default for CpuLockCell<P, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard representing "interrupts are currently suspended".
///
/// Dropping the guard restores the interrupt mask state that was active
/// immediately before the corresponding [`lock_cpu`] call.
pub struct CpuLockGuard<P: Port> {
    token: CpuLockToken<P>,
    saved: InterruptState,
}

impl<P: Port> CpuLockGuard<P> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, P> {
        self.token.borrow_mut()
    }

    pub fn borrow(&self) -> CpuLockTokenRef<'_, P> {
        self.token.borrow()
    }
}

impl<P: Port> Drop for CpuLockGuard<P> {
    fn drop(&mut self) {
        P::interrupt_restore(self.saved);
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Suspend interrupts and get an RAII guard. Always succeeds: nested calls
/// are sound because [`Port::interrupt_suspend`] saves and
/// [`Port::interrupt_restore`] restores the exact prior state.
pub fn lock_cpu<P: Port>() -> CpuLockGuard<P> {
    let saved = P::interrupt_suspend();
    // Safety: we hold a fresh, exclusive claim on the token: nobody else can
    // be holding a `CpuLockToken<P>` while interrupts are suspended, because
    // the only way to get one is through this function, and the previous
    // holder (if any) released it before its matching `interrupt_restore`.
    let token = unsafe { CpuLockToken::new_unchecked() };
    CpuLockGuard { token, saved }
}

/// Borrowed version of [`CpuLockGuard`]. Equivalent to `&'a mut
/// CpuLockGuard` but does not consume memory. Reborrow explicitly with
/// `.borrow_mut()` rather than relying on automatic reborrowing.
pub type CpuLockTokenRefMut<'a, P> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<P>>;

/// Borrowed, read-only version of [`CpuLockGuard`].
pub type CpuLockTokenRef<'a, P> = tokenlock::UnsyncSingletonTokenRef<'a, CpuLockTag<P>>;
