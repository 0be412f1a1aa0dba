//! Error types.
//!
//! [`Signal`] is the wide, word-sized return-code space shared across every
//! kernel operation. Individual operations return a narrow, module-local
//! error enum and widen it into a [`Signal`] only at the public boundary:
//! a small set of sharply scoped error enums (`BadContextError`,
//! `BadParamError`, ...), each with a `From` conversion into every wider
//! error type that can contain it, built with the `define_suberror!` macro
//! below.
use core::fmt;

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        pub enum $Name:ident { $( $Variant:ident = $code:expr, )* }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $Name {
            $( $Variant, )*
        }

        impl From<$Name> for Signal {
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Signal($code), )*
                }
            }
        }
    };
}

/// Opaque word-sized value passed between triggers and handlers; also used
/// as a process exit code and kernel return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signal(pub i32);

impl Signal {
    pub const SUCCESS: Signal = Signal(0);
    pub const INVALID_ARGUMENT: Signal = Signal(0x4000);
    pub const INVALID_STATE: Signal = Signal(0x2000);
    pub const DISPOSED_RESOURCE_ACCESS: Signal = Signal(-9);
    pub const TIMEOUT: Signal = Signal(-8);

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

define_suberror! {
    /// The object has been disposed; its operation function pointers have
    /// been swapped for a stub returning this error. Not fatal: callers may
    /// keep using a handle to a disposed object, they just get this back.
    pub enum DisposedError {
        Disposed = Signal::DISPOSED_RESOURCE_ACCESS.0,
    }
}

define_suberror! {
    /// A caller passed a self-referential argument where that is forbidden
    /// (e.g. `Process::wait_for(self)`, `Semaphore::acquire_async` with the
    /// running process's own action).
    pub enum InvalidArgumentError {
        InvalidArgument = Signal::INVALID_ARGUMENT.0,
    }
}

define_suberror! {
    /// A blocking call specified a timeout but the timed-signal subsystem
    /// was never initialized, or was called from a non-waitable context
    /// (interrupt context).
    pub enum BadContextError {
        BadContext = Signal::INVALID_STATE.0,
    }
}

/// Scheduler-level error: bad calling context, or the target was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    BadContext,
    Disposed,
}

impl From<ScheduleError> for Signal {
    fn from(x: ScheduleError) -> Self {
        match x {
            ScheduleError::BadContext => Signal::INVALID_STATE,
            ScheduleError::Disposed => Signal::DISPOSED_RESOURCE_ACCESS,
        }
    }
}

/// Mutex-specific error codes (`MUTEX_LOCKED=1`, `MUTEX_INVALID_OWNER=2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexError {
    Locked,
    InvalidOwner,
    BadContext,
    Disposed,
}

impl From<MutexError> for Signal {
    fn from(x: MutexError) -> Self {
        match x {
            MutexError::Locked => Signal(1),
            MutexError::InvalidOwner => Signal(2),
            MutexError::BadContext => Signal::INVALID_STATE,
            MutexError::Disposed => Signal::DISPOSED_RESOURCE_ACCESS,
        }
    }
}

/// Semaphore-specific error codes (`SEMAPHORE_NO_PERMITS=1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreError {
    NoPermits,
    InvalidArgument,
    BadContext,
    Disposed,
}

impl From<SemaphoreError> for Signal {
    fn from(x: SemaphoreError) -> Self {
        match x {
            SemaphoreError::NoPermits => Signal(1),
            SemaphoreError::InvalidArgument => Signal::INVALID_ARGUMENT,
            SemaphoreError::BadContext => Signal::INVALID_STATE,
            SemaphoreError::Disposed => Signal::DISPOSED_RESOURCE_ACCESS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    InvalidArgument,
    BadContext,
    Disposed,
}

impl From<ProcessError> for Signal {
    fn from(x: ProcessError) -> Self {
        match x {
            ProcessError::InvalidArgument => Signal::INVALID_ARGUMENT,
            ProcessError::BadContext => Signal::INVALID_STATE,
            ProcessError::Disposed => Signal::DISPOSED_RESOURCE_ACCESS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedSignalError {
    BadContext,
    Disposed,
}

impl From<TimedSignalError> for Signal {
    fn from(x: TimedSignalError) -> Self {
        match x {
            TimedSignalError::BadContext => Signal::INVALID_STATE,
            TimedSignalError::Disposed => Signal::DISPOSED_RESOURCE_ACCESS,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({})", self.0)
    }
}
