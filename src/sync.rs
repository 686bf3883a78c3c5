//! # Critical Sections
//!
//! Every piece of kernel state sits behind one critical section. On the host
//! the `critical-section` crate's `std` implementation provides it; on a
//! single-core target the same calls would mask interrupts.
//!
//! Nothing that can block or park a host thread may run inside a critical
//! section.

use core::cell::RefCell;

pub use critical_section::CriticalSection;

/// Kernel-owned data reachable only from inside a critical section.
pub type Guarded<T> = critical_section::Mutex<RefCell<T>>;

/// Wrap `value` for critical-section-only access.
pub const fn guarded<T>(value: T) -> Guarded<T> {
    critical_section::Mutex::new(RefCell::new(value))
}

/// Execute a closure within a critical section.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Run `f` with exclusive access to `cell`.
#[inline]
pub fn with_guarded<T, R>(cell: &Guarded<T>, f: impl FnOnce(&mut T) -> R) -> R {
    critical_section(|cs| f(&mut cell.borrow(cs).borrow_mut()))
}
