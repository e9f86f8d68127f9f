//! # Synchronization primitives for the device memory allocator
//!
//! | Primitive       | Role                                                                  |
//! |-----------------|-----------------------------------------------------------------------|
//! | [`SpinLock`]    | Short critical sections; the guard can step out of the lock for a call |
//! | [`CallLock`]    | Data-less lock serializing whole calls; holders may block for long    |
//! | [`RwSpinLock`]  | Reader-preferring reader/writer lock                                  |
//!
//! Waiting loops go through [`Backoff`], which spins briefly and then calls
//! [`relax`]. With the `std` feature `relax` yields the thread to the OS
//! scheduler; without it it is a spin hint.

#![cfg_attr(not(any(test, doctest, feature = "std")), no_std)]
#![allow(unsafe_code)]

mod backoff;
mod call_lock;
mod rw_lock;
mod spin_lock;

pub use backoff::{Backoff, relax};
pub use call_lock::{CallGuard, CallLock};
pub use rw_lock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
