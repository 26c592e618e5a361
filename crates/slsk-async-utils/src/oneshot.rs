//! The oneshot channel used for in-process rendezvous.
//!
//! This is `futures::channel::oneshot` with the receiver pre-fused.
//! Receivers from this module end up inside `select!` loops and shared
//! futures (the waiter, upload readiness signals), where they may be
//! polled again after completing; the bare receiver's
//! [`FusedFuture`](futures::future::FusedFuture) implementation
//! misbehaves there ([futures-rs#2455]), so every receiver is wrapped
//! in a [`Fuse`] up front.  The cost is one extra flag per receiver;
//! the benefit is that a completed receiver is simply inert.
//!
//! [futures-rs#2455]: https://github.com/rust-lang/futures-rs/issues/2455

use futures::channel::oneshot as upstream;
use futures::future::{Fuse, FutureExt as _};

pub use upstream::Canceled;

/// The sending half, unchanged from `futures`.
pub type Sender<T> = upstream::Sender<T>;

/// The receiving half, already fused.
pub type Receiver<T> = Fuse<upstream::Receiver<T>>;

/// Create a rendezvous pair.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = upstream::channel();
    (tx, rx.fuse())
}
