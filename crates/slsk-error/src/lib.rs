#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]

use derive_more::Display;

mod report;
pub use report::*;

/// Classification of an error arising from the daemon's core subsystems.
///
/// Every subsystem reports failures with its own error type; those types
/// implement [`HasKind`] so that transports and callers can react to the
/// *category* of a failure without knowing which subsystem produced it.
///
/// When forwarding or reporting errors, use the whole error, not just the
/// kind: the error itself carries the detail and context a human needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A named object (user, upload, search, agent, file) does not exist.
    ///
    /// Also used for responses that arrive with no matching outstanding
    /// request, which from the receiver's point of view name a rendezvous
    /// that does not exist.
    #[display("object not found")]
    NotFound,

    /// The caller presented no credential, an invalid credential, or a
    /// capability token that was already spent.
    ///
    /// Authorisation failures are reported verbatim and never retried.
    #[display("not authorized")]
    Unauthorized,

    /// The operation conflicts with the current state of the object.
    ///
    /// For example: registering an agent name that is bound to a different
    /// live connection, or completing an upload that was never released.
    #[display("conflicting operation already in progress or applied")]
    Conflict,

    /// The input failed validation before any work was attempted.
    #[display("validation failed")]
    ValidationFailed,

    /// The operation did not finish within its allotted time.
    #[display("operation timed out")]
    Timeout,

    /// The operation was cancelled by its owner before it completed.
    #[display("operation cancelled")]
    Cancelled,

    /// A remote relay agent reported a failure while servicing our request.
    ///
    /// The agent's own description of the failure travels inside the
    /// wrapping error.
    #[display("remote agent failure")]
    RemoteAgent,

    /// A share scan was requested while another scan was still running.
    ///
    /// Scans are single-writer; the caller should retry after the current
    /// scan completes.
    #[display("share scan already in progress")]
    ScanAlreadyInProgress,

    /// An uploaded share repository failed content validation and was not
    /// installed.
    #[display("share repository failed validation")]
    ShareValidation,

    /// The peer-protocol library reported a failure we cannot classify
    /// more precisely.
    #[display("peer protocol error")]
    PeerProtocol,

    /// An internal error that indicates a bug in this codebase.
    #[display("internal error (bug)")]
    Internal,
}

/// Errors that can be classified as an [`ErrorKind`].
///
/// All error types exposed by the daemon's subsystems implement this.
pub trait HasKind {
    /// Return the kind of this error.
    fn kind(&self) -> ErrorKind;
}

impl HasKind for ErrorKind {
    fn kind(&self) -> ErrorKind {
        *self
    }
}

impl ErrorKind {
    /// Return true if failures of this kind may sensibly be retried by the
    /// component that owns the operation.
    ///
    /// Validation and authorisation failures must never be retried; the
    /// reconnect loops own their own retry policy for transient transport
    /// failures.
    pub fn is_retriable(&self) -> bool {
        match self {
            ErrorKind::Timeout | ErrorKind::PeerProtocol => true,
            ErrorKind::NotFound
            | ErrorKind::Unauthorized
            | ErrorKind::Conflict
            | ErrorKind::ValidationFailed
            | ErrorKind::Cancelled
            | ErrorKind::RemoteAgent
            | ErrorKind::ScanAlreadyInProgress
            | ErrorKind::ShareValidation
            | ErrorKind::Internal => false,
        }
    }
}
