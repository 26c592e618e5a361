//! The Report type which reports errors nicely

use std::error::Error as StdError;
use std::fmt::{self, Debug, Display};

/// Wraps any Error, providing a nicely-reporting Display impl
#[derive(Debug, Copy, Clone)]
#[allow(clippy::exhaustive_structs)] // this is a transparent wrapper
pub struct Report<E>(pub E)
where
    E: AsRef<dyn StdError>;

/// Display an error together with its chain of sources.
///
/// Sources whose message is already contained in their wrapper's message
/// are skipped, so errors that format their cause themselves are not
/// reported twice.
fn fmt_error_chain(mut e: &dyn StdError, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "error")?;
    let mut last = String::new();
    loop {
        let this = e.to_string();
        if !last.contains(&this) {
            write!(f, ": {}", &this)?;
        }
        last = this;

        if let Some(ne) = e.source() {
            e = ne;
        } else {
            break;
        }
    }
    Ok(())
}

impl<E> Display for Report<E>
where
    E: AsRef<dyn StdError>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_error_chain(self.0.as_ref(), f)
    }
}

/// Extension trait adding [`report`](ErrorReport::report) to every error.
///
/// `err.report()` is the borrowed counterpart of [`Report`]: use it at
/// logging sites where the error is about to be propagated or dropped.
pub trait ErrorReport: StdError {
    /// Wrap this error in an adapter that `Display`s it together with
    /// its chain of sources.
    fn report(&self) -> ReportHelper<'_>;
}

impl<E: StdError + 'static> ErrorReport for E {
    fn report(&self) -> ReportHelper<'_> {
        ReportHelper(self)
    }
}

/// Display adapter returned by [`ErrorReport::report`].
#[derive(Clone, Copy)]
pub struct ReportHelper<'a>(&'a dyn StdError);

impl Display for ReportHelper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_error_chain(self.0, f)
    }
}

impl Debug for ReportHelper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::io;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("queue stalled")]
    struct OuterError {
        #[from]
        source: Box<dyn StdError>,
    }

    #[derive(Error, Debug)]
    #[error("slot table poisoned")]
    struct InnerError;

    fn chk<E: StdError + 'static>(e: E, expected: &str) {
        let boxed: Box<dyn StdError> = Box::new(e);
        let got = Report(&boxed).to_string();
        assert_eq!(got, expected, "\nmismatch: {:?}", &boxed);
    }

    #[test]
    fn chains() {
        chk(InnerError, "error: slot table poisoned");

        chk(
            OuterError {
                source: InnerError.into(),
            },
            "error: queue stalled: slot table poisoned",
        );

        chk(
            io::Error::new(io::ErrorKind::Other, InnerError),
            "error: slot table poisoned",
        );
    }

    #[test]
    fn borrowed_report() {
        let e = OuterError {
            source: InnerError.into(),
        };
        assert_eq!(
            e.report().to_string(),
            "error: queue stalled: slot table poisoned"
        );
    }
}
