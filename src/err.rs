//! Errors of the runtime's setup surface.
//!
//! Only calls made while bringing the runtime up or tearing it down
//! return `Result`: option parsing, transport construction, window
//! creation.  Once workers are scheduling, a failure is unrecoverable by
//! design and goes through [`fatal!`], which never unwinds across task
//! frames on the callstack.
///
/// Copyright (c) 2020, Institute for Defense Analyses
/// 4850 Mark Center Drive, Alexandria, VA 22311-1882; 703-845-2500
///
/// All rights reserved.
///
/// This file is part of Portage, a PGAS tasking runtime for rust.  For
/// licence information see the LICENSE file in the top level dirctory
/// of the distribution.

/// A setup-time failure
#[derive(Debug)]
pub enum Error {
    /// an operating-system error surfaced by the standard library
    Io(std::io::Error),
    /// `init()` after the last `fini()` already finalized the native
    /// transport, which cannot be brought up twice in one process
    NewAfterDrop,
    /// a `PORTAGE_`-prefixed environment variable held a value that
    /// does not parse, or parsed into an unusable configuration
    InvalidOption {
        /// the variable that was set
        name: String,
        /// the value it held
        value: String,
    },
    /// a rank argument lies outside `0..n_ranks()`
    InvalidRank,
    /// an offset or length reaches past the end of a registered window
    BoundsExceeded,
    /// a registered window could not be placed at the required alignment
    WindowAlignment,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => err.fmt(f),
            Error::NewAfterDrop => {
                write!(f, "the transport cannot be initialized again after finalization")
            }
            Error::InvalidOption { name, value } => {
                write!(f, "{} is set to {:?}, which does not parse", name, value)
            }
            Error::InvalidRank => write!(f, "rank is not within the process group"),
            Error::BoundsExceeded => write!(f, "offset or length reaches past a window"),
            Error::WindowAlignment => write!(f, "window alignment requirement not met"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

/// Unrecoverable runtime conditions abort the job with a diagnostic
/// rather than unwinding through task frames on the callstack.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!("portage: fatal: {}", format_args!($($arg)*));
        std::process::abort();
    }};
}
pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_option() {
        let e = Error::InvalidOption {
            name: "PORTAGE_STACK_SIZE".to_string(),
            value: "tiny".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains("PORTAGE_STACK_SIZE"));
        assert!(msg.contains("tiny"));
    }

    #[test]
    fn io_errors_keep_their_source() {
        use std::error::Error as _;
        let e = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(e.source().is_some());
        assert!(Error::NewAfterDrop.source().is_none());
    }
}
