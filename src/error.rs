//! Failure taxonomy of the collector.
//!
//! Almost everything that can go wrong inside the runtime is a logic or memory safety bug
//! and ends the process through [fatal]. The only values that travel back to callers are
//! the interconnect and transfer errors and the result of [try_fill_gap](crate::filler::try_fill_gap).

use std::panic::Location;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GcError {
    #[error("heap corruption: {message}")]
    HeapCorruption { message: String },
    #[error(
        "out of memory: need {needed} bytes but the heap can grow to at most {limit} bytes"
    )]
    ResourceExhaustion { needed: usize, limit: usize },
}

impl GcError {
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::HeapCorruption {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InterconnectError {
    #[error("node {0} is not connected")]
    UnknownNode(usize),
    #[error("peer {0} hung up")]
    Disconnected(usize),
    #[error("expected {expected} bytes from node {node}, got {actual}")]
    SizeMismatch {
        node: usize,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Interconnect(#[from] InterconnectError),
    #[error("malformed control packet: closure size {0} is not word aligned")]
    MalformedPacket(usize),
    #[error("cannot send an object to its own node {0}")]
    SelfSend(usize),
    #[error("reference {target:#x} outside the closure at {remote_base:#x} ({closure_size} bytes)")]
    DanglingReference {
        target: usize,
        remote_base: usize,
        closure_size: usize,
    },
}

/// Reports `err` with the caller's location and a backtrace, then aborts the process.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(err: GcError) -> ! {
    let location = Location::caller();
    log::error!("{}:{}: {}", location.file(), location.line(), err);
    eprintln!("[GC: fatal at {}:{}: {}]", location.file(), location.line(), err);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort()
}

/// Aborts with a [GcError::HeapCorruption] when `cond` does not hold.
#[macro_export]
macro_rules! gc_assert {
    ($cond: expr) => {
        if !$cond {
            $crate::error::fatal($crate::error::GcError::corruption(concat!(
                "assertion failed: ",
                stringify!($cond)
            )));
        }
    };
    ($cond: expr, $($t:tt)*) => {
        if !$cond {
            $crate::error::fatal($crate::error::GcError::corruption(format!($($t)*)));
        }
    };
}
