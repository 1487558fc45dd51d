// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Errors, using [`failure`][failure].
//!
//! [failure]: https://crates.io/crates/failure

use failure::Error;
use std::process::ExitStatus;

/// Result type used throughout the crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Errors raised while synchronizing a table with the kernel.
#[derive(Debug, Fail)]
pub enum SyncError {
    /// The save utility exited non-zero, leaving the dataplane state unknown.
    #[fail(
        display = "'{}' exited with {} while reading table state: {}",
        command, status, stderr
    )]
    DataplaneReadFailed {
        /// The save command that was executed.
        command: String,
        /// The exit status of the save command.
        status: ExitStatus,
        /// Captured standard error of the save command.
        stderr: String,
    },

    /// The restore utility rejected the submitted transaction.
    ///
    /// Expected to happen occasionally when another process modifies the
    /// table concurrently; the apply driver retries on this.
    #[fail(
        display = "'{}' exited with {} while programming table: {}",
        command, status, stderr
    )]
    DataplaneWriteFailed {
        /// The restore command that was executed.
        command: String,
        /// The exit status of the restore command.
        status: ExitStatus,
        /// Captured standard error of the restore command.
        stderr: String,
    },

    /// Every apply attempt within the retry budget failed.
    #[fail(
        display = "failed to update table '{}' after {} attempts, last error: {}",
        table, attempts, last_error
    )]
    RetriesExhausted {
        /// Name of the table that could not be updated.
        table: String,
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Rendering of the error returned by the final attempt.
        last_error: String,
    },

    /// A chain was marked dirty but is known neither as a desired chain nor
    /// as a programmed one. This indicates a bug in the state bookkeeping.
    #[fail(
        display = "dirty chain '{}' is neither desired nor programmed",
        chain
    )]
    InconsistentState {
        /// Name of the unaccounted-for chain.
        chain: String,
    },

    /// The given table name is not a known kernel table.
    #[fail(display = "unknown table '{}'", table)]
    UnknownTable {
        /// The rejected table name.
        table: String,
    },
}
