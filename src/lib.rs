//! emx-testcmd: child-process fixtures for unit tests
//!
//! Inspired by the `testbasher` Go package: keep short auxiliary scripts next
//! to the test using them, run them, and talk to them over stdio.
//!
//! # Overview
//!
//! A [`TestCommand`] starts a child process and exchanges values with it:
//! the child writes JSON values, one per line, to its stdout; the test reads
//! them with [`TestCommand::decode`]. The test hands lines to the child with
//! [`TestCommand::tell`] and lets a waiting child continue with
//! [`TestCommand::proceed`]. [`TestCommand::close`] (or dropping the command)
//! shuts the child down, killing it when it does not exit within its grace
//! period.
//!
//! ```rust,ignore
//! let cmd = TestCommand::new("/bin/sh", ["-c", r#"echo '"ready"' && read _"#]);
//! let state: String = cmd.decode();
//! assert_eq!(state, "ready");
//! cmd.close();
//! ```
//!
//! When the child writes something that is not valid JSON, `decode` panics
//! with the input read for the failed value, the offending character marked
//! `►like this◄`, followed by everything the child wrote to stderr.
//!
//! # Building blocks
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ReplayBuffer`] | Reader remembering what was read since the last checkpoint |
//! | [`Decoder`] | JSON stream decoder with input snippets in its errors |
//! | [`TestCommand`] | The child process fixture |

mod decoder;
mod error;
mod memento;
mod stderr;
mod testcmd;

pub use decoder::{Decoder, CONTEXT_MARGIN};
pub use error::{DecodeError, DecodeErrorKind};
pub use memento::ReplayBuffer;
pub use testcmd::{TestCommand, TestCommandBuilder, DEFAULT_GRACE, GRACE_ENV};
