// Copyright (c) 2026 The netstack developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// Error kinds reported by the stack.
///
/// Errors detected inside the protocol worker never unwind into a caller;
/// the worker transitions the affected PCB to CLOSED and wakes any parked
/// task, which then reports the terminal kind (`ConnectionReset`,
/// `TimedOut`, ...) from its own call frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	#[error("invalid argument")]
	BadArgument,
	#[error("out of control blocks")]
	NoMemory,
	#[error("no route to host")]
	NoRoute,
	#[error("host unreachable")]
	Unreachable,
	#[error("address already in use")]
	InUse,
	#[error("connection closed")]
	Closed,
	#[error("interrupted")]
	Interrupted,
	#[error("connection reset by peer")]
	ConnectionReset,
	#[error("connection timed out")]
	TimedOut,
	#[error("protocol error")]
	Protocol,
	#[error("device failure")]
	Device,
}

pub type Result<T> = core::result::Result<T, Error>;
