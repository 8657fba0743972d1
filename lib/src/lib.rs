// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A library for requesting individual GPIO lines on Linux platforms
//! using the GPIO character device.
//!
//! A [`Device`] owns an open GPIO chip and hands out one [`LineHandle`] per
//! requested line offset.  Lines may be requested as outputs, inputs or
//! edge detecting inputs, and edge events are delivered through a
//! [`Subscription`] that can be cancelled with a [`CancelToken`].
//!
//! ```no_run
//! # use pingo::Result;
//! use pingo::line::{EdgeDetection, Value};
//! use pingo::{CancelToken, Device};
//!
//! # fn main() -> Result<()> {
//! let device = Device::open("/dev/gpiochip0")?;
//! let led = device.request_output(22)?;
//! led.set(Value::Active)?;
//!
//! let button = device.request_interrupt(17, EdgeDetection::FallingEdge)?;
//! let cancel = CancelToken::new()?;
//! for event in button.subscribe(&cancel)? {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

use nix::errno::Errno;
use pingo_uapi as uapi;
#[cfg(feature = "serde")]
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;

mod device;
pub use device::{Builder, ChipInfo, Device, DEFAULT_CHIP, DEFAULT_CONSUMER};

mod handle;
pub use handle::LineHandle;

/// Types describing lines, their values and their edge events.
pub mod line;

mod listener;
pub use listener::{CancelToken, Subscription};

mod request;

/// The uAPI ABI versions available to interact with the kernel.
///
/// Two versions of the Linux GPIO uAPI ABI currently exist, with v1 being released in
/// Linux v4.8 and v2 being released in Linux v5.10.
///
/// * `V2` is the current ABI and is preferred when the kernel supports it.
/// * `V1` is deprecated, but is still the only ABI available on older kernels.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AbiVersion {
    V1,
    #[default]
    V2,
}

impl fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiVersion::V1 => write!(f, "uAPI ABI v1"),
            AbiVersion::V2 => write!(f, "uAPI ABI v2"),
        }
    }
}

/// Errors returned by [`pingo`] functions.
///
/// [`pingo`]: crate
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum Error {
    /// The GPIO chip could not be opened.
    #[error("\"{}\" {}.", .0.display(), .1)]
    ChipOpenFailed(PathBuf, OpenErrorKind),

    /// The line is already requested from this device.
    #[error("line {0} is already in use")]
    LineAlreadyInUse(line::Offset),

    /// The kernel rejected a uAPI call.
    #[error("uAPI {0} returned: {1}")]
    IoctlFailed(UapiCall, Errno),

    /// The line was not requested with edge detection so cannot be subscribed to.
    #[error("line {0} is not configured for edge detection")]
    NotInterruptCapable(line::Offset),

    /// The line was not requested as an output so cannot be set.
    #[error("line {0} is not an output")]
    NotWritable(line::Offset),

    /// The line already has an active subscription.
    #[error("line {0} already has an active subscription")]
    AlreadySubscribed(line::Offset),

    /// An event record read from a line could not be decoded.
    #[error("malformed event: {0}")]
    EventDecodeError(String),

    /// The event stream has terminated and will deliver no further events.
    #[error("event stream closed")]
    EventStreamClosed,

    /// An error returned when there is a problem with an argument.
    #[error("{0}")]
    InvalidArgument(String),

    /// The response to a uAPI call contained unexpected content.
    #[error("uAPI {0} returned unexpected content: {1}")]
    UnexpectedResponse(UapiCall, String),

    /// The kernel does not support the requested ABI version on the chip.
    #[error("{0} is not supported by the kernel.")]
    UnsupportedAbi(AbiVersion),

    /// The chip supports neither ABI version.
    #[error("\"{}\" does not support any uAPI ABI version.", .0.display())]
    NoAbiSupport(PathBuf),

    /// An error returned from an underlying os call.
    #[error(transparent)]
    OsError(#[from] Errno),
}

impl Error {
    /// The raw errno of a failed system call, if that is the cause of the error.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::IoctlFailed(_, e) | Error::OsError(e) => Some(*e as i32),
            _ => None,
        }
    }

    pub(crate) fn uapi(call: UapiCall, e: uapi::Error) -> Error {
        match e {
            uapi::Error::Os(errno) => Error::IoctlFailed(call, errno),
            e => Error::UnexpectedResponse(call, e.to_string()),
        }
    }
}

/// Identifiers for the underlying uAPI calls.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum UapiCall {
    GetChipInfo,
    GetLine,
    GetLineEvent,
    GetLineHandle,
    GetLineValues,
    ReadEvent,
    SetLineValues,
}

impl fmt::Display for UapiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UapiCall::GetChipInfo => "get_chip_info",
            UapiCall::GetLine => "get_line",
            UapiCall::GetLineEvent => "get_line_event",
            UapiCall::GetLineHandle => "get_line_handle",
            UapiCall::GetLineValues => "get_line_values",
            UapiCall::ReadEvent => "read_event",
            UapiCall::SetLineValues => "set_line_values",
        };
        write!(f, "{}", name)
    }
}

/// Reasons a chip could not be opened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenErrorKind {
    /// The path could not be opened for read and write.
    Io(io::ErrorKind),

    /// The path is not a character device.
    NotCharacterDevice,
}

impl fmt::Display for OpenErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenErrorKind::Io(kind) => write!(f, "could not be opened: {}", io::Error::from(*kind)),
            OpenErrorKind::NotCharacterDevice => write!(f, "is not a character device"),
        }
    }
}

/// The result for [`pingo`] functions.
///
/// [`pingo`]: crate
pub type Result<T> = std::result::Result<T, Error>;
