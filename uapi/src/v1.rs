// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bitflags::bitflags;
use std::fs::File;
use std::mem::size_of;
use std::os::unix::prelude::{AsRawFd, FromRawFd};

use super::common::{bytes_of, iorw};

pub use super::common::{
    get_chip_info, ChipInfo, LineEdgeEventKind, Offset, Offsets, Padding, UnderReadError,
    ValidationError,
};
use super::{Error, Name, Result};

#[repr(u8)]
enum Ioctl {
    GetLineInfo = 2,
    GetLineHandle = 3,
    GetLineEvent = 4,
    GetLineValues = 8,
    SetLineValues = 9,
}

/// The state of a line as reported by [`get_line_info`].
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LineInfo {
    pub offset: Offset,

    pub flags: LineInfoFlags,

    /// The name given to the line by the chip, possibly empty.
    pub name: Name,

    /// The label of the current consumer, empty if unused.
    pub consumer: Name,
}

bitflags! {
    /// Line state flags reported in [`LineInfo`].
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct LineInfoFlags: u32 {
        /// Held by some consumer.
        const USED = 1;
        /// Direction is output.
        const OUTPUT = 2;
        /// Active when physically low.
        const ACTIVE_LOW = 4;
    }
}

/// Read the state of the line at `offset`.
///
/// Succeeds on any chip that supports ABI v1.
pub fn get_line_info(cf: &File, offset: Offset) -> Result<LineInfo> {
    let mut li = LineInfo {
        offset,
        ..Default::default()
    };
    // SAFETY: the kernel fills plain integers and byte arrays.
    match unsafe { libc::ioctl(cf.as_raw_fd(), iorw!(Ioctl::GetLineInfo, LineInfo), &mut li) } {
        0 => Ok(li),
        _ => Err(Error::from_errno()),
    }
}

/// A request for lines without edge detection, passed to [`get_line_handle`].
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HandleRequest {
    /// The requested offsets, the first `num_lines` of which are used.
    pub offsets: Offsets,

    pub flags: HandleRequestFlags,

    /// Initial values, used only with [`HandleRequestFlags::OUTPUT`].
    pub values: LineValues,

    /// The consumer label applied to the lines.
    pub consumer: Name,

    pub num_lines: u32,

    // Filled by the kernel.
    #[doc(hidden)]
    pub fd: i32,
}

impl HandleRequest {
    /// The raw image of the request as passed to the kernel.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the struct is repr(C) with no implicit padding.
        unsafe { bytes_of(self) }
    }
}

bitflags! {
    /// Direction of the lines in a [`HandleRequest`] or [`EventRequest`].
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct HandleRequestFlags: u32 {
        const INPUT = 1;
        const OUTPUT = 2;
    }
}

/// Request lines from the chip, returning the file for the requested lines.
pub fn get_line_handle(cf: &File, mut hr: HandleRequest) -> Result<File> {
    // SAFETY: on success the kernel hands over ownership of hr.fd.
    unsafe {
        match libc::ioctl(cf.as_raw_fd(), iorw!(Ioctl::GetLineHandle, HandleRequest), &mut hr) {
            0 => Ok(File::from_raw_fd(hr.fd)),
            _ => Err(Error::from_errno()),
        }
    }
}

/// One byte per requested line, indexed by position in
/// [`HandleRequest::offsets`].
///
/// Zero is *inactive* and anything else *active*.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LineValues([u8; 64usize]);

impl LineValues {
    /// Values from the leading bytes of `s`, the rest zero.
    pub fn from_slice(s: &[u8]) -> Self {
        let mut n = LineValues::default();
        let len = s.len().min(n.0.len());
        n.0[..len].copy_from_slice(&s[..len]);
        n
    }

    #[inline]
    pub fn get(&self, idx: usize) -> u8 {
        self.0[idx]
    }

    #[inline]
    pub fn set(&mut self, idx: usize, value: u8) {
        self.0[idx] = value;
    }

    /// The raw image of the values as passed to the kernel.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for LineValues {
    fn default() -> Self {
        LineValues([0; 64])
    }
}

/// Read the values of the lines held by a handle or event request file.
pub fn get_line_values(lf: &File, vals: &mut LineValues) -> Result<()> {
    // SAFETY: the kernel fills at most the 64 bytes.
    match unsafe {
        libc::ioctl(
            lf.as_raw_fd(),
            iorw!(Ioctl::GetLineValues, LineValues),
            vals.0.as_mut_ptr(),
        )
    } {
        0 => Ok(()),
        _ => Err(Error::from_errno()),
    }
}

/// Drive the values of the lines held by a handle request file.
pub fn set_line_values(lf: &File, vals: &LineValues) -> Result<()> {
    // SAFETY: vals is only read.
    match unsafe {
        libc::ioctl(
            lf.as_raw_fd(),
            iorw!(Ioctl::SetLineValues, LineValues),
            vals.0.as_ptr(),
        )
    } {
        0 => Ok(()),
        _ => Err(Error::from_errno()),
    }
}

/// A request for one line with edge detection, passed to [`get_line_event`].
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EventRequest {
    pub offset: Offset,

    pub handleflags: HandleRequestFlags,

    pub eventflags: EventRequestFlags,

    /// The consumer label applied to the line.
    pub consumer: Name,

    // Filled by the kernel.
    #[doc(hidden)]
    pub fd: i32,
}

impl EventRequest {
    /// The raw image of the request as passed to the kernel.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the struct is repr(C) with no implicit padding.
        unsafe { bytes_of(self) }
    }
}

bitflags! {
    /// The edges reported for an [`EventRequest`].
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct EventRequestFlags: u32 {
        const RISING_EDGE = 1;
        const FALLING_EDGE = 2;
        const BOTH_EDGES = Self::RISING_EDGE.bits() | Self::FALLING_EDGE.bits();
    }
}

/// Request a line with edge detection, returning the file to read events from.
pub fn get_line_event(cf: &File, mut er: EventRequest) -> Result<File> {
    // SAFETY: on success the kernel hands over ownership of er.fd.
    unsafe {
        match libc::ioctl(cf.as_raw_fd(), iorw!(Ioctl::GetLineEvent, EventRequest), &mut er) {
            0 => Ok(File::from_raw_fd(er.fd)),
            _ => Err(Error::from_errno()),
        }
    }
}

/// An edge event as read from an event request file.
///
/// The record carries neither the offset nor sequence numbers.
#[repr(C)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineEdgeEvent {
    /// Time of the edge, in nanoseconds.
    pub timestamp_ns: u64,

    /// The raw edge code, see [`LineEdgeEvent::kind`].
    pub id: u32,

    // Tail padding in the C struct, made explicit.
    #[doc(hidden)]
    pub padding: Padding<1>,
}

impl LineEdgeEvent {
    /// View the start of `d` as an event record.
    ///
    /// Fails with [`Error::UnderRead`] if `d` is shorter than a record.
    pub fn from_slice(d: &[u64]) -> Result<&LineEdgeEvent> {
        let len = d.len() * 8;
        if len < size_of::<LineEdgeEvent>() {
            return Err(Error::from(UnderReadError::new(
                "LineEdgeEvent",
                size_of::<LineEdgeEvent>(),
                len,
            )));
        }
        // SAFETY: every bit pattern is a valid LineEdgeEvent and the buffer is u64 aligned.
        Ok(unsafe { &*(d.as_ptr() as *const LineEdgeEvent) })
    }

    /// The decoded edge code.
    pub fn kind(&self) -> std::result::Result<LineEdgeEventKind, ValidationError> {
        LineEdgeEventKind::try_from(self.id).map_err(|e| ValidationError::new("id", e))
    }

    /// The record size in u64 words.
    pub fn u64_size() -> usize {
        size_of::<LineEdgeEvent>() / 8
    }
}
