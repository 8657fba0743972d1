// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bitflags::bitflags;
use std::fmt;
use std::fs::File;
use std::mem::size_of;
use std::os::unix::prelude::{AsRawFd, FromRawFd};

use super::common::{bytes_of, iorw, ValidationResult};

pub use super::common::{
    get_chip_info, ChipInfo, LineEdgeEventKind, Offset, Offsets, Padding, UnderReadError,
    ValidationError,
};
use super::{Error, Name, Result};

#[repr(u8)]
enum Ioctl {
    GetLineInfo = 5,
    GetLine = 7,
    GetLineValues = 0xE,
    SetLineValues = 0xF,
}

bitflags! {
    /// Line configuration flags, as requested or as reported in [`LineInfo`].
    ///
    /// Bits the kernel reports that are not named here are retained.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct LineFlags: u64 {
        /// Held by some consumer.
        const USED = 1;
        /// Active when physically low.
        const ACTIVE_LOW = 2;
        /// Direction is input.
        const INPUT = 4;
        /// Direction is output.
        const OUTPUT = 8;
        /// Reports *inactive* to *active* transitions.
        const EDGE_RISING = 16;
        /// Reports *active* to *inactive* transitions.
        const EDGE_FALLING = 32;
    }
}

/// A bitmap of line values for a request, indexed by position in
/// [`LineRequest::offsets`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LineValues {
    /// 1 for *active*, 0 for *inactive*.
    pub bits: u64,

    /// The lines the get or set applies to.
    pub mask: u64,
}

impl LineValues {
    /// The value at `idx`, or None if `idx` is not in the mask.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<bool> {
        debug_assert!(idx < 64);
        let bit = 1u64 << idx;
        (self.mask & bit != 0).then_some(self.bits & bit != 0)
    }

    /// Select `idx` and record its value.
    #[inline]
    pub fn set(&mut self, idx: usize, active: bool) {
        debug_assert!(idx < 64);
        let bit = 1u64 << idx;
        self.mask |= bit;
        self.bits = if active {
            self.bits | bit
        } else {
            self.bits & !bit
        };
    }

    /// The raw image of the values as passed to the kernel.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: two u64s, no padding.
        unsafe { bytes_of(self) }
    }
}

/// Read the masked values from a line request file returned by [`get_line`].
#[inline]
pub fn get_line_values(lf: &File, lv: &mut LineValues) -> Result<()> {
    // SAFETY: the kernel only writes the two u64s.
    match unsafe { libc::ioctl(lf.as_raw_fd(), iorw!(Ioctl::GetLineValues, LineValues), lv) } {
        0 => Ok(()),
        _ => Err(Error::from_errno()),
    }
}

/// Drive the masked values on a line request file returned by [`get_line`].
#[inline]
pub fn set_line_values(lf: &File, lv: &LineValues) -> Result<()> {
    // SAFETY: lv is only read.
    match unsafe { libc::ioctl(lf.as_raw_fd(), iorw!(Ioctl::SetLineValues, LineValues), lv) } {
        0 => Ok(()),
        _ => Err(Error::from_errno()),
    }
}

/// Which member of [`LineAttributeValueUnion`] an attribute holds.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LineAttributeKind {
    /// Empty slot.
    #[default]
    Unused = 0,
    /// `flags`.
    Flags = 1,
    /// `values`.
    Values = 2,
    /// `debounce_period_us`.
    Debounce = 3,
}

impl TryFrom<u32> for LineAttributeKind {
    type Error = String;

    fn try_from(v: u32) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(LineAttributeKind::Unused),
            1 => Ok(LineAttributeKind::Flags),
            2 => Ok(LineAttributeKind::Values),
            3 => Ok(LineAttributeKind::Debounce),
            x => Err(format!("invalid value: {x}")),
        }
    }
}

/// A tagged line attribute.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct LineAttribute {
    /// Selects the member of `value` in use.
    pub kind: LineAttributeKind,

    #[doc(hidden)]
    pub padding: Padding<1>,

    /// The attribute payload.
    pub value: LineAttributeValueUnion,
}

impl LineAttribute {
    /// Make this a flags attribute.
    pub fn set_flags(&mut self, flags: LineFlags) {
        self.kind = LineAttributeKind::Flags;
        self.value.flags = flags;
    }

    // The union is always written in full, by set_flags, Default or the kernel.
    fn raw(&self) -> u64 {
        // SAFETY: every member is plain data and the full 8 bytes are initialized.
        unsafe { self.value.values }
    }
}

impl fmt::Debug for LineAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {:#x}", self.kind, self.raw())
    }
}

impl PartialEq for LineAttribute {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && (self.kind == LineAttributeKind::Unused || self.raw() == other.raw())
    }
}
impl Eq for LineAttribute {}

/// The payload of a [`LineAttribute`].
#[repr(C)]
#[derive(Clone, Copy)]
pub union LineAttributeValueUnion {
    pub flags: LineFlags,
    pub values: u64,
    pub debounce_period_us: u32,
}

impl Default for LineAttributeValueUnion {
    fn default() -> Self {
        LineAttributeValueUnion { values: 0 }
    }
}

/// An attribute applied to the requested lines selected by `mask`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LineConfigAttribute {
    pub attr: LineAttribute,
    pub mask: u64,
}

/// The attribute slots of a [`LineConfig`].
///
/// The lowest slot selecting a line wins, and a flags attribute replaces
/// [`LineConfig::flags`] for the lines it selects.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct LineConfigAttributes(pub [LineConfigAttribute; NUM_ATTRS_MAX]);

/// Configuration sent with a [`LineRequest`].
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct LineConfig {
    /// Flags for every requested line not selected by an attribute.
    pub flags: LineFlags,

    /// The number of slots in use in `attrs`.
    pub num_attrs: u32,

    #[doc(hidden)]
    pub padding: Padding<5>,

    pub attrs: LineConfigAttributes,
}

impl LineConfig {
    /// Append a flags attribute covering the lines selected by `mask`.
    ///
    /// The flags replace `flags` for those lines, so they must carry the
    /// direction as well as any edges.
    pub fn add_flags(&mut self, lf: LineFlags, mask: u64) {
        let lca = &mut self.attrs.0[self.num_attrs as usize];
        lca.mask = mask;
        lca.attr.set_flags(lf);
        self.num_attrs += 1;
    }
}

/// A request for lines, passed to [`get_line`].
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct LineRequest {
    /// The requested offsets, the first `num_lines` of which are used.
    pub offsets: Offsets,

    /// The consumer label applied to the lines.
    pub consumer: Name,

    pub config: LineConfig,

    pub num_lines: u32,

    /// Event buffer size hint; zero selects the kernel default.
    pub event_buffer_size: u32,

    #[doc(hidden)]
    pub padding: Padding<5>,

    // Filled by the kernel.
    #[doc(hidden)]
    pub fd: i32,
}

impl LineRequest {
    /// The raw image of the request as passed to the kernel.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the struct is repr(C) with no implicit padding and the
        // attribute unions are always fully initialized.
        unsafe { bytes_of(self) }
    }
}

/// Request lines from the chip, returning the file for the requested lines.
#[inline]
pub fn get_line(cf: &File, mut lr: LineRequest) -> Result<File> {
    // SAFETY: on success the kernel hands over ownership of lr.fd.
    unsafe {
        match libc::ioctl(cf.as_raw_fd(), iorw!(Ioctl::GetLine, LineRequest), &mut lr) {
            0 => Ok(File::from_raw_fd(lr.fd)),
            _ => Err(Error::from_errno()),
        }
    }
}

/// The attribute slots reported in [`LineInfo`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LineAttributes([LineAttribute; NUM_ATTRS_MAX]);

/// The number of attribute slots in [`LineAttributes`] and [`LineConfigAttributes`].
pub const NUM_ATTRS_MAX: usize = 10;

/// The state of a line as reported by [`get_line_info`].
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LineInfo {
    /// The name given to the line by the chip, possibly empty.
    pub name: Name,

    /// The label of the current consumer, empty if unused.
    pub consumer: Name,

    pub offset: Offset,

    /// The number of slots in use in `attrs`.
    pub num_attrs: u32,

    pub flags: LineFlags,

    pub attrs: LineAttributes,

    #[doc(hidden)]
    pub padding: Padding<4>,
}

impl LineInfo {
    fn validate(&self) -> ValidationResult {
        if self.num_attrs > NUM_ATTRS_MAX as u32 {
            return Err(ValidationError::new(
                "num_attrs",
                format!("out of range: {}", self.num_attrs),
            ));
        }
        for (i, attr) in self.attrs.0.iter().enumerate() {
            LineAttributeKind::try_from(attr.kind as u32)
                .map_err(|e| ValidationError::new(format!("attrs[{i}].kind"), e))?;
        }
        Ok(())
    }
}

/// Read the state of the line at `offset`.
///
/// Succeeds on any chip that supports ABI v2.
#[inline]
pub fn get_line_info(cf: &File, offset: Offset) -> Result<LineInfo> {
    let mut li = LineInfo {
        offset,
        ..Default::default()
    };
    // SAFETY: the returned struct is validated before use.
    match unsafe { libc::ioctl(cf.as_raw_fd(), iorw!(Ioctl::GetLineInfo, LineInfo), &mut li) } {
        0 => li.validate().map(|_| li).map_err(Error::from),
        _ => Err(Error::from_errno()),
    }
}

/// An edge event as read from a line request file.
#[repr(C)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineEdgeEvent {
    /// **CLOCK_MONOTONIC** time of the edge, in nanoseconds.
    pub timestamp_ns: u64,

    /// The raw edge code, see [`LineEdgeEvent::kind`].
    pub id: u32,

    pub offset: Offset,

    /// Position in the events of every line in the request.
    pub seqno: u32,

    /// Position in the events of this line.
    pub line_seqno: u32,

    #[doc(hidden)]
    pub padding: Padding<6>,
}

impl LineEdgeEvent {
    /// View the start of `d` as an event record.
    ///
    /// Fails with [`Error::UnderRead`] if `d` is shorter than a record.
    #[inline]
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
