// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::{Error, Result};
use pingo_uapi::LineEdgeEventKind;
#[cfg(feature = "serde")]
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// An identifier for a line on a particular chip.
///
/// Valid offsets are in the range 0..`num_lines` as reported in the chip info.
pub type Offset = u32;

/// The logical value of a line.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Value {
    /// The line is inactive.
    #[default]
    Inactive,
    /// The line is active.
    Active,
}

impl Value {
    /// The value opposite the current value.
    pub fn not(&self) -> Value {
        match self {
            Value::Active => Value::Inactive,
            Value::Inactive => Value::Active,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Value::Active => "active",
            Value::Inactive => "inactive",
        };
        write!(f, "{}", s)
    }
}

impl From<Value> for bool {
    fn from(v: Value) -> bool {
        match v {
            Value::Inactive => false,
            Value::Active => true,
        }
    }
}

impl From<Value> for u8 {
    fn from(v: Value) -> u8 {
        match v {
            Value::Inactive => 0,
            Value::Active => 1,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        match b {
            false => Value::Inactive,
            true => Value::Active,
        }
    }
}

/// Zero is inactive, anything else is active.
impl From<u8> for Value {
    fn from(i: u8) -> Value {
        match i {
            0 => Value::Inactive,
            _ => Value::Active,
        }
    }
}

/// The mode a line was requested in.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Mode {
    /// The line is an input that may be read.
    Input,

    /// The line is an output that may be set and read back.
    Output,

    /// The line is an input with edge detection enabled.
    InterruptInput,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Input => "input",
            Mode::Output => "output",
            Mode::InterruptInput => "interrupt input",
        };
        write!(f, "{}", s)
    }
}

/// The edge detection options for an input line.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EdgeDetection {
    /// Edge detection is only enabled on rising edges.
    ///
    /// A rising edge means a transition from an inactive state to an active state.
    RisingEdge = 1,

    /// Edge detection is only enabled on falling edges.
    ///
    /// A falling edge means a transition from an active state to an inactive state.
    FallingEdge = 2,

    /// Edge detection is enabled on both rising and falling edges.
    BothEdges = 3,
}

/// Parse the raw edge codes, 1 rising, 2 falling and 3 both.
impl TryFrom<u8> for EdgeDetection {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        use EdgeDetection::*;
        Ok(match v {
            x if x == RisingEdge as u8 => RisingEdge,
            x if x == FallingEdge as u8 => FallingEdge,
            x if x == BothEdges as u8 => BothEdges,
            x => {
                return Err(Error::InvalidArgument(format!(
                    "invalid edge detection: {x}"
                )))
            }
        })
    }
}

/// The cause of an [`EdgeEvent`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EdgeKind {
    /// Indicates the line transitioned from inactive to active.
    Rising,

    /// Indicates the line transitioned from active to inactive.
    Falling,

    /// The kernel reported a kind that is not understood.
    ///
    /// Contains the raw kind.
    Unknown(u32),
}

impl From<u32> for EdgeKind {
    fn from(id: u32) -> Self {
        match LineEdgeEventKind::try_from(id) {
            Ok(LineEdgeEventKind::RisingEdge) => EdgeKind::Rising,
            Ok(LineEdgeEventKind::FallingEdge) => EdgeKind::Falling,
            Err(_) => EdgeKind::Unknown(id),
        }
    }
}

/// The details of an edge detected on an input line.
///
/// ABI v1 does not provide the seqno nor line_seqno fields, so they are zero.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EdgeEvent {
    /// The best estimate of time of event occurrence, in nanoseconds.
    ///
    /// Read from **CLOCK_MONOTONIC** so only suitable for comparing the
    /// times of events.
    pub timestamp_ns: u64,

    /// The event trigger identifier.
    pub kind: EdgeKind,

    /// The offset of the line that triggered the event.
    pub offset: Offset,

    /// The sequence number for this event in the sequence of events for all
    /// the lines in the request.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "is_zero", default))]
    pub seqno: u32,

    /// The sequence number for this event in the sequence of events on this
    /// particular line.
    #[cfg_attr(
        feature = "serde",
        serde(rename = "lineSeqno", skip_serializing_if = "is_zero", default)
    )]
    pub line_seqno: u32,
}

#[cfg(feature = "serde")]
fn is_zero(u: &u32) -> bool {
    *u == 0
}
