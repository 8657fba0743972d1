// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::line::{EdgeDetection, EdgeEvent, EdgeKind, Offset, Value};
use crate::{AbiVersion, Error, Result, UapiCall};
use pingo_uapi::{v1, v2, Offsets};
use std::fs::File;

/// The kernel request for a single line, encoded for one ABI version.
///
/// Built fresh for each request and consumed by [`LineRequest::request`].
#[derive(Clone, Debug)]
pub(crate) enum LineRequest {
    HandleV1(v1::HandleRequest),
    EventV1(v1::EventRequest),
    V2(v2::LineRequest),
}

impl LineRequest {
    /// A request for the line as an output, initially inactive.
    pub(crate) fn output(abiv: AbiVersion, offset: Offset, consumer: &str) -> LineRequest {
        match abiv {
            AbiVersion::V1 => Self::handle_v1(offset, v1::HandleRequestFlags::OUTPUT, consumer),
            AbiVersion::V2 => Self::line_v2(offset, v2::LineFlags::OUTPUT, consumer),
        }
    }

    /// A request for the line as an input.
    pub(crate) fn input(abiv: AbiVersion, offset: Offset, consumer: &str) -> LineRequest {
        match abiv {
            AbiVersion::V1 => Self::handle_v1(offset, v1::HandleRequestFlags::INPUT, consumer),
            AbiVersion::V2 => Self::line_v2(offset, v2::LineFlags::INPUT, consumer),
        }
    }

    /// A request for the line as an input with edge detection enabled.
    pub(crate) fn interrupt(
        abiv: AbiVersion,
        offset: Offset,
        edge: EdgeDetection,
        consumer: &str,
    ) -> LineRequest {
        match abiv {
            AbiVersion::V1 => LineRequest::EventV1(v1::EventRequest {
                offset,
                handleflags: v1::HandleRequestFlags::INPUT,
                eventflags: event_flags_v1(edge),
                consumer: consumer.into(),
                ..Default::default()
            }),
            // The kernel takes the first flags attribute matching a line in
            // place of config.flags, so direction and edges must travel together.
            AbiVersion::V2 => {
                Self::line_v2(offset, v2::LineFlags::INPUT | edge_flags_v2(edge), consumer)
            }
        }
    }

    fn handle_v1(offset: Offset, flags: v1::HandleRequestFlags, consumer: &str) -> LineRequest {
        LineRequest::HandleV1(v1::HandleRequest {
            offsets: Offsets::from_slice(&[offset]),
            flags,
            consumer: consumer.into(),
            num_lines: 1,
            ..Default::default()
        })
    }

    fn line_v2(offset: Offset, flags: v2::LineFlags, consumer: &str) -> LineRequest {
        let mut lr = v2::LineRequest {
            offsets: Offsets::from_slice(&[offset]),
            consumer: consumer.into(),
            num_lines: 1,
            ..Default::default()
        };
        lr.config.flags = flags;
        LineRequest::V2(lr)
    }

    /// The image of the request as passed to the kernel.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            LineRequest::HandleV1(hr) => hr.as_bytes(),
            LineRequest::EventV1(er) => er.as_bytes(),
            LineRequest::V2(lr) => lr.as_bytes(),
        }
    }

    /// The uAPI call that issues the request.
    pub(crate) fn call(&self) -> UapiCall {
        match self {
            LineRequest::HandleV1(_) => UapiCall::GetLineHandle,
            LineRequest::EventV1(_) => UapiCall::GetLineEvent,
            LineRequest::V2(_) => UapiCall::GetLine,
        }
    }

    /// Issue the request to the chip, returning the line file granted by the kernel.
    pub(crate) fn request(self, chip: &File) -> Result<File> {
        let call = self.call();
        match self {
            LineRequest::HandleV1(hr) => v1::get_line_handle(chip, hr),
            LineRequest::EventV1(er) => v1::get_line_event(chip, er),
            LineRequest::V2(lr) => v2::get_line(chip, lr),
        }
        .map_err(|e| Error::uapi(call, e))
    }
}

fn event_flags_v1(edge: EdgeDetection) -> v1::EventRequestFlags {
    match edge {
        EdgeDetection::RisingEdge => v1::EventRequestFlags::RISING_EDGE,
        EdgeDetection::FallingEdge => v1::EventRequestFlags::FALLING_EDGE,
        EdgeDetection::BothEdges => v1::EventRequestFlags::BOTH_EDGES,
    }
}

fn edge_flags_v2(edge: EdgeDetection) -> v2::LineFlags {
    match edge {
        EdgeDetection::RisingEdge => v2::LineFlags::EDGE_RISING,
        EdgeDetection::FallingEdge => v2::LineFlags::EDGE_FALLING,
        EdgeDetection::BothEdges => v2::LineFlags::EDGE_RISING | v2::LineFlags::EDGE_FALLING,
    }
}

fn values_v1(value: Value) -> v1::LineValues {
    v1::LineValues::from_slice(&[value.into()])
}

fn values_v2(value: Value) -> v2::LineValues {
    let mut lv = v2::LineValues::default();
    lv.set(0, value.into());
    lv
}

/// Read the value of the single line held by a line file.
pub(crate) fn get_value(abiv: AbiVersion, lf: &File) -> Result<Value> {
    match abiv {
        AbiVersion::V1 => {
            let mut vals = v1::LineValues::default();
            v1::get_line_values(lf, &mut vals)
                .map_err(|e| Error::uapi(UapiCall::GetLineValues, e))?;
            Ok(vals.get(0).into())
        }
        AbiVersion::V2 => {
            let mut vals = v2::LineValues {
                mask: 0x01,
                ..Default::default()
            };
            v2::get_line_values(lf, &mut vals)
                .map_err(|e| Error::uapi(UapiCall::GetLineValues, e))?;
            Ok(vals.get(0).unwrap_or_default().into())
        }
    }
}

/// Set the value of the single line held by a line file.
pub(crate) fn set_value(abiv: AbiVersion, lf: &File, value: Value) -> Result<()> {
    match abiv {
        AbiVersion::V1 => v1::set_line_values(lf, &values_v1(value)),
        AbiVersion::V2 => v2::set_line_values(lf, &values_v2(value)),
    }
    .map_err(|e| Error::uapi(UapiCall::SetLineValues, e))
}

/// The number of u64 words in one event record.
pub(crate) fn event_u64_size(abiv: AbiVersion) -> usize {
    match abiv {
        AbiVersion::V1 => v1::LineEdgeEvent::u64_size(),
        AbiVersion::V2 => v2::LineEdgeEvent::u64_size(),
    }
}

/// Decode one event record read from a line file.
///
/// ABI v1 records do not identify the line, so the requested offset is used.
pub(crate) fn decode_event(abiv: AbiVersion, offset: Offset, buf: &[u64]) -> Result<EdgeEvent> {
    match abiv {
        AbiVersion::V1 => {
            let le = v1::LineEdgeEvent::from_slice(buf)
                .map_err(|e| Error::EventDecodeError(e.to_string()))?;
            Ok(EdgeEvent {
                timestamp_ns: le.timestamp_ns,
                kind: EdgeKind::from(le.id),
                offset,
                seqno: 0,
                line_seqno: 0,
            })
        }
        AbiVersion::V2 => {
            let le = v2::LineEdgeEvent::from_slice(buf)
                .map_err(|e| Error::EventDecodeError(e.to_string()))?;
            Ok(EdgeEvent {
                timestamp_ns: le.timestamp_ns,
                kind: EdgeKind::from(le.id),
                offset: le.offset,
                seqno: le.seqno,
                line_seqno: le.line_seqno,
            })
        }
    }
}
