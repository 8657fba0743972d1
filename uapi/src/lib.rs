// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A thin but safe Rust layer around the Linux GPIO character device uAPI.
//!
//! Provides `#[repr(C)]` mirrors of the kernel request and event structures,
//! and the ioctl and read calls that exchange them with the kernel, for both
//! versions of the ABI.

pub(crate) mod common;

pub use common::{
    get_chip_info, has_event, read_event, wait_event, wait_event_or_cancel, ChipInfo, Error,
    LineEdgeEventKind, Name, Offset, Offsets, Result, UnderReadError, ValidationError, Wakeup,
    LINES_MAX, NAME_MAX,
};

/// GPIO ABI v1, released in Linux v4.8.
///
/// This ABI version is deprecated, so prefer [`v2`] where the kernel supports it.
#[cfg(feature = "uapi_v1")]
pub mod v1;

/// GPIO ABI v2, the current version of the ABI, released in Linux v5.10.
#[cfg(any(feature = "uapi_v2", not(feature = "uapi_v1")))]
pub mod v2;
