// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::handle::{Line, LineHandle};
use crate::line::{EdgeDetection, Mode, Offset};
use crate::request::LineRequest;
use crate::{uapi, AbiVersion, Error, OpenErrorKind, Result, UapiCall};
use nix::errno::Errno;
#[cfg(feature = "serde")]
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uapi::{v1, v2, NAME_MAX};

/// The chip opened by [`Device::new`].
pub const DEFAULT_CHIP: &str = "/dev/gpiochip0";

/// The consumer label applied to requested lines unless overridden.
pub const DEFAULT_CONSUMER: &str = "pingo-gpio";

/// The chip file and the lines currently requested from it.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    chip: Option<File>,
    lines: HashMap<Offset, Arc<Line>>,
}

impl Registry {
    /// Forget a line, unless the offset has since been requested again.
    pub(crate) fn remove(&mut self, line: &Arc<Line>) {
        let offset = self
            .lines
            .iter()
            .find(|(_, l)| Arc::ptr_eq(l, line))
            .map(|(offset, _)| *offset);
        if let Some(offset) = offset {
            self.lines.remove(&offset);
        }
    }
}

/// Information about a GPIO chip.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChipInfo {
    /// The kernel name of the chip.
    pub name: String,

    /// A functional name for the chip, such as a product number.
    ///
    /// May be empty.
    pub label: String,

    /// The number of lines on the chip.
    pub num_lines: u32,
}

impl From<uapi::ChipInfo> for ChipInfo {
    fn from(ci: uapi::ChipInfo) -> Self {
        ChipInfo {
            name: ci.name.as_os_str().to_string_lossy().into_owned(),
            label: ci.label.as_os_str().to_string_lossy().into_owned(),
            num_lines: ci.num_lines,
        }
    }
}

/// A builder of [`Device`]s.
///
/// ```no_run
/// # use pingo::Result;
/// use pingo::{AbiVersion, Device};
///
/// # fn main() -> Result<()> {
/// let device = Device::builder()
///     .on_chip("/dev/gpiochip1")
///     .with_consumer("doorbell")
///     .using_abi_version(AbiVersion::V1)
///     .open()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Builder {
    path: Option<PathBuf>,
    consumer: Option<String>,
    abiv: Option<AbiVersion>,
}

impl Builder {
    /// Select the path of the chip to open.
    ///
    /// Defaults to `/dev/gpiochip0`.
    pub fn on_chip<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.path = Some(path.into());
        self
    }

    /// Set the consumer label applied to lines requested from the device.
    ///
    /// The label must be shorter than 32 bytes.
    pub fn with_consumer<S: Into<String>>(&mut self, consumer: S) -> &mut Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Select the uAPI ABI version used to request lines.
    ///
    /// If not set the most recent version supported by the chip is used.
    pub fn using_abi_version(&mut self, abiv: AbiVersion) -> &mut Self {
        self.abiv = Some(abiv);
        self
    }

    /// Open the chip.
    pub fn open(&self) -> Result<Device> {
        let consumer = self.consumer.as_deref().unwrap_or(DEFAULT_CONSUMER);
        if consumer.len() >= NAME_MAX {
            return Err(Error::InvalidArgument(format!(
                "consumer \"{}\" exceeds {} bytes",
                consumer,
                NAME_MAX - 1
            )));
        }
        if consumer.contains('\0') {
            return Err(Error::InvalidArgument(
                "consumer contains a NUL byte".into(),
            ));
        }
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CHIP));
        let chip = open_chip(&path)?;
        let abiv = match self.abiv {
            Some(abiv) => {
                if !supports_abi_version(&chip, abiv) {
                    return Err(Error::UnsupportedAbi(abiv));
                }
                abiv
            }
            None => detect_abi_version(&chip).ok_or_else(|| Error::NoAbiSupport(path.clone()))?,
        };
        log::debug!("{}: opened using {}", path.display(), abiv);
        Ok(Device {
            path,
            abiv,
            consumer: consumer.to_string(),
            registry: Arc::new(Mutex::new(Registry {
                chip: Some(chip),
                lines: HashMap::new(),
            })),
        })
    }
}

fn open_chip(path: &Path) -> Result<File> {
    let failed = |kind| Error::ChipOpenFailed(path.to_path_buf(), kind);
    let chip = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| failed(OpenErrorKind::Io(e.kind())))?;
    let md = chip
        .metadata()
        .map_err(|e| failed(OpenErrorKind::Io(e.kind())))?;
    if !md.file_type().is_char_device() {
        return Err(failed(OpenErrorKind::NotCharacterDevice));
    }
    Ok(chip)
}

// Probing line 0 is sufficient as the ioctl fails on unsupported ABIs
// regardless of the offset.
fn supports_abi_version(chip: &File, abiv: AbiVersion) -> bool {
    match abiv {
        AbiVersion::V1 => v1::get_line_info(chip, 0).is_ok(),
        AbiVersion::V2 => v2::get_line_info(chip, 0).is_ok(),
    }
}

fn detect_abi_version(chip: &File) -> Option<AbiVersion> {
    // check in preferred order
    [AbiVersion::V2, AbiVersion::V1]
        .into_iter()
        .find(|abiv| supports_abi_version(chip, *abiv))
}

/// An open GPIO chip from which individual lines may be requested.
///
/// Each line offset may only be requested once at a time.  The line is
/// available to be requested again once its [`LineHandle`] is released or
/// dropped.
///
/// Shutting down or dropping the device releases all of its lines, stopping
/// any listeners, and closes the chip.
#[derive(Debug)]
pub struct Device {
    path: PathBuf,
    abiv: AbiVersion,
    consumer: String,
    registry: Arc<Mutex<Registry>>,
}

impl Device {
    /// Open the default chip, `/dev/gpiochip0`, with default settings.
    pub fn new() -> Result<Device> {
        Builder::default().open()
    }

    /// Open the chip at the given path with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Device> {
        Builder::default().on_chip(path.as_ref()).open()
    }

    /// Start building a device with non-default settings.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The path of the chip.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The uAPI ABI version used to request lines.
    pub fn abi_version(&self) -> AbiVersion {
        self.abiv
    }

    /// The consumer label applied to requested lines.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Get the information for the chip.
    pub fn info(&self) -> Result<ChipInfo> {
        let registry = self.lock();
        let chip = registry
            .chip
            .as_ref()
            .ok_or(Error::IoctlFailed(UapiCall::GetChipInfo, Errno::EBADF))?;
        uapi::get_chip_info(chip)
            .map(ChipInfo::from)
            .map_err(|e| Error::uapi(UapiCall::GetChipInfo, e))
    }

    /// The offsets of the lines currently requested, in ascending order.
    pub fn requested(&self) -> Vec<Offset> {
        let mut offsets: Vec<Offset> = self.lock().lines.keys().copied().collect();
        offsets.sort_unstable();
        offsets
    }

    /// Returns true if the line is currently requested from the device.
    pub fn is_requested(&self, offset: Offset) -> bool {
        self.lock().lines.contains_key(&offset)
    }

    /// Request a line as an output, initially inactive.
    pub fn request_output(&self, offset: Offset) -> Result<LineHandle> {
        self.request(offset, Mode::Output, None)
    }

    /// Request a line as an input.
    pub fn request_input(&self, offset: Offset) -> Result<LineHandle> {
        self.request(offset, Mode::Input, None)
    }

    /// Request a line as an input with edge detection enabled.
    ///
    /// Edge events are received by subscribing to the returned handle.
    pub fn request_interrupt(&self, offset: Offset, edge: EdgeDetection) -> Result<LineHandle> {
        self.request(offset, Mode::InterruptInput, Some(edge))
    }

    fn request(
        &self,
        offset: Offset,
        mode: Mode,
        edge: Option<EdgeDetection>,
    ) -> Result<LineHandle> {
        let req = match (mode, edge) {
            (Mode::InterruptInput, Some(edge)) => {
                LineRequest::interrupt(self.abiv, offset, edge, &self.consumer)
            }
            (Mode::Output, _) => LineRequest::output(self.abiv, offset, &self.consumer),
            _ => LineRequest::input(self.abiv, offset, &self.consumer),
        };
        // hold the registry for the duration so concurrent requests for the
        // same offset cannot both reach the kernel
        let mut registry = self.lock();
        if registry.lines.contains_key(&offset) {
            return Err(Error::LineAlreadyInUse(offset));
        }
        let chip = registry
            .chip
            .as_ref()
            .ok_or(Error::IoctlFailed(req.call(), Errno::EBADF))?;
        let file = req.request(chip)?;
        let line = Arc::new(Line::new(offset, file));
        registry.lines.insert(offset, line.clone());
        drop(registry);
        log::debug!("line {}: requested as {}", offset, mode);
        Ok(LineHandle::new(
            line,
            mode,
            edge,
            self.abiv,
            Arc::downgrade(&self.registry),
        ))
    }

    /// Release all lines and close the chip.
    ///
    /// Handles outliving the device fail subsequent value operations.
    pub fn shutdown(self) {}

    fn close(&self) {
        let mut registry = self.lock();
        let lines: Vec<Arc<Line>> = registry.lines.drain().map(|(_, l)| l).collect();
        for line in &lines {
            line.close();
        }
        if registry.chip.take().is_some() {
            log::debug!(
                "{}: closed, released {} lines",
                self.path.display(),
                lines.len()
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}
