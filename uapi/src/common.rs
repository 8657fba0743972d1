// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

use libc::{c_long, c_void, nfds_t, pollfd, ppoll, sigset_t, time_t, timespec, POLLIN};
use nix::errno::Errno;
use std::ffi::OsStr;
use std::fs::File;
use std::mem::{size_of, MaybeUninit};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::ptr;
use std::slice;
use std::time::Duration;

pub(crate) const IOCTL_MAGIC: u8 = 0xb4;

// Ioctl codes in the GPIO space, sized by the structure exchanged with the
// kernel.  Only chip info is read-only, the rest are read/write.
macro_rules! ior {
    ($nr:expr, $dty:ty) => {
        nix::request_code_read!(
            $crate::common::IOCTL_MAGIC,
            $nr,
            std::mem::size_of::<$dty>()
        )
    };
}

macro_rules! iorw {
    ($nr:expr, $dty:ty) => {
        nix::request_code_readwrite!(
            $crate::common::IOCTL_MAGIC,
            $nr,
            std::mem::size_of::<$dty>()
        )
    };
}
pub(crate) use iorw;

#[repr(u8)]
enum Ioctl {
    GetChipInfo = 1,
}

/// Check if the file has an event available to read.
#[inline]
pub fn has_event(f: &File) -> Result<bool> {
    wait_event(f, Duration::ZERO)
}

/// Wait for the file to have an event available to read.
pub fn wait_event(f: &File, d: Duration) -> Result<bool> {
    let mut pfd = pollfd {
        fd: f.as_raw_fd(),
        events: POLLIN,
        revents: 0,
    };
    let timeout = timespec {
        tv_sec: d.as_secs() as time_t,
        tv_nsec: d.subsec_nanos() as c_long,
    };
    // SAFETY: pfd and timeout outlive the call.
    match unsafe {
        ppoll(
            ptr::addr_of_mut!(pfd),
            1,
            ptr::addr_of!(timeout),
            ptr::null::<sigset_t>(),
        )
    } {
        -1 => Err(Error::from_errno()),
        0 => Ok(false),
        _ => Ok(true),
    }
}

/// The reason [`wait_event_or_cancel`] returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wakeup {
    /// An event is available to read from the file.
    Event,

    /// One of the cancellation descriptors became readable.
    Cancelled,

    /// The file reported an error or hang-up condition and will never
    /// provide further events.
    Hangup,
}

/// Block until the file has an event available to read, or until any of the
/// cancellation descriptors becomes readable.
///
/// There is no timeout - the call only returns when one of the descriptors
/// becomes ready, or when interrupted by a signal, in which case the error is
/// `EINTR` and the wait may be retried.
///
/// Cancellation takes precedence over a pending event.
///
/// * `f` - The file to wait on, typically a line request.
/// * `cancel` - Descriptors that signal cancellation by becoming readable.
pub fn wait_event_or_cancel(f: &File, cancel: &[BorrowedFd<'_>]) -> Result<Wakeup> {
    let mut pfds: Vec<pollfd> = Vec::with_capacity(cancel.len() + 1);
    pfds.push(pollfd {
        fd: f.as_raw_fd(),
        events: POLLIN,
        revents: 0,
    });
    pfds.extend(cancel.iter().map(|c| pollfd {
        fd: c.as_raw_fd(),
        events: POLLIN,
        revents: 0,
    }));
    // SAFETY: pfds outlives the call and the null timeout blocks indefinitely.
    if unsafe {
        ppoll(
            pfds.as_mut_ptr(),
            pfds.len() as nfds_t,
            ptr::null::<timespec>(),
            ptr::null::<sigset_t>(),
        )
    } == -1
    {
        return Err(Error::from_errno());
    }
    if pfds[1..].iter().any(|p| p.revents != 0) {
        return Ok(Wakeup::Cancelled);
    }
    if pfds[0].revents & POLLIN != 0 {
        return Ok(Wakeup::Event);
    }
    Ok(Wakeup::Hangup)
}

/// Read events into a buffer.
///
/// Performs a single read, so the kernel returns as many complete events as
/// fit in the buffer, blocking if none are available.
///
/// Returns the number of whole u64 words read.  A read that ends part way
/// through a word is reported as an [`UnderReadError`].
///
/// * `f` - The file to read from.
/// * `buf` - The buffer to contain the raw events.
pub fn read_event(f: &File, buf: &mut [u64]) -> Result<usize> {
    let bufsize = buf.len() * 8;
    // SAFETY: buf is a valid, writable region of bufsize bytes.
    let n = unsafe { libc::read(f.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, bufsize) };
    if n < 0 {
        return Err(Error::from_errno());
    }
    let n = n as usize;
    if n % 8 != 0 {
        return Err(Error::from(UnderReadError::new(
            "event",
            (n + 7) & !7,
            n,
        )));
    }
    Ok(n / 8)
}

/// Information about a particular GPIO chip.
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChipInfo {
    /// The Linux kernel name of this GPIO chip.
    pub name: Name,

    /// A functional name for this GPIO chip, such as a product number.
    ///
    /// May be empty.
    pub label: Name,

    /// The number of GPIO lines on this chip.
    pub num_lines: u32,
}

/// Get the publicly available information for a chip.
///
/// * `cf` - The open gpiochip device file.
pub fn get_chip_info(cf: &File) -> Result<ChipInfo> {
    let mut chip = MaybeUninit::<ChipInfo>::uninit();
    // SAFETY: returned struct contains raw byte arrays and ints that are safe to decode.
    unsafe {
        match libc::ioctl(
            cf.as_raw_fd(),
            ior!(Ioctl::GetChipInfo, ChipInfo),
            chip.as_mut_ptr(),
        ) {
            0 => Ok(chip.assume_init()),
            _ => Err(Error::from_errno()),
        }
    }
}

/// The result returned by [`pingo_uapi`] functions.
///
/// [`pingo_uapi`]: crate
pub type Result<T> = std::result::Result<T, Error>;

/// Result returned by struct validators.
pub type ValidationResult = std::result::Result<(), ValidationError>;

/// Errors returned by [`pingo_uapi`] functions.
///
/// [`pingo_uapi`]: crate
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum Error {
    /// An error returned from an underlying system call.
    #[error(transparent)]
    Os(#[from] Errno),

    /// An error indicating insufficient data read for the expected object.
    #[error(transparent)]
    UnderRead(#[from] UnderReadError),

    /// An error validating a data structure returned from the kernel
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl Error {
    /// Create an error from the current errno value.
    #[inline]
    pub fn from_errno() -> Error {
        Error::Os(Errno::last())
    }

    /// The errno of an underlying system call failure, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os(e) => Some(*e),
            _ => None,
        }
    }
}

/// A failure to read sufficient bytes to construct an object.
//
// This should never happen - but is checked to be safe.
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[error("Reading {obj} returned {found} bytes, expected {expected}.")]
pub struct UnderReadError {
    /// The struct being read
    pub obj: &'static str,
    /// The number of bytes expected
    pub expected: usize,
    /// The number of bytes read
    pub found: usize,
}

impl UnderReadError {
    /// Create an UnderReadError.
    pub(crate) fn new(obj: &'static str, expected: usize, found: usize) -> UnderReadError {
        UnderReadError {
            obj,
            expected,
            found,
        }
    }
}

/// A failure to validate a struct returned from a system call.
//
// Should only be seen if a kernel update adds an enum value we are unaware of.
#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[error("Kernel returned invalid {field}: {msg}")]
pub struct ValidationError {
    /// The field that failed to validate.
    pub field: String,
    /// The details of the validation failure.
    pub msg: String,
}

impl ValidationError {
    /// Create a ValidationError.
    pub(crate) fn new<S: Into<String>, T: Into<String>>(field: S, msg: T) -> ValidationError {
        ValidationError {
            field: field.into(),
            msg: msg.into(),
        }
    }
}

/// The maximum number of bytes stored in a Name.
pub const NAME_MAX: usize = 32;

/// A uAPI name string, common to ABI v1 and v2.
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Name([u8; NAME_MAX]);

impl Name {
    /// Checks whether the Name is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    /// The length of the contained name.
    #[inline]
    pub fn strlen(&self) -> usize {
        self.0.iter().position(|&x| x == 0).unwrap_or(self.0.len())
    }

    /// Convert the contained name to a OsString slice.
    pub fn as_os_str(&self) -> &OsStr {
        OsStr::from_bytes(&self.0[..self.strlen()])
    }

    /// Construct a Name from byte slice.
    ///
    /// Slices longer than [`NAME_MAX`] are truncated.
    /// May result in invalid UTF-8 if truncated in the middle of a multi-byte character.
    pub fn from_bytes(s: &[u8]) -> Name {
        let mut d: Name = Default::default();
        for (src, dst) in s.iter().zip(d.0.iter_mut()) {
            *dst = *src;
        }
        d
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name::from_bytes(s.as_bytes())
    }
}

/// An identifier for a line on a particular chip.
///
/// Valid offsets are in the range 0..`num_lines` as reported in the [`ChipInfo`].
pub type Offset = u32;

/// The maximum number of lines that may be requested in a single request.
pub const LINES_MAX: usize = 64;

/// A collection of line offsets.
///
/// Only the first `num_lines` entries are meaningful to the kernel, the
/// remainder must be zero.
#[repr(C)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Offsets([Offset; LINES_MAX]);

impl Offsets {
    /// Create offsets from a slice.
    pub fn from_slice(s: &[u32]) -> Self {
        let mut n: Offsets = Default::default();
        for (src, dst) in s.iter().zip(n.0.iter_mut()) {
            *dst = *src;
        }
        n
    }

    /// Get the indexed offset from the set.
    #[inline]
    pub fn get(&self, idx: usize) -> Offset {
        self.0[idx]
    }

    /// Set the indexed offset in the set.
    #[inline]
    pub fn set(&mut self, idx: usize, offset: Offset) {
        self.0[idx] = offset;
    }
}

impl Default for Offsets {
    fn default() -> Self {
        Offsets([0; LINES_MAX])
    }
}

/// Space reserved for future use.
///
/// Sized in multiples of u32 words.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[doc(hidden)]
pub struct Padding<const SIZE: usize>([u32; SIZE]);

impl<const SIZE: usize> Default for Padding<SIZE> {
    fn default() -> Self {
        Padding([0; SIZE])
    }
}

impl<const SIZE: usize> Padding<SIZE> {
    pub fn is_zeroed(&self) -> bool {
        self.0.iter().all(|x| *x == 0)
    }
}

/// The trigger identifier for a [`LineEdgeEvent`].
///
/// The kernel reports the kind as a raw u32 which is converted using `TryFrom`.
///
/// [`LineEdgeEvent`]: struct.LineEdgeEvent.html
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineEdgeEventKind {
    /// Indicates the line transitioned from *inactive* to *active*.
    RisingEdge = 1,

    /// Indicates the line transitioned from *active* to *inactive*.
    FallingEdge = 2,
}

impl TryFrom<u32> for LineEdgeEventKind {
    type Error = String;

    fn try_from(v: u32) -> std::result::Result<Self, Self::Error> {
        use LineEdgeEventKind::*;
        Ok(match v {
            x if x == RisingEdge as u32 => RisingEdge,
            x if x == FallingEdge as u32 => FallingEdge,
            _ => return Err(format!("invalid value: {v}")),
        })
    }
}

/// View a kernel structure as the raw bytes exchanged with the kernel.
///
/// # Safety
///
/// `T` must be `#[repr(C)]` and contain no implicit padding, so every byte of
/// the returned slice is initialized.
pub(crate) unsafe fn bytes_of<T>(t: &T) -> &[u8] {
    slice::from_raw_parts(t as *const T as *const u8, size_of::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_codes() {
        assert_eq!(ior!(Ioctl::GetChipInfo, ChipInfo) as u32, 0x8044_b401);
    }

    #[test]
    fn size_chip_info() {
        assert_eq!(
            size_of::<ChipInfo>(),
            68usize,
            concat!("Size of: ", stringify!(ChipInfo))
        );
    }

    #[test]
    fn line_edge_event_kind_try_from() {
        assert_eq!(
            LineEdgeEventKind::try_from(1),
            Ok(LineEdgeEventKind::RisingEdge)
        );
        assert_eq!(
            LineEdgeEventKind::try_from(2),
            Ok(LineEdgeEventKind::FallingEdge)
        );
        assert_eq!(
            LineEdgeEventKind::try_from(0).unwrap_err(),
            "invalid value: 0"
        );
        assert_eq!(
            LineEdgeEventKind::try_from(3).unwrap_err(),
            "invalid value: 3"
        );
    }

    mod name {
        use super::{Name, NAME_MAX};

        #[test]
        fn from_str() {
            let mut x = [0u8; 32];
            x[..6].copy_from_slice(b"banana");
            let mut a = Name::from("banana");
            assert_eq!(a.0, x);
            a = Name::from("apple");
            x[..6].copy_from_slice(b"apple\0");
            assert_eq!(a.0, x);
        }

        #[test]
        fn is_empty() {
            let mut a = Name::default();
            assert!(a.is_empty());
            a = Name::from("banana");
            assert!(!a.is_empty());
        }

        #[test]
        fn strlen() {
            let mut a = Name::default();
            assert_eq!(a.strlen(), 0);
            a = Name::from("banana");
            assert_eq!(a.strlen(), 6);
            a = Name::from("an overly long truncated name -><- cut here");
            assert_eq!(a.strlen(), 32);
        }

        #[test]
        fn as_os_str() {
            let mut a = Name::default();
            assert_eq!(a.as_os_str(), "");
            a = Name::from("banana");
            assert_eq!(a.as_os_str(), "banana");
            a = Name::from("an overly long truncated name -><- cut here");
            assert_eq!(a.as_os_str(), "an overly long truncated name ->");
        }

        #[test]
        fn default() {
            assert_eq!(Name::default().0, [0u8; NAME_MAX]);
        }

        #[test]
        fn size() {
            assert_eq!(
                super::size_of::<Name>(),
                NAME_MAX,
                concat!("Size of: ", stringify!(Name))
            );
        }
    }

    mod offsets {
        use super::{Offsets, LINES_MAX};

        #[test]
        fn from_slice() {
            let mut x = [0u32; LINES_MAX];
            x[..6].copy_from_slice(&[1, 2, 3, 0, 5, 6]);
            let mut a = Offsets::from_slice(&[1, 2, 3, 0, 5, 6]);
            assert_eq!(a.0, x);
            a = Offsets::from_slice(&[17]);
            assert_eq!(a.get(0), 17);
            assert!(a.0[1..].iter().all(|o| *o == 0));
        }

        #[test]
        fn set() {
            let mut a = Offsets::default();
            a.set(0, 42);
            assert_eq!(a.get(0), 42);
            assert_eq!(a.get(1), 0);
        }

        #[test]
        fn size() {
            assert_eq!(
                super::size_of::<Offsets>(),
                256usize,
                concat!("Size of: ", stringify!(Offsets))
            );
        }
    }

    mod padding {
        use super::Padding;

        #[test]
        fn is_zeroed() {
            let mut padding: Padding<3> = Padding::default();
            assert!(padding.is_zeroed());
            padding.0[1] = 3;
            assert!(!padding.is_zeroed());
        }

        #[test]
        fn size() {
            assert_eq!(super::size_of::<Padding<1>>(), 4usize);
            assert_eq!(super::size_of::<Padding<5>>(), 20usize);
        }
    }

    mod wait {
        use super::{has_event, read_event, wait_event_or_cancel, Error, Wakeup};
        use std::fs::File;
        use std::io::Write;
        use std::os::fd::{AsFd, OwnedFd};
        use std::os::unix::net::UnixDatagram;

        fn socket_files() -> (File, File) {
            let (a, b) = UnixDatagram::pair().unwrap();
            (File::from(OwnedFd::from(a)), File::from(OwnedFd::from(b)))
        }

        #[test]
        fn has_event_tracks_readability() {
            let (rx, mut tx) = socket_files();
            assert!(!has_event(&rx).unwrap());
            tx.write_all(&[0u8; 16]).unwrap();
            assert!(has_event(&rx).unwrap());
        }

        #[test]
        fn cancellation_takes_precedence() {
            let (rx, mut tx) = socket_files();
            let (cancel_rx, mut cancel_tx) = socket_files();
            tx.write_all(&[0u8; 16]).unwrap();
            assert_eq!(wait_event_or_cancel(&rx, &[]).unwrap(), Wakeup::Event);
            cancel_tx.write_all(&[1]).unwrap();
            assert_eq!(
                wait_event_or_cancel(&rx, &[cancel_rx.as_fd()]).unwrap(),
                Wakeup::Cancelled
            );
        }

        #[test]
        fn read_whole_words() {
            let (rx, mut tx) = socket_files();
            tx.write_all(&[0xa5u8; 16]).unwrap();
            let mut buf = [0u64; 6];
            assert_eq!(read_event(&rx, &mut buf).unwrap(), 2);
            assert_eq!(buf[0], 0xa5a5_a5a5_a5a5_a5a5);
        }

        #[test]
        fn read_partial_word() {
            let (rx, mut tx) = socket_files();
            tx.write_all(&[0u8; 10]).unwrap();
            let mut buf = [0u64; 6];
            assert!(matches!(
                read_event(&rx, &mut buf),
                Err(Error::UnderRead(e)) if e.found == 10
            ));
        }
    }
}
