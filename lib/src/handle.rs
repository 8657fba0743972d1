// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::device::Registry;
use crate::line::{EdgeDetection, Mode, Offset, Value};
use crate::listener::{CancelToken, Listener, Subscription};
use crate::{request, AbiVersion, Error, Result, UapiCall};
use nix::errno::Errno;
use std::fs::File;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// A requested line, shared between its [`LineHandle`] and the device registry.
#[derive(Debug)]
pub(crate) struct Line {
    offset: Offset,
    file: RwLock<Option<File>>,
    listener: Mutex<Option<Listener>>,
}

impl Line {
    pub(crate) fn new(offset: Offset, file: File) -> Line {
        Line {
            offset,
            file: RwLock::new(Some(file)),
            listener: Mutex::new(None),
        }
    }

    // Calls on a closed line fail as the kernel would for a closed fd.
    fn with_file<T, F>(&self, call: UapiCall, f: F) -> Result<T>
    where
        F: FnOnce(&File) -> Result<T>,
    {
        let guard = self.file.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(Error::IoctlFailed(call, Errno::EBADF)),
        }
    }

    /// Stop any listener then close the line file.
    ///
    /// Returns false if the line was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = slot.take() {
            listener.stop();
        }
        let closed = self
            .file
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if closed {
            log::debug!("line {}: closed", self.offset);
        }
        closed
    }
}

/// A line requested from a [`Device`].
///
/// The line remains requested until the handle is released or dropped, or
/// until the device is shut down.  Once the device has shut down the value
/// operations fail with `EBADF`.
///
/// [`Device`]: crate::Device
#[derive(Debug)]
pub struct LineHandle {
    line: Arc<Line>,
    mode: Mode,
    edge: Option<EdgeDetection>,
    abiv: AbiVersion,
    registry: Weak<Mutex<Registry>>,
}

impl LineHandle {
    pub(crate) fn new(
        line: Arc<Line>,
        mode: Mode,
        edge: Option<EdgeDetection>,
        abiv: AbiVersion,
        registry: Weak<Mutex<Registry>>,
    ) -> LineHandle {
        LineHandle {
            line,
            mode,
            edge,
            abiv,
            registry,
        }
    }

    /// The offset of the line on the chip.
    pub fn offset(&self) -> Offset {
        self.line.offset
    }

    /// The mode the line was requested in.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The edges detected on the line, if it was requested for interrupts.
    pub fn edge_detection(&self) -> Option<EdgeDetection> {
        self.edge
    }

    /// The ABI version used to request the line.
    pub fn abi_version(&self) -> AbiVersion {
        self.abiv
    }

    /// Set the value of an output line.
    ///
    /// Fails with [`Error::NotWritable`] if the line was not requested as an output.
    pub fn set(&self, value: Value) -> Result<()> {
        if self.mode != Mode::Output {
            return Err(Error::NotWritable(self.offset()));
        }
        self.line.with_file(UapiCall::SetLineValues, |f| {
            request::set_value(self.abiv, f, value)
        })
    }

    /// Get the current value of the line.
    ///
    /// For outputs this is the value last set.
    pub fn get(&self) -> Result<Value> {
        self.line.with_file(UapiCall::GetLineValues, |f| {
            request::get_value(self.abiv, f)
        })
    }

    /// Subscribe to the edge events detected on the line.
    ///
    /// The events are read by a background listener until the token is
    /// cancelled, the subscription is dropped, or the line is released.
    ///
    /// Fails with [`Error::NotInterruptCapable`] if the line was not requested
    /// with edge detection, and with [`Error::AlreadySubscribed`] if an earlier
    /// subscription to the line is still active.
    pub fn subscribe(&self, cancel: &CancelToken) -> Result<Subscription> {
        if self.mode != Mode::InterruptInput {
            return Err(Error::NotInterruptCapable(self.offset()));
        }
        let mut slot = self
            .line
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = slot.take() {
            if listener.is_active() {
                *slot = Some(listener);
                return Err(Error::AlreadySubscribed(self.offset()));
            }
            listener.stop();
        }
        let file = self.line.with_file(UapiCall::ReadEvent, dup)?;
        let (listener, sub) = Listener::spawn(self.abiv, self.offset(), file, cancel)?;
        *slot = Some(listener);
        Ok(sub)
    }

    /// Release the line.
    ///
    /// Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for LineHandle {
    fn drop(&mut self) {
        if self.line.close() {
            log::debug!("line {}: released", self.offset());
        }
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.line);
        }
    }
}

// A duplicate of the line fd, so the listener can block on it independently
// of the handle.
fn dup(f: &File) -> Result<File> {
    f.try_clone().map_err(|e| match e.raw_os_error() {
        Some(errno) => Error::OsError(Errno::from_raw(errno)),
        None => Error::OsError(Errno::EAGAIN),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::EdgeKind;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;

    const EVENT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

    // A handle backed by a datagram socket in place of a kernel line.
    fn mock_handle(offset: Offset, mode: Mode) -> (LineHandle, UnixDatagram) {
        let (rx, tx) = UnixDatagram::pair().unwrap();
        let line = Arc::new(Line::new(offset, File::from(OwnedFd::from(rx))));
        let edge = match mode {
            Mode::InterruptInput => Some(EdgeDetection::BothEdges),
            _ => None,
        };
        (
            LineHandle::new(line, mode, edge, AbiVersion::V2, Weak::new()),
            tx,
        )
    }

    fn v2_record(id: u32, offset: u32, seqno: u32) -> Vec<u8> {
        let mut rec = vec![0u8; 48];
        rec[8..12].copy_from_slice(&id.to_ne_bytes());
        rec[12..16].copy_from_slice(&offset.to_ne_bytes());
        rec[16..20].copy_from_slice(&seqno.to_ne_bytes());
        rec
    }

    #[test]
    fn accessors() {
        let (h, _tx) = mock_handle(5, Mode::InterruptInput);
        assert_eq!(h.offset(), 5);
        assert_eq!(h.mode(), Mode::InterruptInput);
        assert_eq!(h.edge_detection(), Some(EdgeDetection::BothEdges));
        assert_eq!(h.abi_version(), AbiVersion::V2);

        let (h, _tx) = mock_handle(6, Mode::Output);
        assert_eq!(h.mode(), Mode::Output);
        assert_eq!(h.edge_detection(), None);
    }

    #[test]
    fn set_requires_output() {
        for mode in [Mode::Input, Mode::InterruptInput] {
            let (h, _tx) = mock_handle(3, mode);
            assert_eq!(h.set(Value::Active), Err(Error::NotWritable(3)));
        }
    }

    #[test]
    fn subscribe_requires_interrupt() {
        let cancel = CancelToken::new().unwrap();
        for mode in [Mode::Input, Mode::Output] {
            let (h, _tx) = mock_handle(3, mode);
            assert_eq!(
                h.subscribe(&cancel).unwrap_err(),
                Error::NotInterruptCapable(3)
            );
        }
    }

    #[test]
    fn subscribe() {
        let (h, tx) = mock_handle(7, Mode::InterruptInput);
        let cancel = CancelToken::new().unwrap();
        let sub = h.subscribe(&cancel).unwrap();
        assert_eq!(sub.offset(), 7);
        tx.send(&v2_record(1, 7, 1)).unwrap();
        let ev = sub.recv_timeout(EVENT_WAIT_TIMEOUT).unwrap().unwrap();
        assert_eq!(ev.kind, EdgeKind::Rising);
        assert_eq!(ev.offset, 7);
        assert_eq!(ev.seqno, 1);
    }

    #[test]
    fn listener_file_is_a_duplicate() {
        use std::os::fd::AsRawFd;
        let (h, tx) = mock_handle(7, Mode::InterruptInput);
        let file = h.line.with_file(UapiCall::ReadEvent, dup).unwrap();
        let orig = h
            .line
            .with_file(UapiCall::ReadEvent, |f| Ok(f.as_raw_fd()))
            .unwrap();
        assert_ne!(file.as_raw_fd(), orig);
        // SAFETY: fcntl only reads the descriptor flags.
        let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, libc::FD_CLOEXEC);

        // events reach the duplicate while the handle still holds the original
        tx.send(&v2_record(2, 7, 1)).unwrap();
        let mut buf = [0u64; 6];
        assert_eq!(pingo_uapi::read_event(&file, &mut buf).unwrap(), 6);

        // and outlive it
        assert!(h.line.close());
        tx.send(&v2_record(1, 7, 2)).unwrap();
        assert_eq!(pingo_uapi::read_event(&file, &mut buf).unwrap(), 6);
    }

    #[test]
    fn one_subscription_at_a_time() {
        let (h, _tx) = mock_handle(7, Mode::InterruptInput);
        let cancel = CancelToken::new().unwrap();
        let mut sub = h.subscribe(&cancel).unwrap();
        assert_eq!(
            h.subscribe(&cancel).unwrap_err(),
            Error::AlreadySubscribed(7)
        );
        cancel.cancel();
        assert_eq!(sub.next(), None);

        // slot is freed once the earlier subscription is cancelled
        let cancel = CancelToken::new().unwrap();
        let sub = h.subscribe(&cancel).unwrap();
        drop(sub);
        let sub = h.subscribe(&cancel);
        assert!(sub.is_ok());
    }

    #[test]
    fn closed_line() {
        let (h, _tx) = mock_handle(2, Mode::InterruptInput);
        let cancel = CancelToken::new().unwrap();
        let mut sub = h.subscribe(&cancel).unwrap();
        assert!(h.line.close());
        // listener is stopped by the close
        assert_eq!(sub.next(), None);
        assert_eq!(
            h.get(),
            Err(Error::IoctlFailed(UapiCall::GetLineValues, Errno::EBADF))
        );
        assert_eq!(
            h.subscribe(&cancel).unwrap_err(),
            Error::IoctlFailed(UapiCall::ReadEvent, Errno::EBADF)
        );
        assert!(!h.line.close());

        let (h, _tx) = mock_handle(2, Mode::Output);
        h.line.close();
        assert_eq!(
            h.set(Value::Inactive),
            Err(Error::IoctlFailed(UapiCall::SetLineValues, Errno::EBADF))
        );
    }

    #[test]
    fn release_stops_listener() {
        let (h, _tx) = mock_handle(2, Mode::InterruptInput);
        let cancel = CancelToken::new().unwrap();
        let mut sub = h.subscribe(&cancel).unwrap();
        h.release();
        assert_eq!(sub.next(), None);
        assert!(!cancel.is_cancelled());
    }
}
