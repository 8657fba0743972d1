// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::line::{EdgeEvent, Offset};
use crate::{request, AbiVersion, Error, Result};
use nix::errno::Errno;
use pingo_uapi as uapi;
use pingo_uapi::Wakeup;
use std::fs::File;
use std::io::Write;
use std::os::unix::prelude::{AsFd, BorrowedFd, FromRawFd};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A signal used to stop one or more [`Subscription`]s.
///
/// Once cancelled a token stays cancelled, so it wakes every listener
/// waiting on it, including those subscribed after the cancellation.
///
/// Clones share the same underlying signal.
#[derive(Clone, Debug)]
pub struct CancelToken(Arc<File>);

impl CancelToken {
    /// Create a new, uncancelled, token.
    pub fn new() -> Result<CancelToken> {
        // SAFETY: the returned fd is owned by the File.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd == -1 {
            return Err(Error::OsError(Errno::last()));
        }
        // SAFETY: fd is a freshly created descriptor that nothing else owns.
        Ok(CancelToken(Arc::new(unsafe { File::from_raw_fd(fd) })))
    }

    /// Signal cancellation.
    ///
    /// The counter is never read, so the token remains readable from here on.
    pub fn cancel(&self) {
        if let Err(e) = (&*self.0).write(&1u64.to_ne_bytes()) {
            // only fails if the counter saturates, in which case it is already readable.
            log::trace!("cancel write failed: {}", e);
        }
    }

    /// Check if the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        uapi::has_event(&self.0).unwrap_or(false)
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A stream of edge events from a line requested with edge detection.
///
/// Events are delivered in the order the kernel reports them.
///
/// The stream ends when the [`CancelToken`] it was subscribed with is
/// cancelled, or when the line is released.  Dropping the subscription
/// stops its listener.
#[derive(Debug)]
pub struct Subscription {
    offset: Offset,
    rx: Receiver<EdgeEvent>,
    stop: CancelToken,
}

impl Subscription {
    /// The offset of the line the events are from.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// Wait up to the timeout for the next event.
    ///
    /// Returns `Ok(None)` if the timeout expires, and [`Error::EventStreamClosed`]
    /// once the stream has ended and all events have been received.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<EdgeEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::EventStreamClosed),
        }
    }
}

impl Iterator for Subscription {
    type Item = EdgeEvent;

    /// Block until the next event, or return None once the stream has ended.
    fn next(&mut self) -> Option<EdgeEvent> {
        self.rx.recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// The background thread feeding a [`Subscription`].
#[derive(Debug)]
pub(crate) struct Listener {
    cancel: CancelToken,
    stop: CancelToken,
    thread: JoinHandle<()>,
}

impl Listener {
    /// Start listening for events on the line file.
    ///
    /// The listener takes ownership of the file, which should be a
    /// duplicate of the line descriptor held by the handle.
    pub(crate) fn spawn(
        abiv: AbiVersion,
        offset: Offset,
        file: File,
        cancel: &CancelToken,
    ) -> Result<(Listener, Subscription)> {
        let stop = CancelToken::new()?;
        let (tx, rx) = mpsc::channel();
        let ctx = Context {
            abiv,
            offset,
            file,
            cancel: cancel.clone(),
            stop: stop.clone(),
            tx,
        };
        let thread = thread::Builder::new()
            .name(format!("pingo-listener-{offset}"))
            .spawn(move || ctx.run())
            .map_err(|e| match e.raw_os_error() {
                Some(errno) => Error::OsError(Errno::from_raw(errno)),
                None => Error::OsError(Errno::EAGAIN),
            })?;
        log::debug!("line {}: listener started", offset);
        Ok((
            Listener {
                cancel: cancel.clone(),
                stop: stop.clone(),
                thread,
            },
            Subscription { offset, rx, stop },
        ))
    }

    /// Check if the listener is still feeding its subscription.
    ///
    /// A listener that has been cancelled, or whose subscription was dropped,
    /// is no longer active even if the thread has yet to exit.
    pub(crate) fn is_active(&self) -> bool {
        !(self.thread.is_finished() || self.stop.is_cancelled() || self.cancel.is_cancelled())
    }

    /// Stop the listener and wait for it to exit.
    pub(crate) fn stop(self) {
        self.stop.cancel();
        if self.thread.join().is_err() {
            log::warn!("listener thread panicked");
        }
    }
}

struct Context {
    abiv: AbiVersion,
    offset: Offset,
    file: File,
    cancel: CancelToken,
    stop: CancelToken,
    tx: Sender<EdgeEvent>,
}

impl Context {
    fn run(self) {
        let mut buf = vec![0_u64; request::event_u64_size(self.abiv)];
        let cancel_fds = [self.cancel.as_fd(), self.stop.as_fd()];
        loop {
            match uapi::wait_event_or_cancel(&self.file, &cancel_fds) {
                Ok(Wakeup::Event) => {}
                Ok(Wakeup::Cancelled) => break,
                Ok(Wakeup::Hangup) => {
                    log::debug!("line {}: event stream hung up", self.offset);
                    break;
                }
                Err(uapi::Error::Os(Errno::EINTR)) => continue,
                Err(e) => {
                    log::warn!("line {}: wait for event failed: {}", self.offset, e);
                    break;
                }
            }
            let n = match uapi::read_event(&self.file, &mut buf) {
                Ok(0) => {
                    log::debug!("line {}: end of event stream", self.offset);
                    break;
                }
                Ok(n) => n,
                Err(uapi::Error::Os(Errno::EINTR | Errno::EAGAIN)) => continue,
                Err(uapi::Error::UnderRead(e)) => {
                    log::warn!("line {}: skipping partial event: {}", self.offset, e);
                    continue;
                }
                Err(e) => {
                    log::warn!("line {}: read event failed: {}", self.offset, e);
                    break;
                }
            };
            match request::decode_event(self.abiv, self.offset, &buf[..n]) {
                Ok(ev) => {
                    log::trace!("line {}: {:?}", self.offset, ev);
                    if self.tx.send(ev).is_err() {
                        // subscription dropped
                        break;
                    }
                }
                Err(e) => log::warn!("line {}: skipping event: {}", self.offset, e),
            }
        }
        log::debug!("line {}: listener stopped", self.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::EdgeKind;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixDatagram;
    use std::time::Instant;

    // bound on the time for a listener to react
    const REACTION_TIMEOUT: Duration = Duration::from_millis(500);

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // A mock event source - each datagram is returned by a single read, as
    // a kernel event record would be.
    fn event_source() -> (File, UnixDatagram) {
        let (rx, tx) = UnixDatagram::pair().unwrap();
        (File::from(OwnedFd::from(rx)), tx)
    }

    fn v2_record(id: u32, offset: u32, seqno: u32) -> Vec<u8> {
        let mut rec = vec![0u8; 48];
        rec[0..8].copy_from_slice(&(seqno as u64 * 1000).to_ne_bytes());
        rec[8..12].copy_from_slice(&id.to_ne_bytes());
        rec[12..16].copy_from_slice(&offset.to_ne_bytes());
        rec[16..20].copy_from_slice(&seqno.to_ne_bytes());
        rec[20..24].copy_from_slice(&seqno.to_ne_bytes());
        rec
    }

    fn v1_record(id: u32, ts: u64) -> Vec<u8> {
        let mut rec = vec![0u8; 16];
        rec[0..8].copy_from_slice(&ts.to_ne_bytes());
        rec[8..12].copy_from_slice(&id.to_ne_bytes());
        rec
    }

    mod cancel_token {
        use super::CancelToken;

        #[test]
        fn cancel() {
            let c = CancelToken::new().unwrap();
            assert!(!c.is_cancelled());
            c.cancel();
            assert!(c.is_cancelled());
            // stays cancelled
            assert!(c.is_cancelled());
            c.cancel();
            assert!(c.is_cancelled());
        }

        #[test]
        fn clones_share_state() {
            let c = CancelToken::new().unwrap();
            let c2 = c.clone();
            c2.cancel();
            assert!(c.is_cancelled());
        }
    }

    #[test]
    fn events_delivered_in_order() {
        init_logger();
        let (file, tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        let (listener, sub) = Listener::spawn(AbiVersion::V2, 9, file, &cancel).unwrap();
        for seqno in 1..=5 {
            tx.send(&v2_record(1 + seqno % 2, 9, seqno)).unwrap();
        }
        for seqno in 1..=5 {
            let ev = sub.recv_timeout(REACTION_TIMEOUT).unwrap().unwrap();
            assert_eq!(ev.seqno, seqno);
            assert_eq!(ev.offset, 9);
            let kind = if seqno % 2 == 0 {
                EdgeKind::Rising
            } else {
                EdgeKind::Falling
            };
            assert_eq!(ev.kind, kind);
        }
        listener.stop();
    }

    #[test]
    fn v1_events_carry_offset() {
        init_logger();
        let (file, tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        let (listener, sub) = Listener::spawn(AbiVersion::V1, 4, file, &cancel).unwrap();
        tx.send(&v1_record(1, 1234)).unwrap();
        let ev = sub.recv_timeout(REACTION_TIMEOUT).unwrap().unwrap();
        assert_eq!(
            ev,
            EdgeEvent {
                timestamp_ns: 1234,
                kind: EdgeKind::Rising,
                offset: 4,
                seqno: 0,
                line_seqno: 0,
            }
        );
        listener.stop();
    }

    #[test]
    fn cancel_with_no_events() {
        init_logger();
        let (file, _tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        let (listener, mut sub) = Listener::spawn(AbiVersion::V2, 1, file, &cancel).unwrap();
        assert_eq!(sub.recv_timeout(Duration::from_millis(20)), Ok(None));
        let start = Instant::now();
        cancel.cancel();
        assert_eq!(sub.next(), None);
        assert!(start.elapsed() < REACTION_TIMEOUT);
        assert_eq!(
            sub.recv_timeout(Duration::ZERO),
            Err(Error::EventStreamClosed)
        );
        listener.stop();
    }

    #[test]
    fn cancelled_before_subscribe() {
        init_logger();
        let (file, _tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        cancel.cancel();
        let (listener, mut sub) = Listener::spawn(AbiVersion::V2, 1, file, &cancel).unwrap();
        assert_eq!(sub.next(), None);
        listener.stop();
    }

    #[test]
    fn cancel_wakes_all_listeners() {
        init_logger();
        let cancel = CancelToken::new().unwrap();
        let mut held = Vec::new();
        for offset in 0..3 {
            let (file, tx) = event_source();
            let (listener, sub) = Listener::spawn(AbiVersion::V2, offset, file, &cancel).unwrap();
            held.push((listener, sub, tx));
        }
        cancel.cancel();
        for (listener, mut sub, _tx) in held {
            assert_eq!(sub.next(), None);
            listener.stop();
        }
    }

    #[test]
    fn stop_while_blocked() {
        init_logger();
        let (file, _tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        let (listener, mut sub) = Listener::spawn(AbiVersion::V2, 1, file, &cancel).unwrap();
        let start = Instant::now();
        listener.stop();
        assert!(start.elapsed() < REACTION_TIMEOUT);
        assert_eq!(sub.next(), None);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn drop_subscription_stops_listener() {
        init_logger();
        let (file, _tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        let (listener, sub) = Listener::spawn(AbiVersion::V2, 1, file, &cancel).unwrap();
        drop(sub);
        let start = Instant::now();
        assert!(!listener.is_active());
        while !listener.thread.is_finished() {
            assert!(start.elapsed() < REACTION_TIMEOUT);
            thread::sleep(Duration::from_millis(1));
        }
        listener.stop();
    }

    #[test]
    fn malformed_records_skipped() {
        init_logger();
        let (file, tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        let (listener, sub) = Listener::spawn(AbiVersion::V2, 9, file, &cancel).unwrap();
        // partial word
        tx.send(&[0xff; 13]).unwrap();
        // whole words, but short of a record
        tx.send(&[0xff; 16]).unwrap();
        tx.send(&v2_record(2, 9, 7)).unwrap();
        let ev = sub.recv_timeout(REACTION_TIMEOUT).unwrap().unwrap();
        assert_eq!(ev.seqno, 7);
        assert_eq!(ev.kind, EdgeKind::Falling);
        assert!(listener.is_active());
        listener.stop();
    }

    #[test]
    fn unknown_kind_delivered() {
        init_logger();
        let (file, tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        let (listener, sub) = Listener::spawn(AbiVersion::V2, 9, file, &cancel).unwrap();
        tx.send(&v2_record(6, 9, 1)).unwrap();
        let ev = sub.recv_timeout(REACTION_TIMEOUT).unwrap().unwrap();
        assert_eq!(ev.kind, EdgeKind::Unknown(6));
        listener.stop();
    }

    #[test]
    fn end_of_stream() {
        init_logger();
        let (file, tx) = event_source();
        let cancel = CancelToken::new().unwrap();
        let (listener, mut sub) = Listener::spawn(AbiVersion::V2, 9, file, &cancel).unwrap();
        tx.send(&v2_record(1, 9, 1)).unwrap();
        // a zero length read
        tx.send(&[]).unwrap();
        assert_eq!(sub.next().map(|ev| ev.seqno), Some(1));
        assert_eq!(sub.next(), None);
        listener.stop();
    }
}
