//! Moving [`SharedMemoryHandle`]s between processes.
//!
//! A handle travels as one `SCM_RIGHTS` message over a Unix stream socket:
//! the fd rides in the ancillary data and the usable size is the payload,
//! encoded as a little-endian `u64`.
//!
//! ```text
//! payload:   [ size: u64 LE ]
//! ancillary: [ SCM_RIGHTS: fd ]
//! ```

use super::SharedMemoryHandle;
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

const SIZE_LEN: usize = std::mem::size_of::<u64>();

/// Send a [`SharedMemoryHandle`] over a Unix socket.
///
/// The local handle is consumed; the kernel keeps the memory alive for the
/// receiver.
///
/// # Example
///
/// ```rust,ignore
/// use discardable_shm::memory::ipc::send_handle;
///
/// let (sender, receiver) = UnixStream::pair()?;
/// send_handle(&sender, segment.share_to_process()?)?;
/// ```
pub fn send_handle(socket: &UnixStream, handle: SharedMemoryHandle) -> Result<()> {
    let (fd, size) = handle.into_parts();
    let payload = (size as u64).to_le_bytes();
    send_with_fd(socket, fd.as_fd(), &payload)?;
    tracing::trace!(size, "sent shared memory handle");
    Ok(())
}

/// Receive a [`SharedMemoryHandle`] sent with [`send_handle`].
///
/// # Errors
///
/// Fails if the peer hung up, the message carries anything but exactly one
/// fd, or the payload is not a size.
pub fn recv_handle(socket: &UnixStream) -> Result<SharedMemoryHandle> {
    let mut payload = [0u8; SIZE_LEN];
    let (bytes, fd) = recv_with_fd(socket, &mut payload)?;

    if bytes == 0 {
        return Err(Error::InvalidSegment("peer closed the socket".into()));
    }
    let fd = fd.ok_or_else(|| Error::InvalidSegment("message carried no fd".into()))?;
    if bytes != SIZE_LEN {
        return Err(Error::InvalidSegment(format!(
            "expected {SIZE_LEN} payload bytes, got {bytes}"
        )));
    }

    let size = usize::try_from(u64::from_le_bytes(payload))
        .map_err(|e| Error::InvalidSegment(e.to_string()))?;
    tracing::trace!(size, "received shared memory handle");
    Ok(SharedMemoryHandle::new(fd, size))
}

fn send_with_fd(socket: &UnixStream, fd: BorrowedFd<'_>, payload: &[u8]) -> Result<()> {
    let fds = [fd];
    let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut ancillary = SendAncillaryBuffer::new(&mut space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(Error::InvalidSegment("ancillary buffer too small".into()));
    }

    // SCM_RIGHTS needs at least one byte of regular data.
    let payload = if payload.is_empty() { &[0u8][..] } else { payload };
    sendmsg(socket, &[IoSlice::new(payload)], &mut ancillary, SendFlags::empty())?;
    Ok(())
}

fn recv_with_fd(socket: &UnixStream, payload: &mut [u8]) -> Result<(usize, Option<OwnedFd>)> {
    let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut ancillary = RecvAncillaryBuffer::new(&mut space);
    let msg = recvmsg(
        socket,
        &mut [IoSliceMut::new(payload)],
        &mut ancillary,
        RecvFlags::CMSG_CLOEXEC,
    )?;

    let mut received = Vec::new();
    for message in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = message {
            received.extend(rights);
        }
    }

    if msg.flags.contains(ReturnFlags::CTRUNC) || received.len() > 1 {
        return Err(Error::InvalidSegment(format!(
            "expected one fd, got {} (truncated: {})",
            received.len(),
            msg.flags.contains(ReturnFlags::CTRUNC)
        )));
    }
    Ok((msg.bytes, received.pop()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemory;
    use std::io::Write;

    fn mapped(name: &str, size: usize) -> SharedMemory {
        let mut shm = SharedMemory::new();
        shm.create(name, size).unwrap();
        shm.map(size).unwrap();
        shm
    }

    #[test]
    fn test_send_recv_handle() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let shm = mapped("test-ipc-handle", 8192);

        let handle = SharedMemoryHandle::new(shm.duplicate_handle().unwrap(), 8192);
        send_handle(&sender, handle).unwrap();

        let received = recv_handle(&receiver).unwrap();
        assert_eq!(received.size(), 8192);

        let (fd, size) = received.into_parts();
        let mut view = SharedMemory::from_fd(fd);
        view.map(size).unwrap();

        unsafe {
            *shm.memory().unwrap().as_ptr().add(4096) = 99;
            assert_eq!(*view.memory().unwrap().as_ptr().add(4096), 99);
        }
    }

    #[test]
    fn test_handles_arrive_in_order() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let first = mapped("test-ipc-first", 4096);
        let second = mapped("test-ipc-second", 8192);

        send_handle(&sender, SharedMemoryHandle::new(first.duplicate_handle().unwrap(), 4096))
            .unwrap();
        send_handle(&sender, SharedMemoryHandle::new(second.duplicate_handle().unwrap(), 8192))
            .unwrap();

        assert_eq!(recv_handle(&receiver).unwrap().size(), 4096);
        assert_eq!(recv_handle(&receiver).unwrap().size(), 8192);
    }

    #[test]
    fn test_recv_without_fd_fails() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        sender.write_all(&4096u64.to_le_bytes()).unwrap();
        assert!(recv_handle(&receiver).is_err());
    }

    #[test]
    fn test_recv_short_payload_fails() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let shm = mapped("test-ipc-short", 4096);
        send_with_fd(&sender, shm.handle().unwrap(), &[1, 2, 3]).unwrap();
        assert!(recv_handle(&receiver).is_err());
    }

    #[test]
    fn test_recv_after_hangup_fails() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        drop(sender);
        assert!(recv_handle(&receiver).is_err());
    }
}
