//! The socket connection to a Wayland compositor.
//!
//! Locating the socket, adopting it into tokio, and moving whole messages
//! (with any file descriptors riding along as ancillary data) across it.

use std::{
    collections::VecDeque,
    env,
    ffi::{OsStr, OsString},
    io::{ErrorKind, IoSlice, IoSliceMut},
    os::{
        fd::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    path::PathBuf,
};

use thiserror::Error;
use tokio_seqpacket::{
    UnixSeqpacket,
    ancillary::{AddControlMessageError, AncillaryMessageWriter, OwnedAncillaryMessage},
};
use wl_core::wire::serde::{CompileTimeMessageSize, Decode, MessageHeader, SerdeError};

use crate::event::Event;

/// The display name used when neither the caller nor the environment names one.
pub const DEFAULT_DISPLAY: &str = "wayland-0";

/// Room for one `SCM_RIGHTS` record of 28 descriptors, the most a single
/// message may carry.
const ANCILLARY_BUFFER_SIZE: usize = 128;

/// Where to find the compositor, as read from the environment.
///
/// Empty values are treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayConfig {
    /// `WAYLAND_SOCKET`: an already connected socket inherited from the parent.
    pub wayland_socket: Option<OsString>,
    /// `WAYLAND_DISPLAY`: the socket name or absolute path.
    pub wayland_display: Option<OsString>,
    /// `XDG_RUNTIME_DIR`: the directory relative socket names live in.
    pub xdg_runtime_dir: Option<OsString>,
}

fn non_empty(value: Option<OsString>) -> Option<OsString> {
    value.filter(|value| !value.is_empty())
}

impl DisplayConfig {
    /// Reads the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            wayland_socket: non_empty(env::var_os("WAYLAND_SOCKET")),
            wayland_display: non_empty(env::var_os("WAYLAND_DISPLAY")),
            xdg_runtime_dir: non_empty(env::var_os("XDG_RUNTIME_DIR")),
        }
    }

    /// Resolves the socket path for the display `name`.
    ///
    /// The name falls back to `WAYLAND_DISPLAY` and then to
    /// [`DEFAULT_DISPLAY`]. Absolute names are used as they are, relative
    /// ones are joined onto `XDG_RUNTIME_DIR`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoXdgRuntimeDir`] if the name is relative
    /// and the runtime directory is not set.
    pub fn socket_path(&self, name: Option<&OsStr>) -> Result<PathBuf, ConnectionError> {
        let name = name
            .filter(|name| !name.is_empty())
            .or(self.wayland_display.as_deref())
            .unwrap_or(OsStr::new(DEFAULT_DISPLAY));

        let name = PathBuf::from(name);
        if name.is_absolute() {
            return Ok(name);
        }

        let runtime_dir = non_empty(self.xdg_runtime_dir.clone())
            .ok_or(ConnectionError::NoXdgRuntimeDir)?;
        Ok(PathBuf::from(runtime_dir).join(name))
    }

    /// Parses `WAYLAND_SOCKET`, if set.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidWaylandSocket`] if the value is not a
    /// file descriptor number.
    pub fn inherited_socket(&self) -> Result<Option<RawFd>, ConnectionError> {
        let Some(value) = non_empty(self.wayland_socket.clone()) else {
            return Ok(None);
        };

        value
            .to_str()
            .and_then(|value| value.parse::<RawFd>().ok())
            .filter(|fd| *fd >= 0)
            .map(Some)
            .ok_or_else(|| ConnectionError::InvalidWaylandSocket(value))
    }
}

/// Opens the socket described by `config` for the display `name`.
///
/// An inherited `WAYLAND_SOCKET` takes precedence unless a name is given.
///
/// # Errors
///
/// Returns an error if the socket cannot be located or connected.
pub fn open(config: &DisplayConfig, name: Option<&OsStr>) -> Result<UnixStream, ConnectionError> {
    if name.is_none()
        && let Some(fd) = config.inherited_socket()?
    {
        tracing::debug!(fd, "using inherited wayland socket");
        // SAFETY: WAYLAND_SOCKET hands this process ownership of an open,
        // connected socket descriptor, and nothing else adopts it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        return Ok(UnixStream::from(fd));
    }

    let path = config.socket_path(name)?;
    tracing::debug!(path = %path.display(), "connecting to wayland display");
    UnixStream::connect(&path).map_err(ConnectionError::ConnectError)
}

/// Splits a connected stream into the halves used for writing and reading.
///
/// Must be called from within a tokio runtime.
pub(crate) fn split(stream: UnixStream) -> Result<(SendSocket, RecvSocket), ConnectionError> {
    stream
        .set_nonblocking(true)
        .map_err(ConnectionError::AdoptError)?;
    let stream_dup = stream.try_clone().map_err(ConnectionError::CloneError)?;

    Ok((adopt(stream)?.into(), adopt(stream_dup)?.into()))
}

fn adopt(stream: UnixStream) -> Result<UnixSeqpacket, ConnectionError> {
    // SAFETY: the descriptor is taken out of an owned, connected socket and
    // handed over exactly once.
    unsafe { UnixSeqpacket::from_raw_fd(stream.into_raw_fd()) }
        .map_err(ConnectionError::AdoptError)
}

/// Errors that can occur when establishing a connection to a Wayland compositor.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The `XDG_RUNTIME_DIR` environment variable is not set.
    #[error("XDG_RUNTIME_DIR cannot be found in the environment.")]
    NoXdgRuntimeDir,
    /// `WAYLAND_SOCKET` does not hold a file descriptor number.
    #[error("WAYLAND_SOCKET is not a file descriptor: {0:?}")]
    InvalidWaylandSocket(OsString),
    /// Could not connect to the Wayland display.
    #[error("Could not connect to wayland display.")]
    ConnectError(#[source] std::io::Error),
    /// Could not clone the underlying Unix stream.
    #[error("Could not clone the stream.")]
    CloneError(#[source] std::io::Error),
    /// Could not register the socket with the tokio reactor.
    #[error("Could not adopt the socket into the async runtime.")]
    AdoptError(#[source] std::io::Error),
    /// The connection was created outside of a tokio runtime.
    #[error("A tokio runtime is required to run the dispatch worker.")]
    NoRuntime,
}

/// The writing half of the connection.
#[derive(Debug)]
pub(crate) struct SendSocket(UnixSeqpacket);

impl SendSocket {
    /// Sends one message along with file descriptors.
    ///
    /// # Errors
    ///
    /// This function will return an error if sending the message fails.
    /// See [UnixSeqpacket::send_vectored_with_ancillary] for more details.
    pub(crate) async fn send(&self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> Result<(), SendError> {
        let mut ancillary_buffer = [0; ANCILLARY_BUFFER_SIZE];
        let mut ancillary = AncillaryMessageWriter::new(&mut ancillary_buffer[..]);
        if !fds.is_empty() {
            ancillary.add_fds(fds)?;
        }

        let sent = loop {
            match self
                .0
                .send_vectored_with_ancillary(&[IoSlice::new(buf)], &mut ancillary)
                .await
            {
                Ok(sent) => break sent,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(SendError::IoError(err)),
            }
        };

        // The descriptors went out with the first byte; the rest is plain data.
        let mut written = sent;
        while written < buf.len() {
            match self.0.send(&buf[written..]).await {
                Ok(0) => return Err(SendError::IoError(ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(SendError::IoError(err)),
            }
        }

        Ok(())
    }
}

impl From<UnixSeqpacket> for SendSocket {
    fn from(value: UnixSeqpacket) -> Self {
        Self(value)
    }
}

/// Errors that can occur when sending a message.
#[derive(Debug, Error)]
pub enum SendError {
    /// Too many file descriptors for one message.
    #[error("Failed to add fds to ancillary buffer")]
    AddFdsFailed(#[from] AddControlMessageError),
    /// The context was closed.
    #[error("The connection is closed.")]
    Closed,
    /// Writing to the socket failed.
    #[error("IO operation failed.")]
    IoError(#[from] std::io::Error),
}

/// The reading half of the connection.
///
/// Descriptors are queued here as they arrive, independent of which bytes
/// the kernel delivered them with. Each event borrows the whole queue and
/// hands back whatever its handler did not take.
#[derive(Debug)]
pub(crate) struct RecvSocket {
    socket: UnixSeqpacket,
    fds: VecDeque<OwnedFd>,
}

impl RecvSocket {
    /// Reads exactly one message.
    ///
    /// The header is read with a single `recvmsg`, then the body is read in
    /// full. Descriptors received by either step join the queue.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::EndOfStream`] if the compositor hung up between
    /// messages, and a fatal error for truncated or malformed messages.
    pub(crate) async fn read_event(&mut self) -> Result<Event, ReadError> {
        let mut header_buf = [0u8; MessageHeader::SIZE];
        match self.recv_with_ancillary(&mut header_buf).await? {
            0 => return Err(ReadError::EndOfStream),
            read if read < MessageHeader::SIZE => return Err(ReadError::ShortHeader(read)),
            _ => {}
        }

        let (header, _) = MessageHeader::decode(&header_buf)?;
        let mut body = vec![0u8; header.body_len()?];

        let mut filled = 0;
        while filled < body.len() {
            match self.recv_with_ancillary(&mut body[filled..]).await {
                Ok(0) => {
                    return Err(ReadError::ShortBody {
                        expected: body.len(),
                        received: filled,
                    });
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(ReadError::IoError(err)),
            }
        }

        Ok(Event::new(header, body, std::mem::take(&mut self.fds)))
    }

    /// Puts the descriptors `event` left untouched back at the front of the
    /// queue, ahead of any that arrived since.
    pub(crate) fn reclaim(&mut self, event: Event) {
        let mut leftover = event.into_fds();
        leftover.append(&mut self.fds);
        self.fds = leftover;
    }

    /// Descriptors received but not yet handed to an event.
    #[cfg(test)]
    pub(crate) fn queued_fds(&self) -> usize {
        self.fds.len()
    }

    async fn recv_with_ancillary(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Self { socket, fds } = self;
        let mut ancillary_buffer = [0; ANCILLARY_BUFFER_SIZE];
        let (read, ancillary_reader) = socket
            .recv_vectored_with_ancillary(&mut [IoSliceMut::new(buf)], &mut ancillary_buffer[..])
            .await?;

        for message in ancillary_reader.into_messages() {
            if let OwnedAncillaryMessage::FileDescriptors(received_fds) = message {
                fds.extend(received_fds);
            }
        }
        Ok(read)
    }
}

impl From<UnixSeqpacket> for RecvSocket {
    fn from(value: UnixSeqpacket) -> Self {
        Self {
            socket: value,
            fds: VecDeque::new(),
        }
    }
}

/// Errors that can occur when reading a message.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The compositor closed the connection.
    #[error("The connection reached end of stream.")]
    EndOfStream,
    /// The connection ended inside a message header.
    #[error("Short message header: {0} of 8 bytes.")]
    ShortHeader(usize),
    /// The connection ended inside a message body.
    #[error("Short message body: {received} of {expected} bytes.")]
    ShortBody {
        /// Body length declared by the header.
        expected: usize,
        /// Body bytes read before the connection ended.
        received: usize,
    },
    /// The header declared an impossible size.
    #[error("Malformed message header.")]
    DecodeHeaderError(#[from] SerdeError),
    /// Reading from the socket failed.
    #[error("IO operation failed.")]
    IoError(#[from] std::io::Error),
}

impl ReadError {
    /// Returns `true` for errors that mean the connection is simply gone,
    /// which ends a session without failing it.
    #[must_use]
    pub fn is_clean_shutdown(&self) -> bool {
        match self {
            Self::EndOfStream => true,
            Self::IoError(err) => matches!(
                err.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::fd::AsFd,
        time::Duration,
    };

    use wl_core::wire::{MessageEncoder, serde::SerdeError};

    use super::*;

    fn config(display: Option<&str>, runtime_dir: Option<&str>) -> DisplayConfig {
        DisplayConfig {
            wayland_socket: None,
            wayland_display: display.map(OsString::from),
            xdg_runtime_dir: runtime_dir.map(OsString::from),
        }
    }

    #[test]
    fn default_display_under_runtime_dir() {
        let path = config(None, Some("/run/user/1000"))
            .socket_path(None)
            .unwrap();
        assert_eq!(path, PathBuf::from("/run/user/1000/wayland-0"));
    }

    #[test]
    fn explicit_name_wins_over_environment() {
        let config = config(Some("wayland-1"), Some("/run/user/1000"));
        assert_eq!(
            config.socket_path(Some(OsStr::new("wayland-7"))).unwrap(),
            PathBuf::from("/run/user/1000/wayland-7")
        );
        assert_eq!(
            config.socket_path(None).unwrap(),
            PathBuf::from("/run/user/1000/wayland-1")
        );
        assert_eq!(
            config.socket_path(Some(OsStr::new(""))).unwrap(),
            PathBuf::from("/run/user/1000/wayland-1")
        );
    }

    #[test]
    fn absolute_display_needs_no_runtime_dir() {
        let path = config(Some("/tmp/compositor.sock"), None)
            .socket_path(None)
            .unwrap();
        assert_eq!(path, PathBuf::from("/tmp/compositor.sock"));
    }

    #[test]
    fn missing_runtime_dir_is_reported() {
        assert!(matches!(
            config(None, None).socket_path(None),
            Err(ConnectionError::NoXdgRuntimeDir)
        ));
        assert!(matches!(
            config(None, Some("")).socket_path(None),
            Err(ConnectionError::NoXdgRuntimeDir)
        ));
    }

    #[test]
    fn inherited_socket_parsing() {
        let mut config = config(None, None);
        assert_eq!(config.inherited_socket().unwrap(), None);

        config.wayland_socket = Some("5".into());
        assert_eq!(config.inherited_socket().unwrap(), Some(5));

        config.wayland_socket = Some("five".into());
        assert!(matches!(
            config.inherited_socket(),
            Err(ConnectionError::InvalidWaylandSocket(_))
        ));
    }

    #[test]
    fn connect_failure_is_reported() {
        let config = config(Some("/nonexistent/wl-client-test.sock"), None);
        assert!(matches!(
            open(&config, None),
            Err(ConnectionError::ConnectError(_))
        ));
    }

    fn message(object_id: u32, opcode: u16, value: u32) -> Vec<u8> {
        let mut encoder = MessageEncoder::new(object_id, opcode);
        encoder.write(&value).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn reads_one_message_at_a_time() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();

        let mut bytes = message(1, 0, 2);
        bytes.extend(message(4, 3, 9));
        peer.write_all(&bytes).unwrap();

        let mut first = recv.read_event().await.unwrap();
        assert_eq!((first.object_id(), first.opcode()), (1, 0));
        assert_eq!(first.read_u32().unwrap(), 2);

        let mut second = recv.read_event().await.unwrap();
        assert_eq!((second.object_id(), second.opcode()), (4, 3));
        assert_eq!(second.read_u32().unwrap(), 9);
    }

    #[tokio::test]
    async fn body_split_across_writes() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();

        let bytes = message(2, 1, 0xdead_beef);
        peer.write_all(&bytes[..10]).unwrap();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            peer.write_all(&bytes[10..]).unwrap();
            peer
        });

        let mut event = recv.read_event().await.unwrap();
        assert_eq!(event.read_u32().unwrap(), 0xdead_beef);
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn end_of_stream_is_clean() {
        let (local, peer) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();
        drop(peer);

        let err = recv.read_event().await.unwrap_err();
        assert!(matches!(err, ReadError::EndOfStream));
        assert!(err.is_clean_shutdown());
    }

    #[tokio::test]
    async fn truncated_messages_are_fatal() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();
        peer.write_all(&[1, 0, 0, 0]).unwrap();

        let err = recv.read_event().await.unwrap_err();
        assert!(matches!(err, ReadError::ShortHeader(4)));
        assert!(!err.is_clean_shutdown());

        let (local, mut peer) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();
        peer.write_all(&message(1, 0, 2)[..10]).unwrap();
        drop(peer);

        let err = recv.read_event().await.unwrap_err();
        assert!(matches!(
            err,
            ReadError::ShortBody {
                expected: 4,
                received: 2
            }
        ));
    }

    #[tokio::test]
    async fn undersized_header_is_fatal() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();

        let mut bytes = 1u32.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&(4u32 << 16).to_ne_bytes());
        peer.write_all(&bytes).unwrap();

        let err = recv.read_event().await.unwrap_err();
        assert!(matches!(
            err,
            ReadError::DecodeHeaderError(SerdeError::InvalidSize { .. })
        ));
    }

    #[tokio::test]
    async fn file_descriptors_drain_in_order() {
        let (local, remote) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();
        let (peer, _peer_recv) = split(remote).unwrap();

        let (first_local, mut first_remote) = UnixStream::pair().unwrap();
        let (second_local, mut second_remote) = UnixStream::pair().unwrap();

        peer.send(
            &message(3, 0, 0),
            &[first_local.as_fd(), second_local.as_fd()],
        )
        .await
        .unwrap();

        let mut event = recv.read_event().await.unwrap();
        assert_eq!(event.pending_fds(), 2);

        let mut first = UnixStream::from(event.read_fd().unwrap());
        let mut second = UnixStream::from(event.read_fd().unwrap());
        assert!(matches!(
            event.read_fd(),
            Err(SerdeError::MissingFileDescriptor)
        ));

        first.write_all(b"1").unwrap();
        second.write_all(b"2").unwrap();
        let mut buf = [0u8; 1];
        first_remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"1");
        second_remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"2");
    }

    #[tokio::test]
    async fn untaken_descriptors_carry_over_to_the_next_event() {
        let (local, remote) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();
        let (peer, _peer_recv) = split(remote).unwrap();
        let (keymap, mut keymap_remote) = UnixStream::pair().unwrap();

        let mut batch = message(2, 0, 7);
        batch.extend(message(3, 0, 1));
        peer.send(&batch, &[keymap.as_fd()]).await.unwrap();

        let mut first = recv.read_event().await.unwrap();
        assert_eq!(first.object_id(), 2);
        assert_eq!(first.read_u32().unwrap(), 7);
        assert_eq!(first.pending_fds(), 1);
        recv.reclaim(first);
        assert_eq!(recv.queued_fds(), 1);

        let mut second = recv.read_event().await.unwrap();
        assert_eq!(second.object_id(), 3);
        let mut received = UnixStream::from(second.read_fd().unwrap());
        recv.reclaim(second);
        assert_eq!(recv.queued_fds(), 0);

        received.write_all(b"k").unwrap();
        let mut buf = [0u8; 1];
        keymap_remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"k");
    }

    #[tokio::test]
    async fn descriptors_sent_with_the_body_are_kept() {
        let (local, remote) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();
        let (peer, _peer_recv) = split(remote).unwrap();
        let (fd_local, _fd_remote) = UnixStream::pair().unwrap();

        let bytes = message(4, 1, 9);
        peer.send(&bytes[..8], &[]).await.unwrap();
        peer.send(&bytes[8..], &[fd_local.as_fd()]).await.unwrap();

        let mut event = recv.read_event().await.unwrap();
        assert_eq!(event.read_u32().unwrap(), 9);
        assert!(event.read_fd().is_ok());
    }

    #[tokio::test]
    async fn descriptors_keep_arrival_order_across_events() {
        let (local, remote) = UnixStream::pair().unwrap();
        let (_send, mut recv) = split(local).unwrap();
        let (peer, _peer_recv) = split(remote).unwrap();
        let (older, mut older_remote) = UnixStream::pair().unwrap();
        let (newer, _newer_remote) = UnixStream::pair().unwrap();

        peer.send(&message(1, 0, 0), &[older.as_fd()]).await.unwrap();
        let first = recv.read_event().await.unwrap();
        peer.send(&message(1, 0, 1), &[newer.as_fd()]).await.unwrap();
        recv.reclaim(first);

        let mut second = recv.read_event().await.unwrap();
        assert_eq!(second.pending_fds(), 2);
        let mut front = UnixStream::from(second.read_fd().unwrap());
        front.write_all(b"o").unwrap();
        let mut buf = [0u8; 1];
        older_remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"o");
    }
}
