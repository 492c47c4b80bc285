use std::{
    io, mem,
    net::SocketAddr,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use mio::{Interest, Registry, Token, net::TcpListener, net::UnixListener};
use tracing::{debug, info, warn};

use crate::client::ClientStream;

/// An accepted connection plus whatever identity the transport gives us.
pub struct Accepted {
    pub stream: ClientStream,
    pub peer: String,
    /// Proven peer uid; only Unix sockets can supply one.
    pub uid: Option<u32>,
}

enum ListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// The daemon's listening sockets. Bound up front, registered readable by
/// the reactor, and polled for accepts when ready.
#[derive(Default)]
pub struct Listener {
    sockets: Vec<(Token, ListenerSocket)>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a TCP listening socket, returning the actual local address
    /// (useful with port 0).
    pub fn bind_tcp(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        info!(addr = %local, "listening");
        self.sockets.push((Token(usize::MAX), ListenerSocket::Tcp(listener)));
        Ok(local)
    }

    /// Binds a Unix listening socket, replacing a stale socket file from a
    /// previous run.
    pub fn bind_unix(&mut self, path: &Path) -> io::Result<()> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "listening");
        self.sockets.push((Token(usize::MAX), ListenerSocket::Unix(listener, path.to_owned())));
        Ok(())
    }

    /// Registers every listening socket readable, taking tokens from the
    /// manager's allocator.
    pub(crate) fn register_all(
        &mut self,
        registry: &Registry,
        mut alloc: impl FnMut() -> Token,
    ) -> io::Result<()> {
        for (token, socket) in &mut self.sockets {
            *token = alloc();
            match socket {
                ListenerSocket::Tcp(l) => registry.register(l, *token, Interest::READABLE)?,
                ListenerSocket::Unix(l, _) => registry.register(l, *token, Interest::READABLE)?,
            }
        }
        Ok(())
    }

    pub(crate) fn owns(&self, token: Token) -> bool {
        self.sockets.iter().any(|(t, _)| *t == token)
    }

    /// Accepts one pending connection on the given listening socket.
    /// `Ok(None)` means the backlog is drained.
    pub(crate) fn accept(&mut self, token: Token) -> io::Result<Option<Accepted>> {
        let Some((_, socket)) = self.sockets.iter_mut().find(|(t, _)| *t == token) else {
            return Ok(None);
        };
        match socket {
            ListenerSocket::Tcp(listener) => match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(?err, "set_nodelay");
                    }
                    Ok(Some(Accepted {
                        stream: ClientStream::Tcp(stream),
                        peer: addr.to_string(),
                        uid: None,
                    }))
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err),
            },
            ListenerSocket::Unix(listener, _) => match listener.accept() {
                Ok((stream, _)) => {
                    let uid = peer_uid(&stream);
                    Ok(Some(Accepted {
                        stream: ClientStream::Unix(stream),
                        peer: "local".to_owned(),
                        uid,
                    }))
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err),
            },
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for (_, socket) in &self.sockets {
            if let ListenerSocket::Unix(_, path) = socket {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!(?err, path = %path.display(), "removing socket file");
                }
            }
        }
    }
}

/// SO_PEERCRED credentials of a connected Unix-socket peer.
fn peer_uid(stream: &mio::net::UnixStream) -> Option<u32> {
    let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&raw mut cred).cast(),
            &raw mut len,
        )
    };
    (rc == 0).then_some(cred.uid)
}
