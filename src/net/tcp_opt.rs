use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

const LISTEN_BACKLOG: i32 = 1024;

/// Sets per-connection TCP flags on an accepted stream.
///
/// * `TCP_NODELAY`: frames are small and latency matters more than packet count.
///
/// mio streams are already non-blocking.
pub fn apply_optimizations(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

/// Creates a non-blocking listening socket for the relay.
///
/// `SO_REUSEADDR` is set so a restarted relay can rebind while old
/// connections sit in TIME_WAIT.
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
