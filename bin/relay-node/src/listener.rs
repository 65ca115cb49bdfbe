use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;

/// Binds a dual-stack IPv6 listener with `SO_REUSEADDR` set, matching the
/// reference server's listen socket. `SO_REUSEADDR` on its own isn't
/// reachable through `tokio::net::TcpListener::bind`, so the socket is built
/// with `socket2` and handed to tokio afterward.
pub fn bind_dual_stack(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, None)?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    let addr: std::net::SocketAddr = format!("[::]:{port}").parse().expect("valid socket address");
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
