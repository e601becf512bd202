//! # Network Abstraction Layer
//!
//! Traits that abstract over async network I/O so the engine can run on
//! different socket implementations.
//!
//! ## Purpose
//!
//! - **Production**: real tokio sockets
//! - **Testing**: simulated [turmoil](https://docs.rs/turmoil) sockets for
//!   deterministic, fast network simulation
//!
//! | Trait | Production Impl | Testing Impl |
//! |-------|-----------------|--------------|
//! | [`UdpSocket`] | `tokio::net::UdpSocket` | `turmoil::net::UdpSocket` |
//! | [`TcpStream`] | `tokio::net::TcpStream` | `turmoil::net::TcpStream` |
//! | [`TcpListener`] | `tokio::net::TcpListener` | `turmoil::net::TcpListener` |
//!
//! The client engine itself never accepts TCP connections; [`TcpListener`]
//! exists so tests can stand up simulated DoIP servers against the same
//! abstraction.
//!
//! All recv/read futures are cancellation-safe in the usual tokio sense:
//! the scheduler and channel tasks drop them freely inside `select!`.
//!
//! ## Feature Flags
//!
//! - `turmoil` (default): enables the turmoil implementations for testing

use std::future::Future;
use std::io;
use std::net::SocketAddr;

mod tokio_impl;

#[cfg(feature = "turmoil")]
mod turmoil_impl;

/// Async UDP socket abstraction.
///
/// The shared discovery endpoint is bound through this trait; broadcast
/// must be enabled so identification requests can go to the limited
/// broadcast address.
pub trait UdpSocket: Send + Sync + Sized + 'static {
    /// Bind to the given address.
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    /// Send a datagram to the given address.
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receive a datagram and the source address.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    /// Allow sending to broadcast addresses.
    fn set_broadcast(&self, enabled: bool) -> io::Result<()>;

    /// Get the local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Async TCP stream abstraction.
///
/// Implemented by `tokio::net::TcpStream` and `turmoil::net::TcpStream`.
/// Each stream is owned by exactly one channel task, which interleaves
/// reads and writes; no splitting is required.
pub trait TcpStream: Send + Sized + 'static {
    /// The listener type that produces this stream.
    type Listener: TcpListener<Stream = Self>;

    /// Connect to the given address.
    fn connect(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    /// Read data into the buffer.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write all data from the buffer.
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Shut down the write half, signalling a graceful close to the peer.
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Get the local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Get the peer address.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Async TCP listener abstraction.
///
/// Implemented by `tokio::net::TcpListener` and `turmoil::net::TcpListener`.
pub trait TcpListener: Send + Sync + Sized + 'static {
    /// The stream type produced when accepting connections.
    type Stream: TcpStream<Listener = Self>;

    /// Bind to the given address.
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send;

    /// Accept a new connection.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    /// Get the local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
