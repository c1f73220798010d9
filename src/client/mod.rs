//! Client connection layer

pub mod connection;
pub mod pool;
pub mod tcp_connection;

pub use connection::{Connection, ConnectionFactory, Interrupt};
pub use pool::{ConnectionPool, PooledConnection};
pub use tcp_connection::{TcpConnection, TcpConnectionFactory};
