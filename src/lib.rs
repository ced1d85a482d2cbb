//! A client library for a local message-bus wire protocol: argument
//! codec, message framing, authentication, and a non-blocking
//! connection state machine built on `epoll`.

pub mod address;
pub mod arguments;
pub mod auth;
pub mod commutex;
pub mod connection;
pub mod dbus_reader;
pub mod dbus_writer;
pub mod dispatcher;
pub mod error;
pub mod fd;
pub mod message;
pub mod names;
pub mod poller;
pub mod server;
pub mod signature;
pub mod transport;
pub mod value;

pub use address::ConnectAddress;
pub use arguments::{Arguments, Reader, Writer};
pub use connection::{Connection, ConnectionIoHandler, ConnectionState, PendingReply, Role, SecondaryConnection};
pub use dispatcher::{EventDispatcher, IoHandler, TimerId};
pub use error::{Error, Result};
pub use message::{Message, MessageType};
pub use poller::{EpollPoller, Interest, Poller};
pub use server::PeerServer;
pub use signature::Type;
pub use transport::{Transport, TcpTransport, UnixTransport};
pub use value::Value;
