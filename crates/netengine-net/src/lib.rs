//! TCP/TLS transport: framing, the wire codec, per-connection I/O tasks and
//! kind-based message routing shared by the server and the client.

mod connection;
pub mod error;
pub mod framing;
pub mod messages;
pub mod packet;
pub mod platform;
pub mod routing;
pub mod tcp_client;
pub mod tcp_server;
pub mod tls;

pub use error::TransportError;
pub use framing::{DEFAULT_MAX_MESSAGE_SIZE, FrameConfig, FrameError, read_frame, write_frame};
pub use messages::{
    Authentication, CodecError, Content, EndOfStream, IncomingMessage, Message, MessageKind,
    PROTOCOL_VERSION, decode_message, encode_message,
};
pub use packet::{ConnectionId, IdGenerator, Packet, PacketKind};
pub use platform::SocketConfig;
pub use routing::{MessageHandler, MessageRouter, RouteError};
pub use tcp_client::{ConnectionState, ConnectionStateWatch, SERVER_CONNECTION, TransportClient};
pub use tcp_server::{TransportConfig, TransportServer};
pub use tls::{ClientTls, ClientTlsSettings, ServerTls, ServerTlsSettings, TlsError};
