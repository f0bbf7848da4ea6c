// ravenly-api: HTTP and WebSocket transport layer for the ravenly cluster client

pub mod changes;
pub mod command;
pub mod commands;
pub mod error;
pub mod node;
pub mod transport;
pub mod websocket;

pub use command::{Command, JsonCommand, RawRequest, RawResponse};
pub use error::Error;
pub use node::{ServerNode, ServerRole, Topology};
pub use transport::{ClientIdentity, HttpTransport, ReqwestTransport, TlsMode, TransportConfig};
pub use websocket::{
    TungsteniteConnector, WebSocketConnector, WebSocketSession, WebSocketSink, WebSocketSource,
};
