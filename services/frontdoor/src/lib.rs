pub mod acceptor;
pub mod config;

pub use acceptor::{
    create, ConnectionDetails, ConnectionHandler, ConnectionInfo, Listener, ListenerHandle,
    ListenerOptions, RequestMeta, TlsOptions, TransportError, WebSocketOptions,
};
