//! Transport-agnostic session core for the voice assistant client.
//!
//! Nothing in this crate performs I/O. Platform bindings drive a
//! [`session::Session`] by executing its [`session::Command`]s and feeding back
//! [`session::TransportEvent`]s and timer expirations.

pub mod codec;
pub mod config;
pub mod controller;
pub mod errors;
pub mod models;
pub mod monitor;
pub mod reconnect;
pub mod router;
pub mod session;

pub use codec::{Frame, FrameCodec, Notice, ToolEventCodec};
pub use config::{Configuration, Endpoint, EndpointResolver};
pub use controller::{AudioConstraints, ControllerState, ConversationController, MediaResource};
pub use errors::{ConfigError, MediaAccessError, ProtocolError, SessionError};
pub use models::{EventLog, Message, MessageKind, StreamingStatus, ToolEvent};
pub use monitor::{ConversationSession, ProductInfoMonitor, ToolMonitor};
pub use reconnect::ReconnectPolicy;
pub use router::{ClientEvent, ConversationCodec, MessageRouter};
pub use session::{Command, Session, SessionState, SocketId, TimerId, TransportEvent};
