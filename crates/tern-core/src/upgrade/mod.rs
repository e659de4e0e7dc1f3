//! Protocol upgrades that take over the connection: WebSocket and CONNECT

pub mod frame;
pub mod tunnel;
pub mod websocket;

pub use frame::{Frame, FrameError, Opcode};
pub use tunnel::connect;
pub use websocket::{accept_key, upgrade as websocket, CloseFrame, Message, WebSocket, WebSocketConfig, WebSocketError};
