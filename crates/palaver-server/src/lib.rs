pub mod broadcast;
pub mod client;
pub mod rooms;
pub mod server;
pub mod session;
pub mod wire;

pub use broadcast::Broadcaster;
pub use client::ConnectionRegistry;
pub use rooms::{Room, RoomRegistry};
pub use server::{start, AppState, ServerConfig, ServerHandle};
pub use session::{Session, SessionState};
pub use wire::{ClientFrame, ServerFrame};
