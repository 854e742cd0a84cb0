//! Session and account orchestration: links platform users to remote
//! messaging accounts, keeps one live client per account slot, and serves
//! profile, dialog, message and media reads through them.

pub mod client;
pub mod config;
mod directory_reader;
pub mod error;
mod handshake;
pub mod locks;
mod logout;
pub mod media_cache;
mod message_reader;
pub mod pool;
mod registry;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use client::{
    ChatPhoto, RemoteChat, RemoteDialog, RemoteError, RemoteMedia, RemoteMessage, RemoteStream,
    RemoteUser, RpcError, SentCode, SessionClient, SessionClientFactory, SignInOutcome, UserStatus,
};
pub use config::{CoreConfig, HandshakeKeyPolicy};
pub use directory_reader::{presence_of, OwnProfile};
pub use error::{classify, CoreError};
pub use handshake::normalize_phone;
pub use logout::SlotLogout;
pub use message_reader::human_size;
pub use registry::SessionRegistry;

#[cfg(test)]
#[path = "tests/fixture.rs"]
mod fixture;
