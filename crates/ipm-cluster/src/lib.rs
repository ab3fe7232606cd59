pub mod dialer;
pub mod error;
pub mod hub;
pub mod message;
pub mod peer;
pub mod sync;

pub use dialer::*;
pub use error::*;
pub use hub::*;
pub use message::*;
pub use peer::{Frame, Handshake, PeerSocket, INSTANCE_PRIORITY, INSTANCE_UUID};
pub use sync::*;
