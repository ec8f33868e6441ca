pub mod constants;
pub mod control;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod identity;
pub mod perms;
pub mod uid;

pub use error::AbyssError;
