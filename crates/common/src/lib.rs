//! Types shared by the session, pipeline and realtime crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
