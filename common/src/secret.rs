//! Re-export of `secrecy` wrapper types used everywhere a password, session
//! key, or signing secret crosses a struct boundary.
//!
//! Use `SecretString` for anything that is naturally textual (passwords,
//! bearer tokens, session keys). Use `SecretBox<Vec<u8>>` for raw key
//! material (the server HS256 secret, decoded PEM bytes).

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
