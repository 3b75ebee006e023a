//! Server implementation.
//!
//! The login authority is the only server process in this crate;
//! char-servers and map-servers are external collaborators that speak
//! the wire protocols implemented under [`login`].

pub mod login;
