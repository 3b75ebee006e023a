//! Network utilities shared by the login authority.

pub mod ipban;
