//! C9: the NNTP line framer consumed by both the injection receiver and
//! the reader front-end. Everything else about the wire protocol (command
//! dispatch, authentication, TLS/SASL) is out of scope; see §1.

mod framer;

pub use framer::{Framer, ReadStatus, SetReadTimeout};
