//! The lamp's newline delimited text protocol, independent of the transport carrying it.

pub mod decoder;
pub mod framer;
pub mod status;
