//! Utility functions and supporting infrastructure.
//!
//! Provides the byte buffer and bit cursor every decoder reads through,
//! byte sources, CRC validation and error handling.

pub mod bitstream_io;
pub mod byte_buffer;
pub mod crc;
pub mod errors;
pub mod source;
