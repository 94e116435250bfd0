//! Data structures representing format components.
//!
//! Each codec keeps its parsed headers, tables and per-frame decoding
//! routines here. The stream-level decoders in [`crate::process`] drive
//! them and own all state that spans frames.

pub mod alac;
pub mod atom;
pub mod channel;
pub mod iff;
pub mod mpeg_ps;
pub mod shorten;
pub mod tta;
pub mod wavpack;
