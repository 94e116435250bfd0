//! Bit-exact decoders for lossless audio formats.
//!
//! ## Technical Overview
//!
//! Every decoder reads through a [`BitCursor`](utils::bitstream_io::BitCursor)
//! over any `Read + Seek` source and produces [`FrameList`](process::FrameList)
//! batches of signed PCM samples, one vector per channel in WAVE channel order.
//!
//! ### Formats
//!
//! - **ALAC** in MP4/M4A: atom navigation, adaptive Rice residuals, adaptive
//!   LPC and mid/side decorrelation. Seekable through the sample tables.
//! - **WavPack 4**: lossless integer blocks with decorrelation passes, joint
//!   stereo, extended integers and MD5 verification.
//! - **Shorten**: fixed and quantized LPC predictors with running means.
//! - **TTA**: adaptive Rice codes and the hybrid filter, CRC-checked and
//!   seekable per frame.
//! - **DVD-Audio AOB**: MPEG program stream demultiplexing of the PCM
//!   substream. MLP substreams are recognized but not decoded.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! use lossless::process::PcmReader;
//! use lossless::process::tta::TtaDecoder;
//!
//! let mut decoder = TtaDecoder::open(BufReader::new(File::open("track.tta")?))?;
//! println!("{}", decoder.info());
//!
//! loop {
//!     let frames = decoder.read()?;
//!     if frames.is_empty() {
//!         break;
//!     }
//!     let pcm = frames.to_le_bytes(decoder.info().bits_per_sample);
//!     // write `pcm` somewhere
//! #   let _ = pcm;
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Validation problems that still leave a usable stream are logged at warning
//! level. Decoders with such fallbacks take a `fail_level`; setting it to
//! [`log::Level::Warn`] turns those warnings into errors.

/// Stream-level decoders.
///
/// - **ALAC** ([`process::alac`]): MP4 track decoding with seeking
/// - **WavPack** ([`process::wavpack`]): multi-block frames, MD5 check
/// - **Shorten** ([`process::shorten`]): command stream interpreter
/// - **TTA** ([`process::tta`]): frame decoding with seeking
/// - **AOB** ([`process::aob`]): DVD-Audio PCM demultiplexing
pub mod process;

/// Data structures representing format components.
///
/// - **Atoms** ([`structs::atom`]): MP4 box navigation
/// - **Channels** ([`structs::channel`]): masks and channel order tables
/// - **Embedded headers** ([`structs::iff`]): WAVE/AIFF headers inside Shorten
/// - **Program streams** ([`structs::mpeg_ps`]): AOB sectors and PES packets
pub mod structs;

/// Utility functions and supporting infrastructure.
///
/// - **Byte buffer** ([`utils::byte_buffer`]): growable FIFO with rewind
/// - **Bitstream I/O** ([`utils::bitstream_io`]): bit cursor with marks
/// - **Sources** ([`utils::source`]): callback and pipe adapters
/// - **CRC Validation** ([`utils::crc`]): TTA checksums
/// - **Error Handling** ([`utils::errors`]): Error types
pub mod utils;
