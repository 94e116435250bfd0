use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Result, anyhow, bail};
use log::debug;

use lossless::process::alac::AlacDecoder;
use lossless::process::aob::AobPcmDecoder;
use lossless::process::shorten::ShortenDecoder;
use lossless::process::tta::TtaDecoder;
use lossless::process::wavpack::WavPackDecoder;
use lossless::process::{PcmReader, Seekable};
use lossless::utils::errors::StreamError;
use lossless::utils::source::StreamSource;

use crate::cli::command::Codec;

pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// File or stdin input. Stdin is made seekable within the bytes already
/// read, which is enough for codec sniffing and forward decoding.
pub type Source = Box<dyn ReadSeek>;

pub fn is_pipe(path: &Path) -> bool {
    path.to_string_lossy() == "-"
}

pub fn open_source(path: &Path) -> Result<Source> {
    if is_pipe(path) {
        Ok(Box::new(StreamSource::new(io::stdin().lock())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

/// Recognizes a stream from its first bytes.
pub fn detect_codec(head: &[u8]) -> Option<Codec> {
    const MP4_ATOMS: [&[u8; 4]; 6] = [b"ftyp", b"moov", b"mdat", b"free", b"skip", b"wide"];

    if head.len() >= 8 && MP4_ATOMS.iter().any(|tag| &head[4..8] == *tag) {
        return Some(Codec::Alac);
    }
    match head.get(..4)? {
        b"wvpk" => Some(Codec::Wavpack),
        b"ajkg" => Some(Codec::Shorten),
        b"TTA1" => Some(Codec::Tta),
        [0x00, 0x00, 0x01, 0xBA] => Some(Codec::Aob),
        _ => None,
    }
}

fn sniff(source: &mut Source) -> Result<Codec> {
    let mut head = [0u8; 12];
    let mut filled = 0;
    while filled < head.len() {
        let n = source.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    source.seek(SeekFrom::Start(0))?;

    let Some(codec) = detect_codec(&head[..filled]) else {
        debug!("Unrecognized leading bytes {:02X?}", &head[..filled]);
        bail!(StreamError::UnknownFormat);
    };
    debug!("Detected {} stream", codec.name());
    Ok(codec)
}

/// An opened decoder of any supported codec.
pub trait Decoder: PcmReader {
    /// Seek support, for codecs that have it.
    fn seekable(&mut self) -> Option<&mut dyn Seekable> {
        None
    }
}

impl<R: Read + Seek> Decoder for AlacDecoder<R> {
    fn seekable(&mut self) -> Option<&mut dyn Seekable> {
        Some(self)
    }
}

impl<R: Read + Seek> Decoder for TtaDecoder<R> {
    fn seekable(&mut self) -> Option<&mut dyn Seekable> {
        Some(self)
    }
}

impl<R: Read + Seek> Decoder for WavPackDecoder<R> {}
impl<R: Read + Seek> Decoder for ShortenDecoder<R> {}
impl<R: Read + Seek> Decoder for AobPcmDecoder<R> {}

/// Resolves `Codec::Auto` by sniffing and leaves the source at its start.
pub fn resolve_codec(source: &mut Source, codec: Codec) -> Result<Codec> {
    match codec {
        Codec::Auto => sniff(source),
        other => Ok(other),
    }
}

pub fn open_decoder(
    source: Source,
    codec: Codec,
    fail_level: log::Level,
) -> Result<Box<dyn Decoder>> {
    Ok(match codec {
        Codec::Alac => Box::new(AlacDecoder::open_with_fail_level(source, fail_level)?),
        Codec::Wavpack => Box::new(WavPackDecoder::open_with_fail_level(source, fail_level)?),
        Codec::Shorten => Box::new(ShortenDecoder::open_with_fail_level(source, fail_level)?),
        Codec::Tta => Box::new(TtaDecoder::open(source)?),
        Codec::Aob => Box::new(AobPcmDecoder::open_with_fail_level(source, fail_level)?),
        Codec::Auto => return Err(anyhow!("codec must be resolved before opening")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_detection() {
        assert_eq!(
            detect_codec(b"\0\0\0\x20ftypM4A \0\0\0\0"),
            Some(Codec::Alac)
        );
        assert_eq!(detect_codec(b"\0\0\x01\0moov"), Some(Codec::Alac));
        assert_eq!(detect_codec(b"wvpk\x20\0\0\0"), Some(Codec::Wavpack));
        assert_eq!(detect_codec(b"ajkg\x02"), Some(Codec::Shorten));
        assert_eq!(detect_codec(b"TTA1\x01\0"), Some(Codec::Tta));
        assert_eq!(detect_codec(&[0, 0, 1, 0xBA, 0x44]), Some(Codec::Aob));
        assert_eq!(detect_codec(b"RIFF\0\0\0\0WAVE"), None);
        assert_eq!(detect_codec(b"wv"), None);
    }

    #[test]
    fn sniffing_rewinds_the_source() -> Result<()> {
        let mut source: Source = Box::new(io::Cursor::new(b"TTA1rest".to_vec()));
        assert_eq!(resolve_codec(&mut source, Codec::Auto)?, Codec::Tta);
        assert_eq!(source.stream_position()?, 0);

        let mut short: Source = Box::new(io::Cursor::new(b"xyz".to_vec()));
        assert!(resolve_codec(&mut short, Codec::Auto).is_err());
        assert_eq!(resolve_codec(&mut short, Codec::Shorten)?, Codec::Shorten);
        Ok(())
    }
}
