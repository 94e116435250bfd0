/// Returns `Err($err)` when `$level` is at or above the configured failure
/// level, otherwise logs the error at `$level` and carries on.
#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err.into());
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

#[derive(thiserror::Error, Debug)]
pub enum BitstreamError {
    #[error("No mark is active on the bit cursor")]
    NoMark,

    #[error("Seek to byte {0} falls before the retained buffer region")]
    SeekBeforeRetained(u64),
}

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Stream is closed")]
    Closed,

    #[error("Source does not support seeking")]
    NotSeekable,

    #[error("Unable to detect a supported stream format")]
    UnknownFormat,
}

#[derive(thiserror::Error, Debug)]
pub enum AtomError {
    #[error("Atom not found: {0}")]
    NotFound(String),

    #[error("Atom '{tag}' declares size {size}, smaller than its {header}-byte header")]
    InvalidSize { tag: String, size: u64, header: u64 },

    #[error("Atom '{tag}' extends past its parent ({end} > {limit})")]
    Overrun { tag: String, end: u64, limit: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum AlacError {
    #[error("Sub-frame unused bits must be zero, read {0:#06X}")]
    InvalidUnusedBits(u16),

    #[error("Invalid ALAC sample description atom")]
    InvalidAlacAtom,

    #[error("Invalid mdhd atom version {0}")]
    InvalidMdhdAtom(u8),

    #[error("mdia atom not found")]
    MdiaNotFound,

    #[error("stsd atom not found")]
    StsdNotFound,

    #[error("mdhd atom not found")]
    MdhdNotFound,

    #[error("mdat atom not found")]
    MdatNotFound,

    #[error("Invalid seek table: {0}")]
    InvalidSeektable(String),

    #[error("Unsupported prediction type {0}")]
    UnsupportedPredictionType(u8),

    #[error("Unsupported channel count {0}")]
    UnsupportedChannelCount(u8),

    #[error("Unsupported bits per sample {0}")]
    UnsupportedBitsPerSample(u8),

    #[error("Sub-frame declares {found} samples, more than the frame length {max}")]
    FrameTooLong { found: u32, max: u32 },

    #[error("Frame channel count {found} does not match the stream ({expected})")]
    ChannelMismatch { found: usize, expected: usize },

    #[error("Elements of one frame set disagree on sample count ({found} vs {expected})")]
    SampleCountMismatch { found: usize, expected: usize },

    #[error("Zero run of {run} samples overruns the {remaining} samples left in the sub-frame")]
    ZeroRunOverflow { run: u32, remaining: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum WavPackError {
    #[error("Invalid block id: {0:02X?}")]
    InvalidBlockId([u8; 4]),

    #[error("Reserved header bit is set")]
    InvalidReservedBit,

    #[error("Unsupported stream version {0:#05X}")]
    UnsupportedVersion(u16),

    #[error("Block size {0} is too small to hold a header")]
    InvalidBlockSize(u32),

    #[error("Invalid decorrelation term {0}")]
    InvalidDecorrelationTerm(i32),

    #[error("Decorrelation weights or samples appear before decorrelation terms")]
    DecorrelationTermsMissing,

    #[error("Decorrelation samples appear before decorrelation weights")]
    DecorrelationWeightsMissing,

    #[error("Bitstream appears before entropy variables")]
    EntropyVariablesMissing,

    #[error("Block with samples has no bitstream sub-block")]
    BitstreamMissing,

    #[error("Too many decorrelation {what}: {found} for {max} terms")]
    ExcessiveDecorrelationData { what: &'static str, found: usize, max: usize },

    #[error("Sub-block {id:#04X} declares {size} bytes, only {remaining} remain in the block")]
    SubBlockOverrun { id: u8, size: usize, remaining: usize },

    #[error("Invalid {what} sub-block size {size}")]
    InvalidSubBlockSize { what: &'static str, size: usize },

    #[error("Residual unary prefix exceeds 16 ones")]
    ResidualOverflow,

    #[error("CRC mismatch for block {block_index}. Calculated {calculated:#010X}, Read {read:#010X}")]
    CrcMismatch { block_index: u32, calculated: u32, read: u32 },

    #[error("MD5 mismatch. Calculated {calculated}, Read {read}")]
    Md5Mismatch { calculated: String, read: String },

    #[error("Stream layout changed between blocks: {0}")]
    InconsistentBlock(&'static str),

    #[error("Unknown decoder sub-block {0:#04X}")]
    UnknownSubBlock(u8),

    #[error("Unsupported feature: {0}")]
    Unsupported(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum ShortenError {
    #[error("Invalid magic: {0:02X?}")]
    InvalidMagic([u8; 4]),

    #[error("Unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported file type {0}")]
    UnsupportedFileType(u32),

    #[error("Unknown command {0}")]
    UnknownCommand(u32),

    #[error("Invalid channel count {0}")]
    InvalidChannelCount(u32),

    #[error("Invalid block size {0}")]
    InvalidBlockSize(u32),

    #[error("LPC order {order} exceeds the maximum {max}")]
    InvalidLpcOrder { order: u32, max: u32 },

    #[error("Invalid bit shift {0}")]
    InvalidBitShift(u32),

    #[error("Invalid mean block count {0}")]
    InvalidMeanCount(u32),

    #[error("Residual width {0} exceeds 30 bits")]
    InvalidResidualWidth(u32),

    #[error("Verbatim byte value {0} does not fit in a byte")]
    InvalidVerbatimByte(u32),

    #[error("Block size changed inside a channel group")]
    BlockSizeChangeMidGroup,

    #[error("Invalid embedded header: {0}")]
    InvalidEmbeddedHeader(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum TtaError {
    #[error("Invalid magic: {0:02X?}")]
    InvalidMagic([u8; 4]),

    #[error("Unsupported format {0}")]
    UnsupportedFormat(u16),

    #[error("Unsupported bits per sample {0}")]
    UnsupportedBitsPerSample(u16),

    #[error("Invalid channel count {0}")]
    InvalidChannelCount(u16),

    #[error("Invalid sample rate {0}")]
    InvalidSampleRate(u32),

    #[error("CRC mismatch in {section}. Calculated {calculated:#010X}, Read {read:#010X}")]
    CrcMismatch { section: String, calculated: u32, read: u32 },

    #[error("Frame {index} has invalid size {size}")]
    InvalidFrameSize { index: usize, size: u32 },

    #[error("Rice parameter {0} exceeds 24 bits")]
    RiceParameterOverflow(u32),
}

#[derive(thiserror::Error, Debug)]
pub enum AobError {
    #[error("Invalid pack start code {0:#010X}")]
    InvalidPackHeader(u32),

    #[error("Invalid packet start code {0:#08X}")]
    InvalidPacketStartCode(u32),

    #[error("Packet of {length} bytes overruns the {sector}-byte sector")]
    PacketOverrun { length: usize, sector: usize },

    #[error("Invalid PCM private header: {0}")]
    InvalidPcmHeader(&'static str),

    #[error("Invalid bits per sample code {0}")]
    InvalidBitsPerSample(u8),

    #[error("Invalid sample rate code {0}")]
    InvalidSampleRate(u8),

    #[error("Invalid channel assignment {0}")]
    InvalidChannelAssignment(u8),

    #[error("MLP audio is not supported")]
    MlpUnsupported,

    #[error("No audio stream found")]
    NoAudioStream,

    #[error("Unsupported feature: {0}")]
    Unsupported(&'static str),
}
