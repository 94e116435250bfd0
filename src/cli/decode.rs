use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Result, bail};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use lossless::process::{FrameList, StreamInfo};

use super::command::{AudioFormat, Cli, DecodeArgs};
use crate::input::{open_decoder, open_source, resolve_codec};
use crate::timestamp::time_str;
use crate::wav::WAVWriter;

pub fn create_path_with_extension(base_path: &Path, expected_ext: &str) -> PathBuf {
    match base_path.extension() {
        Some(existing_ext) if existing_ext == expected_ext => base_path.to_path_buf(),
        Some(_) => {
            let mut name = base_path.file_name().unwrap_or_default().to_os_string();
            name.push(".");
            name.push(expected_ext);
            base_path.with_file_name(name)
        }
        None => base_path.with_extension(expected_ext),
    }
}

pub enum AudioWriter {
    Pcm(BufWriter<File>, u32),
    Wav(WAVWriter<File>),
}

impl AudioWriter {
    pub fn create(path: &Path, format: AudioFormat, info: &StreamInfo) -> Result<Self> {
        let file = File::create(path)?;
        Ok(match format {
            AudioFormat::Pcm => AudioWriter::Pcm(BufWriter::new(file), info.bits_per_sample),
            AudioFormat::Wav => {
                let mut writer = WAVWriter::new(file, *info);
                writer.write_header()?;
                AudioWriter::Wav(writer)
            }
        })
    }

    pub fn write(&mut self, frames: &FrameList) -> Result<()> {
        match self {
            AudioWriter::Pcm(writer, bits) => writer.write_all(&frames.to_le_bytes(*bits))?,
            AudioWriter::Wav(writer) => writer.write_frames(frames)?,
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        match self {
            AudioWriter::Pcm(writer, _) => writer.flush()?,
            AudioWriter::Wav(writer) => writer.finish()?,
        }
        Ok(())
    }
}

pub fn create_progress_bar(multi: &MultiProgress, total: Option<u64>) -> Result<ProgressBar> {
    let pb = if let Some(total) = total {
        let pb = multi.add(ProgressBar::new(total));
        pb.set_style(ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} PCM frames ({percent}%)\n{msg} | elapsed: {elapsed_precise} | ETA: {eta_precise}",
        )?);
        pb
    } else {
        let pb = multi.add(ProgressBar::new_spinner());
        pb.set_style(ProgressStyle::with_template(
            "{spinner:.green} {pos} PCM frames\n{msg} | elapsed: {elapsed_precise}",
        )?);
        pb
    };
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb.set_message("decoding");
    Ok(pb)
}

pub fn cmd_decode(args: &DecodeArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!(
        "Decoding stream: {} (strict mode: {})",
        args.input.display(),
        cli.strict
    );

    let mut source = open_source(&args.input)?;
    let codec = resolve_codec(&mut source, args.codec)?;
    let mut decoder = open_decoder(source, codec, cli.fail_level())?;
    let info = *decoder.info();
    log::info!("{} stream: {info}", codec.name());

    // Seeking lands on a seek point; the rest is skipped after decoding.
    let start = args.start.unwrap_or(0);
    let mut skip = 0u64;
    if let Some(target) = args.start {
        let Some(seekable) = decoder.seekable() else {
            bail!("--start is not supported for {} input", codec.name());
        };
        let reached = seekable.seek(target)?;
        skip = target.saturating_sub(reached);
        log::debug!("Seek to {target} reached {reached}, skipping {skip} PCM frames");
    }

    let mut writer = match &args.output_path {
        Some(base_path) => {
            let path = create_path_with_extension(base_path, args.format.extension());
            log::info!("Writing {}", path.display());
            Some(AudioWriter::create(&path, args.format, &info)?)
        }
        None => {
            log::info!("No output path given, decoding without writing");
            None
        }
    };

    let remaining = info.total_pcm_frames.map(|total| total.saturating_sub(start));
    let pb = multi
        .map(|multi| create_progress_bar(multi, remaining))
        .transpose()?;

    let started = Instant::now();
    let mut written = 0u64;
    loop {
        let mut frames = decoder.read()?;
        if frames.is_empty() {
            break;
        }

        if skip > 0 {
            let n = skip.min(frames.pcm_frames() as u64);
            frames.skip_frames(n as usize);
            skip -= n;
            if frames.is_empty() {
                continue;
            }
        }

        if let Some(writer) = writer.as_mut() {
            writer.write(&frames)?;
        }
        written += frames.pcm_frames() as u64;

        if let Some(ref pb) = pb {
            pb.set_position(written);
            pb.set_message(time_str(start + written, info.sample_rate));
        }
    }

    decoder.close()?;
    if let Some(writer) = writer.as_mut() {
        writer.finish()?;
    }
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let elapsed = started.elapsed().as_secs_f64();
    let duration = written as f64 / f64::from(info.sample_rate.max(1));
    log::info!(
        "Decoded {written} PCM frames ({}) in {elapsed:.3}s ({:.1}x realtime)",
        time_str(written, info.sample_rate),
        if elapsed > 0.0 { duration / elapsed } else { 0.0 }
    );

    Ok(())
}
