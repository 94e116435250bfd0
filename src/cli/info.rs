use std::io::{Seek, SeekFrom};

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use lossless::process::StreamInfo;
use lossless::process::aob::{Substreams, discover_substreams};
use lossless::structs::channel::Speaker;
use serde::Serialize;

use super::command::{Cli, Codec, InfoArgs};
use crate::input::{open_decoder, open_source, resolve_codec};
use crate::timestamp::time_str;

#[derive(Debug, Serialize)]
struct InfoReport {
    input: String,
    codec: Codec,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<StreamReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    substreams: Option<SubstreamReport>,
}

#[derive(Debug, Serialize, PartialEq)]
struct StreamReport {
    sample_rate: u32,
    bits_per_sample: u32,
    channels: usize,
    channel_mask: u32,
    speakers: Vec<String>,
    /// Declared by the stream, or counted by decoding when it declares none.
    total_pcm_frames: u64,
    total_declared: bool,
    duration: String,
    seekable: bool,
}

impl StreamReport {
    fn new(info: &StreamInfo, seekable: bool, counted: Option<u64>) -> Self {
        let total = info.total_pcm_frames.or(counted).unwrap_or(0);
        Self {
            sample_rate: info.sample_rate,
            bits_per_sample: info.bits_per_sample,
            channels: info.channels,
            channel_mask: info.channel_mask,
            speakers: Speaker::from_mask(info.channel_mask)
                .iter()
                .map(ToString::to_string)
                .collect(),
            total_pcm_frames: total,
            total_declared: info.total_pcm_frames.is_some(),
            duration: time_str(total, info.sample_rate),
            seekable,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct MlpReport {
    bits_per_sample: u32,
    sample_rate: u32,
    channel_assignment: u8,
}

#[derive(Debug, Serialize, PartialEq)]
struct SubstreamReport {
    sectors: u64,
    pcm_packets: u64,
    mlp_packets: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    mlp: Option<MlpReport>,
}

impl From<&Substreams> for SubstreamReport {
    fn from(found: &Substreams) -> Self {
        Self {
            sectors: found.sectors,
            pcm_packets: found.pcm_packets,
            mlp_packets: found.mlp_packets,
            mlp: found.mlp.map(|mlp| MlpReport {
                bits_per_sample: mlp.bits_per_sample,
                sample_rate: mlp.sample_rate,
                channel_assignment: mlp.channel_assignment,
            }),
        }
    }
}

pub fn cmd_info(args: &InfoArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!("Analyzing stream: {}", args.input.display());

    let mut source = open_source(&args.input)?;
    let codec = resolve_codec(&mut source, args.codec)?;
    let mut report = InfoReport {
        input: args.input.display().to_string(),
        codec,
        stream: None,
        substreams: None,
    };

    if codec == Codec::Aob {
        let found = discover_substreams(&mut source)?;
        source.seek(SeekFrom::Start(0))?;
        report.substreams = Some(SubstreamReport::from(&found));
        if found.pcm.is_none() {
            log::warn!("No PCM substream; MLP audio cannot be decoded");
            return print_report(&report, args.yaml);
        }
    }

    let mut decoder = open_decoder(source, codec, cli.fail_level())?;
    let seekable = decoder.seekable().is_some();

    // Streams without a declared length are decoded once to count frames.
    let counted = if decoder.info().total_pcm_frames.is_none() {
        let pb = multi.map(add_spinner).transpose()?;
        let mut total = 0u64;
        loop {
            let frames = decoder.read()?;
            if frames.is_empty() {
                break;
            }
            total += frames.pcm_frames() as u64;
            if let Some(ref pb) = pb {
                pb.set_message(format!("Counting PCM frames...    {total}"));
            }
        }
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        Some(total)
    } else {
        None
    };

    report.stream = Some(StreamReport::new(decoder.info(), seekable, counted));
    decoder.close()?;
    print_report(&report, args.yaml)
}

fn add_spinner(multi: &MultiProgress) -> Result<ProgressBar> {
    let pb = multi.add(ProgressBar::new_spinner());
    pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb.set_message("Counting PCM frames...");
    Ok(pb)
}

fn print_report(report: &InfoReport, yaml: bool) -> Result<()> {
    if yaml {
        print!("{}", serde_yaml_ng::to_string(report)?);
        return Ok(());
    }

    println!();
    println!("{} Stream Information", report.codec.name());
    println!("=========================");
    println!();

    if let Some(stream) = &report.stream {
        display_stream(stream);
    }
    if let Some(substreams) = &report.substreams {
        display_substreams(substreams);
    }
    Ok(())
}

fn display_stream(stream: &StreamReport) {
    println!("Stream Information");
    println!("  Sampling rate             {} Hz", stream.sample_rate);
    println!("  Bits per sample           {}", stream.bits_per_sample);
    println!("  Channels                  {}", stream.channels);
    if stream.speakers.is_empty() {
        println!("  Channel mask              undefined");
    } else {
        println!(
            "  Channel mask              {:#X} ({})",
            stream.channel_mask,
            stream.speakers.join(" ")
        );
    }
    let source = if stream.total_declared {
        "declared"
    } else {
        "decoded"
    };
    println!(
        "  PCM frames                {} ({source})",
        stream.total_pcm_frames
    );
    println!("  Duration                  {}", stream.duration);
    println!("  Seekable                  {}", stream.seekable);
    println!();
}

fn display_substreams(substreams: &SubstreamReport) {
    println!("Substreams");
    println!("  Sectors                   {}", substreams.sectors);
    println!("  PCM packets               {}", substreams.pcm_packets);
    println!("  MLP packets               {}", substreams.mlp_packets);
    if let Some(mlp) = &substreams.mlp {
        println!(
            "  MLP format                {} Hz, {} bit, assignment {}",
            mlp.sample_rate, mlp.bits_per_sample, mlp.channel_assignment
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_counted_totals() -> Result<()> {
        let info = StreamInfo {
            sample_rate: 48000,
            bits_per_sample: 24,
            channels: 2,
            channel_mask: 0x3,
            total_pcm_frames: None,
        };
        let stream = StreamReport::new(&info, false, Some(96000));
        assert_eq!(stream.total_pcm_frames, 96000);
        assert!(!stream.total_declared);
        assert_eq!(stream.duration, "00:00:02.000");
        assert_eq!(stream.speakers, ["L", "R"]);

        let report = InfoReport {
            input: "title.aob".to_string(),
            codec: Codec::Aob,
            stream: Some(stream),
            substreams: None,
        };
        let yaml = serde_yaml_ng::to_string(&report)?;
        assert!(yaml.contains("codec: aob"));
        assert!(yaml.contains("total_pcm_frames: 96000"));
        assert!(!yaml.contains("substreams"));
        Ok(())
    }
}
