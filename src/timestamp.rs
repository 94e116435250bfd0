/// Formats a PCM frame position as `HH:MM:SS.mmm`, truncating to the
/// millisecond. Hours widen past two digits when needed.
pub fn time_str(pcm_frames: u64, sample_rate: u32) -> String {
    if sample_rate == 0 {
        return "--:--:--.---".to_string();
    }

    let ms = u128::from(pcm_frames) * 1000 / u128::from(sample_rate);
    let hours = ms / 3_600_000;
    let minutes = ms % 3_600_000 / 60_000;
    let seconds = ms % 60_000 / 1000;
    let milliseconds = ms % 1000;

    format!("{hours:02}:{minutes:02}:{seconds:02}.{milliseconds:03}")
}
