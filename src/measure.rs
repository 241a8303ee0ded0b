use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use ebur128::{EbuR128, Mode};
use log::{debug, error, warn};
use symphonia::core::audio::AudioBufferRef;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::MeasurementError;

/// What a single decode pass over a source file reveals
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceAnalysis {
    pub duration: Duration,
    /// Integrated loudness in LUFS, or RMS dBFS when EBU R128 gave no finite value
    pub loudness: f64,
    /// Maximum true peak over all channels in dBTP
    pub true_peak_db: Option<f64>,
}

/// Something that can tell how long an audio file plays
pub trait DurationProbe: Sync {
    fn duration(&self, path: &Path) -> Result<Duration, MeasurementError>;
}

/// Reads durations by demuxing with symphonia, without decoding
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaProbe;

/// Reads durations from the container via `ffprobe`
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    pub program: PathBuf,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        FfprobeProbe {
            program: program.into(),
        }
    }
}

/// Tries symphonia first and falls back to ffprobe for formats symphonia can't read
#[derive(Debug, Clone)]
pub struct Prober {
    pub ffprobe: FfprobeProbe,
}

impl Prober {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Prober {
            ffprobe: FfprobeProbe::new(ffprobe),
        }
    }
}

fn open_format(path: &Path) -> Result<Box<dyn FormatReader>, MeasurementError> {
    let file = fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();

    let probed = symphonia::default::get_probe().format(&hint, mss, &fmt_opts, &meta_opts)?;
    Ok(probed.format)
}

fn is_eof(e: &SymphoniaError) -> bool {
    matches!(e, SymphoniaError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

impl DurationProbe for SymphoniaProbe {
    fn duration(&self, path: &Path) -> Result<Duration, MeasurementError> {
        let mut format = open_format(path)?;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(MeasurementError::NoTrack)?;
        let track_id = track.id;
        let time_base = track.codec_params.time_base;
        let sample_rate = track.codec_params.sample_rate;

        let mut total_ts: u64 = 0;
        loop {
            match format.next_packet() {
                Ok(packet) if packet.track_id() == track_id => total_ts += packet.dur,
                Ok(_) => {}
                Err(ref e) if is_eof(e) => break,
                Err(e) => return Err(MeasurementError::Symphonia(e)),
            }
        }

        match (time_base, sample_rate) {
            (Some(tb), _) => {
                let time = tb.calc_time(total_ts);
                Ok(Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac))
            }
            (None, Some(rate)) if rate > 0 => {
                Ok(Duration::from_secs_f64(total_ts as f64 / rate as f64))
            }
            _ => Err(MeasurementError::UnsupportedFormat),
        }
    }
}

impl DurationProbe for FfprobeProbe {
    fn duration(&self, path: &Path) -> Result<Duration, MeasurementError> {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()?;

        if !output.status.success() {
            return Err(MeasurementError::Ffprobe(format!(
                "exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let secs: f64 = stdout.trim().parse().map_err(|_| {
            MeasurementError::Ffprobe(format!("unexpected duration output {:?}", stdout.trim()))
        })?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(MeasurementError::Ffprobe(format!("invalid duration {secs}")));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

impl DurationProbe for Prober {
    fn duration(&self, path: &Path) -> Result<Duration, MeasurementError> {
        match SymphoniaProbe.duration(path) {
            Ok(d) => Ok(d),
            Err(e) => {
                debug!(
                    "symphonia could not measure {:?} ({}), asking ffprobe",
                    path.file_name().unwrap_or_default(),
                    e
                );
                self.ffprobe.duration(path)
            }
        }
    }
}

/// Updates RMS accumulators with a chunk of planar audio
fn update_rms_accumulators(
    planar_f32: &[Vec<f32>],
    sum_of_squares: &mut f64,
    total_samples: &mut u64,
) {
    for channel_buffer in planar_f32 {
        for sample in channel_buffer {
            *sum_of_squares += (*sample as f64) * (*sample as f64);
        }
        *total_samples += channel_buffer.len() as u64;
    }
}

/// RMS in dBFS, negative infinity for silence
fn calculate_rms_dbfs(sum_of_squares: f64, total_samples: u64) -> f64 {
    if total_samples == 0 {
        return f64::NEG_INFINITY;
    }
    let mean_square = sum_of_squares / total_samples as f64;
    if mean_square <= 0.0 {
        return f64::NEG_INFINITY;
    }
    20.0 * mean_square.sqrt().max(f32::EPSILON as f64).log10()
}

/// Decodes a source once, measuring its duration, EBU R128 loudness and true peak
///
/// # Arguments
/// * `path` - Path to the audio file
///
/// # Returns
/// Loudness is in LUFS, or in dBFS if EBU R128 produced no finite value
pub fn analyze_source(path: impl AsRef<Path>) -> Result<SourceAnalysis, MeasurementError> {
    let path = path.as_ref();
    let name = path.file_name().unwrap_or_default();
    let mut format = open_format(path)?;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(MeasurementError::NoTrack)?;
    let track_id = track.id;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(MeasurementError::UnsupportedFormat)?;
    let channel_count = track
        .codec_params
        .channels
        .ok_or(MeasurementError::UnsupportedFormat)?
        .count();

    let mut ebu_state = EbuR128::new(channel_count as u32, sample_rate, Mode::I | Mode::TRUE_PEAK)?;

    let dec_opts: DecoderOptions = Default::default();
    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &dec_opts)?;

    let mut decoded_frames: u64 = 0;
    let mut rms_sum_of_squares: f64 = 0.0;
    let mut rms_total_samples: u64 = 0;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(ref e) if is_eof(e) => break,
            Err(e) => {
                error!("Error reading packet from {:?}: {}", name, e);
                return Err(MeasurementError::Symphonia(e));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                decoded_frames += decoded.frames() as u64;
                match convert_buffer_to_planar_f32(&decoded) {
                    Ok(planar_f32) => {
                        let plane_slices: Vec<&[f32]> =
                            planar_f32.iter().map(|v| v.as_slice()).collect();
                        if let Err(e) = ebu_state.add_frames_planar_f32(&plane_slices) {
                            warn!(
                                "EBU R128 add_frames failed for chunk in {:?}: {}. Skipping chunk.",
                                name, e
                            );
                        }
                        update_rms_accumulators(
                            &planar_f32,
                            &mut rms_sum_of_squares,
                            &mut rms_total_samples,
                        );
                    }
                    Err(e) => {
                        warn!("Buffer conversion failed for chunk in {:?}: {}", name, e);
                    }
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Decode error in {:?}: {}. Skipping packet.", name, e);
            }
            Err(ref e) if is_eof(e) => break,
            Err(e) => {
                error!("Unhandled decoder error in {:?}: {}", name, e);
                return Err(MeasurementError::Symphonia(e));
            }
        }
    }

    let duration = Duration::from_secs_f64(decoded_frames as f64 / sample_rate as f64);

    let loudness = match ebu_state.loudness_global() {
        Ok(lufs) if lufs.is_finite() => lufs,
        other => {
            let rms_dbfs = calculate_rms_dbfs(rms_sum_of_squares, rms_total_samples);
            debug!(
                "EBU R128 gave {:?} for {:?}, falling back to RMS {:.2} dBFS",
                other, name, rms_dbfs
            );
            rms_dbfs
        }
    };

    let true_peak_db = (0..channel_count as u32)
        .filter_map(|ch| ebu_state.true_peak(ch).ok())
        .fold(None, |max: Option<f64>, p| Some(max.map_or(p, |m| m.max(p))))
        .filter(|&p| p > 0.0)
        .map(|p| 20.0 * p.log10());

    debug!(
        "Analyzed {:?}: {:.2}s, {:.2} LUFS, true peak {:?} dBTP",
        name,
        duration.as_secs_f64(),
        loudness,
        true_peak_db
    );

    Ok(SourceAnalysis {
        duration,
        loudness,
        true_peak_db,
    })
}

/// Calculates a target loudness as the trimmed mean of finite measurements
///
/// # Arguments
/// * `measurements` - Loudness values in LUFS; non-finite values are ignored
/// * `trim_percentage` - Fraction of values to drop, split between both ends
pub fn calculate_target_loudness(
    measurements: &[f64],
    trim_percentage: f64,
) -> Result<f64, String> {
    let mut sorted: Vec<f64> = measurements.iter().copied().filter(|l| l.is_finite()).collect();
    if sorted.is_empty() {
        return Err(
            "No valid finite loudness measurements available to calculate target.".to_string(),
        );
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let count = sorted.len();
    let trim_count_each_side = (count as f64 * trim_percentage / 2.0).floor() as usize;
    debug!(
        "Total valid samples: {}, Trimming {} from each side",
        count, trim_count_each_side
    );

    let trimmed = if count > trim_count_each_side * 2 {
        &sorted[trim_count_each_side..count - trim_count_each_side]
    } else {
        warn!(
            "Not enough samples ({}) to perform {}% trimming. Using mean of all valid samples.",
            count,
            trim_percentage * 100.0
        );
        &sorted[..]
    };

    let mean = trimmed.iter().sum::<f64>() / trimmed.len() as f64;
    if !mean.is_finite() {
        return Err(format!(
            "Calculated target loudness is not a finite number ({mean:.2})."
        ));
    }
    Ok(mean)
}

/// Gain in dB that brings `current` to `target` without pushing the true peak over `peak_ceiling_db`
pub fn loudness_gain_db(
    current: f64,
    target: f64,
    true_peak_db: Option<f64>,
    peak_ceiling_db: f64,
) -> f64 {
    let gain = target - current;
    match true_peak_db {
        Some(peak) if peak + gain > peak_ceiling_db => peak_ceiling_db - peak,
        _ => gain,
    }
}

/// Converts any symphonia audio buffer to planar f32
fn convert_buffer_to_planar_f32(
    decoded: &AudioBufferRef<'_>,
) -> Result<Vec<Vec<f32>>, MeasurementError> {
    let num_channels = decoded.spec().channels.count();
    let mut planar_output: Vec<Vec<f32>> = Vec::with_capacity(num_channels);

    match decoded {
        AudioBufferRef::F32(buf) => {
            for plane in buf.planes().planes() {
                planar_output.push(plane.to_vec());
            }
        }
        AudioBufferRef::F64(buf) => {
            for plane in buf.planes().planes() {
                planar_output.push(plane.iter().map(|&s| s as f32).collect());
            }
        }
        AudioBufferRef::S32(buf) => {
            for plane in buf.planes().planes() {
                planar_output.push(plane.iter().map(|&s| s as f32 / i32::MAX as f32).collect());
            }
        }
        AudioBufferRef::S24(buf) => {
            for plane in buf.planes().planes() {
                planar_output.push(plane.iter().map(|&s| s.inner() as f32 / 8388607.0).collect());
            }
        }
        AudioBufferRef::S16(buf) => {
            for plane in buf.planes().planes() {
                planar_output.push(plane.iter().map(|&s| s as f32 / i16::MAX as f32).collect());
            }
        }
        AudioBufferRef::U8(buf) => {
            for plane in buf.planes().planes() {
                planar_output.push(
                    plane
                        .iter()
                        .map(|&s| (s as i16 - 128) as f32 / 128.0)
                        .collect(),
                );
            }
        }
        _ => return Err(MeasurementError::UnsupportedFormat),
    }
    Ok(planar_output)
}
