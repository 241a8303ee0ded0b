/// Module for encoding via an external encoder
pub mod encode;
/// Module for error handling
pub mod error;
/// Module for mapping sources onto the output directory
pub mod layout;
/// Module for duration and loudness measurement
pub mod measure;
/// Module for reading and writing playlists
pub mod playlist;
/// Module for copying metadata between files
pub mod tags;
/// Module for the silence trimming search
pub mod trim;

use crate::encode::{EncodePlan, Ffmpeg, Loudness, TargetFormat, Transcoder};
use crate::error::{Error, MeasurementError};
use crate::layout::{Job, common_root, is_up_to_date, plan_jobs};
use crate::measure::{
    DurationProbe, Prober, SourceAnalysis, analyze_source, calculate_target_loudness,
    loudness_gain_db,
};
use crate::playlist::{PathRewrite, expand_entries, read_playlist, write_playlist};
use crate::tags::SourceTags;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Target loudness in LUFS when no source of the playlist could be measured
pub const FALLBACK_TARGET_LUFS: f64 = -16.0;

/// Represents audio file formats accepted as sources
#[derive(Debug, PartialEq)]
pub enum AudioFormats {
    Wav,
    Mp3,
    Flac,
    Ogg,
    M4a,
    Aac,
    Opus,
    Aiff,
    Wma,
    WavPack,
}

impl AudioFormats {
    /// Creates an AudioFormats enum from a file path based on its extension
    #[inline]
    pub fn from_path(value: impl AsRef<Path>) -> Option<Self> {
        Some(
            match value
                .as_ref()
                .extension()
                .unwrap_or_default()
                .to_string_lossy()
                .to_lowercase()
                .as_ref()
            {
                "wav" => Self::Wav,
                "mp3" => Self::Mp3,
                "flac" => Self::Flac,
                "ogg" | "oga" => Self::Ogg,
                "m4a" => Self::M4a,
                "aac" => Self::Aac,
                "opus" => Self::Opus,
                "aif" | "aiff" => Self::Aiff,
                "wma" => Self::Wma,
                "wv" => Self::WavPack,
                _ => return None,
            },
        )
    }
}

/// Configuration options for a playlist sync
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Playlist whose entries are copied
    pub playlist: PathBuf,
    /// Directory the transcoded files are written to
    pub output_dir: PathBuf,
    /// Directory whose layout is mirrored below `output_dir`. Defaults to the
    /// deepest directory shared by all entries.
    pub source_root: Option<PathBuf>,
    /// Prefix rewrites applied to raw playlist entries
    pub rewrites: Vec<PathRewrite>,
    pub format: TargetFormat,
    /// Bitrate in kbit/s, the format's default if not set
    pub bitrate_kbps: Option<u32>,
    /// Whether to normalize loudness at all
    pub normalize: bool,
    /// Target loudness in LUFS. If not set, the trimmed mean of the playlist is used.
    pub target_lufs: Option<f64>,
    /// Percentage of measurements to trim when calculating the playlist loudness (0.0 to 0.5)
    pub trim_percentage: f64,
    /// Target true peak in dBTP
    pub true_peak_db: f64,
    /// Whether to trim leading and trailing silence
    pub trim_silence: bool,
    /// Silence thresholds in dBFS, tried in order
    pub thresholds_db: Vec<f64>,
    /// Largest accepted difference between source and output duration
    pub tolerance: Duration,
    /// Copy tags and cover art from the source
    pub embed_tags: bool,
    /// Re-encode even if the target is up to date
    pub force: bool,
    /// Only log what would be done
    pub dry_run: bool,
    /// Write a playlist of the copied files into `output_dir`
    pub write_playlist: bool,
    /// Number of threads for parallel processing
    pub num_threads: Option<usize>,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            playlist: PathBuf::new(),
            output_dir: PathBuf::from("."),
            source_root: None,
            rewrites: Vec::new(),
            format: TargetFormat::Mp3,
            bitrate_kbps: None,
            normalize: true,
            target_lufs: None,
            trim_percentage: 0.30,
            true_peak_db: -1.5,
            trim_silence: true,
            thresholds_db: trim::DEFAULT_THRESHOLDS_DB.to_vec(),
            tolerance: trim::DEFAULT_TOLERANCE,
            embed_tags: false,
            force: false,
            dry_run: false,
            write_playlist: false,
            num_threads: None,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// What happened to a single playlist entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Transcoded {
        threshold_db: Option<f64>,
        duration: Duration,
        attempts: usize,
    },
    /// The target was already up to date
    Skipped,
    /// Dry run
    Planned,
}

/// Final tally of a sync
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub transcoded: usize,
    pub skipped: usize,
    pub planned: usize,
    pub failed: usize,
}

/// The collaborators and settings shared by every entry of a sync
pub struct Context<'a> {
    pub transcoder: &'a dyn Transcoder,
    pub probe: &'a dyn DurationProbe,
    /// Plan for every encode; loudness and silence threshold are filled in per attempt
    pub plan: EncodePlan,
    /// Empty when silence trimming is off
    pub thresholds_db: &'a [f64],
    pub tolerance: Duration,
    pub embed_tags: bool,
    pub dry_run: bool,
}

fn progress_bar(len: usize, message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(message);
    pb
}

/// Copy every entry of a playlist into the output directory, transcoded
pub fn sync_playlist(options: &SyncOptions) -> Result<Summary, Error> {
    // 1. Validate options
    validate_options(options)?;

    // Configure Rayon thread pool size if specified
    match options.num_threads {
        Some(num_threads) if num_threads > 0 => {
            let rayon_init_result = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build_global();
            if let Err(e) = rayon_init_result {
                warn!(
                    "Failed to configure Rayon thread pool: {}. Using default number of threads.",
                    e
                );
            } else {
                info!("Using {} threads for processing.", num_threads);
            }
        }
        _ => info!("Using default number of threads."),
    }

    // 2. Read the playlist
    info!("Reading playlist {:?}...", options.playlist);
    let playlist = read_playlist(&options.playlist, &options.rewrites)?;
    let sources = expand_entries(&playlist.entries);
    if sources.is_empty() {
        info!("Playlist has no entries.");
        return Ok(Summary::default());
    }

    // 3. Plan targets
    let source_root = options
        .source_root
        .clone()
        .or_else(|| common_root(&sources))
        .unwrap_or_default();
    debug!("Mirroring layout below {:?}", source_root);
    let jobs = plan_jobs(&sources, &source_root, &options.output_dir, options.format);
    let up_to_date: Vec<bool> = jobs
        .iter()
        .map(|job| !options.force && is_up_to_date(&job.source, &job.target))
        .collect();
    let pending = up_to_date.iter().filter(|fresh| !**fresh).count();
    info!(
        "Found {} files, {} need transcoding.",
        jobs.len(),
        pending
    );

    // 4. Analyze sources and pick the target loudness
    let mut analyses: HashMap<PathBuf, Result<SourceAnalysis, MeasurementError>> = HashMap::new();
    let mut target_lufs = options.target_lufs;
    if options.normalize && pending > 0 {
        // An automatic target depends on the whole playlist, not just the stale part of it
        let to_analyze: Vec<&Job> = jobs
            .iter()
            .zip(&up_to_date)
            .filter(|(_, fresh)| options.target_lufs.is_none() || !**fresh)
            .map(|(job, _)| job)
            .collect();

        info!("Measuring loudness of {} files...", to_analyze.len());
        let pb = progress_bar(to_analyze.len(), "Measuring");
        analyses = to_analyze
            .par_iter()
            .progress_with(pb.clone())
            .map(|job| {
                let result = analyze_source(&job.source);
                if let Err(e) = &result {
                    debug!(
                        "Failed to measure {:?}: {}",
                        job.source.file_name().unwrap_or_default(),
                        e
                    );
                }
                (job.source.clone(), result)
            })
            .collect();
        pb.finish_with_message("Measurement done");

        if target_lufs.is_none() {
            let measured: Vec<f64> = analyses
                .values()
                .filter_map(|r| r.as_ref().ok().map(|a| a.loudness))
                .collect();
            let calculated = match calculate_target_loudness(&measured, options.trim_percentage) {
                Ok(calculated) => {
                    info!(
                        "Calculated Target Loudness ({}% trimmed mean): {:.2} LUFS",
                        options.trim_percentage * 100.0,
                        calculated
                    );
                    calculated
                }
                Err(e) => {
                    warn!("{} Falling back to {:.1} LUFS.", e, FALLBACK_TARGET_LUFS);
                    FALLBACK_TARGET_LUFS
                }
            };
            target_lufs = Some(calculated);
        }
    }

    // 5. Process every entry
    let ffmpeg = Ffmpeg::new(&options.ffmpeg);
    let prober = Prober::new(&options.ffprobe);
    let thresholds: &[f64] = if options.trim_silence {
        &options.thresholds_db
    } else {
        &[]
    };
    let context = Context {
        transcoder: &ffmpeg,
        probe: &prober,
        plan: EncodePlan {
            format: options.format,
            bitrate_kbps: options.bitrate_kbps,
            loudness: Loudness::Off,
            silence_threshold_db: None,
            strip_metadata: options.embed_tags,
        },
        thresholds_db: thresholds,
        tolerance: options.tolerance,
        embed_tags: options.embed_tags,
        dry_run: options.dry_run,
    };

    info!("Transcoding to {} in {:?}...", options.format, options.output_dir);
    let pb = progress_bar(jobs.len(), "Transcoding");
    let results: Vec<Result<Outcome, Error>> = jobs
        .par_iter()
        .zip(&up_to_date)
        .progress_with(pb.clone())
        .map(|(job, fresh)| {
            if *fresh {
                debug!("Up to date: {:?}", job.target);
                return Ok(Outcome::Skipped);
            }
            let analysis = analyses.get(&job.source).and_then(|r| r.as_ref().ok());
            let loudness = match target_lufs {
                Some(target) if options.normalize => {
                    loudness_for(analysis, target, options.true_peak_db)
                }
                _ => Loudness::Off,
            };
            process_entry(job, loudness, analysis.map(|a| a.duration), &context)
        })
        .collect();
    pb.finish_with_message("Transcoding done");

    // 6. Report final status and errors
    let mut summary = Summary::default();
    let mut copied = Vec::new();
    for (job, result) in jobs.iter().zip(results) {
        match result {
            Ok(Outcome::Transcoded { .. }) => {
                summary.transcoded += 1;
                copied.push(job.target.clone());
            }
            Ok(Outcome::Skipped) => {
                summary.skipped += 1;
                copied.push(job.target.clone());
            }
            Ok(Outcome::Planned) => summary.planned += 1,
            Err(e) => {
                error!("Error: {}", e);
                summary.failed += 1;
            }
        }
    }

    info!(
        "Processing complete. {} transcoded, {} up to date, {} planned, {} failed.",
        summary.transcoded, summary.skipped, summary.planned, summary.failed
    );

    if options.write_playlist && !options.dry_run {
        let name = playlist.path.file_stem().unwrap_or_default();
        let mut out = options.output_dir.join(name);
        out.set_extension("m3u8");
        write_playlist(&out, &copied)?;
        info!("Wrote playlist {:?} with {} entries", out, copied.len());
    }

    if summary.failed > 0 {
        Err(Error::FilesFailed(summary.failed))
    } else {
        Ok(summary)
    }
}

/// Picks the loudness correction for one source
fn loudness_for(analysis: Option<&SourceAnalysis>, target_lufs: f64, true_peak_db: f64) -> Loudness {
    match analysis {
        Some(a) if a.loudness.is_finite() => Loudness::Gain(loudness_gain_db(
            a.loudness,
            target_lufs,
            a.true_peak_db,
            true_peak_db,
        )),
        // Silent, nothing to normalize
        Some(_) => Loudness::Off,
        None => Loudness::LoudNorm {
            target_lufs,
            true_peak_db,
        },
    }
}

/// Transcodes a single entry, retrying with stricter silence thresholds until
/// the output duration matches the source
///
/// # Arguments
/// * `job` - Source and target path
/// * `loudness` - Loudness correction to apply
/// * `source_duration` - Duration of the source if already known
/// * `ctx` - Shared collaborators and settings
pub fn process_entry(
    job: &Job,
    loudness: Loudness,
    source_duration: Option<Duration>,
    ctx: &Context<'_>,
) -> Result<Outcome, Error> {
    let source = job.source.as_path();
    if !source.is_file() {
        return Err(Error::MissingSource(source.to_path_buf()));
    }
    if AudioFormats::from_path(source).is_none() {
        warn!("{:?} has no known audio extension, trying anyway", source);
    }

    let plan = EncodePlan {
        loudness,
        ..ctx.plan.clone()
    };

    if ctx.dry_run {
        info!(
            "Would transcode {:?} -> {:?} ({:?})",
            source, job.target, plan.loudness
        );
        return Ok(Outcome::Planned);
    }

    let source_duration = match source_duration {
        Some(d) => d,
        None => ctx.probe.duration(source).map_err(|e| Error::Measurement {
            path: source.to_path_buf(),
            source: e,
        })?,
    };

    let parent = job.target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| Error::Io {
        path: parent.to_path_buf(),
        source: e,
    })?;

    // Encode next to the target so the final rename stays on one filesystem
    let temp = tempfile::Builder::new()
        .prefix(".playlist-transcode-")
        .suffix(&format!(".{}", plan.format.extension()))
        .tempfile_in(parent)
        .map_err(|e| Error::Io {
            path: parent.to_path_buf(),
            source: e,
        })?
        .into_temp_path();

    let convergence = trim::converge(
        source_duration,
        ctx.thresholds_db,
        ctx.tolerance,
        |threshold| {
            let attempt = plan.with_silence_threshold(threshold);
            ctx.transcoder.transcode(source, &temp, &attempt)?;
            Ok(ctx.probe.duration(&temp)?)
        },
    )
    .map_err(|e| Error::Transcode {
        path: source.to_path_buf(),
        source: e,
    })?;

    if ctx.embed_tags {
        match SourceTags::read(source) {
            Ok(tags) if !tags.is_empty() => tags.embed(&temp).map_err(|e| Error::Tagging {
                path: job.target.clone(),
                source: e,
            })?,
            Ok(_) => debug!("No tags to copy from {:?}", source),
            Err(e) => warn!("Could not read tags from {:?}: {}", source, e),
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp, fs::Permissions::from_mode(0o644)).map_err(|e| Error::Io {
            path: temp.to_path_buf(),
            source: e,
        })?;
    }

    temp.persist(&job.target).map_err(|e| Error::Io {
        path: job.target.clone(),
        source: e.error,
    })?;

    match convergence.threshold_db {
        Some(t) => debug!(
            "Wrote {:?} ({:.2}s, silence below {} dB trimmed, {} attempts)",
            job.target,
            convergence.duration.as_secs_f64(),
            t,
            convergence.attempts
        ),
        None => debug!(
            "Wrote {:?} ({:.2}s, untrimmed, {} attempts)",
            job.target,
            convergence.duration.as_secs_f64(),
            convergence.attempts
        ),
    }

    Ok(Outcome::Transcoded {
        threshold_db: convergence.threshold_db,
        duration: convergence.duration,
        attempts: convergence.attempts,
    })
}

/// Validates sync options for correctness
///
/// # Arguments
/// * `options` - Reference to SyncOptions struct
fn validate_options(options: &SyncOptions) -> Result<(), Error> {
    if !options.playlist.is_file() {
        return Err(Error::InvalidOptions(format!(
            "Playlist is not a file: {:?}",
            options.playlist
        )));
    }

    let output_dir = &options.output_dir;
    if !output_dir.exists() {
        if options.dry_run {
            info!("Output directory {:?} would be created", output_dir);
        } else {
            fs::create_dir_all(output_dir).map_err(|e| Error::Io {
                path: output_dir.to_path_buf(),
                source: e,
            })?;
            info!("Created output directory: {:?}", output_dir);
        }
    } else if !output_dir.is_dir() {
        return Err(Error::InvalidOptions(format!(
            "Output path exists but is not a directory: {:?}",
            output_dir
        )));
    }

    if !(0.0..0.5).contains(&options.trim_percentage) {
        return Err(Error::InvalidOptions(format!(
            "Trim percentage must be between 0.0 and 0.5 (exclusive of 0.5): {}",
            options.trim_percentage
        )));
    }
    if let Some(t) = options.thresholds_db.iter().find(|t| !t.is_finite() || **t > 0.0) {
        return Err(Error::InvalidOptions(format!(
            "Silence thresholds must be at most 0 dB: {}",
            t
        )));
    }
    if options.bitrate_kbps == Some(0) {
        return Err(Error::InvalidOptions("Bitrate must not be 0".to_string()));
    }
    if let Some(t) = options.target_lufs {
        if !t.is_finite() || t > 0.0 {
            return Err(Error::InvalidOptions(format!(
                "Target loudness must be a negative LUFS value: {}",
                t
            )));
        }
    }
    if options.true_peak_db > 0.0 {
        warn!(
            "Target true peak {:.1} dBTP is above 0 dBFS. This will likely cause clipping in standard formats.",
            options.true_peak_db
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loudness_choice_follows_analysis() {
        let analysis = SourceAnalysis {
            duration: Duration::from_secs(1),
            loudness: -20.0,
            true_peak_db: Some(-6.0),
        };
        assert_eq!(
            loudness_for(Some(&analysis), -14.0, -1.5),
            Loudness::Gain(4.5)
        );

        let silent = SourceAnalysis {
            loudness: f64::NEG_INFINITY,
            true_peak_db: None,
            ..analysis
        };
        assert_eq!(loudness_for(Some(&silent), -14.0, -1.5), Loudness::Off);

        assert_eq!(
            loudness_for(None, -14.0, -1.5),
            Loudness::LoudNorm {
                target_lufs: -14.0,
                true_peak_db: -1.5
            }
        );
    }

    #[test]
    fn invalid_options_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let playlist = dir.path().join("list.m3u");
        fs::write(&playlist, "a.mp3\n").unwrap();
        let base = SyncOptions {
            playlist: playlist.clone(),
            output_dir: dir.path().join("out"),
            ..Default::default()
        };

        assert!(validate_options(&base).is_ok());
        assert!(base.output_dir.is_dir());

        let cases = [
            SyncOptions {
                playlist: dir.path().join("missing.m3u"),
                ..base.clone()
            },
            SyncOptions {
                output_dir: playlist.clone(),
                ..base.clone()
            },
            SyncOptions {
                trim_percentage: 0.5,
                ..base.clone()
            },
            SyncOptions {
                thresholds_db: vec![-40.0, 3.0],
                ..base.clone()
            },
            SyncOptions {
                bitrate_kbps: Some(0),
                ..base.clone()
            },
            SyncOptions {
                target_lufs: Some(f64::NAN),
                ..base.clone()
            },
        ];
        for options in &cases {
            assert!(
                matches!(validate_options(options), Err(Error::InvalidOptions(_))),
                "{options:?}"
            );
        }
    }

    #[test]
    fn sync_rejects_invalid_options_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let options = SyncOptions {
            playlist: dir.path().join("missing.m3u"),
            output_dir: dir.path().join("out"),
            num_threads: Some(2),
            ..Default::default()
        };
        assert!(matches!(
            sync_playlist(&options),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn source_extensions_are_recognized() {
        assert_eq!(AudioFormats::from_path("a/B.FLAC"), Some(AudioFormats::Flac));
        assert_eq!(AudioFormats::from_path("x.oga"), Some(AudioFormats::Ogg));
        assert_eq!(AudioFormats::from_path("cover.jpg"), None);
        assert_eq!(AudioFormats::from_path("noext"), None);
    }
}
