use anyhow::Result;
use clap::Parser;
use log::{error, info};
use playlist_transcode::encode::TargetFormat;
use playlist_transcode::playlist::PathRewrite;
use playlist_transcode::{SyncOptions, sync_playlist, trim};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// playlist file (m3u/m3u8)
    playlist: PathBuf,

    /// output directory
    output: PathBuf,

    /// target format: mp3, ogg, opus, m4a, flac or wav
    #[arg(short, long, default_value = "mp3")]
    format: TargetFormat,

    /// bitrate in kbit/s, default depends on the format
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// directory whose layout is mirrored into the output, default to the common directory of all entries
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// rewrite playlist entries starting with FROM to start with TO, may be repeated
    #[arg(short, long, value_name = "FROM=TO")]
    rewrite: Vec<PathRewrite>,

    /// target loudness in LUFS, default to the trimmed mean of the playlist
    #[arg(long, allow_negative_numbers = true)]
    target_lufs: Option<f64>,

    /// trim percentage for calculating target loudness
    #[arg(long, default_value_t = 0.30)]
    trim_percentage: f64,

    /// target true peak in dBTP
    #[arg(long, default_value_t = -1.5, allow_negative_numbers = true)]
    true_peak_db: f64,

    /// do not normalize loudness
    #[arg(long)]
    no_normalize: bool,

    /// do not trim leading and trailing silence
    #[arg(long)]
    no_trim: bool,

    /// silence thresholds in dBFS, tried in order until the duration matches the source
    #[arg(
        long,
        value_delimiter = ',',
        allow_negative_numbers = true,
        default_values_t = trim::DEFAULT_THRESHOLDS_DB
    )]
    thresholds: Vec<f64>,

    /// accepted difference between source and output duration, in seconds
    #[arg(long, default_value_t = trim::DEFAULT_TOLERANCE.as_secs_f64())]
    tolerance: f64,

    /// copy artist, album, track, title, genre and cover art from the source
    #[arg(long)]
    tags: bool,

    /// re-encode files even if they are up to date
    #[arg(long)]
    force: bool,

    /// only print what would be done
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// write a playlist of the copied files into the output directory
    #[arg(long)]
    write_playlist: bool,

    /// number of threads to use, default to CPU core count
    #[arg(short, long)]
    threads: Option<usize>,

    /// ffmpeg executable
    #[arg(long, env = "PLAYLIST_TRANSCODE_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// ffprobe executable
    #[arg(long, env = "PLAYLIST_TRANSCODE_FFPROBE", default_value = "ffprobe")]
    ffprobe: PathBuf,
}

fn main() -> Result<()> {
    _ = pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .parse_filters("symphonia=error,lofty=warn")
        .parse_default_env()
        .try_init();

    let cli = Cli::parse();

    if !cli.tolerance.is_finite() || cli.tolerance < 0.0 {
        anyhow::bail!("tolerance must be a non-negative number of seconds");
    }

    // --- Configuration ---
    let options = SyncOptions {
        playlist: cli.playlist,
        output_dir: cli.output,
        source_root: cli.source_root,
        rewrites: cli.rewrite,
        format: cli.format,
        bitrate_kbps: cli.bitrate,
        normalize: !cli.no_normalize,
        target_lufs: cli.target_lufs,
        trim_percentage: cli.trim_percentage,
        true_peak_db: cli.true_peak_db,
        trim_silence: !cli.no_trim,
        thresholds_db: cli.thresholds,
        tolerance: Duration::from_secs_f64(cli.tolerance),
        embed_tags: cli.tags,
        force: cli.force,
        dry_run: cli.dry_run,
        write_playlist: cli.write_playlist,
        num_threads: cli.threads,
        ffmpeg: cli.ffmpeg,
        ffprobe: cli.ffprobe,
    };

    info!("Starting playlist transcode with options:");
    info!("  Playlist: {:?}", options.playlist);
    info!("  Output Directory: {:?}", options.output_dir);
    info!("  Format: {}", options.format);
    if options.normalize {
        match options.target_lufs {
            Some(t) => info!("  Target Loudness: {:.2} LUFS", t),
            None => info!("  Target Loudness: Automatic (calculated)"),
        }
        info!("  Target True Peak: {:.1} dBTP", options.true_peak_db);
    } else {
        info!("  Loudness Normalization: Off");
    }
    if options.trim_silence {
        info!(
            "  Silence Thresholds: {:?} dB, Tolerance: {:.1}s",
            options.thresholds_db,
            options.tolerance.as_secs_f64()
        );
    } else {
        info!("  Silence Trimming: Off");
    }
    info!("  Copy Tags: {}", options.embed_tags);
    info!("---");

    match sync_playlist(&options) {
        Ok(_) => {
            info!("Playlist transcode finished successfully!");
            Ok(())
        }
        Err(e) => {
            error!("Playlist transcode failed: {}", e);
            Err(e)?
        }
    }
}
