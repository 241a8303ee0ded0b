use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;

use log::debug;
use strum_macros::Display;

use crate::error::TranscodeError;

/// Audio formats the output can be encoded to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TargetFormat {
    Mp3,
    Ogg,
    Opus,
    M4a,
    Flac,
    Wav,
}

impl TargetFormat {
    #[inline]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Opus => "opus",
            Self::M4a => "m4a",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }

    /// ffmpeg encoder name
    #[inline]
    pub fn codec(self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::Ogg => "libvorbis",
            Self::Opus => "libopus",
            Self::M4a => "aac",
            Self::Flac => "flac",
            Self::Wav => "pcm_s16le",
        }
    }

    /// ffmpeg muxer name
    #[inline]
    pub fn muxer(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Opus => "opus",
            Self::M4a => "ipod",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }

    /// Default bitrate in kbit/s, `None` for lossless formats
    #[inline]
    pub fn default_bitrate(self) -> Option<u32> {
        match self {
            Self::Mp3 => Some(256),
            Self::Ogg => Some(192),
            Self::Opus => Some(160),
            Self::M4a => Some(256),
            Self::Flac | Self::Wav => None,
        }
    }

    #[inline]
    pub fn is_lossless(self) -> bool {
        self.default_bitrate().is_none()
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "mp3" => Self::Mp3,
            "ogg" | "vorbis" => Self::Ogg,
            "opus" => Self::Opus,
            "m4a" | "aac" => Self::M4a,
            "flac" => Self::Flac,
            "wav" => Self::Wav,
            other => return Err(format!("unsupported target format: {other}")),
        })
    }
}

/// How the encoder adjusts loudness
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Loudness {
    Off,
    /// Fixed gain computed from a prior measurement
    Gain(f64),
    /// Let ffmpeg's `loudnorm` filter measure and correct in one pass
    LoudNorm { target_lufs: f64, true_peak_db: f64 },
}

/// Everything one encoder invocation needs besides the paths
#[derive(Debug, Clone, PartialEq)]
pub struct EncodePlan {
    pub format: TargetFormat,
    pub bitrate_kbps: Option<u32>,
    pub loudness: Loudness,
    /// Trim leading and trailing audio quieter than this, in dBFS
    pub silence_threshold_db: Option<f64>,
    /// Drop source metadata, used when tags are copied separately
    pub strip_metadata: bool,
}

impl EncodePlan {
    pub fn with_silence_threshold(&self, threshold_db: Option<f64>) -> Self {
        EncodePlan {
            silence_threshold_db: threshold_db,
            ..self.clone()
        }
    }

    /// The `-af` filter graph, if any filtering is needed
    pub fn filter_chain(&self) -> Option<String> {
        let mut filters = Vec::new();

        if let Some(threshold) = self.silence_threshold_db {
            let remove = format!(
                "silenceremove=start_periods=1:start_duration=0:start_threshold={threshold}dB"
            );
            filters.push(remove.clone());
            filters.push("areverse".to_string());
            filters.push(remove);
            filters.push("areverse".to_string());
        }

        match self.loudness {
            Loudness::Off => {}
            Loudness::Gain(db) => filters.push(format!("volume={db:.2}dB")),
            Loudness::LoudNorm {
                target_lufs,
                true_peak_db,
            } => filters.push(format!(
                "loudnorm=I={target_lufs:.1}:TP={true_peak_db:.1}:LRA=11"
            )),
        }

        (!filters.is_empty()).then(|| filters.join(","))
    }

    pub fn ffmpeg_args(&self, source: &Path, target: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(source.into());
        args.extend(["-map", "0:a:0", "-vn"].map(OsString::from));

        if let Some(chain) = self.filter_chain() {
            args.push("-af".into());
            args.push(chain.into());
        }
        // loudnorm upsamples to 192 kHz internally
        if matches!(self.loudness, Loudness::LoudNorm { .. }) {
            args.extend(["-ar", "48000"].map(OsString::from));
        }

        args.push("-c:a".into());
        args.push(self.format.codec().into());
        if !self.format.is_lossless() {
            if let Some(kbps) = self.bitrate_kbps.or(self.format.default_bitrate()) {
                args.push("-b:a".into());
                args.push(format!("{kbps}k").into());
            }
        }
        if self.strip_metadata {
            args.extend(["-map_metadata", "-1"].map(OsString::from));
        }

        args.push("-f".into());
        args.push(self.format.muxer().into());
        args.push(target.into());
        args
    }
}

/// Turns a source file into an encoded target file
pub trait Transcoder: Sync {
    fn transcode(
        &self,
        source: &Path,
        target: &Path,
        plan: &EncodePlan,
    ) -> Result<(), TranscodeError>;
}

/// Transcodes by running an `ffmpeg` binary
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    pub program: PathBuf,
}

impl Ffmpeg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Ffmpeg {
            program: program.into(),
        }
    }
}

impl Transcoder for Ffmpeg {
    fn transcode(
        &self,
        source: &Path,
        target: &Path,
        plan: &EncodePlan,
    ) -> Result<(), TranscodeError> {
        let args = plan.ffmpeg_args(source, target);
        debug!("Running {:?} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| TranscodeError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(TranscodeError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(format: TargetFormat) -> EncodePlan {
        EncodePlan {
            format,
            bitrate_kbps: None,
            loudness: Loudness::Off,
            silence_threshold_db: None,
            strip_metadata: false,
        }
    }

    fn args_as_strings(plan: &EncodePlan) -> Vec<String> {
        plan.ffmpeg_args(Path::new("in.flac"), Path::new("out.tmp"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn format_names_parse_case_insensitively() {
        assert_eq!("MP3".parse::<TargetFormat>(), Ok(TargetFormat::Mp3));
        assert_eq!("aac".parse::<TargetFormat>(), Ok(TargetFormat::M4a));
        assert!("wma".parse::<TargetFormat>().is_err());
        assert_eq!(TargetFormat::Opus.to_string(), "opus");
    }

    #[test]
    fn plain_encode_has_no_filters() {
        let p = plan(TargetFormat::Mp3);
        assert_eq!(p.filter_chain(), None);
        assert_eq!(
            args_as_strings(&p),
            [
                "-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i", "in.flac", "-map",
                "0:a:0", "-vn", "-c:a", "libmp3lame", "-b:a", "256k", "-f", "mp3", "out.tmp",
            ]
        );
    }

    #[test]
    fn silence_trim_runs_before_gain() {
        let p = EncodePlan {
            loudness: Loudness::Gain(-3.256),
            silence_threshold_db: Some(-50.0),
            ..plan(TargetFormat::Ogg)
        };
        let sr = "silenceremove=start_periods=1:start_duration=0:start_threshold=-50dB";
        assert_eq!(
            p.filter_chain().unwrap(),
            format!("{sr},areverse,{sr},areverse,volume=-3.26dB")
        );
    }

    #[test]
    fn loudnorm_resamples_and_lossless_skips_bitrate() {
        let p = EncodePlan {
            bitrate_kbps: Some(320),
            loudness: Loudness::LoudNorm {
                target_lufs: -16.0,
                true_peak_db: -1.5,
            },
            strip_metadata: true,
            ..plan(TargetFormat::Flac)
        };
        let args = args_as_strings(&p);
        let tail: Vec<&str> = args[10..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            [
                "-af",
                "loudnorm=I=-16.0:TP=-1.5:LRA=11",
                "-ar",
                "48000",
                "-c:a",
                "flac",
                "-map_metadata",
                "-1",
                "-f",
                "flac",
                "out.tmp",
            ]
        );
    }

    #[test]
    fn explicit_bitrate_overrides_default() {
        let p = EncodePlan {
            bitrate_kbps: Some(96),
            ..plan(TargetFormat::Opus)
        };
        let args = args_as_strings(&p);
        let pos = args.iter().position(|a| a == "-b:a").unwrap();
        assert_eq!(args[pos + 1], "96k");
    }

    #[test]
    fn missing_encoder_is_a_spawn_error() {
        let ffmpeg = Ffmpeg::new("/nonexistent/ffmpeg-binary");
        let err = ffmpeg
            .transcode(Path::new("a.flac"), Path::new("b.mp3"), &plan(TargetFormat::Mp3))
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn encoder_exit_code_and_stderr_are_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ffmpeg");
        std::fs::write(&script, "#!/bin/sh\necho '  bad input  ' >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = Ffmpeg::new(&script)
            .transcode(Path::new("a.flac"), Path::new("b.mp3"), &plan(TargetFormat::Mp3))
            .unwrap_err();
        match err {
            TranscodeError::Failed { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "bad input");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
