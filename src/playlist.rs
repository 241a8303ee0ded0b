use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use log::{debug, warn};
use url::Url;
use walkdir::WalkDir;

use crate::AudioFormats;
use crate::error::Error;

/// Rewrites a prefix of raw playlist entries, e.g. to map a playlist written
/// on another machine onto the local music library.
#[derive(Debug, Clone, PartialEq)]
pub struct PathRewrite {
    pub from: String,
    pub to: String,
}

impl PathRewrite {
    /// Returns the rewritten entry if it starts with `from`.
    pub fn apply(&self, entry: &str) -> Option<String> {
        entry
            .strip_prefix(self.from.as_str())
            .map(|rest| format!("{}{}", self.to, rest))
    }
}

impl FromStr for PathRewrite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once('=')
            .ok_or_else(|| format!("expected FROM=TO, got {s:?}"))?;
        if from.is_empty() {
            return Err(format!("empty prefix in rewrite {s:?}"));
        }
        Ok(PathRewrite {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// A parsed playlist
#[derive(Debug)]
pub struct Playlist {
    pub path: PathBuf,
    pub entries: Vec<PathBuf>,
}

/// Reads an M3U/M3U8 playlist, resolving every entry to a filesystem path.
pub fn read_playlist(path: impl AsRef<Path>, rewrites: &[PathRewrite]) -> Result<Playlist, Error> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let entries = parse_entries(&text, base_dir, rewrites);
    debug!("Read {} entries from {:?}", entries.len(), path);

    Ok(Playlist {
        path: path.to_path_buf(),
        entries,
    })
}

fn parse_entries(text: &str, base_dir: &Path, rewrites: &[PathRewrite]) -> Vec<PathBuf> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut entries = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let rewritten = rewrites.iter().find_map(|r| r.apply(line));
        let entry = rewritten.as_deref().unwrap_or(line);

        match entry_to_path(entry) {
            Some(p) if p.is_relative() => entries.push(base_dir.join(p)),
            Some(p) => entries.push(p),
            None => warn!("Skipping playlist entry that is not a local file: {}", entry),
        }
    }
    entries
}

fn entry_to_path(entry: &str) -> Option<PathBuf> {
    if entry.contains("://") {
        let url = Url::parse(entry).ok()?;
        if url.scheme() != "file" {
            return None;
        }
        return url.to_file_path().ok();
    }

    if cfg!(windows) {
        Some(PathBuf::from(entry))
    } else {
        Some(PathBuf::from(entry.replace('\\', "/")))
    }
}

/// Expands directory entries into the supported audio files below them.
pub fn expand_entries(entries: &[PathBuf]) -> Vec<PathBuf> {
    let mut expanded = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(entry)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| AudioFormats::from_path(p).is_some())
                .collect();
            found.sort();
            debug!("Expanded {:?} into {} files", entry, found.len());
            expanded.extend(found);
        } else {
            expanded.push(entry.clone());
        }
    }
    expanded
}

/// Writes an extended M3U playlist with entries relative to the playlist's own directory.
pub fn write_playlist(path: impl AsRef<Path>, entries: &[PathBuf]) -> Result<(), Error> {
    let path = path.as_ref();
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut out = String::from("#EXTM3U\n");
    for entry in entries {
        let relative = pathdiff::diff_paths(entry, base_dir).unwrap_or_else(|| entry.clone());
        let line = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                Component::ParentDir => Some("..".to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        out.push_str(&line);
        out.push('\n');
    }

    fs::write(path, out).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "\u{feff}#EXTM3U\r\n#EXTINF:123,Artist - Title\r\n\r\nmusic/a.flac\r\n  \n/abs/b.mp3\n";
        let entries = parse_entries(text, Path::new("/lists"), &[]);
        assert_eq!(
            entries,
            vec![PathBuf::from("/lists/music/a.flac"), PathBuf::from("/abs/b.mp3")]
        );
    }

    #[test]
    fn first_matching_rewrite_wins() {
        let rewrites: Vec<PathRewrite> = vec![
            "/home/old/Music=/srv/music".parse().unwrap(),
            "/home/old=/nowhere".parse().unwrap(),
        ];
        let entries = parse_entries("/home/old/Music/x/y.ogg\n", Path::new("/"), &rewrites);
        assert_eq!(entries, vec![PathBuf::from("/srv/music/x/y.ogg")]);
    }

    #[cfg(not(windows))]
    #[test]
    fn windows_entries_are_rewritten_and_normalized() {
        let rewrites: Vec<PathRewrite> = vec!["D:\\Music=/mnt/music".parse().unwrap()];
        let entries = parse_entries("D:\\Music\\Band\\01 Song.mp3\n", Path::new("/"), &rewrites);
        assert_eq!(entries, vec![PathBuf::from("/mnt/music/Band/01 Song.mp3")]);
    }

    #[cfg(not(windows))]
    #[test]
    fn file_urls_are_decoded_and_remote_urls_skipped() {
        let text = "file:///srv/music/My%20Song.flac\nhttp://radio.example/stream.mp3\n";
        let entries = parse_entries(text, Path::new("/"), &[]);
        assert_eq!(entries, vec![PathBuf::from("/srv/music/My Song.flac")]);
    }

    #[test]
    fn rewrite_parsing_rejects_malformed_input() {
        assert!("no-equals-sign".parse::<PathRewrite>().is_err());
        assert!("=/to".parse::<PathRewrite>().is_err());
        let r: PathRewrite = "/a=".parse().unwrap();
        assert_eq!(r.apply("/a/b"), Some("/b".to_string()));
        assert_eq!(r.apply("/c/b"), None);
    }

    #[test]
    fn directories_expand_to_sorted_audio_files() {
        let dir = tempfile::tempdir().unwrap();
        let album = dir.path().join("album");
        fs::create_dir_all(album.join("cd2")).unwrap();
        fs::write(album.join("02.flac"), b"").unwrap();
        fs::write(album.join("01.mp3"), b"").unwrap();
        fs::write(album.join("cover.jpg"), b"").unwrap();
        fs::write(album.join("cd2").join("01.ogg"), b"").unwrap();
        let single = dir.path().join("missing.mp3");

        let expanded = expand_entries(&[album.clone(), single.clone()]);
        assert_eq!(
            expanded,
            vec![
                album.join("01.mp3"),
                album.join("02.flac"),
                album.join("cd2").join("01.ogg"),
                single,
            ]
        );
    }

    #[test]
    fn written_playlist_uses_relative_entries() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("out.m3u8");
        let entries = vec![
            dir.path().join("Band").join("a.mp3"),
            dir.path().join("b.mp3"),
        ];
        write_playlist(&list, &entries).unwrap();

        let text = fs::read_to_string(&list).unwrap();
        assert_eq!(text, "#EXTM3U\nBand/a.mp3\nb.mp3\n");

        let reread = read_playlist(&list, &[]).unwrap();
        assert_eq!(reread.entries, entries);
    }
}
