use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use log::warn;

use crate::encode::TargetFormat;

/// A source file and the path its transcoded copy is written to
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Returns the deepest directory that contains every file in `paths`.
pub fn common_root(paths: &[PathBuf]) -> Option<PathBuf> {
    let mut iter = paths.iter();
    let first = iter.next()?.parent()?.to_path_buf();

    let root = iter.fold(first, |acc, path| {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        acc.components()
            .zip(parent.components())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a)
            .collect()
    });
    Some(root)
}

/// Maps a source file onto the output directory, keeping its layout below `source_root`.
pub fn target_path(
    source: &Path,
    source_root: &Path,
    output_dir: &Path,
    format: TargetFormat,
) -> PathBuf {
    let relative = pathdiff::diff_paths(source, source_root)
        .filter(|r| {
            !r.as_os_str().is_empty() && r.components().all(|c| matches!(c, Component::Normal(_)))
        })
        .unwrap_or_else(|| {
            warn!(
                "{:?} is not below {:?}, placing it at the top of the output directory",
                source, source_root
            );
            PathBuf::from(source.file_name().unwrap_or_default())
        });

    let mut target = output_dir.join(relative);
    target.set_extension(format.extension());
    target
}

/// Plans one job per unique source. A source whose target is already claimed
/// by an earlier entry is dropped.
pub fn plan_jobs(
    sources: &[PathBuf],
    source_root: &Path,
    output_dir: &Path,
    format: TargetFormat,
) -> Vec<Job> {
    let mut seen_sources = HashSet::new();
    let mut claimed = HashSet::new();
    let mut jobs = Vec::with_capacity(sources.len());

    for source in sources {
        if !seen_sources.insert(source.clone()) {
            continue;
        }
        let target = target_path(source, source_root, output_dir, format);
        if !claimed.insert(target.clone()) {
            warn!(
                "Skipping {:?}: target {:?} is already used by another playlist entry",
                source, target
            );
            continue;
        }
        jobs.push(Job {
            source: source.clone(),
            target,
        });
    }
    jobs
}

/// Whether `target` exists and is at least as new as `source`.
pub fn is_up_to_date(source: &Path, target: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified());
    match (modified(source), modified(target)) {
        (Ok(s), Ok(t)) => t >= s,
        _ => false,
    }
}
