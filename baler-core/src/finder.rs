//! Periodic `find`-style discovery of aged files.
//!
//! The kernel watcher alone is not enough: files that were already closed
//! when the process started produce no events, and a directory created just
//! before its recursive watch was established can swallow events for files
//! written inside it. The sweep picks all of those up by age. It also prunes
//! long-empty directories so dated trees do not accumulate forever.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::filename::SystemPath;
use crate::metrics;
use crate::spread::Spread;

/// Directories younger than this are never pruned, so the current day's
/// dated directory always survives.
const MIN_DIRECTORY_AGE: Duration = Duration::from_secs(25 * 60 * 60);

/// Sweeps `directory` repeatedly until `ctx` cancels, pushing every file
/// whose mtime is more than `max_age` in the past into `tx` in
/// oldest-first order. The inter-sweep delay is drawn from `cadence` so a
/// fleet of sidecars does not run its sweeps in lockstep.
pub async fn find_forever(
    ctx: CancellationToken,
    datatype: String,
    directory: PathBuf,
    max_age: Duration,
    tx: mpsc::Sender<SystemPath>,
    cadence: Spread,
) {
    loop {
        for file in find_files(&datatype, &directory, max_age) {
            if tx.send(file).await.is_err() {
                return;
            }
        }
        tokio::select! {
            _ = ctx.cancelled() => {
                info!("stopping {datatype} finder");
                return;
            }
            _ = tokio::time::sleep(cadence.draw()) => {}
        }
    }
}

/// One sweep: collect eligible files sorted by mtime, prune stale empty
/// directories along the way.
fn find_files(datatype: &str, directory: &Path, max_age: Duration) -> Vec<SystemPath> {
    let eligible_before = SystemTime::now() - max_age;
    let mut eligible: Vec<(PathBuf, SystemTime, u64)> = Vec::new();

    for entry in WalkDir::new(directory) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    "could not walk part of {} (error: {err}), proceeding with discovered files",
                    directory.display()
                );
                continue;
            }
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("could not stat {} (error: {err})", entry.path().display());
                continue;
            }
        };
        let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);
        if metadata.is_dir() {
            maybe_prune_directory(datatype, directory, entry.path(), mtime);
        } else if metadata.is_file() && mtime < eligible_before {
            eligible.push((entry.into_path(), mtime, metadata.len()));
        }
    }

    metrics::FINDER_RUNS.with_label_values(&[datatype]).inc();
    metrics::FINDER_FILES_FOUND
        .with_label_values(&[datatype])
        .inc_by(eligible.len() as u64);
    metrics::FINDER_BYTES_FOUND
        .with_label_values(&[datatype])
        .inc_by(eligible.iter().map(|(_, _, size)| *size).sum::<u64>());

    eligible.sort_by_key(|(_, mtime, _)| *mtime);
    let oldest = eligible
        .first()
        .map(|(_, mtime, _)| *mtime)
        .unwrap_or_else(SystemTime::now);
    metrics::FINDER_MTIME_LOWER_BOUND
        .with_label_values(&[datatype])
        .set(
            oldest
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
        );

    eligible
        .into_iter()
        .map(|(path, _, _)| SystemPath::from(path.as_path()))
        .collect()
}

/// Removes `path` if it is an old, empty directory. The sweep root and any
/// directory named after the datatype are left alone.
fn maybe_prune_directory(datatype: &str, root: &Path, path: &Path, mtime: SystemTime) {
    if path == root {
        return;
    }
    if path.file_name().map(|n| n == datatype).unwrap_or(false) {
        return;
    }
    if mtime > SystemTime::now() - MIN_DIRECTORY_AGE {
        return;
    }
    let is_empty = match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(err) => {
            warn!("could not list {} (error: {err})", path.display());
            return;
        }
    };
    if !is_empty {
        return;
    }
    match std::fs::remove_dir(path) {
        Ok(()) => info!("removed old, empty directory {}", path.display()),
        Err(err) => warn!("could not remove {} (error: {err})", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_file(dir: &Path, rel: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn finds_aged_files_in_mtime_order() {
        let dir = tempfile::tempdir().unwrap();
        // With a zero age threshold everything already on disk is eligible.
        let first = write_file(dir.path(), "a/2019/01/01/first", b"1");
        std::thread::sleep(Duration::from_millis(20));
        let second = write_file(dir.path(), "a/2019/01/02/second", b"22");
        std::thread::sleep(Duration::from_millis(20));
        let third = write_file(dir.path(), "b/2019/01/01/third", b"333");

        let found = find_files("test", dir.path(), Duration::ZERO);
        let paths: Vec<&str> = found.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                first.to_str().unwrap(),
                second.to_str().unwrap(),
                third.to_str().unwrap()
            ]
        );
    }

    #[test]
    fn repeated_sweeps_return_the_same_set() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a/one", b"1");
        write_file(dir.path(), "a/two", b"2");

        let first = find_files("test", dir.path(), Duration::ZERO);
        let second = find_files("test", dir.path(), Duration::ZERO);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn young_files_are_not_eligible() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a/fresh", b"fresh");
        let found = find_files("test", dir.path(), Duration::from_secs(3600));
        assert!(found.is_empty());
    }

    #[test]
    fn fresh_empty_directories_survive_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("a/empty");
        std::fs::create_dir_all(&empty).unwrap();
        find_files("test", dir.path(), Duration::ZERO);
        assert!(empty.exists(), "a young empty directory must not be pruned");
    }

    #[tokio::test]
    async fn find_forever_emits_then_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a/one", b"1");

        let (tx, mut rx) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let task = tokio::spawn(find_forever(
            ctx.clone(),
            "test".to_string(),
            dir.path().to_path_buf(),
            Duration::ZERO,
            tx,
            Spread::fixed(Duration::from_secs(3600)),
        ));

        let found = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("finder did not emit in time")
            .expect("channel closed");
        assert!(found.as_str().ends_with("/a/one"));

        ctx.cancel();
        task.await.unwrap();
    }
}
