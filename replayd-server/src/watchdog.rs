//! Background cleanup of on-disk cache files.
//!
//! Deleting cache files from the server's own exit path is unreliable:
//! the process may be killed, and deleting while the server still writes
//! would corrupt the cache. Instead a small watchdog process is spawned
//! (a re-execution of this binary with hidden arguments) that polls the
//! parent's liveness and removes the files only once the parent is gone.

use replayd_core::cache::purge_cache_files;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Hidden flag carrying the pid to watch.
pub const PARENT_FLAG: &str = "--watchdog-parent";
/// Hidden flag carrying the cache directory.
pub const PATH_FLAG: &str = "--watchdog-path";
/// Hidden flag selecting whole-tree removal (temp directories).
pub const REMOVE_DIR_FLAG: &str = "--watchdog-remove-dir";

/// Liveness poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Spawn a watchdog for the calling process over the given cache
/// directory. `remove_dir` removes the whole tree (used for temp
/// directories the caller did not choose); otherwise only the cache's
/// own files are removed and the directory is left in place.
pub fn spawn_cleaner(cache_dir: &Path, remove_dir: bool) -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .arg(PARENT_FLAG)
        .arg(std::process::id().to_string())
        .arg(PATH_FLAG)
        .arg(cache_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if remove_dir {
        command.arg(REMOVE_DIR_FLAG);
    }
    // Deliberately never waited on; the child outlives this process.
    command.spawn()?;
    debug!(path = %cache_dir.display(), "cache cleanup watchdog spawned");
    Ok(())
}

/// True while the given process exists.
pub fn parent_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Watchdog entry point: wait for the parent to exit, then clean up.
pub fn run(parent: u32, cache_dir: &Path, remove_dir: bool) {
    while parent_alive(parent) {
        std::thread::sleep(POLL_INTERVAL);
    }
    if remove_dir {
        remove_tree(cache_dir);
    } else {
        purge_cache_files(cache_dir);
    }
}

/// Remove a directory tree depth-first, files before directories.
/// Entries that disappear mid-walk (a racing cleaner, a partial write
/// that never completed) are skipped silently.
pub fn remove_tree(path: &Path) {
    let Ok(entries) = fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        let child = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            remove_tree(&child);
        } else {
            let _ = fs::remove_file(&child);
        }
    }
    let _ = fs::remove_dir(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(parent_alive(std::process::id()));
    }

    #[test]
    fn nonexistent_process_is_dead() {
        // Pid numbers top out well below this on every unix we run on.
        assert!(!parent_alive(999_999_999));
    }

    #[test]
    fn remove_tree_is_depth_first_and_tolerant() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/blob"), b"x").unwrap();
        fs::write(root.join("top"), b"y").unwrap();

        remove_tree(&root);
        assert!(!root.exists());

        // A second pass over the now-missing tree is a no-op.
        remove_tree(&root);
    }
}
