//! Shared helpers used by the storage layer and the server engine.

use anyhow::{bail, format_err, Error};
use nix::sys::stat;
use nix::unistd;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod timespan;

/// Write `data` to `path` atomically.
///
/// The data is first written to a temporary file in the same directory,
/// then renamed over the destination. Note: we use mkstemp here because
/// this works with different processes and threads.
pub fn replace_file<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    perm: Option<stat::Mode>,
) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = perm.unwrap_or(
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH,
    );

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write failed: {}", err);
    }

    if let Err(err) = file.sync_all() {
        let _ = unistd::unlink(tmp_path);
        bail!("sync failed: {}", err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

/// Free bytes available to unprivileged users on the filesystem holding `path`.
pub fn free_space<P: AsRef<Path>>(path: P) -> Result<i64, Error> {
    let stat = nix::sys::statvfs::statvfs(path.as_ref())
        .map_err(|err| format_err!("statvfs {:?} failed - {}", path.as_ref(), err))?;
    Ok(stat.blocks_available() as i64 * stat.fragment_size() as i64)
}

/// Total size in bytes of the filesystem holding `path`.
pub fn total_space<P: AsRef<Path>>(path: P) -> Result<i64, Error> {
    let stat = nix::sys::statvfs::statvfs(path.as_ref())
        .map_err(|err| format_err!("statvfs {:?} failed - {}", path.as_ref(), err))?;
    Ok(stat.blocks() as i64 * stat.fragment_size() as i64)
}

pub fn digest_to_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

const BYTE_UNITS: &[&str] = &["bytes", "KiB", "MiB", "GiB", "TiB"];

pub fn pretty_print_bytes(bytes: i64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit + 1 < BYTE_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, BYTE_UNITS[0])
    } else {
        format!("{:.2} {}", value, BYTE_UNITS[unit])
    }
}

pub fn pretty_print_speed(bytes_per_sec: i64) -> String {
    format!("{}/s", pretty_print_bytes(bytes_per_sec))
}

/// Remove a directory tree, handing every symlink found inside to
/// `on_symlink` instead of following or simply unlinking it.
///
/// The callback decides what happens to the link (reference bookkeeping,
/// pool entry removal) and must remove the symlink itself. Errors from
/// single entries are logged and the walk continues; with `delete_root`
/// the (then empty) root directory is removed as well.
pub fn remove_dir_recursive<F>(
    path: &Path,
    on_symlink: &mut F,
    delete_root: bool,
) -> Result<(), Error>
where
    F: FnMut(&Path) -> Result<(), Error>,
{
    let mut had_error = false;

    // children before parents, so directories are empty when removed
    for entry in walkdir::WalkDir::new(path).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::error!("walking {:?} failed - {}", path, err);
                had_error = true;
                continue;
            }
        };
        let entry_path = entry.path();
        if entry.depth() == 0 {
            if delete_root {
                if let Err(err) = std::fs::remove_dir(entry_path) {
                    bail!("unable to remove directory {:?} - {}", entry_path, err);
                }
            }
            continue;
        }

        if entry.path_is_symlink() {
            if let Err(err) = on_symlink(entry_path) {
                log::error!("handling symlink {:?} failed - {}", entry_path, err);
                had_error = true;
            }
        } else if entry.file_type().is_dir() {
            if let Err(err) = std::fs::remove_dir(entry_path) {
                log::error!("unable to remove directory {:?} - {}", entry_path, err);
                had_error = true;
            }
        } else if let Err(err) = std::fs::remove_file(entry_path) {
            log::error!("unable to remove file {:?} - {}", entry_path, err);
            had_error = true;
        }
    }

    if had_error {
        bail!("errors while removing directory tree {:?}", path);
    }

    Ok(())
}

/// File name (final path component) as an owned string.
pub fn file_name_string(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

/// Build the canonical image directory name, e.g. `Image_C_210407-0301`.
pub fn image_dir_name(letter: &str, now: chrono::DateTime<chrono::Local>) -> String {
    let letter = letter.trim_end_matches(':');
    format!("Image_{}_{}", letter, now.format("%y%m%d-%H%M"))
}

pub fn parent_path(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}
