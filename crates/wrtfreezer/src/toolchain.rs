use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};

use tempfile::NamedTempFile;

use crate::checksum::{CHUNK_SIZE, md5_file_hex};
use crate::device::DeviceCoordinate;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{CANCEL_POLL, ExecCtx};
use crate::manifest::fetch_expected_digests;
use crate::remote::RemoteServer;
use crate::workspace::ensure_dir;

/// Cached copy of the downloaded image builder archive.
pub const ARCHIVE_FILE: &str = "imagebuilder.tar.bz2";
/// Fixed name the extracted image builder is moved to.
pub const TOOLCHAIN_DIR: &str = "imagebuilder";
/// Digest of the archive `imagebuilder/` was extracted from.
pub const EXTRACTED_MARKER: &str = ".imagebuilder.md5";

const ARCHIVE_ROOT_PREFIX: &str = "OpenWrt-ImageBuilder";
const DOWNLOAD_PREFIX: &str = ".download-";
const EXTRACT_PREFIX: &str = ".extract-";
const PROGRESS_INTERVAL: u64 = 5 * CHUNK_SIZE as u64;

/// A ready-to-use image builder for one coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub coordinate: DeviceCoordinate,
    pub cache_dir: PathBuf,
    pub dir: PathBuf,
    /// Whether this call had to download the archive.
    pub downloaded: bool,
}

/// Makes sure `<cache_root>/<release>/<version>/<arch>/<type>/imagebuilder`
/// holds a verified, extracted image builder for `coord`.
///
/// The manifest is fetched on every call so upstream updates are noticed; a
/// cached archive whose digest is still listed is reused without downloading.
/// `imagebuilder/` is only trusted when its marker names that same digest.
pub fn ensure_toolchain(
    ctx: &ExecCtx,
    remote: &RemoteServer,
    coord: &DeviceCoordinate,
    cache_root: &Path,
) -> Result<Toolchain> {
    let cache_dir = coord.cache_dir(cache_root);
    ensure_dir(&cache_dir)?;
    remove_leftovers(&cache_dir)?;

    let primary = coord.primary_archive_name();
    let fallback = coord.fallback_archive_name();

    ctx.log("checking if image builder is up to date");
    let expected = fetch_expected_digests(ctx, remote, coord, &primary, &fallback)?;
    if expected.is_empty() {
        return Err(Error::manifest(format!(
            "md5sums for {coord} lists neither {primary} nor {fallback}"
        )));
    }

    let archive = cache_dir.join(ARCHIVE_FILE);
    let dir = cache_dir.join(TOOLCHAIN_DIR);
    let toolchain = |downloaded| Toolchain {
        coordinate: coord.clone(),
        cache_dir: cache_dir.clone(),
        dir: dir.clone(),
        downloaded,
    };

    if archive.is_file() {
        let local = md5_file_hex(&archive)?;
        if expected.contains(&local) {
            if dir.is_dir() && extracted_digest(&cache_dir).as_deref() == Some(local.as_str()) {
                ctx.log("image builder is up to date, skipping download");
                return Ok(toolchain(false));
            }
            ctx.log("cached archive is valid but not extracted, extracting");
            install_toolchain(ctx, &archive, &cache_dir, &local)?;
            return Ok(toolchain(false));
        }
        ctx.log(&format!("cached archive is stale (md5 {local}), discarding"));
        remove_file_if_exists(&archive)?;
    }

    let download = download_archive(ctx, remote, coord, &primary, &fallback, &cache_dir)?;

    ctx.log("image builder downloaded, verifying");
    let digest = verify_archive(download.path(), &expected)?;
    download.persist(&archive).map_err(|e| {
        Error::fs(format!(
            "failed to move download to {}: {}",
            archive.display(),
            e.error
        ))
    })?;

    ctx.log("image builder verified, extracting");
    install_toolchain(ctx, &archive, &cache_dir, &digest)?;
    Ok(toolchain(true))
}

fn download_archive(
    ctx: &ExecCtx,
    remote: &RemoteServer,
    coord: &DeviceCoordinate,
    primary: &str,
    fallback: &str,
    cache_dir: &Path,
) -> Result<NamedTempFile> {
    let mut url = remote.url_for(coord, primary);
    ctx.log(&format!("downloading {url}"));
    let mut res = remote.get(&url)?;
    if res.status() == reqwest::StatusCode::NOT_FOUND {
        url = remote.url_for(coord, fallback);
        ctx.log(&format!("not found, trying {url}"));
        res = remote.get(&url)?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::toolchain_not_found(format!(
                "cannot find image builder for {coord}"
            )));
        }
    }
    if !res.status().is_success() {
        return Err(Error::network(format!(
            "download of {url} failed with status {}",
            res.status()
        )));
    }

    // Dropped (and deleted) on any error below.
    let mut tmp = tempfile::Builder::new()
        .prefix(DOWNLOAD_PREFIX)
        .tempfile_in(cache_dir)
        .map_err(|e| {
            Error::fs(format!(
                "failed to create download file in {}: {e}",
                cache_dir.display()
            ))
        })?;
    stream_to_file(ctx, res, tmp.as_file_mut())?;
    Ok(tmp)
}

/// Copies `body` into `file`. The body is read on a helper thread so a
/// stalled server cannot hold off a cancel request.
fn stream_to_file<R>(ctx: &ExecCtx, mut body: R, file: &mut fs::File) -> Result<u64>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<io::Result<Vec<u8>>>(4);
    std::thread::spawn(move || {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let chunk = match body.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
            let failed = chunk.is_err();
            if tx.send(chunk).is_err() || failed {
                return;
            }
        }
    });

    let mut total: u64 = 0;
    let mut next_report = PROGRESS_INTERVAL;
    loop {
        ctx.check_cancelled()?;
        let chunk = match rx.recv_timeout(CANCEL_POLL) {
            Ok(chunk) => chunk.map_err(|e| Error::network(format!("download interrupted: {e}")))?,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        file.write_all(&chunk)
            .map_err(|e| Error::fs(format!("failed to write download: {e}")))?;
        total += chunk.len() as u64;
        if total >= next_report {
            ctx.log(&format!("{}MB downloaded...", total / CHUNK_SIZE as u64));
            next_report += PROGRESS_INTERVAL;
        }
    }
    file.sync_all()
        .map_err(|e| Error::fs(format!("failed to sync download: {e}")))?;
    Ok(total)
}

/// Checks the archive against the manifest and returns its digest; a
/// mismatching archive is deleted.
pub fn verify_archive(archive: &Path, expected: &BTreeSet<String>) -> Result<String> {
    let got = md5_file_hex(archive)?;
    if expected.contains(&got) {
        return Ok(got);
    }
    remove_file_if_exists(archive)?;
    let want: Vec<&str> = expected.iter().map(String::as_str).collect();
    Err(Error::integrity(format!(
        "validation of {} failed: expected one of [{}], got {got}",
        archive.display(),
        want.join(", ")
    )))
}

// Extracts `archive` and records `digest` as the source of `imagebuilder/`.
// An archive that cannot be extracted is deleted so the next run downloads
// a fresh copy; a cancelled extraction keeps it for the next run.
fn install_toolchain(ctx: &ExecCtx, archive: &Path, cache_dir: &Path, digest: &str) -> Result<()> {
    let marker = cache_dir.join(EXTRACTED_MARKER);
    remove_file_if_exists(&marker)?;
    if let Err(e) = extract_toolchain(ctx, archive, cache_dir) {
        if e.kind() != ErrorKind::Cancelled {
            remove_file_if_exists(archive)?;
        }
        return Err(e);
    }
    fs::write(&marker, format!("{digest}\n"))
        .map_err(|e| Error::fs(format!("failed to write {}: {e}", marker.display())))
}

fn extracted_digest(cache_dir: &Path) -> Option<String> {
    fs::read_to_string(cache_dir.join(EXTRACTED_MARKER))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Unpacks the archive into a staging directory next to it, then moves the
/// single `OpenWrt-ImageBuilder*` root to `imagebuilder/`. A failed or
/// cancelled extraction leaves any previous `imagebuilder/` untouched.
pub fn extract_toolchain(ctx: &ExecCtx, archive: &Path, cache_dir: &Path) -> Result<PathBuf> {
    let staging = tempfile::Builder::new()
        .prefix(EXTRACT_PREFIX)
        .tempdir_in(cache_dir)
        .map_err(|e| {
            Error::fs(format!(
                "failed to create staging dir in {}: {e}",
                cache_dir.display()
            ))
        })?;

    let file = fs::File::open(archive)
        .map_err(|e| Error::fs(format!("failed to open {}: {e}", archive.display())))?;
    let reader = CancelOnRead {
        inner: bzip2::read::BzDecoder::new(io::BufReader::new(file)),
        cancel: Arc::clone(&ctx.cancel),
    };
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    if let Err(e) = tar.unpack(staging.path()) {
        if ctx.cancelled() {
            return Err(Error::cancelled());
        }
        return Err(Error::integrity(format!(
            "failed to extract {}: {e}",
            archive.display()
        )));
    }

    let root = find_archive_root(staging.path())?;
    let dest = cache_dir.join(TOOLCHAIN_DIR);
    if dest.exists() {
        fs::remove_dir_all(&dest)
            .map_err(|e| Error::fs(format!("failed to remove {}: {e}", dest.display())))?;
    }
    fs::rename(&root, &dest).map_err(|e| {
        Error::fs(format!(
            "failed to move {} to {}: {e}",
            root.display(),
            dest.display()
        ))
    })?;
    ctx.log(&format!("image builder extracted to {}", dest.display()));
    Ok(dest)
}

// Partial downloads and staging dirs survive a hard exit; never reuse them.
fn remove_leftovers(cache_dir: &Path) -> Result<()> {
    let entries = fs::read_dir(cache_dir)
        .map_err(|e| Error::fs(format!("failed to list {}: {e}", cache_dir.display())))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let path = entry.path();
        if name.starts_with(DOWNLOAD_PREFIX) && path.is_file() {
            remove_file_if_exists(&path)?;
        } else if name.starts_with(EXTRACT_PREFIX) && path.is_dir() {
            fs::remove_dir_all(&path)
                .map_err(|e| Error::fs(format!("failed to remove {}: {e}", path.display())))?;
        }
    }
    Ok(())
}

fn find_archive_root(staging: &Path) -> Result<PathBuf> {
    let mut roots = Vec::new();
    let entries = fs::read_dir(staging)
        .map_err(|e| Error::fs(format!("failed to list {}: {e}", staging.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::fs(format!("failed to list {}: {e}", staging.display())))?;
        let path = entry.path();
        let is_root = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(ARCHIVE_ROOT_PREFIX));
        if is_root && path.is_dir() {
            roots.push(path);
        }
    }
    match roots.len() {
        1 => Ok(roots.remove(0)),
        0 => Err(Error::integrity(format!(
            "archive has no {ARCHIVE_ROOT_PREFIX}* directory"
        ))),
        n => Err(Error::integrity(format!(
            "archive has {n} {ARCHIVE_ROOT_PREFIX}* directories, expected one"
        ))),
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::fs(format!("failed to remove {}: {e}", path.display()))),
    }
}

// Lets a cancel request abort `tar::Archive::unpack` between reads.
struct CancelOnRead<R> {
    inner: R,
    cancel: Arc<AtomicBool>,
}

impl<R: Read> Read for CancelOnRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(io::Error::other(ErrorKind::Cancelled.as_str()));
        }
        self.inner.read(buf)
    }
}
