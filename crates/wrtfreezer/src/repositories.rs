use std::fs;
use std::path::{Path, PathBuf};

use crate::device::DeviceCoordinate;
use crate::error::{Error, Result};

pub const REPOSITORIES_FILE: &str = "repositories.conf";

const FEEDS: [&str; 6] = [
    "base",
    "luci",
    "management",
    "packages",
    "routing",
    "telephony",
];

/// Renders `repositories.conf`: the six upstream feeds for `coord`, the
/// user's extra lines verbatim, then the image builder's local repository.
/// The last line is newline-terminated.
pub fn render_repositories_conf(
    base_url: &str,
    coord: &DeviceCoordinate,
    extra_lines: &[String],
) -> String {
    let feeds_url = coord.remote_file(base_url, "packages");
    let mut out = String::new();
    for feed in FEEDS {
        out.push_str(&format!(
            "src/gz {}_{feed} {feeds_url}/{feed}\n",
            coord.release
        ));
    }
    out.push('\n');
    out.push_str(&extra_lines.join("\n"));
    out.push_str("\n\n");
    out.push_str("## This is the local package repository, do not remove!\n");
    out.push_str("src imagebuilder file:packages\n");
    out
}

/// Overwrites `<toolchain_dir>/repositories.conf`. Called on every run since
/// the extra repositories may change while the toolchain stays cached.
pub fn write_repositories_conf(
    toolchain_dir: &Path,
    base_url: &str,
    coord: &DeviceCoordinate,
    extra_lines: &[String],
) -> Result<PathBuf> {
    let path = toolchain_dir.join(REPOSITORIES_FILE);
    let body = render_repositories_conf(base_url, coord, extra_lines);
    fs::write(&path, body)
        .map_err(|e| Error::fs(format!("failed to write {}: {e}", path.display())))?;
    Ok(path)
}
