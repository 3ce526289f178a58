use std::collections::BTreeSet;
use std::time::Duration;

use crate::device::DeviceCoordinate;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::remote::RemoteServer;

pub const MANIFEST_FILE: &str = "md5sums";

const MANIFEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Collects the digests of every `<digest> <filename>` line whose filename
/// contains one of `names`. Binary-mode markers (`*name`) are accepted.
pub fn parse_manifest(body: &str, names: &[&str]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for line in body.lines() {
        let mut fields = line.split_whitespace();
        let (Some(digest), Some(first)) = (fields.next(), fields.next()) else {
            continue;
        };
        let mut filename = first.trim_start_matches('*').to_string();
        for rest in fields {
            filename.push(' ');
            filename.push_str(rest);
        }
        if names.iter().any(|n| filename.contains(n)) {
            out.insert(digest.to_ascii_lowercase());
        }
    }
    out
}

/// Fetches `md5sums` for `coord` and returns the digests published for either
/// archive name. Anything but HTTP 200 means there is no trust anchor.
pub fn fetch_expected_digests(
    ctx: &ExecCtx,
    remote: &RemoteServer,
    coord: &DeviceCoordinate,
    primary: &str,
    fallback: &str,
) -> Result<BTreeSet<String>> {
    let url = remote.url_for(coord, MANIFEST_FILE);
    ctx.log(&format!("fetching {url}"));
    let res = remote
        .get_with_timeout(&url, MANIFEST_TIMEOUT)
        .map_err(|e| Error::manifest(format!("cannot get md5sums for {coord}: {e}")))?;
    if res.status() != reqwest::StatusCode::OK {
        return Err(Error::manifest(format!(
            "cannot get md5sums from {url}: HTTP {}",
            res.status()
        )));
    }
    let body = res
        .text()
        .map_err(|e| Error::manifest(format!("failed to read md5sums from {url}: {e}")))?;
    Ok(parse_manifest(&body, &[primary, fallback]))
}
