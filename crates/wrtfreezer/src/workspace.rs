use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};

pub const INTERMEDIATES_DIR: &str = "intermediates";
pub const TARGETS_DIR: &str = "targets";

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    /// Image builder cache, keyed by coordinate.
    pub cache_root: PathBuf,
    /// One folder per device with the published images.
    pub output_root: PathBuf,
}

impl WorkspacePaths {
    pub fn device_out_dir(&self, device: &DeviceDescriptor) -> PathBuf {
        device_out_dir(&self.output_root, device)
    }
}

pub fn device_out_dir(output_root: &Path, device: &DeviceDescriptor) -> PathBuf {
    output_root.join(&device.name)
}

/// Resolves the output directory (relative to the current directory) into workspace paths.
pub fn load_paths(out_dir: &str) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::fs(format!("cwd error: {e}")))?;
    let root = resolve_user_dir(&cwd, out_dir)?;
    Ok(WorkspacePaths {
        cache_root: root.join(INTERMEDIATES_DIR),
        output_root: root.join(TARGETS_DIR),
        root,
    })
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::fs(format!("failed to create dir {}: {e}", p.display())))
}

/// Creates the cache root, the output root and every device output folder.
pub fn init_dirs(
    cache_root: &Path,
    output_root: &Path,
    devices: &[DeviceDescriptor],
) -> Result<()> {
    ensure_dir(cache_root)?;
    ensure_dir(output_root)?;
    for dev in devices {
        validate_dir_name(&dev.name)?;
        ensure_dir(&device_out_dir(output_root, dev))?;
    }
    Ok(())
}

fn validate_dir_name(name: &str) -> Result<()> {
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::config(format!("invalid device name '{name}'"))),
    }
}

fn resolve_user_dir(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty output directory"));
    }
    let pb = PathBuf::from(p);
    if pb.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::config(format!(
            "invalid output directory '{p}' (contains '..')"
        )));
    }
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}
