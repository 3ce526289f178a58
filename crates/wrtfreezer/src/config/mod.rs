use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::device::{DeviceCoordinate, DeviceDescriptor};
use crate::error::{Error, Result};

pub const GLOBAL_CONFIG_FILE: &str = "config.json";
pub const DEVICE_CONFIG_FILE: &str = "device.json";
pub const DEFAULT_BASE_URL: &str = "https://downloads.openwrt.org";

/// Settings shared by every device (`<devices_dir>/config.json`).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GlobalConfig {
    /// Extra lines appended to every generated `repositories.conf`.
    pub repositories: Vec<String>,
    pub base_url: Option<String>,
    pub max_parallel: Option<usize>,
}

impl GlobalConfig {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct DeviceConfig {
    release: Option<String>,
    version: Option<String>,
    arch: Option<String>,
    #[serde(rename = "type")]
    target_type: Option<String>,
    profile: Option<String>,
    packages: Vec<String>,
    output_name: Option<String>,
    device_type: Option<String>,
}

/// A device folder whose `device.json` could not be turned into a descriptor.
#[derive(Debug, Clone)]
pub struct RejectedDevice {
    pub name: String,
    pub path: PathBuf,
    pub error: Error,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub global: GlobalConfig,
    pub devices: Vec<DeviceDescriptor>,
    pub rejected: Vec<RejectedDevice>,
}

pub fn load_global(devices_dir: &Path) -> Result<GlobalConfig> {
    let path = devices_dir.join(GLOBAL_CONFIG_FILE);
    if !path.is_file() {
        return Err(Error::config(format!(
            "cannot find global config at {}",
            path.display()
        )));
    }
    let data = fs::read_to_string(&path)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| Error::config(format!("JSON parse error in {}: {e}", path.display())))
}

fn required(value: Option<String>, field: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => v,
        None => {
            missing.push(field);
            String::new()
        }
    }
}

/// Parses one `device.json` body; `dir` is the device folder it came from.
pub fn parse_device(name: &str, dir: &Path, raw: &str) -> Result<DeviceDescriptor> {
    let cfg: DeviceConfig = serde_json::from_str(raw).map_err(|e| {
        Error::config(format!(
            "JSON parse error in {}: {e}",
            dir.join(DEVICE_CONFIG_FILE).display()
        ))
    })?;

    let mut missing = Vec::new();
    let release = required(cfg.release, "release", &mut missing);
    let version = required(cfg.version, "version", &mut missing);
    let arch = required(cfg.arch, "arch", &mut missing);
    let target_type = required(cfg.target_type, "type", &mut missing);
    let profile = required(cfg.profile, "profile", &mut missing);
    if !missing.is_empty() {
        return Err(Error::config(format!(
            "device '{name}' configuration is not valid, missing {}",
            missing.join(", ")
        )));
    }

    let coordinate = DeviceCoordinate::new(release, version, arch, target_type);
    let device_type = cfg
        .device_type
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| coordinate.label());
    let packages = cfg
        .packages
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    let output_name = cfg
        .output_name
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Ok(DeviceDescriptor {
        name: name.to_string(),
        path: dir.to_path_buf(),
        coordinate,
        profile,
        device_type,
        packages,
        output_name,
    })
}

pub fn load_device(dir: &Path) -> Result<DeviceDescriptor> {
    let name = dir
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::config(format!("invalid device folder {}", dir.display())))?;
    let path = dir.join(DEVICE_CONFIG_FILE);
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
    parse_device(name, dir, &raw)
}

/// Scans `devices_dir` for `config.json` plus one `<name>/device.json` per device.
/// Devices are returned sorted by folder name.
pub fn discover(devices_dir: &Path) -> Result<Discovery> {
    let root = fs::canonicalize(devices_dir).map_err(|e| {
        Error::config(format!(
            "invalid devices directory {}: {e}",
            devices_dir.display()
        ))
    })?;
    let global = load_global(&root)?;

    let mut dirs = Vec::new();
    let entries = fs::read_dir(&root)
        .map_err(|e| Error::fs(format!("failed to list {}: {e}", root.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::fs(format!("failed to list {}: {e}", root.display())))?;
        let path = entry.path();
        if path.is_dir() && path.join(DEVICE_CONFIG_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();

    let mut out = Discovery {
        global,
        ..Discovery::default()
    };
    for dir in dirs {
        match load_device(&dir) {
            Ok(dev) => out.devices.push(dev),
            Err(error) => out.rejected.push(RejectedDevice {
                name: dir
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: dir,
                error,
            }),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn write_device(root: &Path, name: &str, body: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).expect("mkdir device");
        fs::write(dir.join(DEVICE_CONFIG_FILE), body).expect("write device.json");
    }

    #[test]
    fn parses_full_device() {
        let dev = parse_device(
            "office",
            Path::new("/devices/office"),
            r#"{
                "release": "19.07", "version": "7", "arch": "ar71xx", "type": "generic",
                "profile": "tl-wdr4300-v1", "packages": ["luci", " ", "tcpdump"],
                "output_name": "tl-wdr4300"
            }"#,
        )
        .expect("parse");
        assert_eq!(dev.coordinate.label(), "19.07-7-ar71xx-generic");
        assert_eq!(dev.device_type, "19.07-7-ar71xx-generic");
        assert_eq!(dev.packages, vec!["luci", "tcpdump"]);
        assert_eq!(dev.output_name.as_deref(), Some("tl-wdr4300"));
    }

    #[test]
    fn missing_fields_are_configuration_errors() {
        let err = parse_device(
            "broken",
            Path::new("/devices/broken"),
            r#"{"release": "19.07", "arch": "ar71xx"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let msg = err.to_string();
        assert!(msg.contains("version, type, profile"), "unexpected err: {msg}");
    }

    #[test]
    fn device_type_override_is_kept() {
        let dev = parse_device(
            "lab",
            Path::new("/devices/lab"),
            r#"{"release": "r", "version": "v", "arch": "a", "type": "t",
                "profile": "p", "device_type": "custom"}"#,
        )
        .expect("parse");
        assert_eq!(dev.device_type, "custom");
    }

    #[test]
    fn missing_global_config_aborts_discovery() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = discover(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn discovery_sorts_devices_and_keeps_rejects() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join(GLOBAL_CONFIG_FILE),
            r#"{"repositories": ["src/gz extra http://example.test/extra"]}"#,
        )
        .expect("write config");
        let ok = r#"{"release": "r", "version": "v", "arch": "a", "type": "t", "profile": "p"}"#;
        write_device(tmp.path(), "zeta", ok);
        write_device(tmp.path(), "alpha", ok);
        write_device(tmp.path(), "bad", r#"{"release": "r"}"#);
        fs::create_dir_all(tmp.path().join("notes")).expect("mkdir notes");

        let found = discover(tmp.path()).expect("discover");
        let names: Vec<_> = found.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(found.rejected.len(), 1);
        assert_eq!(found.rejected[0].name, "bad");
        assert_eq!(found.global.repositories.len(), 1);
        assert_eq!(found.global.base_url(), DEFAULT_BASE_URL);
        assert!(found.devices[0].path.is_absolute());
    }
}
