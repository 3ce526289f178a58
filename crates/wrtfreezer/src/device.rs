use std::fmt;
use std::path::{Path, PathBuf};

/// Directory inside a device folder whose contents are overlaid onto the image.
pub const FILES_DIR: &str = "files";

/// Identifies one upstream image builder: `release/version/arch/type`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceCoordinate {
    pub release: String,
    pub version: String,
    pub arch: String,
    pub target_type: String,
}

impl DeviceCoordinate {
    pub fn new(
        release: impl Into<String>,
        version: impl Into<String>,
        arch: impl Into<String>,
        target_type: impl Into<String>,
    ) -> Self {
        Self {
            release: release.into(),
            version: version.into(),
            arch: arch.into(),
            target_type: target_type.into(),
        }
    }

    /// Dash-joined form, used as the default device type and as a log scope.
    pub fn label(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.release, self.version, self.arch, self.target_type
        )
    }

    /// Remote directory holding the manifest, the image builder and the package feeds.
    pub fn remote_dir(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.release,
            self.version,
            self.arch,
            self.target_type
        )
    }

    pub fn remote_file(&self, base_url: &str, filename: &str) -> String {
        format!("{}/{}", self.remote_dir(base_url), filename)
    }

    pub fn cache_dir(&self, cache_root: &Path) -> PathBuf {
        cache_root
            .join(&self.release)
            .join(&self.version)
            .join(&self.arch)
            .join(&self.target_type)
    }

    pub fn primary_archive_name(&self) -> String {
        format!(
            "OpenWrt-ImageBuilder-{}_{}-for-linux-x86_64.tar.bz2",
            self.arch, self.target_type
        )
    }

    // Some releases publish the builder without the subtarget in its name.
    pub fn fallback_archive_name(&self) -> String {
        format!("OpenWrt-ImageBuilder-{}-for-linux-x86_64.tar.bz2", self.arch)
    }
}

impl fmt::Display for DeviceCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.release, self.version, self.arch, self.target_type
        )
    }
}

/// One device discovered under the devices directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Name of the device folder; also names the output folder.
    pub name: String,
    /// Absolute path of the device folder.
    pub path: PathBuf,
    pub coordinate: DeviceCoordinate,
    /// Device identifier inside the image builder.
    pub profile: String,
    pub device_type: String,
    pub packages: Vec<String>,
    pub output_name: Option<String>,
}

impl DeviceDescriptor {
    pub fn files_dir(&self) -> Option<PathBuf> {
        let dir = self.path.join(FILES_DIR);
        dir.is_dir().then_some(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord() -> DeviceCoordinate {
        DeviceCoordinate::new("barrier_breaker", "14.07", "ar71xx", "generic")
    }

    #[test]
    fn archive_names_follow_upstream_layout() {
        let c = coord();
        assert_eq!(
            c.primary_archive_name(),
            "OpenWrt-ImageBuilder-ar71xx_generic-for-linux-x86_64.tar.bz2"
        );
        assert_eq!(
            c.fallback_archive_name(),
            "OpenWrt-ImageBuilder-ar71xx-for-linux-x86_64.tar.bz2"
        );
    }

    #[test]
    fn remote_urls_ignore_trailing_slash() {
        let c = coord();
        assert_eq!(
            c.remote_file("https://downloads.openwrt.org/", "md5sums"),
            "https://downloads.openwrt.org/barrier_breaker/14.07/ar71xx/generic/md5sums"
        );
    }

    #[test]
    fn cache_dir_nests_every_segment() {
        let dir = coord().cache_dir(Path::new("/cache"));
        assert_eq!(
            dir,
            PathBuf::from("/cache/barrier_breaker/14.07/ar71xx/generic")
        );
        assert_eq!(coord().label(), "barrier_breaker-14.07-ar71xx-generic");
    }

    #[test]
    fn files_dir_only_when_present() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut dev = DeviceDescriptor {
            name: "router".into(),
            path: tmp.path().to_path_buf(),
            coordinate: coord(),
            profile: "TLWR1043".into(),
            device_type: coord().label(),
            packages: vec![],
            output_name: None,
        };
        assert!(dev.files_dir().is_none());
        std::fs::create_dir(tmp.path().join(FILES_DIR)).expect("mkdir files");
        assert_eq!(dev.files_dir(), Some(tmp.path().join(FILES_DIR)));
        dev.path = tmp.path().join("missing");
        assert!(dev.files_dir().is_none());
    }
}
