use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use crate::device::{DeviceCoordinate, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::workspace::{device_out_dir, ensure_dir};

/// The image builder is driven through its makefile.
pub const BUILD_TOOL: &str = "make";

/// Runs an external command in a working directory.
pub trait CommandRunner: Send + Sync {
    fn run(&self, ctx: &ExecCtx, argv: &[String], cwd: &Path) -> Result<ExitStatus>;
}

/// Spawns real processes through [`ExecCtx::run_cmd`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, ctx: &ExecCtx, argv: &[String], cwd: &Path) -> Result<ExitStatus> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::msg("empty command line"));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        ctx.run_cmd(cmd)
    }
}

/// Where a device's images ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutput {
    /// Factory and sysupgrade images hard-linked into the device output folder.
    Linked {
        factory: PathBuf,
        sysupgrade: PathBuf,
    },
    /// No `output_name` configured; images stay in the image builder's bin dir.
    Raw { dir: PathBuf },
}

impl BuildOutput {
    pub fn describe(&self) -> String {
        match self {
            BuildOutput::Linked {
                factory,
                sysupgrade,
            } => format!(
                "factory: {}, sysupgrade: {}",
                factory.display(),
                sysupgrade.display()
            ),
            BuildOutput::Raw { dir } => format!("outdir: {}", dir.display()),
        }
    }
}

/// `make image PROFILE=.. [PACKAGES=..] [FILES=..]`
pub fn build_command(device: &DeviceDescriptor, files_dir: Option<&Path>) -> Vec<String> {
    let mut argv = vec![
        BUILD_TOOL.to_string(),
        "image".to_string(),
        format!("PROFILE={}", device.profile),
    ];
    if !device.packages.is_empty() {
        argv.push(format!("PACKAGES={}", device.packages.join(" ")));
    }
    if let Some(dir) = files_dir {
        argv.push(format!("FILES={}", dir.display()));
    }
    argv
}

/// Image builder output folder for an architecture.
pub fn bin_dir(toolchain_dir: &Path, coord: &DeviceCoordinate) -> PathBuf {
    toolchain_dir.join("bin").join(&coord.arch)
}

/// Factory and sysupgrade file names produced for `output_name`.
pub fn artifact_names(coord: &DeviceCoordinate, output_name: &str) -> [String; 2] {
    ["factory", "sysupgrade"].map(|variant| {
        format!(
            "openwrt-{}-{}-{output_name}-v1-squashfs-{variant}.bin",
            coord.arch, coord.target_type
        )
    })
}

/// Builds one device inside `toolchain_dir` and publishes its images under
/// `<output_root>/<device name>/`.
pub fn build_device(
    ctx: &ExecCtx,
    runner: &dyn CommandRunner,
    device: &DeviceDescriptor,
    toolchain_dir: &Path,
    output_root: &Path,
) -> Result<BuildOutput> {
    ctx.check_cancelled()?;
    let files_dir = device.files_dir();
    let argv = build_command(device, files_dir.as_deref());
    ctx.log(&format!("starting build for {}", device.profile));
    ctx.log(&format!("invoking build with {argv:?}"));

    let status = runner.run(ctx, &argv, toolchain_dir)?;
    if !status.success() {
        return Err(Error::build(format!(
            "image build for '{}' failed: {status}",
            device.name
        )));
    }
    ctx.log("build completed");

    let bin = bin_dir(toolchain_dir, &device.coordinate);
    let Some(output_name) = device.output_name.as_deref() else {
        ctx.log(&format!("outdir: {}", bin.display()));
        return Ok(BuildOutput::Raw { dir: bin });
    };

    let out_dir = device_out_dir(output_root, device);
    ensure_dir(&out_dir)?;
    let [factory, sysupgrade] = artifact_names(&device.coordinate, output_name);
    let [factory, sysupgrade] = link_artifacts(&bin, &out_dir, [&factory, &sysupgrade])?;
    ctx.log(&format!("factory: {}", factory.display()));
    ctx.log(&format!("sysupgrade: {}", sysupgrade.display()));
    Ok(BuildOutput::Linked {
        factory,
        sysupgrade,
    })
}

// Every source must exist before anything in `out_dir` is replaced.
fn link_artifacts(bin: &Path, out_dir: &Path, names: [&str; 2]) -> Result<[PathBuf; 2]> {
    for name in names {
        let src = bin.join(name);
        if !src.is_file() {
            return Err(Error::build(format!(
                "build finished but {} is missing",
                src.display()
            )));
        }
    }

    let link = |name: &str| -> Result<PathBuf> {
        let src = bin.join(name);
        let dst = out_dir.join(name);
        match fs::remove_file(&dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::fs(format!(
                    "failed to remove {}: {e}",
                    dst.display()
                )));
            }
        }
        fs::hard_link(&src, &dst).map_err(|e| {
            Error::fs(format!(
                "failed to link {} to {}: {e}",
                src.display(),
                dst.display()
            ))
        })?;
        Ok(dst)
    };
    Ok([link(names[0])?, link(names[1])?])
}

/// Runs the image builder's `clean` target.
pub fn clean_toolchain(
    ctx: &ExecCtx,
    runner: &dyn CommandRunner,
    toolchain_dir: &Path,
) -> Result<()> {
    ctx.log("running make clean");
    let argv = vec![BUILD_TOOL.to_string(), "clean".to_string()];
    let status = runner.run(ctx, &argv, toolchain_dir)?;
    if !status.success() {
        return Err(Error::build(format!(
            "make clean in {} failed: {status}",
            toolchain_dir.display()
        )));
    }
    Ok(())
}
