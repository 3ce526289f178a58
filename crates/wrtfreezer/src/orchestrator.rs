use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::build::{BuildOutput, CommandRunner, build_device, clean_toolchain};
use crate::config::RejectedDevice;
use crate::device::{DeviceCoordinate, DeviceDescriptor};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{ExecCtx, ExecEvent, format_elapsed_hms, run_pool};
use crate::remote::RemoteServer;
use crate::repositories::write_repositories_conf;
use crate::toolchain::{TOOLCHAIN_DIR, Toolchain, ensure_toolchain};
use crate::workspace::init_dirs;

/// Asks the operator whether to go ahead with the listed devices.
pub trait Confirm: Send + Sync {
    fn confirm(&self, devices: &[DeviceDescriptor]) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub cache_root: PathBuf,
    pub output_root: PathBuf,
    /// Extra `repositories.conf` lines from the global config.
    pub extra_repositories: Vec<String>,
    pub skip_confirmation: bool,
    /// Number of coordinates processed at once; 1 keeps everything sequential.
    pub max_parallel: usize,
}

#[derive(Debug, Clone)]
pub enum DeviceStatus {
    Built(BuildOutput),
    Failed(Error),
}

#[derive(Debug, Clone)]
pub struct DeviceOutcome {
    pub name: String,
    pub coordinate: Option<DeviceCoordinate>,
    pub status: DeviceStatus,
}

impl DeviceOutcome {
    pub fn ok(&self) -> bool {
        matches!(self.status, DeviceStatus::Built(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.status {
            DeviceStatus::Built(_) => None,
            DeviceStatus::Failed(e) => Some(e.kind()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub outcomes: Vec<DeviceOutcome>,
    /// Coordinates whose image builder had to be downloaded this run.
    pub downloads: usize,
}

impl RunReport {
    pub fn ok(&self) -> bool {
        self.outcomes.iter().all(DeviceOutcome::ok)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes.iter().filter(|o| o.ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes.iter().filter(|o| !o.ok())
    }

    pub fn outcome(&self, name: &str) -> Option<&DeviceOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// Records devices whose configuration never produced a descriptor.
    pub fn add_rejected(&mut self, rejected: &[RejectedDevice]) {
        for r in rejected {
            self.outcomes.push(DeviceOutcome {
                name: r.name.clone(),
                coordinate: None,
                status: DeviceStatus::Failed(r.error.clone()),
            });
        }
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut out = vec![format!(
            "started {}, took {}: {} ok, {} failed, {} image builder download(s)",
            self.started_at.to_rfc3339(),
            format_elapsed_hms(
                (self.finished_at - self.started_at)
                    .num_seconds()
                    .max(0) as u64
            ),
            self.succeeded().count(),
            self.failed().count(),
            self.downloads
        )];
        for o in &self.outcomes {
            out.push(match &o.status {
                DeviceStatus::Built(output) => format!("  ok      {}  {}", o.name, output.describe()),
                DeviceStatus::Failed(e) => format!("  FAILED  {}  [{}] {e}", o.name, e.kind()),
            });
        }
        out
    }
}

/// Groups device indices by coordinate, in order of first appearance.
pub fn group_by_coordinate(devices: &[DeviceDescriptor]) -> Vec<(&DeviceCoordinate, Vec<usize>)> {
    let mut groups: Vec<(&DeviceCoordinate, Vec<usize>)> = Vec::new();
    let mut index: BTreeMap<&DeviceCoordinate, usize> = BTreeMap::new();
    for (i, dev) in devices.iter().enumerate() {
        let slot = *index.entry(&dev.coordinate).or_insert_with(|| {
            groups.push((&dev.coordinate, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(i);
    }
    groups
}

/// Drives a whole run: directories, image builders, confirmation, builds.
pub struct Orchestrator<'a> {
    pub remote: &'a RemoteServer,
    pub runner: &'a dyn CommandRunner,
    pub confirm: &'a dyn Confirm,
}

impl Orchestrator<'_> {
    /// Builds every device. Directory setup failures and a declined
    /// confirmation abort the run; toolchain failures fail only the devices
    /// sharing that coordinate, and build failures only that device.
    pub fn run(
        &self,
        ctx: &ExecCtx,
        devices: &[DeviceDescriptor],
        opts: &RunOptions,
    ) -> Result<RunReport> {
        let started_at = chrono::Utc::now();
        ctx.log(&format!("preparing output directories for {} device(s)", devices.len()));
        init_dirs(&opts.cache_root, &opts.output_root, devices)?;

        let groups = group_by_coordinate(devices);
        let coords: Vec<&DeviceCoordinate> = groups.iter().map(|(c, _)| *c).collect();
        let prepared = run_pool(coords, opts.max_parallel, |coord| self.prepare(ctx, coord, opts));
        let downloads = prepared
            .iter()
            .filter(|r| matches!(r, Ok(tc) if tc.downloaded))
            .count();

        let buildable = groups
            .iter()
            .zip(&prepared)
            .filter(|(_, tc)| tc.is_ok())
            .map(|((_, idx), _)| idx.len())
            .sum::<usize>();
        for ((coord, idx), tc) in groups.iter().zip(&prepared) {
            if let Err(e) = tc {
                ctx.log(&format!(
                    "image builder for {coord} unavailable, skipping {} device(s): {e}",
                    idx.len()
                ));
            }
        }

        if buildable > 0 && !opts.skip_confirmation && !self.confirm.confirm(devices)? {
            let err = Error::aborted("build aborted by operator");
            ctx.sink.emit(ExecEvent::RunDone {
                ok: false,
                error: Some(err.to_string()),
            });
            return Err(err);
        }
        ctx.check_cancelled()?;

        // One job per coordinate: devices sharing an image builder never build concurrently.
        let jobs: Vec<(&[usize], &Result<Toolchain>)> = groups
            .iter()
            .zip(&prepared)
            .map(|((_, idx), tc)| (idx.as_slice(), tc))
            .collect();
        let built = run_pool(jobs, opts.max_parallel, |(idx, tc)| {
            idx.iter()
                .map(|&i| {
                    let status = match tc {
                        Ok(tc) => self.build_one(ctx, &devices[i], tc, opts),
                        Err(e) => DeviceStatus::Failed(e.clone()),
                    };
                    (i, status)
                })
                .collect::<Vec<_>>()
        });

        let mut statuses: Vec<Option<DeviceStatus>> = vec![None; devices.len()];
        for (i, status) in built.into_iter().flatten() {
            statuses[i] = Some(status);
        }
        let outcomes = devices
            .iter()
            .zip(statuses)
            .map(|(dev, status)| DeviceOutcome {
                name: dev.name.clone(),
                coordinate: Some(dev.coordinate.clone()),
                status: status
                    .unwrap_or_else(|| DeviceStatus::Failed(Error::msg("device was not built"))),
            })
            .collect();

        let report = RunReport {
            started_at,
            finished_at: chrono::Utc::now(),
            outcomes,
            downloads,
        };
        let failed: Vec<&str> = report.failed().map(|o| o.name.as_str()).collect();
        ctx.sink.emit(ExecEvent::RunDone {
            ok: failed.is_empty(),
            error: (!failed.is_empty()).then(|| format!("failed devices: {}", failed.join(", "))),
        });
        Ok(report)
    }

    fn prepare(&self, ctx: &ExecCtx, coord: &DeviceCoordinate, opts: &RunOptions) -> Result<Toolchain> {
        ctx.unit(&format!("toolchain:{}", coord.label()), |ctx| {
            let tc = ensure_toolchain(ctx, self.remote, coord, &opts.cache_root)?;
            write_repositories_conf(
                &tc.dir,
                self.remote.base_url(),
                coord,
                &opts.extra_repositories,
            )?;
            Ok(tc)
        })
    }

    fn build_one(
        &self,
        ctx: &ExecCtx,
        device: &DeviceDescriptor,
        tc: &Toolchain,
        opts: &RunOptions,
    ) -> DeviceStatus {
        let res = ctx.unit(&format!("device:{}", device.name), |ctx| {
            build_device(ctx, self.runner, device, &tc.dir, &opts.output_root)
        });
        match res {
            Ok(output) => DeviceStatus::Built(output),
            Err(e) => DeviceStatus::Failed(e),
        }
    }

    /// Runs `make clean` in every cached image builder used by `devices`.
    /// Returns how many image builders were cleaned.
    pub fn clean(
        &self,
        ctx: &ExecCtx,
        devices: &[DeviceDescriptor],
        cache_root: &std::path::Path,
    ) -> Result<usize> {
        let mut cleaned = 0;
        let mut failures = Vec::new();
        for (coord, _) in group_by_coordinate(devices) {
            let dir = coord.cache_dir(cache_root).join(TOOLCHAIN_DIR);
            if !dir.is_dir() {
                ctx.log(&format!("no image builder cached for {coord}"));
                continue;
            }
            match ctx.unit(&format!("clean:{}", coord.label()), |ctx| {
                clean_toolchain(ctx, self.runner, &dir)
            }) {
                Ok(()) => cleaned += 1,
                Err(e) => failures.push(format!("{coord}: {e}")),
            }
        }
        if !failures.is_empty() {
            return Err(Error::build(format!("clean failed for {}", failures.join("; "))));
        }
        Ok(cleaned)
    }
}
