use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use wrtfreezer::Result;
use wrtfreezer::build::ProcessRunner;
use wrtfreezer::config::{self, Discovery};
use wrtfreezer::executor::{ExecCtx, StdoutSink};
use wrtfreezer::orchestrator::{Orchestrator, RunOptions, group_by_coordinate};
use wrtfreezer::prompt::StdinConfirm;
use wrtfreezer::remote::RemoteServer;
use wrtfreezer::workspace;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch image builders and build firmware for every device
    Build {
        /// Directory with config.json and one folder per device
        devices_dir: PathBuf,
        /// Where intermediates/ and targets/ are created
        #[arg(long, default_value = "out", env = "WRTFREEZER_OUT_DIR")]
        out_dir: String,
        /// Do not ask for confirmation before building
        #[arg(short, long)]
        yes: bool,
        /// Image builders processed concurrently (0 = CPU count)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Download server (defaults to config.json, then downloads.openwrt.org)
        #[arg(long, env = "WRTFREEZER_BASE_URL")]
        base_url: Option<String>,
    },
    /// List discovered devices and the image builders they need
    Plan {
        /// Directory with config.json and one folder per device
        devices_dir: PathBuf,
    },
    /// Run `make clean` in every cached image builder the devices use
    Clean {
        /// Directory with config.json and one folder per device
        devices_dir: PathBuf,
        /// Where intermediates/ and targets/ are created
        #[arg(long, default_value = "out", env = "WRTFREEZER_OUT_DIR")]
        out_dir: String,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_format);

    let res = match args.cmd {
        Command::Build {
            devices_dir,
            out_dir,
            yes,
            max_parallel,
            base_url,
        } => cmd_build(&devices_dir, &out_dir, yes, max_parallel, base_url),
        Command::Plan { devices_dir } => cmd_plan(&devices_dir),
        Command::Clean {
            devices_dir,
            out_dir,
        } => cmd_clean(&devices_dir, &out_dir),
    };
    match res {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(kind = %e.kind(), "{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}

/// First CTRL+C cancels the run and kills running build tools, the second exits.
/// Build tools run in their own process group and never see the terminal's SIGINT.
fn watch_interrupts(ctx: &ExecCtx) {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    let ctx = ctx.clone();
    std::thread::spawn(move || {
        let mut seen = 0;
        loop {
            std::thread::sleep(Duration::from_millis(100));
            let n = INTERRUPTS.load(Ordering::SeqCst);
            if n == seen {
                continue;
            }
            seen = n;
            ctx.request_cancel();
            ctx.kill_running_children_force();
            if n > 1 {
                std::process::exit(130);
            }
            tracing::warn!("interrupted, stopping (press CTRL+C again to exit now)");
        }
    });
}

fn report_rejected(discovery: &Discovery) {
    for r in &discovery.rejected {
        tracing::error!(device = %r.name, path = %r.path.display(), "{}", r.error);
    }
}

fn cmd_build(
    devices_dir: &Path,
    out_dir: &str,
    yes: bool,
    max_parallel: Option<usize>,
    base_url: Option<String>,
) -> Result<ExitCode> {
    let discovery = config::discover(devices_dir)?;
    report_rejected(&discovery);
    let paths = workspace::load_paths(out_dir)?;
    let base_url = base_url.unwrap_or_else(|| discovery.global.base_url().to_string());
    let remote = RemoteServer::new(&base_url)?;

    let max_parallel = match max_parallel.or(discovery.global.max_parallel).unwrap_or(1) {
        0 => num_cpus::get().max(1),
        n => n,
    };

    let ctx = ExecCtx::new(Arc::new(StdoutSink::default()));
    watch_interrupts(&ctx);
    let confirm = StdinConfirm::stdio();
    let orchestrator = Orchestrator {
        remote: &remote,
        runner: &ProcessRunner,
        confirm: &confirm,
    };
    let opts = RunOptions {
        cache_root: paths.cache_root,
        output_root: paths.output_root,
        extra_repositories: discovery.global.repositories.clone(),
        skip_confirmation: yes,
        max_parallel,
    };

    let mut report = orchestrator.run(&ctx, &discovery.devices, &opts)?;
    report.add_rejected(&discovery.rejected);
    println!("SUMMARY:");
    for line in report.summary_lines() {
        println!("{line}");
    }
    Ok(if report.ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_plan(devices_dir: &Path) -> Result<ExitCode> {
    let discovery = config::discover(devices_dir)?;
    report_rejected(&discovery);

    for (i, dev) in discovery.devices.iter().enumerate() {
        println!(
            "{:>2}. {:<20} {:<24} {}",
            i + 1,
            dev.name,
            dev.profile,
            dev.coordinate
        );
        if !dev.packages.is_empty() {
            println!("      packages: {}", dev.packages.join(" "));
        }
        if let Some(name) = &dev.output_name {
            println!("      output:   {name}");
        }
        if let Some(files) = dev.files_dir() {
            println!("      files:    {}", files.display());
        }
    }
    let builders = group_by_coordinate(&discovery.devices).len();
    println!(
        "{} device(s), {} image builder(s), {} rejected",
        discovery.devices.len(),
        builders,
        discovery.rejected.len()
    );
    Ok(if discovery.rejected.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_clean(devices_dir: &Path, out_dir: &str) -> Result<ExitCode> {
    let discovery = config::discover(devices_dir)?;
    report_rejected(&discovery);
    let paths = workspace::load_paths(out_dir)?;
    let remote = RemoteServer::new(discovery.global.base_url())?;
    let ctx = ExecCtx::new(Arc::new(StdoutSink::default()));
    watch_interrupts(&ctx);
    let confirm = StdinConfirm::stdio();
    let orchestrator = Orchestrator {
        remote: &remote,
        runner: &ProcessRunner,
        confirm: &confirm,
    };
    let cleaned = orchestrator.clean(&ctx, &discovery.devices, &paths.cache_root)?;
    println!("cleaned {cleaned} image builder(s)");
    Ok(ExitCode::SUCCESS)
}
