#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use md5::{Digest, Md5};
use wrtfreezer::Result;
use wrtfreezer::build::{CommandRunner, artifact_names};
use wrtfreezer::device::{DeviceCoordinate, DeviceDescriptor};
use wrtfreezer::executor::{ChannelSink, ExecCtx, ExecEvent};
use wrtfreezer::orchestrator::Confirm;

/// Static file server over a temp directory that records every request path.
pub struct Mirror {
    pub root: tempfile::TempDir,
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    stalled: Arc<Mutex<Vec<String>>>,
}

fn serve(
    mut stream: std::net::TcpStream,
    served: &Path,
    log: &Mutex<Vec<String>>,
    stalled: &Mutex<Vec<String>>,
) {
    let mut buf = [0u8; 8192];
    let n = stream.read(&mut buf).unwrap_or(0);
    let req = String::from_utf8_lossy(&buf[..n]);
    let path = req
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    log.lock().expect("request log").push(path.clone());

    if stalled.lock().expect("stalled").contains(&path) {
        let _ = stream.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1048576\r\nConnection: close\r\n\r\nOpenWrt-IB-",
        );
        let _ = stream.flush();
        thread::sleep(Duration::from_secs(10));
        return;
    }

    let file = served.join(path.trim_start_matches('/'));
    if file.is_file() {
        let body = fs::read(&file).expect("read fixture");
        let hdr = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = stream.write_all(hdr.as_bytes());
        let _ = stream.write_all(&body);
    } else {
        let _ = stream.write_all(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
    }
}

impl Mirror {
    pub fn start() -> Self {
        let root = tempfile::tempdir().expect("mirror root");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stalled = Arc::new(Mutex::new(Vec::new()));
        let served = root.path().to_path_buf();
        let log = Arc::clone(&requests);
        let stall = Arc::clone(&stalled);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let served = served.clone();
                let log = Arc::clone(&log);
                let stall = Arc::clone(&stall);
                thread::spawn(move || serve(stream, &served, &log, &stall));
            }
        });
        Self {
            root,
            base_url: format!("http://{addr}"),
            requests,
            stalled,
        }
    }

    /// Requests for `name` get headers and a few body bytes, then nothing.
    pub fn stall(&self, coord: &DeviceCoordinate, name: &str) {
        self.stalled.lock().expect("stalled").push(format!(
            "/{}/{}/{}/{}/{name}",
            coord.release, coord.version, coord.arch, coord.target_type
        ));
    }

    pub fn publish(&self, coord: &DeviceCoordinate, name: &str, body: &[u8]) {
        let dir = self.coord_dir(coord);
        fs::create_dir_all(&dir).expect("mkdir mirror dir");
        fs::write(dir.join(name), body).expect("write mirror file");
    }

    pub fn unpublish(&self, coord: &DeviceCoordinate, name: &str) {
        let _ = fs::remove_file(self.coord_dir(coord).join(name));
    }

    /// Publishes `archive` under `name` together with an `md5sums` listing `listed`.
    pub fn publish_builder(&self, coord: &DeviceCoordinate, name: &str, archive: &[u8], listed: &str) {
        self.publish(coord, name, archive);
        self.publish(
            coord,
            "md5sums",
            format!("{listed} *{name}\n{} *OpenWrt-SDK.tar.xz\n", "f".repeat(32)).as_bytes(),
        );
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("request log").clone()
    }

    pub fn count(&self, suffix: &str) -> usize {
        self.requests().iter().filter(|p| p.ends_with(suffix)).count()
    }

    fn coord_dir(&self, coord: &DeviceCoordinate) -> PathBuf {
        self.root
            .path()
            .join(&coord.release)
            .join(&coord.version)
            .join(&coord.arch)
            .join(&coord.target_type)
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// tar.bz2 with a single `root` directory holding a stub Makefile.
pub fn imagebuilder_archive(root: &str, marker: &str) -> Vec<u8> {
    let src = tempfile::tempdir().expect("archive src");
    let dir = src.path().join(root);
    fs::create_dir_all(dir.join("packages")).expect("mkdir");
    fs::write(dir.join("Makefile"), "image:\n\ttrue\n").expect("write makefile");
    fs::write(dir.join("marker"), marker).expect("write marker");

    let enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.append_dir_all(root, &dir).expect("append");
    builder
        .into_inner()
        .expect("tar finish")
        .finish()
        .expect("bz finish")
}

pub fn ctx() -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
    let (tx, rx) = mpsc::channel();
    (ExecCtx::new(Arc::new(ChannelSink::new(tx))), rx)
}

pub fn coordinate() -> DeviceCoordinate {
    DeviceCoordinate::new("19.07", "7", "ar71xx", "generic")
}

pub fn device(name: &str, coord: &DeviceCoordinate, output_name: Option<&str>) -> DeviceDescriptor {
    DeviceDescriptor {
        name: name.into(),
        path: PathBuf::from("/devices").join(name),
        coordinate: coord.clone(),
        profile: format!("{name}-profile"),
        device_type: coord.label(),
        packages: vec![],
        output_name: output_name.map(str::to_string),
    }
}

/// Stands in for `make`: writes the images a profile would produce and exits
/// non-zero for profiles listed in `failing`.
#[derive(Default)]
pub struct FakeRunner {
    outputs: HashMap<String, Vec<String>>,
    failing: Vec<String>,
    delay: Option<Duration>,
    pub calls: Mutex<Vec<(Vec<String>, PathBuf)>>,
    active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producing(mut self, dev: &DeviceDescriptor) -> Self {
        let files = match dev.output_name.as_deref() {
            Some(out) => artifact_names(&dev.coordinate, out)
                .into_iter()
                .map(|n| format!("bin/{}/{n}", dev.coordinate.arch))
                .collect(),
            None => vec![],
        };
        self.outputs.insert(format!("PROFILE={}", dev.profile), files);
        self
    }

    pub fn failing(mut self, dev: &DeviceDescriptor) -> Self {
        self.failing.push(format!("PROFILE={}", dev.profile));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn profiles(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter_map(|(argv, _)| argv.iter().find(|a| a.starts_with("PROFILE=")).cloned())
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, _ctx: &ExecCtx, argv: &[String], cwd: &Path) -> Result<ExitStatus> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls
            .lock()
            .expect("calls")
            .push((argv.to_vec(), cwd.to_path_buf()));
        if let Some(d) = self.delay {
            thread::sleep(d);
        }

        let profile = argv.iter().find(|a| a.starts_with("PROFILE="));
        let failed = profile.is_some_and(|p| self.failing.contains(p));
        if !failed {
            for rel in profile.and_then(|p| self.outputs.get(p)).into_iter().flatten() {
                let p = cwd.join(rel);
                fs::create_dir_all(p.parent().expect("parent")).expect("mkdir bin");
                fs::write(&p, rel.as_bytes()).expect("write image");
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ExitStatus::from_raw(if failed { 2 << 8 } else { 0 }))
    }
}

pub struct RecordingConfirm {
    answer: bool,
    pub asked: Mutex<Vec<Vec<String>>>,
}

impl RecordingConfirm {
    pub fn answering(answer: bool) -> Self {
        Self {
            answer,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.lock().expect("asked").len()
    }
}

impl Confirm for RecordingConfirm {
    fn confirm(&self, devices: &[DeviceDescriptor]) -> Result<bool> {
        self.asked
            .lock()
            .expect("asked")
            .push(devices.iter().map(|d| d.name.clone()).collect());
        Ok(self.answer)
    }
}
