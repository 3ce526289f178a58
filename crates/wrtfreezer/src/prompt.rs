use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::orchestrator::Confirm;

/// Lists the devices and waits for Enter. `n`/`no` or end of input declines.
pub struct StdinConfirm<R, W> {
    input: Mutex<R>,
    output: Mutex<W>,
}

impl StdinConfirm<io::BufReader<io::Stdin>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R, W> StdinConfirm<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }
}

impl<R: BufRead + Send, W: Write + Send> Confirm for StdinConfirm<R, W> {
    fn confirm(&self, devices: &[DeviceDescriptor]) -> Result<bool> {
        let mut out = self
            .output
            .lock()
            .map_err(|_| Error::msg("prompt output poisoned"))?;
        writeln!(out, "building for the following devices, please confirm:")?;
        for dev in devices {
            writeln!(
                out,
                "  - {}: {} at {} ({}, {})",
                dev.name,
                dev.profile,
                dev.path.display(),
                dev.device_type,
                dev.coordinate
            )?;
        }
        writeln!(out)?;
        write!(out, "Press enter to continue, CTRL+C to abort ")?;
        out.flush()?;

        let mut answer = String::new();
        let n = self
            .input
            .lock()
            .map_err(|_| Error::msg("prompt input poisoned"))?
            .read_line(&mut answer)?;
        if n == 0 {
            return Ok(false);
        }
        let answer = answer.trim().to_ascii_lowercase();
        Ok(answer != "n" && answer != "no")
    }
}
