//! Echo probes used by the liveness checker.
//!
//! A probe is created per address pair and run on a blocking thread. The
//! production prober shells out to `ping`, which already knows how to bind
//! to a source address and needs no raw-socket privileges of its own.
//!
//! `ping` only takes whole seconds for its overall deadline, so a run is
//! also interrupted once the probe timeout elapses. On interrupt `ping`
//! still prints its summary.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use kernelmesh_common::error::{KernelmeshError, Result};

/// One echo probe between a source and a destination address.
pub trait Pinger: Send {
    /// Sends the echo requests and waits for replies. Blocking.
    ///
    /// Bounded by the timeout the probe was created with.
    ///
    /// # Errors
    ///
    /// Returns [`KernelmeshError::Probe`] if the probe could not be sent.
    /// Missing replies are not an error.
    fn run(&mut self) -> Result<()>;

    /// Replies received by the last [`run`](Self::run).
    fn received_packets(&self) -> usize;
}

/// Creates probes.
pub trait PingerFactory: Send + Sync {
    /// Creates a probe sending `count` echo requests spread over `timeout`.
    fn create_pinger(
        &self,
        src: IpAddr,
        dst: IpAddr,
        timeout: Duration,
        count: usize,
    ) -> Box<dyn Pinger>;
}

/// [`PingerFactory`] running the system `ping` binary.
#[derive(Debug, Clone)]
pub struct SystemPingerFactory {
    binary: PathBuf,
}

impl SystemPingerFactory {
    /// Uses `binary` (a name on `PATH` or an explicit path), resolved per probe.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Resolves `binary` now.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be found.
    pub fn locate(binary: &str) -> Result<Self> {
        let binary = which::which(binary).map_err(|e| KernelmeshError::Config {
            message: format!("ping binary {binary} not found: {e}"),
        })?;
        Ok(Self { binary })
    }
}

impl PingerFactory for SystemPingerFactory {
    fn create_pinger(
        &self,
        src: IpAddr,
        dst: IpAddr,
        timeout: Duration,
        count: usize,
    ) -> Box<dyn Pinger> {
        Box::new(SystemPinger {
            binary: self.binary.clone(),
            src,
            dst,
            timeout,
            count: count.max(1),
            received: 0,
        })
    }
}

/// A single `ping` invocation.
#[derive(Debug)]
pub struct SystemPinger {
    binary: PathBuf,
    src: IpAddr,
    dst: IpAddr,
    timeout: Duration,
    count: usize,
    received: usize,
}

impl SystemPinger {
    fn probe_error(&self, message: impl Into<String>) -> KernelmeshError {
        KernelmeshError::Probe {
            src: self.src.to_string(),
            dst: self.dst.to_string(),
            message: message.into(),
        }
    }

    /// Echo requests that fit into the timeout at the minimum interval.
    fn effective_count(&self) -> usize {
        let fit = self.timeout.as_secs_f64() / MIN_INTERVAL_SECS;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let fit = fit.floor() as usize;
        self.count.min(fit).max(1)
    }

    fn args(&self) -> Vec<String> {
        let count = self.effective_count();
        let timeout = self.timeout.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let interval = timeout / count as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let deadline = (timeout.ceil() as u64).max(1);
        vec![
            "-n".into(),
            "-q".into(),
            "-c".into(),
            count.to_string(),
            "-i".into(),
            format!("{:.3}", interval.max(MIN_INTERVAL_SECS)),
            "-W".into(),
            format!("{:.3}", timeout.max(MIN_REPLY_WAIT_SECS)),
            "-w".into(),
            deadline.to_string(),
            "-I".into(),
            self.src.to_string(),
            self.dst.to_string(),
        ]
    }

    /// Waits for `child`, interrupting it once the probe timeout elapsed.
    fn wait_bounded(&self, child: &mut Child) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if child
                .try_wait()
                .map_err(|e| self.probe_error(e.to_string()))?
                .is_some()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::debug!(src = %self.src, dst = %self.dst, "ping timed out, interrupting");
                return interrupt(child).map_err(|e| self.probe_error(e.to_string()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Smallest interval accepted by unprivileged `ping`.
const MIN_INTERVAL_SECS: f64 = 0.2;

/// Smallest per-reply wait passed to `ping`.
const MIN_REPLY_WAIT_SECS: f64 = 0.001;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Asks `ping` to stop and print its summary.
#[cfg(target_os = "linux")]
fn interrupt(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = i32::try_from(child.id()).map_err(io::Error::other)?;
    kill(Pid::from_raw(pid), Signal::SIGINT).map_err(io::Error::from)
}

#[cfg(not(target_os = "linux"))]
fn interrupt(child: &mut Child) -> io::Result<()> {
    child.kill()
}

impl Pinger for SystemPinger {
    fn run(&mut self) -> Result<()> {
        let binary = which::which(&self.binary)
            .map_err(|e| self.probe_error(format!("{}: {e}", self.binary.display())))?;
        let args = self.args();
        tracing::trace!(binary = %binary.display(), ?args, "ping");
        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.probe_error(e.to_string()))?;
        self.wait_bounded(&mut child)?;
        let output = child
            .wait_with_output()
            .map_err(|e| self.probe_error(e.to_string()))?;

        // ping exits 1 when no reply arrived and 2 on any other error.
        if output.status.code() == Some(2) || output.status.code().is_none() {
            return Err(self.probe_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        self.received = parse_received(&stdout)
            .ok_or_else(|| self.probe_error("unrecognised ping output"))?;
        Ok(())
    }

    fn received_packets(&self) -> usize {
        self.received
    }
}

/// Extracts the reply count from a `ping` summary line.
///
/// Understands both `4 packets transmitted, 2 received, ...` (iputils)
/// and `4 packets transmitted, 2 packets received, ...` (busybox).
fn parse_received(output: &str) -> Option<usize> {
    output
        .lines()
        .filter(|line| line.contains("transmitted"))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .find(|part| part.ends_with("received"))
        .and_then(|part| part.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}
