use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Optional step run before every connection attempt, e.g. joining the
/// camera's dedicated wireless network. Failures are logged by the caller
/// and never abort the attempt.
pub trait LinkJoiner: Send + Sync {
    fn name(&self) -> &str;

    fn join(&self) -> Result<()>;
}

/// No pre-connection step.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLink;

impl LinkJoiner for NoLink {
    fn name(&self) -> &str {
        "none"
    }

    fn join(&self) -> Result<()> {
        Ok(())
    }
}

/// Joins a wireless network through NetworkManager's `nmcli`.
#[derive(Clone, Debug)]
pub struct NmcliJoiner {
    ssid: String,
    password: Option<String>,
    timeout: Duration,
}

impl NmcliJoiner {
    pub fn new(ssid: impl Into<String>, password: Option<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password,
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_active(&self) -> bool {
        let mut cmd = Command::new("nmcli");
        cmd.args(["-t", "-f", "ACTIVE,SSID", "dev", "wifi"]);
        match run_with_deadline(&mut cmd, self.timeout.min(STATUS_TIMEOUT)) {
            Ok((_, stdout)) => lists_active(&stdout, &self.ssid),
            Err(err) => {
                log::debug!("LinkJoiner: nmcli status check failed: {:#}", err);
                false
            }
        }
    }
}

impl LinkJoiner for NmcliJoiner {
    fn name(&self) -> &str {
        &self.ssid
    }

    fn join(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        let mut cmd = Command::new("nmcli");
        cmd.args(["dev", "wifi", "connect", &self.ssid]);
        if let Some(password) = &self.password {
            cmd.args(["password", password]);
        }
        let (status, _) = run_with_deadline(&mut cmd, self.timeout)
            .with_context(|| format!("joining {}", self.ssid))?;
        if !status.success() {
            return Err(anyhow!("nmcli exited with {} joining {}", status, self.ssid));
        }
        log::info!("LinkJoiner: joined wireless network {}", self.ssid);
        Ok(())
    }
}

fn lists_active(status: &str, ssid: &str) -> bool {
    status
        .lines()
        .any(|line| line.strip_prefix("yes:") == Some(ssid))
}

/// Run `cmd` to completion and collect its stdout, killing it once `timeout`
/// passes.
fn run_with_deadline(cmd: &mut Command, timeout: Duration) -> Result<(ExitStatus, String)> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn {}", program))?;

    // Drained on its own thread so a chatty child never blocks on a full pipe.
    let stdout = child.stdout.take();
    let reader = std::thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_string(&mut out);
        }
        out
    });

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("wait for {}", program))?
        {
            let out = reader.join().unwrap_or_default();
            return Ok((status, out));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("{} timed out after {:?}", program, timeout));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
