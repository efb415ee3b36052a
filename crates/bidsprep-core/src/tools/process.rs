use super::engine::NumericEngine;
use super::{Executor, Invocation, ToolOutput, ToolSpec};
use crate::error::{Error, ToolFailure};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(48 * 60 * 60);
const STDERR_TAIL_LINES: usize = 20;
/// How long pipes are read after the tool exits. Background processes it
/// left behind can hold them open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Executes specs on the host: processes and container runs via
/// `std::process`, engine calls via the configured [`NumericEngine`].
pub struct SystemExecutor {
    engine: Arc<dyn NumericEngine>,
}

impl SystemExecutor {
    pub fn new(engine: Arc<dyn NumericEngine>) -> Self {
        Self { engine }
    }
}

impl Executor for SystemExecutor {
    fn execute(&self, spec: &ToolSpec) -> Result<ToolOutput, Error> {
        let timeout = spec.timeout.unwrap_or(DEFAULT_TIMEOUT);
        match &spec.invocation {
            Invocation::Process { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                run_command(&spec.name, cmd, timeout)
            }
            Invocation::Container(run) => {
                let mut cmd = Command::new(&run.runtime);
                cmd.args(run.to_args());
                let result = run_command(&spec.name, cmd, timeout);
                if let Err(Error::ToolExecutionFailed {
                    failure: ToolFailure::Timeout(_),
                    ..
                }) = &result
                {
                    // killing the client does not stop the container
                    if let Some(name) = &run.name {
                        let _ = Command::new(&run.runtime).args(["kill", name]).output();
                    }
                }
                result
            }
            Invocation::Engine(call) => {
                self.engine
                    .call(call, timeout)
                    .map_err(|failure| Error::tool(&spec.name, failure))?;
                Ok(ToolOutput::default())
            }
        }
    }
}

/// Spawn `cmd`, capture its output, and wait at most `timeout`.
pub fn run_command(tool: &str, mut cmd: Command, timeout: Duration) -> Result<ToolOutput, Error> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::tool(tool, ToolFailure::Launch(e.to_string())))?;

    let deadline = Instant::now() + timeout;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match wait_with_deadline(&mut child, deadline) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            warn!("{} exceeded {}s, killed", tool, timeout.as_secs());
            return Err(Error::tool(tool, ToolFailure::Timeout(timeout)));
        }
        Err(e) => return Err(Error::tool(tool, ToolFailure::Launch(e.to_string()))),
    };

    let output_deadline = deadline.min(Instant::now() + OUTPUT_GRACE);
    let stdout = collect(&stdout, output_deadline);
    let stderr = collect(&stderr, output_deadline);

    match status.code() {
        Some(0) => {
            debug!("{} finished", tool);
            Ok(ToolOutput { stdout })
        }
        code => {
            let tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL_LINES).collect();
            for line in tail.iter().rev() {
                warn!("{}: {}", tool, line);
            }
            let failure = match code {
                Some(code) => ToolFailure::ExitCode(code),
                None => ToolFailure::Terminated,
            };
            Err(Error::tool(tool, failure))
        }
    }
}

/// Read `stream` on its own thread, forwarding chunks as they arrive.
fn drain<R: Read + Send + 'static>(stream: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let Some(mut stream) = stream else {
            return;
        };
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

/// Everything received before the stream closes or `deadline` passes.
fn collect(rx: &mpsc::Receiver<Vec<u8>>, deadline: Instant) -> String {
    let mut bytes = Vec::new();
    while let Ok(chunk) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        bytes.extend(chunk);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn wait_with_deadline(
    child: &mut Child,
    deadline: Instant,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}
