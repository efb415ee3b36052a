//! Typed invocation of external tools.
//!
//! A [`ToolSpec`] names the tool, how to run it, and the files it must leave
//! behind. [`ToolInvoker::invoke`] skips the run when those files already
//! exist, serializes writers of the same outputs, and turns any failure into
//! [`Error::ToolExecutionFailed`].

pub mod container;
pub mod dcm2niix;
pub mod engine;
pub mod freesurfer;
pub mod fsl;
pub mod nipreps;
pub mod process;

use crate::config::{Overwrite, ToolsConfig};
use crate::error::{Error, ToolFailure};
use crate::fsutil;
use crate::locks::{self, PathLocks};
use crate::progress::{ProgressReporter, SilentReporter};
use container::ContainerRun;
use engine::EngineCall;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Process { program: String, args: Vec<String> },
    Container(ContainerRun),
    /// A routine hosted by a numerical engine rather than a standalone binary.
    Engine(EngineCall),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub invocation: Invocation,
    pub outputs: Vec<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ToolSpec {
    /// A plain process whose program is the tool name.
    pub fn process<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            invocation: Invocation::Process {
                program: name.to_string(),
                args: args.into_iter().map(Into::into).collect(),
            },
            outputs: Vec::new(),
            timeout: None,
        }
    }

    pub fn container(name: &str, run: ContainerRun) -> Self {
        Self {
            name: name.to_string(),
            invocation: Invocation::Container(run),
            outputs: Vec::new(),
            timeout: None,
        }
    }

    pub fn engine(name: &str, call: EngineCall) -> Self {
        Self {
            name: name.to_string(),
            invocation: Invocation::Engine(call),
            outputs: Vec::new(),
            timeout: None,
        }
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Program and arguments as they would be executed, for logs and tests.
    pub fn command_line(&self) -> Vec<String> {
        match &self.invocation {
            Invocation::Process { program, args } => {
                std::iter::once(program.clone()).chain(args.iter().cloned()).collect()
            }
            Invocation::Container(run) => std::iter::once(run.runtime.clone())
                .chain(run.to_args())
                .collect(),
            Invocation::Engine(call) => vec![call.function.clone(), call.describe()],
        }
    }

    fn outputs_present(&self) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|o| fsutil::present(o))
    }

    /// Whether `ToolInvoker::invoke` would skip this spec.
    pub fn is_current(&self, overwrite: &Overwrite) -> bool {
        !overwrite.any(&self.outputs) && self.outputs_present()
    }
}

/// Captured result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
}

/// Runs a spec to completion, blocking.
pub trait Executor: Send + Sync {
    fn execute(&self, spec: &ToolSpec) -> Result<ToolOutput, Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invoked {
    Ran(ToolOutput),
    Skipped,
}

impl Invoked {
    pub fn ran(&self) -> bool {
        matches!(self, Invoked::Ran(_))
    }
}

/// Counting gate bounding concurrent container runs.
#[derive(Debug)]
struct Gate {
    limit: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

impl Gate {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) -> GatePass<'_> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_use >= self.limit {
            in_use = self
                .freed
                .wait(in_use)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *in_use += 1;
        GatePass { gate: self }
    }
}

struct GatePass<'a> {
    gate: &'a Gate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut in_use = self
            .gate
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *in_use -= 1;
        self.gate.freed.notify_one();
    }
}

pub struct ToolInvoker {
    executor: Arc<dyn Executor>,
    locks: Arc<PathLocks>,
    tools: ToolsConfig,
    containers: Gate,
    reporter: Arc<dyn ProgressReporter>,
}

impl ToolInvoker {
    pub fn new(executor: Arc<dyn Executor>, tools: &ToolsConfig) -> Self {
        Self {
            executor,
            locks: Arc::new(PathLocks::new()),
            tools: tools.clone(),
            containers: Gate::new(tools.max_containers),
            reporter: Arc::new(SilentReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    pub fn reporter(&self) -> &dyn ProgressReporter {
        self.reporter.as_ref()
    }

    /// Run `spec` unless all of its outputs exist and `overwrite` does not
    /// cover any of them. Specs without outputs always run.
    pub fn invoke(&self, spec: ToolSpec, overwrite: &Overwrite) -> Result<Invoked, Error> {
        if spec.is_current(overwrite) {
            debug!("skipping {}: outputs present", spec.name);
            self.reporter.on_tool_skipped(&spec.name);
            return Ok(Invoked::Skipped);
        }

        let handles = self.locks.handles(&spec.outputs);
        let _guards: Vec<_> = handles.iter().map(|h| locks::acquire(h)).collect();
        // another worker may have produced the outputs while we waited
        if spec.is_current(overwrite) {
            self.reporter.on_tool_skipped(&spec.name);
            return Ok(Invoked::Skipped);
        }

        let mut spec = spec;
        if spec.timeout.is_none() {
            spec.timeout = Some(self.tools.timeout_for(&spec.name));
        }
        for output in &spec.outputs {
            fsutil::ensure_parent(output)?;
        }

        info!("{}", spec.name);
        debug!("{}", spec.command_line().join(" "));
        self.reporter.on_tool_start(&spec.name);

        let output = match &spec.invocation {
            Invocation::Container(_) => {
                let _pass = self.containers.acquire();
                self.executor.execute(&spec)?
            }
            _ => self.executor.execute(&spec)?,
        };

        if let Some(missing) = spec.outputs.iter().find(|o| !fsutil::present(o)) {
            return Err(Error::tool(
                &spec.name,
                ToolFailure::MissingOutput(missing.clone()),
            ));
        }
        self.reporter.on_tool_complete(&spec.name);
        Ok(Invoked::Ran(output))
    }

    /// Run a read-only tool and return its stdout.
    pub fn query(&self, spec: ToolSpec) -> Result<String, Error> {
        match self.invoke(spec, &Overwrite::Flag(false))? {
            Invoked::Ran(output) => Ok(output.stdout),
            Invoked::Skipped => Ok(String::new()),
        }
    }
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records every spec and creates its declared outputs.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub calls: Mutex<Vec<ToolSpec>>,
        pub fail: Option<ToolFailure>,
    }

    impl Executor for Recorder {
        fn execute(&self, spec: &ToolSpec) -> Result<ToolOutput, Error> {
            self.calls.lock().unwrap().push(spec.clone());
            if let Some(failure) = &self.fail {
                return Err(Error::tool(&spec.name, failure.clone()));
            }
            for output in &spec.outputs {
                fs::write(output, b"").unwrap();
            }
            Ok(ToolOutput {
                stdout: "12.5\n".to_string(),
            })
        }
    }

    impl Recorder {
        pub(crate) fn names(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|s| s.name.clone()).collect()
        }
    }

    #[test]
    fn test_invoke_skips_when_outputs_present() {
        let tmp = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let invoker = ToolInvoker::new(recorder.clone(), &ToolsConfig::default());
        let out = tmp.path().join("ts_motcor.nii.gz");
        let spec = ToolSpec::process("mcflirt", ["-in", "ts.nii", "-out"]).output(&out);

        assert!(invoker.invoke(spec.clone(), &Overwrite::default()).unwrap().ran());
        assert_eq!(recorder.names(), vec!["mcflirt".to_string()]);

        let second = invoker.invoke(spec.clone(), &Overwrite::default()).unwrap();
        assert_eq!(second, Invoked::Skipped);
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);

        assert!(invoker.invoke(spec, &Overwrite::Flag(true)).unwrap().ran());
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_invoke_applies_configured_timeout() {
        let tmp = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut tools = ToolsConfig::default();
        tools.timeouts.insert("fslmaths".to_string(), 30);
        let invoker = ToolInvoker::new(recorder.clone(), &tools);
        let spec = ToolSpec::process("fslmaths", ["a"]).output(tmp.path().join("b.nii.gz"));
        invoker.invoke(spec, &Overwrite::default()).unwrap();
        assert_eq!(
            recorder.calls.lock().unwrap()[0].timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_failure_leaves_output_missing() {
        let tmp = tempdir().unwrap();
        let recorder = Arc::new(Recorder {
            fail: Some(ToolFailure::ExitCode(3)),
            ..Default::default()
        });
        let invoker = ToolInvoker::new(recorder, &ToolsConfig::default());
        let out = tmp.path().join("x.nii.gz");
        let err = invoker
            .invoke(
                ToolSpec::process("flirt", ["-in", "a"]).output(&out),
                &Overwrite::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ToolExecutionFailed { ref tool, failure: ToolFailure::ExitCode(3) } if tool == "flirt"
        ));
        assert!(!out.exists());
    }

    struct Silent;

    impl Executor for Silent {
        fn execute(&self, _spec: &ToolSpec) -> Result<ToolOutput, Error> {
            Ok(ToolOutput::default())
        }
    }

    #[test]
    fn test_missing_output_after_success_is_failure() {
        let tmp = tempdir().unwrap();
        let invoker = ToolInvoker::new(Arc::new(Silent), &ToolsConfig::default());
        let err = invoker
            .invoke(
                ToolSpec::process("fslmaths", ["a"]).output(tmp.path().join("never.nii.gz")),
                &Overwrite::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ToolExecutionFailed {
                failure: ToolFailure::MissingOutput(_),
                ..
            }
        ));
    }

    #[test]
    fn test_query_always_runs() {
        let recorder = Arc::new(Recorder::default());
        let invoker = ToolInvoker::new(recorder.clone(), &ToolsConfig::default());
        let spec = ToolSpec::process("fslstats", ["tsnr.nii.gz", "-m"]);
        assert_eq!(invoker.query(spec.clone()).unwrap(), "12.5\n");
        assert_eq!(invoker.query(spec).unwrap(), "12.5\n");
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
    }
}
