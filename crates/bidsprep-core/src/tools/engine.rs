use super::path_arg;
use super::process::run_command;
use crate::error::{Error, ToolFailure};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// A function call into a numerical engine: positional string arguments
/// followed by one parameter record.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineCall {
    pub function: String,
    /// Directory added to the engine's search path before the call.
    pub search_path: PathBuf,
    pub args: Vec<String>,
    pub params: BTreeMap<String, f64>,
}

impl EngineCall {
    pub fn new(function: &str, search_path: PathBuf) -> Self {
        Self {
            function: function.to_string(),
            search_path,
            args: Vec::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn param(mut self, key: &str, value: f64) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn describe(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("({}) {{{}}}", self.args.join(", "), params.join(", "))
    }
}

/// Hosts engine calls. Blocks until the call finishes.
pub trait NumericEngine: Send + Sync {
    fn call(&self, call: &EngineCall, timeout: Duration) -> Result<(), ToolFailure>;
}

/// MATLAB, driven through `-batch`.
pub struct MatlabEngine {
    program: String,
}

impl MatlabEngine {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// The statement passed to `-batch`.
    pub fn script(call: &EngineCall) -> String {
        let mut positional: Vec<String> = call.args.iter().map(|a| quote(a)).collect();
        let fields: Vec<String> = call
            .params
            .iter()
            .map(|(k, v)| format!("{}, {}", quote(k), v))
            .collect();
        positional.push(format!("struct({})", fields.join(", ")));
        format!(
            "addpath({}); {}({});",
            quote(&path_arg(&call.search_path)),
            call.function,
            positional.join(", ")
        )
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl NumericEngine for MatlabEngine {
    fn call(&self, call: &EngineCall, timeout: Duration) -> Result<(), ToolFailure> {
        let script = Self::script(call);
        let mut cmd = Command::new(&self.program);
        cmd.args(["-nodisplay", "-batch", script.as_str()]);
        match run_command(&call.function, cmd, timeout) {
            Ok(_) => Ok(()),
            Err(Error::ToolExecutionFailed { failure, .. }) => Err(failure),
            Err(other) => Err(ToolFailure::Engine(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matlab_script() {
        let call = EngineCall::new("NIFTI_NORDIC", PathBuf::from("/opt/NORDIC_Raw"))
            .arg("/d/mag.nii")
            .arg("/d/it's phase.nii")
            .arg("/d/out")
            .param("phase_filter_width", 10.0)
            .param("noise_volume_last", 1.0);
        assert_eq!(
            MatlabEngine::script(&call),
            "addpath('/opt/NORDIC_Raw'); NIFTI_NORDIC('/d/mag.nii', '/d/it''s phase.nii', \
             '/d/out', struct('noise_volume_last', 1, 'phase_filter_width', 10));"
        );
    }
}
