use super::path_arg;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub src: PathBuf,
    pub dst: String,
}

/// `<runtime> run --rm` with bind mounts and resource ceilings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRun {
    pub runtime: String,
    pub image: String,
    /// Container name, used to stop it if the client is killed.
    pub name: Option<String>,
    pub mounts: Vec<Mount>,
    pub memory: Option<String>,
    pub memory_swap: Option<String>,
    pub args: Vec<String>,
}

impl ContainerRun {
    pub fn new(runtime: &str, image: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            image: image.to_string(),
            name: None,
            mounts: Vec::new(),
            memory: None,
            memory_swap: None,
            args: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(sanitize_name(name));
        self
    }

    pub fn bind(mut self, src: &Path, dst: &str) -> Self {
        self.mounts.push(Mount {
            src: src.to_path_buf(),
            dst: dst.to_string(),
        });
        self
    }

    pub fn memory(mut self, memory: &str, swap: &str) -> Self {
        self.memory = Some(memory.to_string());
        self.memory_swap = Some(swap.to_string());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments following the runtime binary.
    pub fn to_args(&self) -> Vec<String> {
        let mut out = vec!["run".to_string(), "--rm".to_string()];
        if let Some(name) = &self.name {
            out.push("--name".to_string());
            out.push(name.clone());
        }
        for mount in &self.mounts {
            out.push("--mount".to_string());
            out.push(format!("type=bind,src={},dst={}", path_arg(&mount.src), mount.dst));
        }
        if let Some(memory) = &self.memory {
            out.push(format!("--memory={}", memory));
        }
        if let Some(swap) = &self.memory_swap {
            out.push(format!("--memory-swap={}", swap));
        }
        out.push(self.image.clone());
        out.extend(self.args.iter().cloned());
        out
    }
}

/// Container names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_args() {
        let run = ContainerRun::new("docker", "nipreps/mriqc:23.1.0")
            .name("bidsprep-mriqc/M001")
            .bind(Path::new("/study"), "/data")
            .bind(Path::new("/study/derivatives/mriqc-23.1.0"), "/out")
            .memory("32g", "64g")
            .args(["--nprocs", "8"])
            .arg("participant");
        assert_eq!(
            run.to_args(),
            vec![
                "run",
                "--rm",
                "--name",
                "bidsprep-mriqc-M001",
                "--mount",
                "type=bind,src=/study,dst=/data",
                "--mount",
                "type=bind,src=/study/derivatives/mriqc-23.1.0,dst=/out",
                "--memory=32g",
                "--memory-swap=64g",
                "nipreps/mriqc:23.1.0",
                "--nprocs",
                "8",
                "participant",
            ]
        );
    }
}
