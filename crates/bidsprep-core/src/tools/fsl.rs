//! FSL command lines.

use super::{path_arg, ToolSpec};
use crate::error::Error;
use std::path::Path;

/// `fslmaths <input> [ops...] <output>`.
pub struct Maths {
    args: Vec<String>,
}

pub fn maths(input: &Path) -> Maths {
    Maths {
        args: vec![path_arg(input)],
    }
}

impl Maths {
    pub fn tmean(mut self) -> Self {
        self.args.push("-Tmean".to_string());
        self
    }

    pub fn tstd(mut self) -> Self {
        self.args.push("-Tstd".to_string());
        self
    }

    pub fn div(mut self, image: &Path) -> Self {
        self.args.extend(["-div".to_string(), path_arg(image)]);
        self
    }

    pub fn mul(mut self, image: &Path) -> Self {
        self.args.extend(["-mul".to_string(), path_arg(image)]);
        self
    }

    pub fn add(mut self, image: &Path) -> Self {
        self.args.extend(["-add".to_string(), path_arg(image)]);
        self
    }

    pub fn bin(mut self) -> Self {
        self.args.push("-bin".to_string());
        self
    }

    /// Temporal bandpass; a negative sigma disables that side.
    pub fn bptf(mut self, highpass_sigma: f64, lowpass_sigma: f64) -> Self {
        self.args.extend([
            "-bptf".to_string(),
            highpass_sigma.to_string(),
            lowpass_sigma.to_string(),
        ]);
        self
    }

    pub fn into_spec(mut self, output: &Path) -> ToolSpec {
        self.args.push(path_arg(output));
        ToolSpec::process("fslmaths", self.args).output(output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Mean,
    Std,
}

/// `fslstats <image> -k <mask> -m|-s`; read-only, no outputs.
pub fn stats(image: &Path, mask: &Path, stat: Stat) -> ToolSpec {
    let flag = match stat {
        Stat::Mean => "-m",
        Stat::Std => "-s",
    };
    ToolSpec::process(
        "fslstats",
        [path_arg(image), "-k".to_string(), path_arg(mask), flag.to_string()],
    )
}

pub fn parse_stat(stdout: &str) -> Result<f64, Error> {
    let token = stdout.split_whitespace().next().unwrap_or("");
    token
        .parse::<f64>()
        .map_err(|_| Error::Other(format!("unexpected fslstats output '{}'", stdout.trim())))
}

pub fn mcflirt(input: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "mcflirt",
        ["-in".to_string(), path_arg(input), "-out".to_string(), path_arg(output)],
    )
    .output(output)
}

/// Extract `size` volumes starting at `start`; `output` may equal `input`.
pub fn roi(input: &Path, output: &Path, start: i64, size: i64) -> ToolSpec {
    ToolSpec::process(
        "fslroi",
        [path_arg(input), path_arg(output), start.to_string(), size.to_string()],
    )
}

/// Rewrite the repetition time of `input` into `output`.
pub fn merge_tr(output: &Path, input: &Path, tr: f64) -> ToolSpec {
    ToolSpec::process(
        "fslmerge",
        ["-tr".to_string(), path_arg(output), path_arg(input), tr.to_string()],
    )
}

pub fn complex_from_parts(real: &Path, imag: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "fslcomplex",
        ["-complex".to_string(), path_arg(real), path_arg(imag), path_arg(output)],
    )
    .output(output)
}

pub fn complex_abs(complex: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "fslcomplex",
        ["-realabs".to_string(), path_arg(complex), path_arg(output)],
    )
    .output(output)
}

pub fn complex_phase(complex: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "fslcomplex",
        ["-realphase".to_string(), path_arg(complex), path_arg(output)],
    )
    .output(output)
}

/// Copy header geometry from `source` onto `dest` in place.
pub fn cpgeom(source: &Path, dest: &Path) -> ToolSpec {
    ToolSpec::process("fslcpgeom", [path_arg(source), path_arg(dest)])
}

/// Estimate an affine from `input` to `reference`.
pub fn flirt_estimate(input: &Path, reference: &Path, matrix: &Path, dof: u8) -> ToolSpec {
    ToolSpec::process(
        "flirt",
        [
            "-in".to_string(),
            path_arg(input),
            "-ref".to_string(),
            path_arg(reference),
            "-omat".to_string(),
            path_arg(matrix),
            "-dof".to_string(),
            dof.to_string(),
        ],
    )
    .output(matrix)
}

/// Resample a label image with an existing affine.
pub fn flirt_apply(input: &Path, reference: &Path, output: &Path, matrix: &Path) -> ToolSpec {
    ToolSpec::process(
        "flirt",
        [
            "-in".to_string(),
            path_arg(input),
            "-ref".to_string(),
            path_arg(reference),
            "-out".to_string(),
            path_arg(output),
            "-applyxfm".to_string(),
            "-init".to_string(),
            path_arg(matrix),
            "-interp".to_string(),
            "nearestneighbour".to_string(),
        ],
    )
    .output(output)
}

pub fn fnirt(input: &Path, affine: &Path, reference: &Path, refmask: &Path, warp: &Path) -> ToolSpec {
    ToolSpec::process(
        "fnirt",
        [
            format!("--in={}", path_arg(input)),
            format!("--aff={}", path_arg(affine)),
            format!("--ref={}", path_arg(reference)),
            format!("--refmask={}", path_arg(refmask)),
            format!("--cout={}", path_arg(warp)),
        ],
    )
    .output(warp)
}

pub fn invwarp(warp: &Path, reference: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "invwarp",
        [
            "-w".to_string(),
            path_arg(warp),
            "-o".to_string(),
            path_arg(output),
            "-r".to_string(),
            path_arg(reference),
        ],
    )
    .output(output)
}

pub fn convertwarp(reference: &Path, warp: &Path, postmat: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "convertwarp",
        [
            format!("--ref={}", path_arg(reference)),
            format!("--warp1={}", path_arg(warp)),
            format!("--postmat={}", path_arg(postmat)),
            format!("--out={}", path_arg(output)),
        ],
    )
    .output(output)
}

/// Nearest-neighbour warp of a mask.
pub fn applywarp(input: &Path, reference: &Path, warp: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "applywarp",
        [
            "-i".to_string(),
            path_arg(input),
            "-r".to_string(),
            path_arg(reference),
            "-o".to_string(),
            path_arg(output),
            "-w".to_string(),
            path_arg(warp),
            "--interp=nn".to_string(),
        ],
    )
    .output(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_maths_chain() {
        let spec = maths(Path::new("/t/mc.nii.gz"))
            .bptf(15.0, -1.0)
            .add(Path::new("/t/mc_Tmean.nii.gz"))
            .into_spec(Path::new("/t/mc_ltr.nii.gz"));
        assert_eq!(
            spec.command_line(),
            vec![
                "fslmaths",
                "/t/mc.nii.gz",
                "-bptf",
                "15",
                "-1",
                "-add",
                "/t/mc_Tmean.nii.gz",
                "/t/mc_ltr.nii.gz"
            ]
        );
        assert_eq!(spec.outputs, vec![PathBuf::from("/t/mc_ltr.nii.gz")]);
    }

    #[test]
    fn test_stats_has_no_outputs() {
        let spec = stats(Path::new("/t/tsnr.nii.gz"), Path::new("/m/V1_cortex.nii.gz"), Stat::Std);
        assert!(spec.outputs.is_empty());
        assert_eq!(spec.command_line().last().map(String::as_str), Some("-s"));
    }

    #[test]
    fn test_parse_stat() {
        assert_eq!(parse_stat("23.456789 \n").unwrap(), 23.456789);
        assert!(parse_stat("").is_err());
        assert!(parse_stat("nan-ish").is_err());
    }
}
