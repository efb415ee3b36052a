//! FreeSurfer command lines.

use super::{path_arg, ToolSpec};
use std::path::Path;

/// `mri_convert <input> <output>`.
pub fn convert(input: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process("mri_convert", [path_arg(input), path_arg(output)]).output(output)
}

/// mgz label volume to NIfTI, keeping labels intact.
pub fn convert_labels(input: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "mri_convert",
        [
            "--in_type".to_string(),
            "mgz".to_string(),
            "--out_type".to_string(),
            "nii".to_string(),
            "-rt".to_string(),
            "nearest".to_string(),
            path_arg(input),
            path_arg(output),
        ],
    )
    .output(output)
}

/// Resample `mov` into the space of `targ` using the scanner header alone.
pub fn vol2vol_header(mov: &Path, targ: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "mri_vol2vol",
        [
            "--mov".to_string(),
            path_arg(mov),
            "--targ".to_string(),
            path_arg(targ),
            "--regheader".to_string(),
            "--o".to_string(),
            path_arg(output),
            "--nearest".to_string(),
            "--no-save-reg".to_string(),
        ],
    )
    .output(output)
}

pub fn synthstrip(input: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "mri_synthstrip",
        ["-i".to_string(), path_arg(input), "-o".to_string(), path_arg(output)],
    )
    .output(output)
}

pub fn mideface(input: &Path, output: &Path) -> ToolSpec {
    ToolSpec::process(
        "mideface",
        ["--i".to_string(), path_arg(input), "--o".to_string(), path_arg(output)],
    )
    .output(output)
}
