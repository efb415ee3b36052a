use super::{path_arg, ToolSpec};
use std::path::Path;

/// Convert every DICOM series in `dir` to NIfTI plus JSON sidecars, in place.
/// Outputs are only known after the run, so the spec declares none.
pub fn convert_dir(dir: &Path) -> ToolSpec {
    ToolSpec::process(
        "dcm2niix",
        [
            "-z".to_string(),
            "n".to_string(),
            "-b".to_string(),
            "y".to_string(),
            "-o".to_string(),
            path_arg(dir),
            path_arg(dir),
        ],
    )
}
