//! Header-only NIfTI access for volume and slice counts.

use crate::error::Error;
use nifti::NiftiHeader;
use std::path::{Path, PathBuf};

pub fn read_header(path: &Path) -> Result<NiftiHeader, Error> {
    NiftiHeader::from_file(path).map_err(|source| Error::Nifti {
        path: path.to_path_buf(),
        source,
    })
}

/// Size of the 3rd dimension.
pub fn slice_count(path: &Path) -> Result<u16, Error> {
    let header = read_header(path)?;
    Ok(header.dim[3])
}

/// Size of the 4th dimension, 1 for 3D images.
pub fn volume_count(path: &Path) -> Result<u16, Error> {
    let header = read_header(path)?;
    if header.dim[0] < 4 {
        Ok(1)
    } else {
        Ok(header.dim[4].max(1))
    }
}

/// FSL tools accept extensionless image names; find the file they wrote.
pub fn find_image(stem: &Path) -> Option<PathBuf> {
    let name = stem.file_name()?.to_string_lossy().into_owned();
    ["nii", "nii.gz"]
        .iter()
        .map(|ext| stem.with_file_name(format!("{}.{}", name, ext)))
        .find(|candidate| candidate.is_file())
}

/// Strip `.nii` or `.nii.gz` from a path.
pub fn stem(path: &Path) -> PathBuf {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return path.to_path_buf(),
    };
    let trimmed = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    path.with_file_name(trimmed)
}

/// Append `suffix` to the image stem and give it `.nii.gz`, the FSL default.
pub fn derived(path: &Path, suffix: &str) -> PathBuf {
    let stem = stem(path);
    let name = stem
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.with_file_name(format!("{}{}.nii.gz", name, suffix))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// Minimal little-endian NIfTI-1 single-file header with the given dims.
    pub(crate) fn write_header(path: &Path, dims: &[u16]) {
        let mut bytes = vec![0u8; 352];
        bytes[0..4].copy_from_slice(&348i32.to_le_bytes());
        let mut dim = [1i16; 8];
        dim[0] = dims.len() as i16;
        for (i, d) in dims.iter().enumerate() {
            dim[i + 1] = *d as i16;
        }
        for (i, d) in dim.iter().enumerate() {
            let at = 40 + i * 2;
            bytes[at..at + 2].copy_from_slice(&d.to_le_bytes());
        }
        // datatype: uint8, bitpix 8
        bytes[70..72].copy_from_slice(&2i16.to_le_bytes());
        bytes[72..74].copy_from_slice(&8i16.to_le_bytes());
        for i in 0..8 {
            let at = 76 + i * 4;
            bytes[at..at + 4].copy_from_slice(&1f32.to_le_bytes());
        }
        bytes[108..112].copy_from_slice(&352f32.to_le_bytes());
        bytes[112..116].copy_from_slice(&1f32.to_le_bytes());
        bytes[344..348].copy_from_slice(b"n+1\0");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_counts_from_header() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("bold.nii");
        write_header(&path, &[64, 64, 36, 31]);
        assert_eq!(slice_count(&path).unwrap(), 36);
        assert_eq!(volume_count(&path).unwrap(), 31);

        let anat = tmp.path().join("T1w.nii");
        write_header(&anat, &[176, 256, 256]);
        assert_eq!(volume_count(&anat).unwrap(), 1);
    }

    #[test]
    fn test_stem_and_derived() {
        assert_eq!(stem(Path::new("/a/b.nii.gz")), PathBuf::from("/a/b"));
        assert_eq!(stem(Path::new("/a/b.nii")), PathBuf::from("/a/b"));
        assert_eq!(stem(Path::new("/a/b")), PathBuf::from("/a/b"));
        assert_eq!(
            derived(Path::new("/t/run_bold.nii"), "_motcor"),
            PathBuf::from("/t/run_bold_motcor.nii.gz")
        );
        assert_eq!(
            derived(Path::new("/t/run_bold_motcor.nii.gz"), "_Tmean"),
            PathBuf::from("/t/run_bold_motcor_Tmean.nii.gz")
        );
    }

    #[test]
    fn test_find_image() {
        let tmp = tempdir().unwrap();
        let stem = tmp.path().join("mag_cor");
        assert_eq!(find_image(&stem), None);
        fs::write(tmp.path().join("mag_cor.nii.gz"), b"").unwrap();
        assert_eq!(find_image(&stem), Some(tmp.path().join("mag_cor.nii.gz")));
    }
}
