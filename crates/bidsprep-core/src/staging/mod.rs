pub mod session;

use crate::error::Error;
use crate::fsutil;
use crate::locks::PathLocks;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, trace};

/// How a raw file reaches the BIDS tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Converter output is a temporary derived file and is moved.
    Move,
    /// Native NIfTI exports are preserved and copied.
    Copy,
}

impl TransferMode {
    /// DICOM sources go through the converter first, so their outputs are moved.
    pub fn for_source(has_dicom: bool) -> Self {
        if has_dicom {
            TransferMode::Move
        } else {
            TransferMode::Copy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Transferred,
    AlreadyPresent,
}

/// Place `source` at `dest` unless `dest` already exists. The existing file is
/// never overwritten, and a destination created concurrently counts as present.
pub fn stage(
    locks: &PathLocks,
    source: &Path,
    dest: &Path,
    mode: TransferMode,
) -> Result<StageOutcome, Error> {
    locks.with_lock(dest, || {
        if fsutil::present(dest) {
            trace!("{} already staged", dest.display());
            return Ok(StageOutcome::AlreadyPresent);
        }

        let failed = |source_err: io::Error| Error::StagingFailed {
            from: source.to_path_buf(),
            to: dest.to_path_buf(),
            source: source_err,
        };

        fsutil::ensure_parent(dest).map_err(failed)?;
        match mode {
            TransferMode::Copy => match fsutil::copy_no_clobber(source, dest) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Ok(StageOutcome::AlreadyPresent)
                }
                Err(e) => return Err(failed(e)),
            },
            TransferMode::Move => {
                if let Err(e) = fs::rename(source, dest) {
                    // EXDEV: rename across filesystems
                    if e.raw_os_error() == Some(18) {
                        fsutil::copy_no_clobber(source, dest).map_err(failed)?;
                        fs::remove_file(source).map_err(failed)?;
                    } else {
                        return Err(failed(e));
                    }
                }
            }
        }
        debug!(
            "{} {} -> {}",
            match mode {
                TransferMode::Move => "moved",
                TransferMode::Copy => "copied",
            },
            source.display(),
            dest.display()
        );
        Ok(StageOutcome::Transferred)
    })
}
