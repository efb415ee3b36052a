use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn temp_beside(path: &Path) -> io::Result<NamedTempFile> {
    ensure_parent(path)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(".bidsprep-")
        .suffix(".tmp")
        .tempfile_in(dir)
}

/// Write `bytes` to a temp file next to `path`, then rename over it.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = temp_beside(path)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Copy `from` to `to` through a temp file, failing with `AlreadyExists`
/// if `to` appeared in the meantime.
pub fn copy_no_clobber(from: &Path, to: &Path) -> io::Result<()> {
    let mut tmp = temp_beside(to)?;
    let mut src = fs::File::open(from)?;
    io::copy(&mut src, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(to).map_err(|e| e.error)?;
    Ok(())
}

/// Decompress a `.nii.gz` into `to`.
pub fn gunzip(from: &Path, to: &Path) -> io::Result<()> {
    let mut decoder = GzDecoder::new(fs::File::open(from)?);
    let mut tmp = temp_beside(to)?;
    io::copy(&mut decoder, tmp.as_file_mut())?;
    tmp.persist(to).map_err(|e| e.error)?;
    Ok(())
}

/// Link `target` at `link`, falling back to a copy where symlinks are unavailable.
pub fn link_or_copy(target: &Path, link: &Path) -> io::Result<()> {
    ensure_parent(link)?;
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(not(unix))]
    {
        if target.is_dir() {
            copy_dir(target, link)
        } else {
            fs::copy(target, link).map(|_| ())
        }
    }
}

#[cfg(not(unix))]
fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

/// `true` if the path or a dangling symlink at it exists.
pub fn present(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
