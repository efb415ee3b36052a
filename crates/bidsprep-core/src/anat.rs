//! Anatomical preprocessing: fMRIPrep's anatomical workflow (FreeSurfer
//! reconstruction), then NIfTI copies and skull-stripped versions of the
//! conformed and original T1 volumes.

use crate::config::{AppConfig, Overwrite};
use crate::error::Error;
use crate::tools::nipreps::{self, BidsApp};
use crate::tools::{freesurfer, ToolInvoker};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// FreeSurfer files of one subject.
#[derive(Debug, Clone)]
pub struct FreesurferSubject {
    pub dir: PathBuf,
}

impl FreesurferSubject {
    pub fn new(subjects_dir: &Path, subject: &str) -> Self {
        Self {
            dir: subjects_dir.join(format!("sub-{}", subject)),
        }
    }

    pub fn mri(&self) -> PathBuf {
        self.dir.join("mri")
    }

    pub fn orig(&self) -> PathBuf {
        self.mri().join("orig")
    }

    /// Volumes converted and skull-stripped after reconstruction.
    pub fn volumes(&self) -> [PathBuf; 2] {
        [self.mri().join("T1.mgz"), self.orig().join("001.mgz")]
    }

    /// Original T1 in NIfTI, the high-resolution reference for registration.
    pub fn highres(&self) -> PathBuf {
        self.orig().join("001.nii")
    }

    pub fn highres_brain(&self) -> PathBuf {
        self.orig().join("001_brain.nii.gz")
    }
}

fn with_name(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}", stem, suffix))
}

pub struct AnatomicalPreprocessor<'a> {
    config: &'a AppConfig,
    invoker: &'a ToolInvoker,
}

impl<'a> AnatomicalPreprocessor<'a> {
    pub fn new(config: &'a AppConfig, invoker: &'a ToolInvoker) -> Self {
        Self { config, invoker }
    }

    pub fn run(&self, subject: &str, overwrite: &Overwrite) -> Result<(), Error> {
        let subjects_dir = self.config.freesurfer_subjects_dir()?;
        let derivatives = self.config.derivatives_dir();
        let app = BidsApp {
            input: self.config.root.clone(),
            output: derivatives.join(format!("fmriprep-{}", self.config.container.fmriprep_version)),
            // per subject so parallel subjects do not share scratch space
            work: derivatives.join("fmriprep_work").join(format!("sub-{}", subject)),
        };
        fs::create_dir_all(&app.output)?;
        fs::create_dir_all(&app.work)?;

        let spec = nipreps::fmriprep_anat(
            &self.config.container,
            &app,
            &subjects_dir,
            subject,
            self.config.n_procs,
        );
        let invoked = self.invoker.invoke(spec, overwrite);
        if let Err(e) = fs::remove_dir_all(&app.work) {
            warn!("could not remove {}: {}", app.work.display(), e);
        }
        if invoked?.ran() {
            info!("fMRIPrep anatomical workflow finished for sub-{}", subject);
        }

        let fs_subject = FreesurferSubject::new(&subjects_dir, subject);
        for mgz in fs_subject.volumes() {
            let nii = with_name(&mgz, ".nii");
            let brain = with_name(&mgz, "_brain.nii.gz");
            self.invoker
                .invoke(freesurfer::convert(&mgz, &nii), overwrite)?;
            self.invoker
                .invoke(freesurfer::synthstrip(&nii, &brain), overwrite)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::Recorder;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_anat_converts_and_strips_both_volumes() {
        let tmp = tempdir().unwrap();
        let subjects = tmp.path().join("freesurfer");
        let mut config = AppConfig::for_root(tmp.path().join("study"));
        config.subjects_dir = Some(subjects.clone());
        let recorder = Arc::new(Recorder::default());
        let invoker = ToolInvoker::new(recorder.clone(), &config.tools);

        AnatomicalPreprocessor::new(&config, &invoker)
            .run("M001", &Overwrite::default())
            .unwrap();
        assert_eq!(
            recorder.names(),
            vec!["fmriprep", "mri_convert", "mri_synthstrip", "mri_convert", "mri_synthstrip"]
        );
        let fs_subject = FreesurferSubject::new(&subjects, "M001");
        assert!(fs_subject.highres().exists());
        assert!(fs_subject.highres_brain().exists());
        assert!(fs_subject.mri().join("T1_brain.nii.gz").exists());
        assert!(!config.derivatives_dir().join("fmriprep_work/sub-M001").exists());

        AnatomicalPreprocessor::new(&config, &invoker)
            .run("M001", &Overwrite::default())
            .unwrap();
        assert_eq!(recorder.calls.lock().unwrap().len(), 5);
    }
}
