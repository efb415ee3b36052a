//! Transforms between the functional reference, the subject's anatomy and
//! standard space, written to `derivatives/registration/sub-<S>`.

use crate::anat::FreesurferSubject;
use crate::config::{AppConfig, Overwrite};
use crate::error::Error;
use crate::naming::{first_match, SessionPaths};
use crate::tools::{fsl, ToolInvoker};
use glob::Pattern;
use std::path::{Path, PathBuf};
use tracing::info;

/// Files of one subject's registration directory.
#[derive(Debug, Clone)]
pub struct RegistrationPaths {
    pub dir: PathBuf,
}

impl RegistrationPaths {
    pub fn new(root: &Path, subject: &str) -> Self {
        Self {
            dir: root
                .join("derivatives")
                .join("registration")
                .join(format!("sub-{}", subject)),
        }
    }

    /// Temporal mean of the first functional run; the functional-space reference.
    pub fn example_func(&self) -> PathBuf {
        self.dir.join("example_func.nii.gz")
    }

    pub fn highres2example_func(&self) -> PathBuf {
        self.dir.join("highres2example_func.mat")
    }

    pub fn highres2standard(&self) -> PathBuf {
        self.dir.join("highres2standard.mat")
    }

    pub fn highres2standard_warp(&self) -> PathBuf {
        self.dir.join("highres2standard_warp.nii.gz")
    }

    pub fn standard2highres_warp(&self) -> PathBuf {
        self.dir.join("standard2highres_warp.nii.gz")
    }

    pub fn standard2example_func_warp(&self) -> PathBuf {
        self.dir.join("standard2example_func_warp.nii.gz")
    }
}

/// An FSL standard template with its brain and dilated brain mask.
#[derive(Debug, Clone)]
pub struct StandardTemplate {
    pub head: PathBuf,
    pub brain: PathBuf,
    pub mask: PathBuf,
}

impl StandardTemplate {
    pub fn new(fsl_dir: &Path, name: &str) -> Self {
        let dir = fsl_dir.join("data").join("standard");
        Self {
            head: dir.join(format!("{}.nii.gz", name)),
            brain: dir.join(format!("{}_brain.nii.gz", name)),
            mask: dir.join(format!("{}_brain_mask_dil.nii.gz", name)),
        }
    }
}

pub struct Registration<'a> {
    config: &'a AppConfig,
    invoker: &'a ToolInvoker,
}

impl<'a> Registration<'a> {
    pub fn new(config: &'a AppConfig, invoker: &'a ToolInvoker) -> Self {
        Self { config, invoker }
    }

    /// The first magnitude series of the session, measured data preferred.
    fn reference_series(&self, paths: &SessionPaths) -> Result<PathBuf, Error> {
        let func = Pattern::escape(&paths.func_dir().to_string_lossy());
        let measured = format!("{}/*acq-meas*part-mag_bold.nii", func);
        let any = format!("{}/*part-mag_bold.nii", func);
        match first_match(&measured)? {
            Some(path) => Ok(path),
            None => first_match(&any)?.ok_or_else(|| Error::AmbiguousOrMissingSource {
                pattern: any,
                matches: Vec::new(),
            }),
        }
    }

    pub fn run(&self, subject: &str, session: usize, overwrite: &Overwrite) -> Result<RegistrationPaths, Error> {
        let reg = RegistrationPaths::new(&self.config.root, subject);
        let fs_subject = FreesurferSubject::new(&self.config.freesurfer_subjects_dir()?, subject);
        let standard = StandardTemplate::new(&self.config.fsl_home()?, &self.config.registration.standard);
        let dof = &self.config.registration;
        info!("Registration | sub-{}", subject);

        let series = self.reference_series(&SessionPaths::new(&self.config.root, subject, session))?;
        self.invoker.invoke(
            fsl::maths(&series).tmean().into_spec(&reg.example_func()),
            overwrite,
        )?;
        self.invoker.invoke(
            fsl::flirt_estimate(
                &fs_subject.highres_brain(),
                &reg.example_func(),
                &reg.highres2example_func(),
                dof.dof_func,
            ),
            overwrite,
        )?;
        self.invoker.invoke(
            fsl::flirt_estimate(
                &fs_subject.highres_brain(),
                &standard.brain,
                &reg.highres2standard(),
                dof.dof_standard,
            ),
            overwrite,
        )?;
        self.invoker.invoke(
            fsl::fnirt(
                &fs_subject.highres(),
                &reg.highres2standard(),
                &standard.head,
                &standard.mask,
                &reg.highres2standard_warp(),
            ),
            overwrite,
        )?;
        self.invoker.invoke(
            fsl::invwarp(
                &reg.highres2standard_warp(),
                &fs_subject.highres(),
                &reg.standard2highres_warp(),
            ),
            overwrite,
        )?;
        self.invoker.invoke(
            fsl::convertwarp(
                &reg.example_func(),
                &reg.standard2highres_warp(),
                &reg.highres2example_func(),
                &reg.standard2example_func_warp(),
            ),
            overwrite,
        )?;
        Ok(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::Recorder;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup(root: &Path) -> AppConfig {
        let func = root.join("study/sub-M001/ses-1/func");
        fs::create_dir_all(&func).unwrap();
        fs::write(func.join("sub-M001_ses-1_task-rest_run-1_part-mag_bold.nii"), b"").unwrap();
        fs::write(func.join("sub-M001_ses-1_task-rest_acq-meas_part-mag_bold.nii"), b"").unwrap();
        let mut config = AppConfig::for_root(root.join("study"));
        config.subjects_dir = Some(root.join("fs"));
        config.fsl_dir = Some(root.join("fsl"));
        config
    }

    #[test]
    fn test_registration_chain() {
        let tmp = tempdir().unwrap();
        let config = setup(tmp.path());
        let recorder = Arc::new(Recorder::default());
        let invoker = ToolInvoker::new(recorder.clone(), &config.tools);

        let reg = Registration::new(&config, &invoker)
            .run("M001", 1, &Overwrite::default())
            .unwrap();
        assert_eq!(
            recorder.names(),
            vec!["fslmaths", "flirt", "flirt", "fnirt", "invwarp", "convertwarp"]
        );
        let calls = recorder.calls.lock().unwrap();
        assert!(calls[0].command_line()[1].ends_with("acq-meas_part-mag_bold.nii"));
        assert!(calls[1].command_line().contains(&"6".to_string()));
        assert!(calls[2].command_line().contains(&"12".to_string()));
        drop(calls);
        assert!(reg.standard2example_func_warp().exists());

        let overwrite = Overwrite::Targets(vec!["standard2example_func_warp.nii.gz".to_string()]);
        Registration::new(&config, &invoker)
            .run("M001", 1, &overwrite)
            .unwrap();
        assert_eq!(recorder.calls.lock().unwrap().len(), 7);
    }

    #[test]
    fn test_missing_functional_reference() {
        let tmp = tempdir().unwrap();
        let mut config = AppConfig::for_root(tmp.path());
        config.subjects_dir = Some(tmp.path().join("fs"));
        config.fsl_dir = Some(tmp.path().join("fsl"));
        let invoker = ToolInvoker::new(Arc::new(Recorder::default()), &config.tools);
        let err = Registration::new(&config, &invoker)
            .run("M001", 1, &Overwrite::default())
            .unwrap_err();
        assert_eq!(err.kind(), "AmbiguousOrMissingSource");
    }
}
