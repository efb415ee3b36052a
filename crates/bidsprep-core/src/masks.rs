//! Region masks in functional space.
//!
//! The FreeSurfer cortical ribbon is brought into the original T1 space,
//! merged across hemispheres and resampled into functional space; each
//! standard-space region is warped into functional space and intersected
//! with it. The intersection is `<region>_cortex.nii.gz`.

use crate::anat::FreesurferSubject;
use crate::config::{AppConfig, Overwrite};
use crate::error::Error;
use crate::registration::RegistrationPaths;
use crate::tools::{freesurfer, fsl, ToolInvoker};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

/// `derivatives/ROIs/sub-<S>`.
pub fn roi_dir(root: &Path, subject: &str) -> PathBuf {
    root.join("derivatives")
        .join("ROIs")
        .join(format!("sub-{}", subject))
}

pub fn region_mask(root: &Path, subject: &str, region: &str) -> PathBuf {
    roi_dir(root, subject).join(format!("{}_cortex.nii.gz", region))
}

/// First `<region>.nii.gz` under `dir`, searched recursively in path order.
pub fn find_standard_mask(dir: &Path, region: &str) -> Result<PathBuf, Error> {
    let wanted = format!("{}.nii.gz", region);
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name().to_string_lossy() == wanted)
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
        .into_iter()
        .next()
        .ok_or_else(|| Error::AmbiguousOrMissingSource {
            pattern: format!("{}/**/{}", dir.display(), wanted),
            matches: Vec::new(),
        })
}

pub struct MaskBuilder<'a> {
    config: &'a AppConfig,
    invoker: &'a ToolInvoker,
}

impl<'a> MaskBuilder<'a> {
    pub fn new(config: &'a AppConfig, invoker: &'a ToolInvoker) -> Self {
        Self { config, invoker }
    }

    /// Build every configured region mask; returns their paths.
    pub fn run(&self, subject: &str, overwrite: &Overwrite) -> Result<Vec<PathBuf>, Error> {
        let fs_subject = FreesurferSubject::new(&self.config.freesurfer_subjects_dir()?, subject);
        let reg = RegistrationPaths::new(&self.config.root, subject);
        let rois = roi_dir(&self.config.root, subject);
        info!("Region masks | sub-{}", subject);

        let orig = fs_subject.orig();
        let mut hemispheres = Vec::with_capacity(2);
        for hemi in ["lh", "rh"] {
            let ribbon = fs_subject.mri().join(format!("{}.ribbon.mgz", hemi));
            let native = orig.join(format!("{}.ribbon.mgz", hemi));
            let nii = orig.join(format!("{}.ribbon.nii.gz", hemi));
            if !nii.exists() || overwrite.applies_to(&nii) {
                self.invoker.invoke(
                    freesurfer::vol2vol_header(&ribbon, &orig.join("001.mgz"), &native),
                    &Overwrite::Flag(true),
                )?;
            }
            self.invoker
                .invoke(freesurfer::convert_labels(&native, &nii), overwrite)?;
            hemispheres.push(nii);
        }

        let cortex_highres = orig.join("bi.ribbon.nii.gz");
        self.invoker.invoke(
            fsl::maths(&hemispheres[0])
                .add(&hemispheres[1])
                .bin()
                .into_spec(&cortex_highres),
            overwrite,
        )?;

        let cortex = rois.join("cortex.nii.gz");
        self.invoker.invoke(
            fsl::flirt_apply(
                &cortex_highres,
                &reg.example_func(),
                &cortex,
                &reg.highres2example_func(),
            ),
            overwrite,
        )?;

        let standard_dir = self.config.resolve(&self.config.masks.standard_dir);
        let mut masks = Vec::with_capacity(self.config.masks.regions.len());
        for region in &self.config.masks.regions {
            let standard = find_standard_mask(&standard_dir, region)?;
            let func_mask = rois.join(format!("{}.nii.gz", region));
            self.invoker.invoke(
                fsl::applywarp(
                    &standard,
                    &reg.example_func(),
                    &reg.standard2example_func_warp(),
                    &func_mask,
                ),
                overwrite,
            )?;
            let combined = region_mask(&self.config.root, subject, region);
            self.invoker.invoke(
                fsl::maths(&cortex).mul(&func_mask).into_spec(&combined),
                overwrite,
            )?;
            masks.push(combined);
        }
        Ok(masks)
    }
}
