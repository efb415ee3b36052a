//! NORDIC denoising variants.
//!
//! The measured magnitude/phase pair of one functional run is renamed to
//! `acq-meas`, a calculated pair (`acq-calc`) is rebuilt from the real and
//! imaginary components, and the NORDIC routine runs once per combination of
//! magnitude source, phase source and noise mode. Each combination becomes a
//! BIDS dataset under `derivatives/NORDIC_mag-<m>_phase-<p>_noise-<n>`.

use crate::config::{AppConfig, Overwrite};
use crate::error::Error;
use crate::fsutil;
use crate::naming::{exactly_one, glob_sorted, SessionPaths};
use crate::nifti_header;
use crate::staging::{stage, StageOutcome, TransferMode};
use crate::tools::engine::EngineCall;
use crate::tools::{fsl, path_arg, ToolInvoker, ToolSpec};
use glob::Pattern;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const NORDIC_ROUTINE: &str = "NIFTI_NORDIC";

/// Where a magnitude or phase image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Exported by the scanner.
    Measured,
    /// Rebuilt from real and imaginary components.
    Calculated,
}

impl Origin {
    pub const ALL: [Origin; 2] = [Origin::Measured, Origin::Calculated];

    pub fn label(self) -> &'static str {
        match self {
            Origin::Measured => "meas",
            Origin::Calculated => "calc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseMode {
    /// The last volume is a noise scan.
    Volume,
    /// Noise is estimated from the signal volumes; the noise scan is dropped first.
    Estimated,
}

impl NoiseMode {
    pub const ALL: [NoiseMode; 2] = [NoiseMode::Volume, NoiseMode::Estimated];

    pub fn label(self) -> &'static str {
        match self {
            NoiseMode::Volume => "vol",
            NoiseMode::Estimated => "est",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NordicVariant {
    pub magnitude: Origin,
    pub phase: Origin,
    pub noise: NoiseMode,
}

impl NordicVariant {
    pub fn all() -> Vec<NordicVariant> {
        let mut variants = Vec::with_capacity(8);
        for magnitude in Origin::ALL {
            for phase in Origin::ALL {
                for noise in NoiseMode::ALL {
                    variants.push(NordicVariant {
                        magnitude,
                        phase,
                        noise,
                    });
                }
            }
        }
        variants
    }
}

impl fmt::Display for NordicVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NORDIC_mag-{}_phase-{}_noise-{}",
            self.magnitude.label(),
            self.phase.label(),
            self.noise.label()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenoiseReport {
    /// Variants whose NORDIC routine ran in this call.
    pub computed: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct Denoiser<'a> {
    config: &'a AppConfig,
    invoker: &'a ToolInvoker,
}

impl<'a> Denoiser<'a> {
    pub fn new(config: &'a AppConfig, invoker: &'a ToolInvoker) -> Self {
        Self { config, invoker }
    }

    /// Denoise the configured task run of one session. Returns `None` when the
    /// session has no such run.
    pub fn denoise_session(
        &self,
        subject: &str,
        session: usize,
        overwrite: &Overwrite,
    ) -> Result<Option<DenoiseReport>, Error> {
        let paths = SessionPaths::new(&self.config.root, subject, session);
        if !self.rename_measured(&paths)? {
            debug!("sub-{} ses-{}: no {} run to denoise", subject, session, self.config.nordic.task);
            return Ok(None);
        }
        info!("NORDIC preprocessing | sub-{} | ses-{}", subject, session);
        self.calculate_components(&paths, overwrite)?;

        let mut report = DenoiseReport::default();
        for variant in NordicVariant::all() {
            if self.run_variant(&paths, variant, overwrite)? {
                report.computed.push(variant.to_string());
            } else {
                report.skipped.push(variant.to_string());
            }
        }

        if self.config.nordic.remove_components {
            self.remove_components(&paths)?;
        }
        Ok(Some(report))
    }

    fn name(&self, paths: &SessionPaths, acq: Option<&str>, part: &str) -> String {
        let nordic = &self.config.nordic;
        let mut name = paths.name("bold").task(&nordic.task);
        name = match acq {
            Some(acq) => name.acq(acq),
            None => name.run(nordic.run),
        };
        name.part(part).to_string()
    }

    /// Measured magnitude and phase images lose their run entity in favour of
    /// `acq-meas`. Returns whether a measured magnitude image exists afterwards.
    fn rename_measured(&self, paths: &SessionPaths) -> Result<bool, Error> {
        let func = paths.func_dir();
        for part in ["mag", "phase"] {
            let from = func.join(format!("{}.nii", self.name(paths, None, part)));
            let to = func.join(format!("{}.nii", self.name(paths, Some("meas"), part)));
            self.invoker.locks().with_lock(&to, || -> Result<(), Error> {
                if from.is_file() && !fsutil::present(&to) {
                    fs::rename(&from, &to)?;
                    debug!("{} -> {}", from.display(), to.display());
                }
                Ok(())
            })?;
        }
        Ok(func
            .join(format!("{}.nii", self.name(paths, Some("meas"), "mag")))
            .is_file())
    }

    /// Build `acq-calc` magnitude and phase from the real and imaginary images.
    fn calculate_components(&self, paths: &SessionPaths, overwrite: &Overwrite) -> Result<(), Error> {
        let func = paths.func_dir();
        let mag_calc = func.join(format!("{}.nii.gz", self.name(paths, Some("calc"), "mag")));
        let phase_calc = func.join(format!("{}.nii.gz", self.name(paths, Some("calc"), "phase")));
        let stale = overwrite.any(&[mag_calc.clone(), phase_calc.clone()]);
        if !stale && mag_calc.is_file() && phase_calc.is_file() {
            return Ok(());
        }

        let real = self.required_image(&func, &self.name(paths, None, "real"))?;
        let imag = self.required_image(&func, &self.name(paths, None, "imag"))?;
        let complex = func.join(format!("{}.nii.gz", self.name(paths, None, "complex")));

        info!("calculating magnitude and phase from real and imaginary components");
        self.invoker
            .invoke(fsl::complex_from_parts(&real, &imag, &complex), overwrite)?;
        self.invoker
            .invoke(fsl::complex_abs(&complex, &mag_calc), overwrite)?;
        self.invoker
            .invoke(fsl::cpgeom(&imag, &mag_calc), overwrite)?;
        self.invoker
            .invoke(fsl::complex_phase(&complex, &phase_calc), overwrite)?;
        self.invoker
            .invoke(fsl::cpgeom(&imag, &phase_calc), overwrite)?;

        let complex_stem = nifti_header::stem(&complex);
        for leftover in glob_sorted(&format!(
            "{}*",
            Pattern::escape(&complex_stem.to_string_lossy())
        ))? {
            fs::remove_file(&leftover)?;
        }
        Ok(())
    }

    fn required_image(&self, dir: &Path, stem: &str) -> Result<PathBuf, Error> {
        nifti_header::find_image(&dir.join(stem)).ok_or_else(|| Error::AmbiguousOrMissingSource {
            pattern: format!("{}/{}.nii*", dir.display(), stem),
            matches: Vec::new(),
        })
    }

    /// Returns whether the NORDIC routine ran.
    fn run_variant(
        &self,
        paths: &SessionPaths,
        variant: NordicVariant,
        overwrite: &Overwrite,
    ) -> Result<bool, Error> {
        let nordic = &self.config.nordic;
        let name = variant.to_string();
        let out = paths.in_derivative(&name);
        let out_func = out.func_dir();
        let func = paths.func_dir();
        let corrected = out_func.join(
            out.name("bold")
                .task(&nordic.task)
                .part("mag")
                .with_extension("nii"),
        );

        let ran = if !fsutil::present(&corrected) || overwrite.applies_to(&corrected) {
            info!("running {} for {}", NORDIC_ROUTINE, name);
            let magnitude = self.stage_input(&func, &out_func, variant.magnitude, "mag", variant.noise)?;
            let phase = self.stage_input(&func, &out_func, variant.phase, "phase", variant.noise)?;

            let mut call = EngineCall::new(NORDIC_ROUTINE, self.config.resolve(&nordic.source_dir))
                .arg(path_arg(&magnitude))
                .arg(path_arg(&phase))
                .arg(path_arg(&nifti_header::stem(&corrected)))
                .param("phase_filter_width", nordic.phase_filter_width);
            call = match variant.noise {
                NoiseMode::Volume => call
                    .param("noise_volume_last", 1.0)
                    .param("use_magn_for_gfactor", 1.0),
                NoiseMode::Estimated => call.param("noise_volume_last", 0.0),
            };
            self.invoker
                .invoke(ToolSpec::engine(NORDIC_ROUTINE, call).output(&corrected), &Overwrite::Flag(true))?;
            true
        } else {
            false
        };

        self.trim_noise_volume(&corrected)?;
        self.remove_staged_inputs(&out_func)?;
        self.copy_sidecars(paths, &out)?;
        self.link_modalities(paths, &out)?;
        self.copy_dataset_files(&self.config.root.join("derivatives").join(&name))?;
        Ok(ran)
    }

    /// Copy the magnitude or phase input for a variant next to its output.
    fn stage_input(
        &self,
        func: &Path,
        out_func: &Path,
        origin: Origin,
        part: &str,
        noise: NoiseMode,
    ) -> Result<PathBuf, Error> {
        let pattern = format!(
            "{}/*acq-{}*part-{}_bold.nii*",
            Pattern::escape(&func.to_string_lossy()),
            origin.label(),
            part
        );
        let source = exactly_one(&pattern)?;
        let file_name = source
            .file_name()
            .ok_or_else(|| Error::Other(format!("no file name in {}", source.display())))?;
        let dest = out_func.join(file_name);
        let staged = stage(self.invoker.locks(), &source, &dest, TransferMode::Copy)?;
        if staged == StageOutcome::Transferred && noise == NoiseMode::Estimated {
            let volumes = i64::from(self.config.nordic.signal_volumes);
            self.invoker
                .invoke(fsl::roi(&dest, &dest, 0, volumes), &Overwrite::default())?;
        }
        Ok(dest)
    }

    /// Drop a trailing noise volume from the corrected series and restore its TR.
    fn trim_noise_volume(&self, corrected: &Path) -> Result<(), Error> {
        let nordic = &self.config.nordic;
        let volumes = nifti_header::volume_count(corrected)?;
        if volumes != nordic.signal_volumes + 1 {
            return Ok(());
        }
        info!("trimming noise volume from {}", corrected.display());
        let gz = nifti_header::derived(corrected, "");
        self.invoker.invoke(
            fsl::roi(corrected, &gz, 0, i64::from(nordic.signal_volumes)),
            &Overwrite::default(),
        )?;
        fs::remove_file(corrected)?;
        self.invoker
            .invoke(fsl::merge_tr(&gz, &gz, nordic.repetition_time), &Overwrite::default())?;
        fsutil::gunzip(&gz, corrected)?;
        fs::remove_file(&gz)?;
        Ok(())
    }

    /// The routine's inputs would otherwise be mistaken for the variant's series.
    fn remove_staged_inputs(&self, out_func: &Path) -> Result<(), Error> {
        for input in glob_sorted(&format!(
            "{}/*_acq-*",
            Pattern::escape(&out_func.to_string_lossy())
        ))? {
            fs::remove_file(&input)?;
        }
        Ok(())
    }

    /// Functional sidecars follow the corrected image, which has no run entity.
    fn copy_sidecars(&self, paths: &SessionPaths, out: &SessionPaths) -> Result<(), Error> {
        let nordic = &self.config.nordic;
        let pattern = format!(
            "{}/*task-{}*part-mag_bold.json",
            Pattern::escape(&paths.func_dir().to_string_lossy()),
            Pattern::escape(&nordic.task)
        );
        let run = format!("_run-{}", nordic.run);
        for source in glob_sorted(&pattern)? {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().replace(&run, ""))
                .unwrap_or_default();
            stage(self.invoker.locks(), &source, &out.func_dir().join(name), TransferMode::Copy)?;
        }
        Ok(())
    }

    fn link_modalities(&self, paths: &SessionPaths, out: &SessionPaths) -> Result<(), Error> {
        for (target, link) in [
            (paths.anat_dir(), out.anat_dir()),
            (paths.fmap_dir(), out.fmap_dir()),
        ] {
            if target.is_dir() && !fsutil::present(&link) {
                let target = fs::canonicalize(&target)?;
                fsutil::link_or_copy(&target, &link)?;
            }
        }
        Ok(())
    }

    /// Top-level files a BIDS dataset needs.
    fn copy_dataset_files(&self, dataset: &Path) -> Result<(), Error> {
        let root = &self.config.root;
        let registry = self.config.registry_path();
        for source in [
            root.join("dataset_description.json"),
            registry,
            root.join("README"),
        ] {
            if !source.is_file() {
                continue;
            }
            if let Some(name) = source.file_name() {
                stage(self.invoker.locks(), &source, &dataset.join(name), TransferMode::Copy)?;
            }
        }
        Ok(())
    }

    fn remove_components(&self, paths: &SessionPaths) -> Result<(), Error> {
        let func = Pattern::escape(&paths.func_dir().to_string_lossy());
        for part in ["real", "imag", "phase"] {
            for path in glob_sorted(&format!("{}/*part-{}*", func, part))? {
                debug!("removing {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_header::tests::write_header;
    use crate::tools::{Executor, Invocation, ToolOutput};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Stands in for FSL and the engine, producing headers with the volume
    /// counts the real tools would.
    #[derive(Default)]
    struct FakeTools {
        calls: Mutex<Vec<ToolSpec>>,
    }

    fn write_gz_header(path: &Path, dims: &[u16]) {
        let plain = path.with_extension("plain");
        write_header(&plain, dims);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&fs::read(&plain).unwrap()).unwrap();
        fs::write(path, encoder.finish().unwrap()).unwrap();
        fs::remove_file(plain).unwrap();
    }

    impl Executor for FakeTools {
        fn execute(&self, spec: &ToolSpec) -> Result<ToolOutput, Error> {
            self.calls.lock().unwrap().push(spec.clone());
            match &spec.invocation {
                Invocation::Engine(_) => write_header(&spec.outputs[0], &[4, 4, 2, 31]),
                Invocation::Process { program, args } if program == "fslroi" => {
                    if args[1].ends_with(".gz") {
                        write_gz_header(Path::new(&args[1]), &[4, 4, 2, 30]);
                    }
                }
                _ => {}
            }
            for output in &spec.outputs {
                if !output.exists() {
                    fs::write(output, b"").unwrap();
                }
            }
            Ok(ToolOutput::default())
        }
    }

    impl FakeTools {
        fn count(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|s| s.name == name).count()
        }
    }

    fn session_tree(root: &Path) -> SessionPaths {
        let paths = SessionPaths::new(root, "M001", 1);
        let func = paths.func_dir();
        for part in ["mag", "phase", "real", "imag"] {
            let stem = format!("sub-M001_ses-1_task-restingState_run-1_part-{}_bold", part);
            write_header(&func.join(format!("{}.nii", stem)), &[4, 4, 2, 31]);
        }
        fs::write(
            func.join("sub-M001_ses-1_task-restingState_run-1_part-mag_bold.json"),
            br#"{"TaskName": "restingState"}"#,
        )
        .unwrap();
        fs::create_dir_all(paths.anat_dir()).unwrap();
        fs::write(root.join("dataset_description.json"), b"{}").unwrap();
        fs::write(root.join("participants.json"), b"{}").unwrap();
        paths
    }

    #[test]
    fn test_variant_names() {
        let names: Vec<String> = NordicVariant::all().iter().map(|v| v.to_string()).collect();
        assert_eq!(names.len(), 8);
        assert_eq!(names[0], "NORDIC_mag-meas_phase-meas_noise-vol");
        assert_eq!(names[7], "NORDIC_mag-calc_phase-calc_noise-est");
    }

    #[test]
    fn test_denoise_builds_every_variant_once() {
        let tmp = tempdir().unwrap();
        let paths = session_tree(tmp.path());
        let config = AppConfig::for_root(tmp.path());
        let tools = Arc::new(FakeTools::default());
        let invoker = ToolInvoker::new(tools.clone(), &config.tools);
        let denoiser = Denoiser::new(&config, &invoker);

        let report = denoiser
            .denoise_session("M001", 1, &Overwrite::default())
            .unwrap()
            .unwrap();
        assert_eq!(report.computed.len(), 8);
        assert_eq!(tools.count(NORDIC_ROUTINE), 8);

        let func = paths.func_dir();
        assert!(func.join("sub-M001_ses-1_task-restingState_acq-meas_part-mag_bold.nii").is_file());
        assert!(!func.join("sub-M001_ses-1_task-restingState_run-1_part-mag_bold.nii").exists());
        assert!(func.join("sub-M001_ses-1_task-restingState_acq-calc_part-phase_bold.nii.gz").is_file());
        assert!(!func.join("sub-M001_ses-1_task-restingState_run-1_part-complex_bold.nii.gz").exists());

        let variant = tmp.path().join("derivatives/NORDIC_mag-meas_phase-calc_noise-vol");
        let out_func = variant.join("sub-M001/ses-1/func");
        let corrected = out_func.join("sub-M001_ses-1_task-restingState_part-mag_bold.nii");
        assert_eq!(nifti_header::volume_count(&corrected).unwrap(), 30);
        assert!(out_func.join("sub-M001_ses-1_task-restingState_part-mag_bold.json").is_file());
        assert!(glob_sorted(&format!("{}/*_acq-*", out_func.display())).unwrap().is_empty());
        assert!(variant.join("sub-M001/ses-1/anat").exists());
        assert!(variant.join("dataset_description.json").is_file());
        assert!(variant.join("participants.json").is_file());

        let calls = tools.calls.lock().unwrap();
        let vol_call = calls
            .iter()
            .find_map(|s| match &s.invocation {
                Invocation::Engine(call) if s.outputs[0] == corrected => Some(call.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(vol_call.params.get("noise_volume_last"), Some(&1.0));
        assert_eq!(vol_call.params.get("use_magn_for_gfactor"), Some(&1.0));
        assert_eq!(vol_call.params.get("phase_filter_width"), Some(&10.0));
        drop(calls);

        let again = denoiser
            .denoise_session("M001", 1, &Overwrite::default())
            .unwrap()
            .unwrap();
        assert!(again.computed.is_empty());
        assert_eq!(tools.count(NORDIC_ROUTINE), 8);
    }

    #[test]
    fn test_session_without_task_run_is_skipped() {
        let tmp = tempdir().unwrap();
        let config = AppConfig::for_root(tmp.path());
        let invoker = ToolInvoker::new(Arc::new(FakeTools::default()), &config.tools);
        let report = Denoiser::new(&config, &invoker)
            .denoise_session("M001", 1, &Overwrite::default())
            .unwrap();
        assert!(report.is_none());
    }
}
