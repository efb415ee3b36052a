use crate::error::Error;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Study root holding `participants.json`, `sourcedata/` and the BIDS tree.
    pub root: PathBuf,
    #[serde(default = "default_registry")]
    pub registry: PathBuf,
    /// FreeSurfer `SUBJECTS_DIR`; falls back to the environment variable.
    #[serde(default)]
    pub subjects_dir: Option<PathBuf>,
    /// FSL installation; falls back to `FSLDIR`.
    #[serde(default)]
    pub fsl_dir: Option<PathBuf>,
    #[serde(default = "default_n_procs")]
    pub n_procs: usize,
    #[serde(default = "default_one")]
    pub max_parallel_subjects: usize,
    /// Names (or glob patterns) under `derivatives/` that are tool outputs
    /// rather than processing variants.
    #[serde(default = "default_exclude")]
    pub exclude_derivatives: Vec<String>,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub nordic: NordicConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub masks: MasksConfig,
    #[serde(default)]
    pub tsnr: TsnrConfig,
    #[serde(default)]
    pub overwrite: OverwriteConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Deface the anatomical image with `mideface` instead of copying it.
    pub deface_anat: bool,
    /// Token identifying fieldmap acquisitions in raw filenames.
    pub fieldmap_token: String,
    pub slice_order: SliceOrder,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            deface_anat: true,
            fieldmap_token: "B0_shimmed".to_string(),
            slice_order: SliceOrder::Ascending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceOrder {
    Ascending,
    Descending,
    Interleaved,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub timeout_secs: u64,
    /// Per-tool timeout overrides, keyed by tool name.
    pub timeouts: BTreeMap<String, u64>,
    /// Upper bound on container runs in flight at once.
    pub max_containers: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 48 * 60 * 60,
            timeouts: BTreeMap::new(),
            max_containers: 1,
        }
    }
}

impl ToolsConfig {
    pub fn timeout_for(&self, tool: &str) -> Duration {
        let secs = self.timeouts.get(tool).copied().unwrap_or(self.timeout_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub runtime: String,
    pub memory: String,
    pub memory_swap: String,
    pub mem_mb: u64,
    pub mriqc_image: String,
    pub mriqc_version: String,
    pub fmriprep_image: String,
    pub fmriprep_version: String,
    /// FreeSurfer license file name inside the subjects directory.
    pub fs_license: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            memory: "32g".to_string(),
            memory_swap: "64g".to_string(),
            mem_mb: 64000,
            mriqc_image: "nipreps/mriqc".to_string(),
            mriqc_version: "23.1.0".to_string(),
            fmriprep_image: "nipreps/fmriprep".to_string(),
            fmriprep_version: "23.0.2".to_string(),
            fs_license: "license.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NordicConfig {
    pub task: String,
    pub run: u32,
    /// Volumes in the timeseries excluding the trailing noise volume.
    pub signal_volumes: u16,
    /// Repetition time written back after trimming the noise volume.
    pub repetition_time: f64,
    pub phase_filter_width: f64,
    /// Program used to host the NORDIC routine.
    pub engine: String,
    /// Directory holding `NIFTI_NORDIC.m`.
    pub source_dir: PathBuf,
    /// Delete real/imaginary/phase images from the session once all variants exist.
    pub remove_components: bool,
}

impl Default for NordicConfig {
    fn default() -> Self {
        Self {
            task: "restingState".to_string(),
            run: 1,
            signal_volumes: 30,
            repetition_time: 4.217,
            phase_filter_width: 10.0,
            engine: "matlab".to_string(),
            source_dir: PathBuf::from("NORDIC_Raw"),
            remove_components: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub dof_func: u8,
    pub dof_standard: u8,
    /// Template name under `$FSLDIR/data/standard`.
    pub standard: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            dof_func: 6,
            dof_standard: 12,
            standard: "MNI152_T1_2mm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MasksConfig {
    pub regions: Vec<String>,
    /// Standard-space region masks, searched recursively for `<region>.nii.gz`.
    pub standard_dir: PathBuf,
}

impl Default for MasksConfig {
    fn default() -> Self {
        Self {
            regions: vec!["V1".to_string()],
            standard_dir: PathBuf::from("masks"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TsnrConfig {
    pub task: String,
    /// Session whose functional data is measured.
    pub session: usize,
    pub region: String,
    pub bptf_sigma: f64,
    pub steps: Vec<PostStep>,
}

impl Default for TsnrConfig {
    fn default() -> Self {
        Self {
            task: "restingState".to_string(),
            session: 1,
            region: "V1".to_string(),
            bptf_sigma: 15.0,
            steps: PostStep::ALL.to_vec(),
        }
    }
}

/// Post-processing applied before measuring tSNR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStep {
    None,
    Motcor,
    MotcorLtr,
}

impl PostStep {
    pub const ALL: [PostStep; 3] = [PostStep::None, PostStep::Motcor, PostStep::MotcorLtr];

    /// Label written to the `postproc` column.
    pub fn label(self) -> &'static str {
        match self {
            PostStep::None => "no further processing",
            PostStep::Motcor => "after motion correction",
            PostStep::MotcorLtr => "after motion correction and linear trend removal",
        }
    }
}

/// Force-recompute policy for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Overwrite {
    Flag(bool),
    /// File-name patterns of the outputs to recompute.
    Targets(Vec<String>),
}

/// Accepted spellings of [`Overwrite`]. Environment variables arrive as text,
/// so `"true"` is a flag and `"a.mat,*_cortex.nii.gz"` a target list.
#[derive(Deserialize)]
#[serde(untagged)]
enum OverwriteRepr {
    Flag(bool),
    Text(String),
    Targets(Vec<String>),
}

impl<'de> Deserialize<'de> for Overwrite {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match OverwriteRepr::deserialize(deserializer)? {
            OverwriteRepr::Flag(flag) => Overwrite::Flag(flag),
            OverwriteRepr::Targets(targets) => Overwrite::Targets(targets),
            OverwriteRepr::Text(text) => match text.trim() {
                "true" => Overwrite::Flag(true),
                "false" | "" => Overwrite::Flag(false),
                list => Overwrite::Targets(
                    list.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect(),
                ),
            },
        })
    }
}

impl Default for Overwrite {
    fn default() -> Self {
        Overwrite::Flag(false)
    }
}

impl Overwrite {
    pub fn applies_to(&self, output: &Path) -> bool {
        match self {
            Overwrite::Flag(flag) => *flag,
            Overwrite::Targets(targets) => {
                let name = match output.file_name() {
                    Some(name) => name.to_string_lossy(),
                    None => return false,
                };
                targets.iter().any(|target| {
                    target.as_str() == name
                        || Pattern::new(target)
                            .map(|p| p.matches(&name))
                            .unwrap_or(false)
                })
            }
        }
    }

    pub fn any(&self, outputs: &[PathBuf]) -> bool {
        outputs.iter().any(|o| self.applies_to(o))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OverwriteConfig {
    pub denoise: Overwrite,
    pub quality: Overwrite,
    pub anat: Overwrite,
    pub registration: Overwrite,
    pub masks: Overwrite,
    pub tsnr: Overwrite,
}

fn default_registry() -> PathBuf {
    PathBuf::from("participants.json")
}

fn default_exclude() -> Vec<String> {
    ["mriqc*", "fmriprep*", "registration", "ROIs", "tSNR"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_n_procs() -> usize {
    8
}

fn default_one() -> usize {
    1
}

impl AppConfig {
    /// Configuration for a study rooted at `root` with every other value defaulted.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: default_registry(),
            subjects_dir: None,
            fsl_dir: None,
            n_procs: default_n_procs(),
            max_parallel_subjects: default_one(),
            exclude_derivatives: default_exclude(),
            staging: StagingConfig::default(),
            tools: ToolsConfig::default(),
            container: ContainerConfig::default(),
            nordic: NordicConfig::default(),
            registration: RegistrationConfig::default(),
            masks: MasksConfig::default(),
            tsnr: TsnrConfig::default(),
            overwrite: OverwriteConfig::default(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(&self.registry)
    }

    pub fn derivatives_dir(&self) -> PathBuf {
        self.root.join("derivatives")
    }

    pub fn freesurfer_subjects_dir(&self) -> Result<PathBuf, Error> {
        self.subjects_dir
            .clone()
            .or_else(|| env::var_os("SUBJECTS_DIR").map(PathBuf::from))
            .ok_or_else(|| Error::Other("subjects_dir is not configured and SUBJECTS_DIR is unset".into()))
    }

    pub fn fsl_home(&self) -> Result<PathBuf, Error> {
        self.fsl_dir
            .clone()
            .or_else(|| env::var_os("FSLDIR").map(PathBuf::from))
            .ok_or_else(|| Error::Other("fsl_dir is not configured and FSLDIR is unset".into()))
    }

    /// Whether `derivatives/<name>` holds tool output rather than a processing variant.
    pub fn is_excluded_derivative(&self, name: &str) -> bool {
        self.exclude_derivatives.iter().any(|pattern| {
            pattern == name
                || Pattern::new(pattern)
                    .map(|p| p.matches(name))
                    .unwrap_or(false)
        })
    }

    /// Resolve a configured path against the study root unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Layer `Pipeline.toml` (or `file`), then `BIDSPREP__*` environment variables,
/// then an explicit root override. List-valued keys take comma-separated
/// values from the environment.
pub fn load_configuration(
    file: Option<&Path>,
    root: Option<&Path>,
) -> Result<AppConfig, ConfigError> {
    let file_source = match file {
        Some(path) => ConfigFile::from(path).required(true),
        None => ConfigFile::with_name("Pipeline").required(false),
    };
    let builder = Config::builder()
        .add_source(file_source)
        .add_source(
            Environment::with_prefix("BIDSPREP")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("exclude_derivatives")
                .with_list_parse_key("masks.regions")
                .with_list_parse_key("tsnr.steps"),
        )
        .set_override_option("root", root.map(|r| r.to_string_lossy().into_owned()))?
        .build()?;
    builder.try_deserialize::<AppConfig>()
}
