//! Temporal SNR of every processing variant inside a region mask.
//!
//! Each variant's timeseries is linked into `derivatives/tSNR/sub-<S>/<variant>`,
//! optionally motion corrected and detrended, reduced to a tSNR map
//! (`Tmean / Tstd`), and summarized by the mean and standard deviation inside
//! the region mask. Rows already in the result table are not recomputed.

pub mod table;

use crate::config::{AppConfig, Overwrite, PostStep};
use crate::error::Error;
use crate::fsutil;
use crate::masks;
use crate::naming::{exactly_one, glob_sorted, SessionPaths};
use crate::nifti_header::derived;
use crate::tools::fsl::{self, Stat};
use crate::tools::ToolInvoker;
use glob::Pattern;
use std::fs;
use std::path::{Path, PathBuf};
use table::{ResultTable, TsnrRow};
use tracing::{debug, info, warn};

pub const RAW_MEASURED: &str = "raw_data_meas";
pub const RAW_CALCULATED: &str = "raw_data_calc";

/// A processing variant and the glob locating its timeseries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
    pub pattern: String,
    /// Baselines read from the session itself and may legitimately be absent.
    pub baseline: bool,
}

impl Variant {
    /// The timeseries, or `None` for an absent baseline.
    pub fn locate(&self) -> Result<Option<PathBuf>, Error> {
        if self.baseline {
            let mut matches = glob_sorted(&self.pattern)?;
            match matches.len() {
                0 => Ok(None),
                1 => Ok(Some(matches.remove(0))),
                _ => Err(Error::AmbiguousOrMissingSource {
                    pattern: self.pattern.clone(),
                    matches,
                }),
            }
        } else {
            exactly_one(&self.pattern).map(Some)
        }
    }
}

/// The two raw baselines followed by every derivative holding this session's
/// functional data, in name order.
pub fn discover_variants(config: &AppConfig, subject: &str) -> Result<Vec<Variant>, Error> {
    let task = Pattern::escape(&config.tsnr.task);
    let session = SessionPaths::new(&config.root, subject, config.tsnr.session);
    let func = Pattern::escape(&session.func_dir().to_string_lossy());
    let mut variants = vec![
        Variant {
            name: RAW_MEASURED.to_string(),
            pattern: format!("{}/*{}*acq-meas*part-mag_bold.nii", func, task),
            baseline: true,
        },
        Variant {
            name: RAW_CALCULATED.to_string(),
            pattern: format!("{}/*{}*acq-calc*part-mag_bold.nii*", func, task),
            baseline: true,
        },
    ];

    let derivatives = config.derivatives_dir();
    if !derivatives.is_dir() {
        return Ok(variants);
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(&derivatives)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if config.is_excluded_derivative(&name) {
            continue;
        }
        if session.in_derivative(&name).func_dir().is_dir() {
            names.push(name);
        }
    }
    names.sort();
    for name in names {
        let func = session.in_derivative(&name).func_dir();
        variants.push(Variant {
            pattern: format!(
                "{}/*{}*bold.nii",
                Pattern::escape(&func.to_string_lossy()),
                task
            ),
            name,
            baseline: false,
        });
    }
    Ok(variants)
}

#[derive(Debug, Clone, Default)]
pub struct TsnrReport {
    pub appended: usize,
    pub table: PathBuf,
    pub text: PathBuf,
}

pub struct TsnrAggregator<'a> {
    config: &'a AppConfig,
    invoker: &'a ToolInvoker,
}

impl<'a> TsnrAggregator<'a> {
    pub fn new(config: &'a AppConfig, invoker: &'a ToolInvoker) -> Self {
        Self { config, invoker }
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.config
            .derivatives_dir()
            .join("tSNR")
            .join(format!("sub-{}", subject))
    }

    pub fn table_path(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject)
            .join(format!("tSNR_{}.csv", self.config.tsnr.region))
    }

    pub fn run(&self, subject: &str, overwrite: &Overwrite) -> Result<TsnrReport, Error> {
        let table_path = self.table_path(subject);
        let mut table = if overwrite.applies_to(&table_path) {
            ResultTable::empty(&table_path)
        } else {
            ResultTable::load(&table_path)?
        };
        let mask = masks::region_mask(&self.config.root, subject, &self.config.tsnr.region);
        if !mask.is_file() {
            return Err(Error::AmbiguousOrMissingSource {
                pattern: mask.to_string_lossy().into_owned(),
                matches: Vec::new(),
            });
        }

        let mut appended = 0;
        for variant in discover_variants(self.config, subject)? {
            let missing: Vec<PostStep> = self
                .config
                .tsnr
                .steps
                .iter()
                .copied()
                .filter(|step| !table.contains(&variant.name, step.label()))
                .collect();
            if missing.is_empty() {
                debug!("{}: already in {}", variant.name, table_path.display());
                continue;
            }
            let Some(series) = variant.locate()? else {
                warn!("{}: no timeseries matching {}", variant.name, variant.pattern);
                continue;
            };

            info!("tSNR | sub-{} | {}", subject, variant.name);
            let linked = self.link_series(&variant.name, &series, subject)?;
            for step in missing {
                let prepared = self.prepare(&linked, step, overwrite)?;
                let (mean, std) = self.measure(&prepared, &mask, overwrite)?;
                table.push(TsnrRow {
                    preproc: variant.name.clone(),
                    postproc: step.label().to_string(),
                    mean,
                    std,
                });
                appended += 1;
            }
            // persisted per variant so a later failure keeps finished rows
            table.save()?;
        }

        if !table_path.is_file() {
            table.save()?;
        }
        let text = table.save_text()?;
        Ok(TsnrReport {
            appended,
            table: table_path,
            text,
        })
    }

    fn link_series(&self, variant: &str, series: &Path, subject: &str) -> Result<PathBuf, Error> {
        let out_dir = self.subject_dir(subject).join(variant);
        let name = series
            .file_name()
            .ok_or_else(|| Error::Other(format!("no file name in {}", series.display())))?;
        let link = out_dir.join(name);
        if !fsutil::present(&link) {
            fsutil::link_or_copy(&fs::canonicalize(series)?, &link)?;
        }
        Ok(link)
    }

    /// The timeseries a step is measured on, produced if missing.
    fn prepare(&self, series: &Path, step: PostStep, overwrite: &Overwrite) -> Result<PathBuf, Error> {
        if step == PostStep::None {
            return Ok(series.to_path_buf());
        }
        let motcor = derived(series, "_motcor");
        self.invoker.invoke(fsl::mcflirt(series, &motcor), overwrite)?;
        if step == PostStep::Motcor {
            return Ok(motcor);
        }

        // the mean is removed by the high-pass filter, add it back
        let motcor_mean = derived(&motcor, "_Tmean");
        let detrended = derived(&motcor, "_ltr");
        self.invoker
            .invoke(fsl::maths(&motcor).tmean().into_spec(&motcor_mean), overwrite)?;
        self.invoker.invoke(
            fsl::maths(&motcor)
                .bptf(self.config.tsnr.bptf_sigma, -1.0)
                .add(&motcor_mean)
                .into_spec(&detrended),
            overwrite,
        )?;
        Ok(detrended)
    }

    fn measure(&self, series: &Path, mask: &Path, overwrite: &Overwrite) -> Result<(f64, f64), Error> {
        let mean = derived(series, "_Tmean");
        let std = derived(series, "_Tstd");
        let tsnr = derived(series, "_tSNR");
        self.invoker
            .invoke(fsl::maths(series).tmean().into_spec(&mean), overwrite)?;
        self.invoker
            .invoke(fsl::maths(series).tstd().into_spec(&std), overwrite)?;
        self.invoker
            .invoke(fsl::maths(&mean).div(&std).into_spec(&tsnr), overwrite)?;

        let mean_in_mask = fsl::parse_stat(&self.invoker.query(fsl::stats(&tsnr, mask, Stat::Mean))?)?;
        let std_in_mask = fsl::parse_stat(&self.invoker.query(fsl::stats(&tsnr, mask, Stat::Std))?)?;
        Ok((mean_in_mask, std_in_mask))
    }
}
