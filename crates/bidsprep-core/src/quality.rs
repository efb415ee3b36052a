//! MRIQC over the raw dataset and every derivative dataset.

use crate::config::{AppConfig, Overwrite};
use crate::error::Error;
use crate::tools::nipreps::{self, BidsApp, QcLevel};
use crate::tools::{ToolInvoker, ToolSpec};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct QualityControl<'a> {
    config: &'a AppConfig,
    invoker: &'a ToolInvoker,
}

impl<'a> QualityControl<'a> {
    pub fn new(config: &'a AppConfig, invoker: &'a ToolInvoker) -> Self {
        Self { config, invoker }
    }

    /// The study root plus every non-excluded derivative that is itself a
    /// BIDS dataset (has `dataset_description.json`), in name order.
    pub fn datasets(&self) -> Result<Vec<PathBuf>, Error> {
        let mut datasets = vec![self.config.root.clone()];
        let derivatives = self.config.derivatives_dir();
        if !derivatives.is_dir() {
            return Ok(datasets);
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&derivatives)? {
            let path = entry?.path();
            let name = entry_name(&path);
            if !self.config.is_excluded_derivative(&name)
                && path.join("dataset_description.json").is_file()
            {
                found.push(path);
            }
        }
        found.sort();
        datasets.extend(found);
        Ok(datasets)
    }

    fn app(&self, dataset: &Path, work: &str) -> BidsApp {
        let derivatives = dataset.join("derivatives");
        BidsApp {
            input: dataset.to_path_buf(),
            output: derivatives.join(format!("mriqc-{}", self.config.container.mriqc_version)),
            work: derivatives.join("mriqc-work").join(work),
        }
    }

    /// Participant-level QC of `subject` in every dataset. Returns the datasets
    /// where MRIQC actually ran, which need a fresh group report.
    pub fn participant(&self, subject: &str, overwrite: &Overwrite) -> Result<BTreeSet<PathBuf>, Error> {
        let mut ran = BTreeSet::new();
        for dataset in self.datasets()? {
            let app = self.app(&dataset, &format!("sub-{}", subject));
            let spec = nipreps::mriqc(
                &self.config.container,
                &app,
                &QcLevel::Participant(subject.to_string()),
                self.config.n_procs,
            );
            if self.run_in(spec, &app.work, overwrite)? {
                info!("MRIQC sub-{} in {}", subject, dataset.display());
                ran.insert(dataset);
            }
        }
        Ok(ran)
    }

    /// Group-level reports; datasets in `refreshed` are rebuilt even if a
    /// report exists.
    pub fn group(&self, refreshed: &BTreeSet<PathBuf>, overwrite: &Overwrite) -> Result<usize, Error> {
        let mut built = 0;
        for dataset in self.datasets()? {
            let app = self.app(&dataset, "group");
            if !app.output.is_dir() {
                debug!("no MRIQC output in {}", dataset.display());
                continue;
            }
            let force = Overwrite::Flag(true);
            let overwrite = if refreshed.contains(&dataset) {
                &force
            } else {
                overwrite
            };
            let spec = nipreps::mriqc(&self.config.container, &app, &QcLevel::Group, self.config.n_procs);
            if self.run_in(spec, &app.work, overwrite)? {
                built += 1;
            }
        }
        Ok(built)
    }

    /// Run `spec` with fresh scratch space at `work`. The scratch directory
    /// is left alone when the reports are current.
    fn run_in(&self, spec: ToolSpec, work: &Path, overwrite: &Overwrite) -> Result<bool, Error> {
        if spec.is_current(overwrite) {
            debug!("{} reports are current", spec.name);
            return Ok(false);
        }
        prepare_work(work)?;
        let invoked = self.invoker.invoke(spec, overwrite);
        clean_work(work);
        Ok(invoked?.ran())
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Scratch space starts empty for every run.
fn prepare_work(work: &Path) -> Result<(), Error> {
    if work.is_dir() {
        fs::remove_dir_all(work)?;
    }
    fs::create_dir_all(work)?;
    Ok(())
}

fn clean_work(work: &Path) {
    if let Err(e) = fs::remove_dir_all(work) {
        warn!("could not remove {}: {}", work.display(), e);
    }
}
