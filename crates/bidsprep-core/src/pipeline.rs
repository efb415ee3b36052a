use crate::anat::AnatomicalPreprocessor;
use crate::config::{AppConfig, Overwrite};
use crate::denoise::Denoiser;
use crate::error::Error;
use crate::masks::MaskBuilder;
use crate::progress::{ProgressReporter, SilentReporter};
use crate::quality::QualityControl;
use crate::registration::Registration;
use crate::registry::{Registry, Subject};
use crate::staging::session::SessionStager;
use crate::tools::engine::MatlabEngine;
use crate::tools::process::SystemExecutor;
use crate::tools::{Executor, ToolInvoker};
use crate::tsnr::TsnrAggregator;
use chrono::{DateTime, Local};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Staging,
    Denoise,
    Quality,
    Anat,
    Registration,
    Masks,
    Tsnr,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Staging,
        Stage::Denoise,
        Stage::Quality,
        Stage::Anat,
        Stage::Registration,
        Stage::Masks,
        Stage::Tsnr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Staging => "stage",
            Stage::Denoise => "denoise",
            Stage::Quality => "quality",
            Stage::Anat => "anat",
            Stage::Registration => "register",
            Stage::Masks => "masks",
            Stage::Tsnr => "tsnr",
        }
    }

    fn overwrite(self, config: &AppConfig) -> Overwrite {
        let overwrite = &config.overwrite;
        match self {
            Stage::Staging => Overwrite::default(),
            Stage::Denoise => overwrite.denoise.clone(),
            Stage::Quality => overwrite.quality.clone(),
            Stage::Anat => overwrite.anat.clone(),
            Stage::Registration => overwrite.registration.clone(),
            Stage::Masks => overwrite.masks.clone(),
            Stage::Tsnr => overwrite.tsnr.clone(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| Error::Other(format!("unknown stage '{}'", s)))
    }
}

/// A stage that failed for one subject (and session, where the stage is
/// per session). A failed session skips its later per-session stages; a
/// failed subject-level stage ends the subject.
#[derive(Debug)]
pub struct SubjectFailure {
    pub subject: String,
    pub session: Option<usize>,
    pub stage: Stage,
    pub error: Error,
}

impl fmt::Display for SubjectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.subject)?;
        if let Some(session) = self.session {
            write!(f, " ses-{}", session)?;
        }
        write!(f, " [{}] {}: {}", self.stage, self.error.kind(), self.error)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub started_at: DateTime<Local>,
    pub duration: Duration,
    pub subjects: usize,
    pub failures: Vec<SubjectFailure>,
    /// Rows added to result tables.
    pub tsnr_rows: usize,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct SubjectOutcome {
    tsnr_rows: usize,
    /// Datasets whose MRIQC participant run happened for this subject.
    qc_refreshed: BTreeSet<PathBuf>,
    failures: Vec<SubjectFailure>,
}

pub struct Pipeline {
    config: AppConfig,
    invoker: ToolInvoker,
    reporter: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(config: AppConfig, executor: Arc<dyn Executor>) -> Self {
        let invoker = ToolInvoker::new(executor, &config.tools);
        Self {
            config,
            invoker,
            reporter: Arc::new(SilentReporter),
        }
    }

    /// Host processes and containers, with the configured engine for NORDIC.
    pub fn system(config: AppConfig) -> Self {
        let engine = Arc::new(MatlabEngine::new(&config.nordic.engine));
        Self::new(config, Arc::new(SystemExecutor::new(engine)))
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.invoker = self.invoker.with_reporter(reporter.clone());
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    /// Run `stages` (in pipeline order, whatever order they are given in) for
    /// every subject of `registry`. Subject failures are collected, not raised.
    pub fn run(&self, registry: &Registry, stages: &[Stage]) -> Result<RunReport, Error> {
        let started_at = Local::now();
        let start = Instant::now();
        let stages: BTreeSet<Stage> = stages.iter().copied().collect();
        let subjects = registry.subjects();
        info!(
            "Running {} for {} subject(s)",
            stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(", "),
            subjects.len()
        );
        self.reporter.on_run_start(subjects.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_parallel_subjects.max(1))
            .build()
            .map_err(|e| Error::Other(format!("cannot build subject pool: {}", e)))?;
        let results: Vec<SubjectOutcome> = pool.install(|| {
            subjects
                .par_iter()
                .map(|subject| {
                    self.reporter.on_subject_start(&subject.id);
                    let outcome = self.run_subject(subject, &stages);
                    self.reporter
                        .on_subject_complete(&subject.id, outcome.failures.is_empty());
                    outcome
                })
                .collect()
        });

        let mut failures = Vec::new();
        let mut tsnr_rows = 0;
        let mut qc_refreshed = BTreeSet::new();
        for outcome in results {
            tsnr_rows += outcome.tsnr_rows;
            qc_refreshed.extend(outcome.qc_refreshed);
            for failure in outcome.failures {
                error!("{}", failure);
                failures.push(failure);
            }
        }

        if stages.contains(&Stage::Quality) && !subjects.is_empty() {
            let qc = QualityControl::new(&self.config, &self.invoker);
            if let Err(e) = qc.group(&qc_refreshed, &Stage::Quality.overwrite(&self.config)) {
                let failure = SubjectFailure {
                    subject: "group".to_string(),
                    session: None,
                    stage: Stage::Quality,
                    error: e,
                };
                error!("{}", failure);
                failures.push(failure);
            }
        }

        let duration = start.elapsed();
        self.reporter
            .on_run_complete(failures.len(), duration.as_secs_f64());
        Ok(RunReport {
            started_at,
            duration,
            subjects: subjects.len(),
            failures,
            tsnr_rows,
        })
    }

    fn run_subject(&self, subject: &Subject, stages: &BTreeSet<Stage>) -> SubjectOutcome {
        let id = subject.id.as_str();
        let mut outcome = SubjectOutcome::default();
        let fail = |stage: Stage, session: Option<usize>, error: Error| SubjectFailure {
            subject: id.to_string(),
            session,
            stage,
            error,
        };
        // sessions with a failed per-session stage
        let mut failed: BTreeSet<usize> = BTreeSet::new();

        for &stage in stages {
            if !subject.sessions.is_empty() && failed.len() == subject.sessions.len() {
                debug!("sub-{}: every session failed, skipping {}", id, stage);
                break;
            }
            self.reporter.on_stage_start(id, stage.name());
            let overwrite = stage.overwrite(&self.config);
            let result = match stage {
                Stage::Staging => {
                    let stager = SessionStager::new(&self.config, &self.invoker);
                    for session in &subject.sessions {
                        if let Err(e) = stager.stage_session(id, session) {
                            failed.insert(session.number);
                            outcome.failures.push(fail(stage, Some(session.number), e));
                        }
                    }
                    Ok(())
                }
                Stage::Denoise => {
                    let denoiser = Denoiser::new(&self.config, &self.invoker);
                    let healthy: Vec<usize> = subject
                        .sessions
                        .iter()
                        .map(|s| s.number)
                        .filter(|n| !failed.contains(n))
                        .collect();
                    for session in healthy {
                        if let Err(e) = denoiser.denoise_session(id, session, &overwrite) {
                            failed.insert(session);
                            outcome.failures.push(fail(stage, Some(session), e));
                        }
                    }
                    Ok(())
                }
                Stage::Quality => QualityControl::new(&self.config, &self.invoker)
                    .participant(id, &overwrite)
                    .map(|refreshed| outcome.qc_refreshed = refreshed)
                    .map_err(|e| fail(stage, None, e)),
                Stage::Anat => AnatomicalPreprocessor::new(&self.config, &self.invoker)
                    .run(id, &overwrite)
                    .map_err(|e| fail(stage, None, e)),
                Stage::Registration => {
                    let session = subject.sessions.first().map(|s| s.number).unwrap_or(1);
                    if failed.contains(&session) {
                        debug!("sub-{} ses-{} failed earlier, skipping registration", id, session);
                        Ok(())
                    } else {
                        Registration::new(&self.config, &self.invoker)
                            .run(id, session, &overwrite)
                            .map(|_| ())
                            .map_err(|e| fail(stage, Some(session), e))
                    }
                }
                Stage::Masks => MaskBuilder::new(&self.config, &self.invoker)
                    .run(id, &overwrite)
                    .map(|_| ())
                    .map_err(|e| fail(stage, None, e)),
                Stage::Tsnr => {
                    let session = self.config.tsnr.session;
                    if failed.contains(&session) {
                        debug!("sub-{} ses-{} failed earlier, skipping tsnr", id, session);
                        Ok(())
                    } else {
                        TsnrAggregator::new(&self.config, &self.invoker)
                            .run(id, &overwrite)
                            .map(|report| outcome.tsnr_rows = report.appended)
                            .map_err(|e| fail(stage, Some(session), e))
                    }
                }
            };
            if let Err(failure) = result {
                outcome.failures.push(failure);
                break;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::Recorder;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.name().parse::<Stage>().unwrap(), stage);
        }
        assert!("nordic".parse::<Stage>().is_err());
    }

    #[test]
    fn test_failure_is_recorded_and_run_continues() {
        let tmp = tempdir().unwrap();
        let raw = tmp.path().join("sourcedata/sub-B02/ses-1/raw_data");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("t1_S2.03_mprage.nii"), b"").unwrap();
        fs::write(raw.join("t1_S2.03_mprage.json"), b"{}").unwrap();
        let registry = Registry::from_json(
            r#"{"A01": {"s1": {"sessID": "S1", "anat": 3}},
                "B02": {"s1": {"sessID": "S2", "anat": 3}}}"#,
        )
        .unwrap();

        let mut config = AppConfig::for_root(tmp.path());
        config.staging.deface_anat = false;
        let pipeline = Pipeline::new(config, Arc::new(Recorder::default()));
        let report = pipeline.run(&registry, &[Stage::Staging]).unwrap();

        assert_eq!(report.subjects, 2);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.subject, "A01");
        assert_eq!(failure.session, Some(1));
        assert_eq!(failure.stage, Stage::Staging);
        assert_eq!(failure.error.kind(), "AmbiguousOrMissingSource");
        assert!(tmp.path().join("sub-B02/ses-1/anat/sub-B02_ses-1_T1w.nii").is_file());
    }

    #[test]
    fn test_failed_session_does_not_stop_later_sessions() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("sourcedata/sub-A01/ses-1/raw_data")).unwrap();
        let raw = tmp.path().join("sourcedata/sub-A01/ses-2/raw_data");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("t1_S2.03_mprage.nii"), b"").unwrap();
        fs::write(raw.join("t1_S2.03_mprage.json"), b"{}").unwrap();
        let registry = Registry::from_json(
            r#"{"A01": {"s1": {"sessID": "S1", "anat": 3},
                        "s2": {"sessID": "S2", "anat": 3}}}"#,
        )
        .unwrap();

        let mut config = AppConfig::for_root(tmp.path());
        config.staging.deface_anat = false;
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(config, recorder.clone());
        let report = pipeline
            .run(&registry, &[Stage::Registration, Stage::Staging])
            .unwrap();

        // registration targets the first session, which failed to stage
        assert!(recorder.names().is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subject, "A01");
        assert_eq!(report.failures[0].stage, Stage::Staging);
        assert_eq!(report.failures[0].session, Some(1));
        assert!(tmp.path().join("sub-A01/ses-2/anat/sub-A01_ses-2_T1w.nii").is_file());
        assert!(!tmp.path().join("sub-A01/ses-1/anat").exists());
    }
}
