//! Staging of one registry session: raw files into the BIDS tree, then
//! sidecar enrichment in the same pass.

use super::{stage, StageOutcome, TransferMode};
use crate::config::{AppConfig, Overwrite};
use crate::error::Error;
use crate::fsutil;
use crate::metadata::{self, enrich};
use crate::naming::{
    glob_sorted, Component, FieldmapComponent, FileKind, NamingResolver, Resolution, ScanRole,
};
use crate::registry::Session;
use crate::tools::{dcm2niix, freesurfer, ToolInvoker};
use glob::Pattern;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingReport {
    pub transferred: usize,
    pub already_present: usize,
    /// Sidecars that gained at least one key.
    pub enriched: usize,
}

impl StagingReport {
    fn record(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Transferred => self.transferred += 1,
            StageOutcome::AlreadyPresent => self.already_present += 1,
        }
    }
}

pub struct SessionStager<'a> {
    config: &'a AppConfig,
    invoker: &'a ToolInvoker,
    resolver: NamingResolver<'a>,
}

impl<'a> SessionStager<'a> {
    pub fn new(config: &'a AppConfig, invoker: &'a ToolInvoker) -> Self {
        Self {
            config,
            invoker,
            resolver: NamingResolver::new(&config.root, &config.staging.fieldmap_token),
        }
    }

    pub fn stage_session(&self, subject: &str, session: &Session) -> Result<StagingReport, Error> {
        info!(
            "Staging sub-{} ses-{} (scanner session {})",
            subject, session.number, session.entry.scanner_id
        );
        let mode = self.prepare_source(subject, session)?;
        let mut report = StagingReport::default();

        if let Some(scan) = session.entry.anat {
            self.stage_anatomical(subject, session, scan, mode, &mut report)?;
        }
        for (task, scans) in &session.entry.func {
            for (idx, scan) in scans.iter().enumerate() {
                self.stage_functional(subject, session, task, idx as u32 + 1, *scan, mode, &mut report)?;
            }
        }
        // fieldmaps last: IntendedFor lists the images staged above
        for (label, scan) in &session.entry.fmap {
            self.stage_fieldmap(subject, session, label, *scan, mode, &mut report)?;
        }

        debug!(
            "sub-{} ses-{}: {} transferred, {} present, {} sidecars enriched",
            subject, session.number, report.transferred, report.already_present, report.enriched
        );
        Ok(report)
    }

    /// Convert a DICOM export once; its outputs are then moved rather than copied.
    /// A session whose images are all staged is not converted again.
    fn prepare_source(&self, subject: &str, session: &Session) -> Result<TransferMode, Error> {
        let has_dicom = self.resolver.has_dicom(subject, session.number)?;
        if has_dicom {
            let source_dir = self.resolver.session(subject, session.number).source_dir();
            let converted = glob_sorted(&format!(
                "{}/*.nii",
                Pattern::escape(&source_dir.to_string_lossy())
            ))?;
            if converted.is_empty() {
                if self.images_staged(subject, session) {
                    debug!("sub-{} ses-{} already staged, skipping dcm2niix", subject, session.number);
                } else {
                    self.invoker
                        .invoke(dcm2niix::convert_dir(&source_dir), &Overwrite::default())?;
                }
            }
        }
        Ok(TransferMode::for_source(has_dicom))
    }

    /// Whether the anatomical, magnitude run and fieldmap images of `session`
    /// are all in the BIDS tree.
    fn images_staged(&self, subject: &str, session: &Session) -> bool {
        let entry = &session.entry;
        let mut roles: Vec<ScanRole> = entry
            .anat
            .map(|scan| ScanRole::Anatomical { scan })
            .into_iter()
            .collect();
        for (task, scans) in &entry.func {
            for (idx, scan) in scans.iter().enumerate() {
                roles.push(ScanRole::Functional {
                    task: task.clone(),
                    run: idx as u32 + 1,
                    scan: *scan,
                    component: Component::Mag,
                });
            }
        }
        for (label, scan) in &entry.fmap {
            for component in FieldmapComponent::ALL {
                roles.push(ScanRole::Fieldmap {
                    label: label.clone(),
                    scan: *scan,
                    component,
                });
            }
        }
        roles
            .iter()
            .all(|role| fsutil::present(&self.resolve(subject, session, role, FileKind::Image).dest))
    }

    fn resolve(&self, subject: &str, session: &Session, role: &ScanRole, kind: FileKind) -> Resolution {
        self.resolver
            .resolve(subject, session.number, &session.entry.scanner_id, role, kind)
    }

    fn stage_anatomical(
        &self,
        subject: &str,
        session: &Session,
        scan: u32,
        mode: TransferMode,
        report: &mut StagingReport,
    ) -> Result<(), Error> {
        let role = ScanRole::Anatomical { scan };
        for kind in FileKind::ALL {
            let resolution = self.resolve(subject, session, &role, kind);
            if fsutil::present(&resolution.dest) {
                report.record(StageOutcome::AlreadyPresent);
                continue;
            }
            let Some(source) = resolution.locate()? else {
                continue;
            };
            if kind == FileKind::Image && self.config.staging.deface_anat {
                let ran = self
                    .invoker
                    .invoke(freesurfer::mideface(&source, &resolution.dest), &Overwrite::default())?
                    .ran();
                report.record(if ran {
                    StageOutcome::Transferred
                } else {
                    StageOutcome::AlreadyPresent
                });
            } else {
                report.record(stage(self.invoker.locks(), &source, &resolution.dest, mode)?);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_functional(
        &self,
        subject: &str,
        session: &Session,
        task: &str,
        run: u32,
        scan: u32,
        mode: TransferMode,
        report: &mut StagingReport,
    ) -> Result<(), Error> {
        for component in Component::ALL {
            let role = ScanRole::Functional {
                task: task.to_string(),
                run,
                scan,
                component,
            };
            let mut sidecar: Option<PathBuf> = None;
            for kind in FileKind::ALL {
                let resolution = self.resolve(subject, session, &role, kind);
                if fsutil::present(&resolution.dest) {
                    report.record(StageOutcome::AlreadyPresent);
                    if kind == FileKind::Metadata {
                        sidecar = Some(resolution.dest);
                    }
                    continue;
                }
                match resolution.locate()? {
                    Some(source) => {
                        report.record(stage(self.invoker.locks(), &source, &resolution.dest, mode)?);
                        if kind == FileKind::Metadata {
                            sidecar = Some(resolution.dest);
                        }
                    }
                    None => debug!("no raw {} file for '{}'", kind.extension(), resolution.pattern),
                }
            }
            if let Some(sidecar) = sidecar {
                let rules = metadata::functional_rules(task, self.config.staging.slice_order);
                if !enrich(self.invoker.locks(), &sidecar, &rules)?.added.is_empty() {
                    report.enriched += 1;
                }
            }
        }
        Ok(())
    }

    fn stage_fieldmap(
        &self,
        subject: &str,
        session: &Session,
        label: &str,
        scan: u32,
        mode: TransferMode,
        report: &mut StagingReport,
    ) -> Result<(), Error> {
        let paths = self.resolver.session(subject, session.number);
        for component in FieldmapComponent::ALL {
            let role = ScanRole::Fieldmap {
                label: label.to_string(),
                scan,
                component,
            };
            let mut sidecar = None;
            for kind in FileKind::ALL {
                let resolution = self.resolve(subject, session, &role, kind);
                if fsutil::present(&resolution.dest) {
                    report.record(StageOutcome::AlreadyPresent);
                    if kind == FileKind::Metadata {
                        sidecar = Some(resolution.dest);
                    }
                    continue;
                }
                if let Some(source) = resolution.locate()? {
                    report.record(stage(self.invoker.locks(), &source, &resolution.dest, mode)?);
                    if kind == FileKind::Metadata {
                        sidecar = Some(resolution.dest);
                    }
                }
            }
            if let Some(sidecar) = sidecar {
                let rules =
                    metadata::fieldmap_rules(&paths, component == FieldmapComponent::Fieldmap);
                if !enrich(self.invoker.locks(), &sidecar, &rules)?.added.is_empty() {
                    report.enriched += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::tools::tests::Recorder;
    use crate::tools::{Executor, ToolOutput, ToolSpec};
    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn raw_session(root: &Path) {
        let raw = root.join("sourcedata/sub-M001/ses-1/raw_data");
        let bold = json!({
            "RepetitionTime": 2.0,
            "NumberOfSlices": 4,
            "EstimatedTotalReadoutTime": 0.031
        });
        write(&raw.join("T1_X9.03_mprage.nii"), b"t1");
        write(&raw.join("T1_X9.03_mprage.json"), b"{}");
        for suffix in ["01", "01_ph"] {
            write(&raw.join(format!("rest_X9.05_{}.nii", suffix)), b"img");
            write(
                &raw.join(format!("rest_X9.05_{}.json", suffix)),
                bold.to_string().as_bytes(),
            );
        }
        for echo in [1, 2] {
            write(&raw.join(format!("fm_X9.07_B0_shimmed_e{}.nii", echo)), b"fm");
            write(&raw.join(format!("fm_X9.07_B0_shimmed_e{}.json", echo)), b"{}");
        }
    }

    /// Writes the converted T1w pair next to the DICOM files.
    struct Converter {
        raw: PathBuf,
        calls: Mutex<usize>,
    }

    impl Executor for Converter {
        fn execute(&self, spec: &ToolSpec) -> Result<ToolOutput, Error> {
            assert_eq!(spec.name, "dcm2niix");
            *self.calls.lock().unwrap() += 1;
            write(&self.raw.join("T1_X9.03_mprage.nii"), b"t1");
            write(&self.raw.join("T1_X9.03_mprage.json"), b"{}");
            Ok(ToolOutput::default())
        }
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn session() -> Session {
        let registry = Registry::from_json(
            r#"{"M001": {"s1": {"sessID": "X9", "anat": 3,
                "func": {"rest": [5]}, "fmap": {"b0": 7}}}}"#,
        )
        .unwrap();
        registry.subjects()[0].sessions[0].clone()
    }

    #[test]
    fn test_stage_session_copies_and_enriches() {
        let tmp = tempdir().unwrap();
        raw_session(tmp.path());
        let mut config = AppConfig::for_root(tmp.path());
        config.staging.deface_anat = false;
        let recorder = Arc::new(Recorder::default());
        let invoker = ToolInvoker::new(recorder.clone(), &config.tools);
        let stager = SessionStager::new(&config, &invoker);

        let report = stager.stage_session("M001", &session()).unwrap();
        // T1w pair, mag and phase pairs, two fieldmap pairs
        assert_eq!(report.transferred, 10);
        assert_eq!(report.enriched, 4);
        assert!(recorder.names().is_empty());

        let ses = tmp.path().join("sub-M001/ses-1");
        assert!(ses.join("anat/sub-M001_ses-1_T1w.nii").is_file());
        let bold: Value = serde_json::from_slice(
            &fs::read(ses.join("func/sub-M001_ses-1_task-rest_run-1_part-mag_bold.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(bold["TaskName"], json!("rest"));
        assert_eq!(bold["TotalReadoutTime"], json!(0.031));
        assert_eq!(bold["SliceTiming"].as_array().unwrap().len(), 4);

        let fieldmap: Value = serde_json::from_slice(
            &fs::read(ses.join("fmap/sub-M001_ses-1_acq-b0_fieldmap.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(fieldmap["Units"], json!("Hz"));
        assert_eq!(
            fieldmap["IntendedFor"],
            json!([
                "ses-1/anat/sub-M001_ses-1_T1w.nii",
                "ses-1/func/sub-M001_ses-1_task-rest_run-1_part-mag_bold.nii"
            ])
        );
        let magnitude: Value = serde_json::from_slice(
            &fs::read(ses.join("fmap/sub-M001_ses-1_acq-b0_magnitude.json")).unwrap(),
        )
        .unwrap();
        assert!(magnitude.get("Units").is_none());

        let again = stager.stage_session("M001", &session()).unwrap();
        assert_eq!(again.transferred, 0);
        assert_eq!(again.already_present, 10);
        assert_eq!(again.enriched, 0);
    }

    #[test]
    fn test_defacing_replaces_anatomical_copy() {
        let tmp = tempdir().unwrap();
        raw_session(tmp.path());
        let config = AppConfig::for_root(tmp.path());
        let recorder = Arc::new(Recorder::default());
        let invoker = ToolInvoker::new(recorder.clone(), &config.tools);
        SessionStager::new(&config, &invoker)
            .stage_session("M001", &session())
            .unwrap();
        assert_eq!(recorder.names(), vec!["mideface".to_string()]);
        let call = &recorder.calls.lock().unwrap()[0];
        assert!(call.outputs[0].ends_with("anat/sub-M001_ses-1_T1w.nii"));
    }

    #[test]
    fn test_missing_fieldmap_is_fatal() {
        let tmp = tempdir().unwrap();
        raw_session(tmp.path());
        fs::remove_file(
            tmp.path()
                .join("sourcedata/sub-M001/ses-1/raw_data/fm_X9.07_B0_shimmed_e2.nii"),
        )
        .unwrap();
        let mut config = AppConfig::for_root(tmp.path());
        config.staging.deface_anat = false;
        let invoker = ToolInvoker::new(Arc::new(Recorder::default()), &config.tools);
        let err = SessionStager::new(&config, &invoker)
            .stage_session("M001", &session())
            .unwrap_err();
        assert!(matches!(err, Error::AmbiguousOrMissingSource { ref matches, .. } if matches.is_empty()));
    }

    #[test]
    fn test_dicom_session_is_converted_once() {
        let tmp = tempdir().unwrap();
        let raw = tmp.path().join("sourcedata/sub-M001/ses-1/raw_data");
        write(&raw.join("IM0001.DCM"), b"dicom");
        let mut config = AppConfig::for_root(tmp.path());
        config.staging.deface_anat = false;
        let converter = Arc::new(Converter {
            raw: raw.clone(),
            calls: Mutex::new(0),
        });
        let invoker = ToolInvoker::new(converter.clone(), &config.tools);
        let stager = SessionStager::new(&config, &invoker);
        let registry =
            Registry::from_json(r#"{"M001": {"s1": {"sessID": "X9", "anat": 3}}}"#).unwrap();
        let session = registry.subjects()[0].sessions[0].clone();

        let first = stager.stage_session("M001", &session).unwrap();
        assert_eq!(first.transferred, 2);
        assert_eq!(listing(&raw), vec!["IM0001.DCM".to_string()]);
        assert!(tmp
            .path()
            .join("sub-M001/ses-1/anat/sub-M001_ses-1_T1w.nii")
            .is_file());

        let again = stager.stage_session("M001", &session).unwrap();
        assert_eq!(again.transferred, 0);
        assert_eq!(again.already_present, 2);
        assert_eq!(*converter.calls.lock().unwrap(), 1);
        assert_eq!(listing(&raw), vec!["IM0001.DCM".to_string()]);
    }
}
