//! Containerized nipreps applications (MRIQC, fMRIPrep).

use super::container::ContainerRun;
use super::ToolSpec;
use crate::config::ContainerConfig;
use std::path::{Path, PathBuf};

/// Host directories bound into a nipreps container.
#[derive(Debug, Clone)]
pub struct BidsApp {
    /// BIDS dataset, mounted at `/data`.
    pub input: PathBuf,
    /// Output directory, mounted at `/out`.
    pub output: PathBuf,
    /// Scratch directory, mounted at `/work`.
    pub work: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QcLevel {
    Participant(String),
    Group,
}

fn image(name: &str, version: &str) -> String {
    format!("{}:{}", name, version)
}

fn base_run(config: &ContainerConfig, image: &str, app: &BidsApp) -> ContainerRun {
    ContainerRun::new(&config.runtime, image)
        .bind(&app.input, "/data")
        .bind(&app.output, "/out")
        .bind(&app.work, "/work")
        .memory(&config.memory, &config.memory_swap)
}

/// MRIQC at participant or group level. The participant run declares the
/// subject's output directory; the group run declares `group_bold.html`.
pub fn mriqc(config: &ContainerConfig, app: &BidsApp, level: &QcLevel, n_procs: usize) -> ToolSpec {
    let image = image(&config.mriqc_image, &config.mriqc_version);
    let mut run = base_run(config, &image, app).args([
        "--nprocs".to_string(),
        n_procs.to_string(),
        "--verbose-reports".to_string(),
        "--resource-monitor".to_string(),
        "-f".to_string(),
        "-w".to_string(),
        "/work".to_string(),
        "/data".to_string(),
        "/out".to_string(),
    ]);
    let output = match level {
        QcLevel::Participant(subject) => {
            run = run
                .name(&format!("bidsprep-mriqc-{}", subject))
                .args(["participant", "--participant-label", subject.as_str()]);
            app.output.join(format!("sub-{}", subject))
        }
        QcLevel::Group => {
            run = run.name("bidsprep-mriqc-group").arg("group");
            app.output.join("group_bold.html")
        }
    };
    ToolSpec::container("mriqc", run).output(output)
}

/// fMRIPrep anatomical workflow for one subject, reusing `subjects_dir`
/// for FreeSurfer outputs and its license file.
pub fn fmriprep_anat(
    config: &ContainerConfig,
    app: &BidsApp,
    subjects_dir: &Path,
    subject: &str,
    n_procs: usize,
) -> ToolSpec {
    let image = image(&config.fmriprep_image, &config.fmriprep_version);
    let run = ContainerRun::new(&config.runtime, &image)
        .name(&format!("bidsprep-fmriprep-{}", subject))
        .bind(&app.input, "/data")
        .bind(&app.output, "/out")
        .bind(subjects_dir, "/fs_subjects")
        .bind(&app.work, "/work")
        .memory(&config.memory, &config.memory_swap)
        .args([
            "--clean-workdir".to_string(),
            "--resource-monitor".to_string(),
            "--anat-only".to_string(),
            "--skip-bids-validation".to_string(),
            "--nprocs".to_string(),
            n_procs.to_string(),
            "--mem-mb".to_string(),
            config.mem_mb.to_string(),
            "--fs-license-file".to_string(),
            format!("/fs_subjects/{}", config.fs_license),
            "--fs-subjects-dir".to_string(),
            "/fs_subjects".to_string(),
            "--output-spaces".to_string(),
            "func".to_string(),
            "-w".to_string(),
            "/work".to_string(),
            "/data".to_string(),
            "/out".to_string(),
            "participant".to_string(),
            "--participant-label".to_string(),
            subject.to_string(),
        ]);
    ToolSpec::container("fmriprep", run).output(app.output.join(format!("sub-{}", subject)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Invocation;

    fn app() -> BidsApp {
        BidsApp {
            input: PathBuf::from("/study"),
            output: PathBuf::from("/study/derivatives/mriqc-23.1.0"),
            work: PathBuf::from("/study/derivatives/mriqc-work"),
        }
    }

    #[test]
    fn test_mriqc_participant_declares_subject_dir() {
        let spec = mriqc(
            &ContainerConfig::default(),
            &app(),
            &QcLevel::Participant("M001".to_string()),
            8,
        );
        assert_eq!(
            spec.outputs,
            vec![PathBuf::from("/study/derivatives/mriqc-23.1.0/sub-M001")]
        );
        let Invocation::Container(run) = &spec.invocation else {
            panic!("expected a container run");
        };
        assert_eq!(run.image, "nipreps/mriqc:23.1.0");
        assert_eq!(
            run.args[run.args.len() - 3..],
            ["participant", "--participant-label", "M001"]
        );
        assert_eq!(run.memory.as_deref(), Some("32g"));
    }

    #[test]
    fn test_mriqc_group_declares_report() {
        let spec = mriqc(&ContainerConfig::default(), &app(), &QcLevel::Group, 4);
        assert_eq!(
            spec.outputs,
            vec![PathBuf::from("/study/derivatives/mriqc-23.1.0/group_bold.html")]
        );
        assert_eq!(spec.command_line().last().map(String::as_str), Some("group"));
    }

    #[test]
    fn test_fmriprep_mounts_subjects_dir() {
        let app = BidsApp {
            input: PathBuf::from("/study"),
            output: PathBuf::from("/study/derivatives/fmriprep-23.0.2"),
            work: PathBuf::from("/study/derivatives/fmriprep_work"),
        };
        let spec = fmriprep_anat(&ContainerConfig::default(), &app, Path::new("/fs"), "M001", 8);
        let line = spec.command_line().join(" ");
        assert!(line.contains("type=bind,src=/fs,dst=/fs_subjects"));
        assert!(line.contains("--fs-license-file /fs_subjects/license.txt"));
        assert!(line.contains("--mem-mb 64000"));
        assert!(line.ends_with("participant --participant-label M001"));
    }
}
