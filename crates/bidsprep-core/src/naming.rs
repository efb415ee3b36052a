//! Raw-to-BIDS filename conventions.
//!
//! Raw exports are named `<anything><sessID>.<scan:02><anything><component>.<ext>`
//! and live in `sourcedata/sub-<S>/ses-<N>/raw_data`. Resolution yields a glob
//! pattern over that directory plus the canonical destination in the BIDS tree.

use crate::error::Error;
use glob::Pattern;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Image,
    Metadata,
}

impl FileKind {
    pub const ALL: [FileKind; 2] = [FileKind::Image, FileKind::Metadata];

    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Image => "nii",
            FileKind::Metadata => "json",
        }
    }
}

/// Components a functional acquisition may be exported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Mag,
    Real,
    Imag,
    Phase,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Mag,
        Component::Real,
        Component::Imag,
        Component::Phase,
    ];

    /// Trailing token of the raw filename.
    pub fn raw_suffix(self) -> &'static str {
        match self {
            Component::Mag => "01",
            Component::Real => "01_real",
            Component::Imag => "01_imaginary",
            Component::Phase => "01_ph",
        }
    }

    /// BIDS `part-` label.
    pub fn label(self) -> &'static str {
        match self {
            Component::Mag => "mag",
            Component::Real => "real",
            Component::Imag => "imag",
            Component::Phase => "phase",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldmapComponent {
    Magnitude,
    Fieldmap,
}

impl FieldmapComponent {
    pub const ALL: [FieldmapComponent; 2] =
        [FieldmapComponent::Magnitude, FieldmapComponent::Fieldmap];

    /// Echo number the scanner uses for this component.
    pub fn echo(self) -> u32 {
        match self {
            FieldmapComponent::Magnitude => 1,
            FieldmapComponent::Fieldmap => 2,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            FieldmapComponent::Magnitude => "magnitude",
            FieldmapComponent::Fieldmap => "fieldmap",
        }
    }
}

/// What a raw scan is used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanRole {
    Anatomical {
        scan: u32,
    },
    Functional {
        task: String,
        /// 1-based run number within the task.
        run: u32,
        scan: u32,
        component: Component,
    },
    Fieldmap {
        label: String,
        scan: u32,
        component: FieldmapComponent,
    },
}

impl ScanRole {
    /// Anatomical and fieldmap scans must match exactly one raw file.
    pub fn is_required(&self) -> bool {
        !matches!(self, ScanRole::Functional { .. })
    }
}

/// BIDS entities for one file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BidsName {
    pub subject: String,
    pub session: usize,
    pub task: Option<String>,
    pub acq: Option<String>,
    pub run: Option<u32>,
    pub part: Option<String>,
    pub suffix: String,
}

impl BidsName {
    pub fn new(subject: &str, session: usize, suffix: &str) -> Self {
        Self {
            subject: subject.to_string(),
            session,
            suffix: suffix.to_string(),
            ..Default::default()
        }
    }

    pub fn task(mut self, task: &str) -> Self {
        self.task = Some(task.to_string());
        self
    }

    pub fn acq(mut self, acq: &str) -> Self {
        self.acq = Some(acq.to_string());
        self
    }

    pub fn run(mut self, run: u32) -> Self {
        self.run = Some(run);
        self
    }

    pub fn part(mut self, part: &str) -> Self {
        self.part = Some(part.to_string());
        self
    }

    pub fn with_extension(&self, ext: &str) -> String {
        format!("{}.{}", self, ext)
    }
}

impl fmt::Display for BidsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}_ses-{}", self.subject, self.session)?;
        if let Some(task) = &self.task {
            write!(f, "_task-{}", task)?;
        }
        if let Some(acq) = &self.acq {
            write!(f, "_acq-{}", acq)?;
        }
        if let Some(run) = self.run {
            write!(f, "_run-{}", run)?;
        }
        if let Some(part) = &self.part {
            write!(f, "_part-{}", part)?;
        }
        write!(f, "_{}", self.suffix)
    }
}

/// Directories of one subject/session in the BIDS tree and its source tree.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub subject: String,
    pub session: usize,
}

impl SessionPaths {
    pub fn new(root: &Path, subject: &str, session: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            subject: subject.to_string(),
            session,
        }
    }

    /// `sub-<S>/ses-<N>`, relative.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("sub-{}", self.subject)).join(format!("ses-{}", self.session))
    }

    pub fn subject_dir(&self) -> PathBuf {
        self.root.join(format!("sub-{}", self.subject))
    }

    pub fn session_dir(&self) -> PathBuf {
        self.root.join(self.relative_dir())
    }

    pub fn anat_dir(&self) -> PathBuf {
        self.session_dir().join("anat")
    }

    pub fn func_dir(&self) -> PathBuf {
        self.session_dir().join("func")
    }

    pub fn fmap_dir(&self) -> PathBuf {
        self.session_dir().join("fmap")
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root
            .join("sourcedata")
            .join(self.relative_dir())
            .join("raw_data")
    }

    pub fn name(&self, suffix: &str) -> BidsName {
        BidsName::new(&self.subject, self.session, suffix)
    }

    /// Same session under `derivatives/<variant>`.
    pub fn in_derivative(&self, variant: &str) -> SessionPaths {
        SessionPaths::new(
            &self.root.join("derivatives").join(variant),
            &self.subject,
            self.session,
        )
    }
}

/// A resolved raw-to-BIDS mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub pattern: String,
    pub dest: PathBuf,
    pub required: bool,
}

impl Resolution {
    /// Locate the raw file. Required roles fail unless exactly one file matches;
    /// optional ones take the first lexicographic match.
    pub fn locate(&self) -> Result<Option<PathBuf>, Error> {
        if self.required {
            exactly_one(&self.pattern).map(Some)
        } else {
            first_match(&self.pattern)
        }
    }
}

pub struct NamingResolver<'a> {
    root: &'a Path,
    fieldmap_token: &'a str,
}

impl<'a> NamingResolver<'a> {
    pub fn new(root: &'a Path, fieldmap_token: &'a str) -> Self {
        Self {
            root,
            fieldmap_token,
        }
    }

    pub fn session(&self, subject: &str, session: usize) -> SessionPaths {
        SessionPaths::new(self.root, subject, session)
    }

    pub fn resolve(
        &self,
        subject: &str,
        session: usize,
        scanner_id: &str,
        role: &ScanRole,
        kind: FileKind,
    ) -> Resolution {
        let paths = self.session(subject, session);
        let ext = kind.extension();
        let source = Pattern::escape(&paths.source_dir().to_string_lossy());
        let sess = Pattern::escape(scanner_id);

        let (pattern, dest) = match role {
            ScanRole::Anatomical { scan } => (
                format!("{}/*{}.{:02}*.{}", source, sess, scan, ext),
                paths
                    .anat_dir()
                    .join(paths.name("T1w").with_extension(ext)),
            ),
            ScanRole::Functional {
                task,
                run,
                scan,
                component,
            } => (
                format!(
                    "{}/*{}.{:02}*{}.{}",
                    source,
                    sess,
                    scan,
                    component.raw_suffix(),
                    ext
                ),
                paths.func_dir().join(
                    paths
                        .name("bold")
                        .task(task)
                        .run(*run)
                        .part(component.label())
                        .with_extension(ext),
                ),
            ),
            ScanRole::Fieldmap {
                label,
                scan,
                component,
            } => (
                format!(
                    "{}/*{}.{:02}*{}*e{}*.{}",
                    source,
                    sess,
                    scan,
                    Pattern::escape(self.fieldmap_token),
                    component.echo(),
                    ext
                ),
                paths
                    .fmap_dir()
                    .join(paths.name(component.suffix()).acq(label).with_extension(ext)),
            ),
        };

        Resolution {
            pattern,
            dest,
            required: role.is_required(),
        }
    }

    /// Whether the raw session was exported as DICOM and needs conversion first.
    pub fn has_dicom(&self, subject: &str, session: usize) -> Result<bool, Error> {
        let source = Pattern::escape(&self.session(subject, session).source_dir().to_string_lossy());
        Ok(!glob_sorted(&format!("{}/*.DCM", source))?.is_empty())
    }
}

/// All matches of `pattern`, sorted.
pub fn glob_sorted(pattern: &str) -> Result<Vec<PathBuf>, Error> {
    let paths = glob::glob(pattern)
        .map_err(|e| Error::Other(format!("invalid glob pattern '{}': {}", pattern, e)))?;
    let mut matches = Vec::new();
    for entry in paths {
        matches.push(entry.map_err(|e| Error::Io(e.into_error()))?);
    }
    matches.sort();
    Ok(matches)
}

pub fn exactly_one(pattern: &str) -> Result<PathBuf, Error> {
    let mut matches = glob_sorted(pattern)?;
    if matches.len() == 1 {
        Ok(matches.remove(0))
    } else {
        Err(Error::AmbiguousOrMissingSource {
            pattern: pattern.to_string(),
            matches,
        })
    }
}

pub fn first_match(pattern: &str) -> Result<Option<PathBuf>, Error> {
    Ok(glob_sorted(pattern)?.into_iter().next())
}
