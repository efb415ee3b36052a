pub mod slice_timing;

use crate::config::SliceOrder;
use crate::error::Error;
use crate::fsutil;
use crate::locks::PathLocks;
use crate::naming::{glob_sorted, SessionPaths};
use crate::nifti_header;
use glob::Pattern;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A sidecar document. Keys serialize in sorted order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataRecord {
    fields: BTreeMap<String, Value>,
}

impl MetadataRecord {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let fields: BTreeMap<String, Value> =
            serde_json::from_str(&text).map_err(|source| Error::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { fields })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Four-space indented JSON with every object's keys sorted.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let sorted: BTreeMap<&String, Value> =
            self.fields.iter().map(|(k, v)| (k, sort_keys(v))).collect();
        let mut out = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        sorted.serialize(&mut serializer)?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let bytes = self.to_pretty_json().map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fsutil::write_atomic(path, &bytes)?;
        Ok(())
    }

    fn number(&self, path: &Path, key: &str) -> Result<f64, Error> {
        self.get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::MetadataKeyMissingUpstream {
                path: path.to_path_buf(),
                key: key.to_string(),
            })
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// How a missing key gets its value.
#[derive(Debug, Clone)]
pub enum Fill {
    Value(Value),
    /// Copy another key of the same record.
    CopyFrom(String),
    /// From `RepetitionTime`, the slice count and `MultibandAccelerationFactor`.
    SliceTiming(SliceOrder),
    /// Session-relative paths of every anatomical and magnitude functional image.
    IntendedFor(SessionPaths),
}

#[derive(Debug, Clone)]
pub struct FillRule {
    pub key: String,
    pub fill: Fill,
}

impl FillRule {
    pub fn new(key: &str, fill: Fill) -> Self {
        Self {
            key: key.to_string(),
            fill,
        }
    }
}

impl Fill {
    fn compute(&self, record: &MetadataRecord, path: &Path) -> Result<Value, Error> {
        match self {
            Fill::Value(value) => Ok(value.clone()),
            Fill::CopyFrom(key) => {
                record
                    .get(key)
                    .cloned()
                    .ok_or_else(|| Error::MetadataKeyMissingUpstream {
                        path: path.to_path_buf(),
                        key: key.clone(),
                    })
            }
            Fill::SliceTiming(order) => {
                let tr = record.number(path, "RepetitionTime")?;
                let slices = match record.get("NumberOfSlices").and_then(Value::as_u64) {
                    Some(n) => n as usize,
                    None => {
                        let image = path.with_extension("nii");
                        if !image.is_file() {
                            return Err(Error::MetadataKeyMissingUpstream {
                                path: path.to_path_buf(),
                                key: "NumberOfSlices".to_string(),
                            });
                        }
                        nifti_header::slice_count(&image)? as usize
                    }
                };
                let multiband = record
                    .get("MultibandAccelerationFactor")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as usize;
                let times = slice_timing::slice_timing(tr, slices, multiband, *order);
                Ok(Value::from(times))
            }
            Fill::IntendedFor(session) => {
                let paths = intended_for(session)?;
                Ok(Value::from(paths))
            }
        }
    }
}

/// Sorted, subject-relative (`ses-N/...`) image paths a fieldmap applies to.
pub fn intended_for(session: &SessionPaths) -> Result<Vec<String>, Error> {
    let anat = Pattern::escape(&session.anat_dir().to_string_lossy());
    let func = Pattern::escape(&session.func_dir().to_string_lossy());
    let mut images = glob_sorted(&format!("{}/*.nii", anat))?;
    images.extend(glob_sorted(&format!("{}/*part-mag_bold.nii", func))?);

    let subject_dir = session.subject_dir();
    let mut relative: Vec<String> = images
        .iter()
        .filter_map(|p| p.strip_prefix(&subject_dir).ok())
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    relative.sort();
    Ok(relative)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichOutcome {
    pub added: Vec<String>,
}

/// Apply `rules` in order, filling only keys the record does not have yet.
/// The file is rewritten only if something was added.
pub fn enrich(locks: &PathLocks, path: &Path, rules: &[FillRule]) -> Result<EnrichOutcome, Error> {
    locks.with_lock(path, || {
        let mut record = MetadataRecord::load(path)?;
        let mut outcome = EnrichOutcome::default();
        for rule in rules {
            if record.contains(&rule.key) {
                continue;
            }
            let value = rule.fill.compute(&record, path)?;
            record.insert(&rule.key, value);
            outcome.added.push(rule.key.clone());
        }
        if !outcome.added.is_empty() {
            record.save(path)?;
            debug!("{}: added {}", path.display(), outcome.added.join(", "));
        }
        Ok(outcome)
    })
}

/// Rules for a functional sidecar.
pub fn functional_rules(task: &str, order: SliceOrder) -> Vec<FillRule> {
    vec![
        FillRule::new("TaskName", Fill::Value(Value::from(task))),
        FillRule::new("SliceTiming", Fill::SliceTiming(order)),
        FillRule::new(
            "TotalReadoutTime",
            Fill::CopyFrom("EstimatedTotalReadoutTime".to_string()),
        ),
    ]
}

/// Rules for a fieldmap sidecar; `Units` only applies to the fieldmap image itself.
pub fn fieldmap_rules(session: &SessionPaths, is_fieldmap: bool) -> Vec<FillRule> {
    let mut rules = vec![FillRule::new(
        "IntendedFor",
        Fill::IntendedFor(session.clone()),
    )];
    if is_fieldmap {
        rules.push(FillRule::new("Units", Fill::Value(Value::from("Hz"))));
    }
    rules
}

/// Sidecar path of an image.
pub fn sidecar(image: &Path) -> PathBuf {
    nifti_header::stem(image).with_extension("json")
}
