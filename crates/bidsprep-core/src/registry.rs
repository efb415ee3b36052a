use crate::error::Error;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One scanning visit as recorded in `participants.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionEntry {
    #[serde(rename = "sessID")]
    pub scanner_id: String,
    #[serde(default)]
    pub anat: Option<u32>,
    /// Task label to the scan indices of its runs, in run order.
    #[serde(default)]
    pub func: BTreeMap<String, Vec<u32>>,
    /// Fieldmap label (e.g. `b0`) to scan index.
    #[serde(default)]
    pub fmap: BTreeMap<String, u32>,
}

/// A session with its BIDS number (1-based).
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub number: usize,
    pub entry: SessionEntry,
}

#[derive(Debug, Clone)]
pub struct Subject {
    pub id: String,
    pub sessions: Vec<Session>,
}

/// Subjects and their sessions. Sessions are numbered in file order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    subjects: Vec<Subject>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Registry(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text).map_err(|e| match e {
            Error::Json { source, .. } => Error::Json {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Subjects and their sessions keep the order they have in the file.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let json_error = |source: serde_json::Error| Error::Json {
            path: Path::new("<registry>").to_path_buf(),
            source,
        };
        // serde_json's preserve_order keeps Map in document order
        let raw: Map<String, Value> = serde_json::from_str(text).map_err(json_error)?;

        let mut subjects = Vec::with_capacity(raw.len());
        for (id, sessions) in raw {
            let Value::Object(sessions) = sessions else {
                return Err(Error::Registry(format!(
                    "subject '{}' must map session keys to sessions",
                    id
                )));
            };
            let mut ordered = Vec::with_capacity(sessions.len());
            for (idx, (key, entry)) in sessions.into_iter().enumerate() {
                ordered.push(Session {
                    key,
                    number: idx + 1,
                    entry: serde_json::from_value::<SessionEntry>(entry).map_err(json_error)?,
                });
            }
            subjects.push(Subject {
                id,
                sessions: ordered,
            });
        }

        Ok(Self { subjects })
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn subject(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == id)
    }

    /// Restrict to the listed subject IDs; an empty filter keeps everything.
    pub fn filtered(&self, ids: &[String]) -> Result<Registry, Error> {
        if ids.is_empty() {
            return Ok(self.clone());
        }
        let mut subjects = Vec::with_capacity(ids.len());
        for id in ids {
            let subject = self
                .subject(id)
                .ok_or_else(|| Error::Registry(format!("unknown subject '{}'", id)))?;
            subjects.push(subject.clone());
        }
        Ok(Registry { subjects })
    }
}
