//! JSON-backed persistence of learned state and session logs
//!
//! One document holds the enrolled subjects, every (task, subject) profile
//! and the append-only break-event and session logs. File-backed stores rewrite the document
//! through a temporary file and a rename after every mutation, so a crash
//! leaves either the old or the new document on disk.

use crate::calibration::SubjectRecord;
use crate::config::LearningConfig;
use crate::error::LoopError;
use crate::ports::StateStore;
use crate::types::{BreakEventRecord, LearnedState, SessionRecord, StateKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const STORE_VERSION: u32 = 1;

/// On-disk layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    pub version: u32,
    /// Keyed by subject id
    #[serde(default)]
    pub subjects: BTreeMap<String, SubjectRecord>,
    /// Keyed by [`StateKey::storage_key`]
    #[serde(default)]
    pub profiles: BTreeMap<String, LearnedState>,
    #[serde(default)]
    pub break_events: Vec<BreakEventRecord>,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            subjects: BTreeMap::new(),
            profiles: BTreeMap::new(),
            break_events: Vec::new(),
            sessions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: Option<PathBuf>,
    document: StoreDocument,
    learning: LearningConfig,
}

impl JsonStateStore {
    /// Store that never touches disk
    pub fn in_memory(learning: &LearningConfig) -> Self {
        Self {
            path: None,
            document: StoreDocument::default(),
            learning: learning.clone(),
        }
    }

    /// Open `path`, starting empty if it does not exist yet
    pub fn open(path: impl AsRef<Path>, learning: &LearningConfig) -> Result<Self, LoopError> {
        let path = path.as_ref().to_path_buf();
        let document = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            Self::parse(&text)?
        } else {
            debug!(path = %path.display(), "state file not found, starting empty");
            StoreDocument::default()
        };
        info!(
            path = %path.display(),
            subjects = document.subjects.len(),
            profiles = document.profiles.len(),
            "state store opened"
        );
        Ok(Self {
            path: Some(path),
            document,
            learning: learning.clone(),
        })
    }

    fn parse(json: &str) -> Result<StoreDocument, LoopError> {
        let document: StoreDocument = serde_json::from_str(json)?;
        if document.version != STORE_VERSION {
            return Err(LoopError::Persistence(format!(
                "unsupported state file version {}",
                document.version
            )));
        }
        Ok(document)
    }

    pub fn from_json(json: &str, learning: &LearningConfig) -> Result<Self, LoopError> {
        Ok(Self {
            path: None,
            document: Self::parse(json)?,
            learning: learning.clone(),
        })
    }

    pub fn to_json(&self) -> Result<String, LoopError> {
        Ok(serde_json::to_string_pretty(&self.document)?)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn document(&self) -> &StoreDocument {
        &self.document
    }

    fn sanitize(&self, state: &LearnedState) -> LearnedState {
        state.sanitized(
            self.learning.scaler_min,
            self.learning.scaler_max,
            self.learning.default_scaler,
        )
    }

    /// Problems with the stored profiles, for diagnostics
    pub fn check(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for (id, record) in &self.document.subjects {
            if !record.profile.is_valid() {
                issues.push(format!("subject {id}: reference profile is invalid"));
            }
        }
        for (key, state) in &self.document.profiles {
            if !state.weights.is_normalized() {
                issues.push(format!("{key}: weights are not normalized"));
            }
            let (min, max) = (self.learning.scaler_min, self.learning.scaler_max);
            if !(state.scaler.is_finite() && (min..=max).contains(&state.scaler)) {
                issues.push(format!(
                    "{key}: scaler {} outside [{min}, {max}]",
                    state.scaler
                ));
            }
        }
        issues
    }

    fn flush(&self) -> Result<(), LoopError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let json = self.to_json()?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path).map_err(|e| {
            LoopError::Persistence(format!("failed to replace {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "state written");
        Ok(())
    }
}

impl StateStore for JsonStateStore {
    fn record_subject(&mut self, record: &SubjectRecord) -> Result<(), LoopError> {
        self.document
            .subjects
            .insert(record.subject.clone(), record.clone());
        self.flush()
    }

    fn load_subject(&self, subject: &str) -> Result<Option<SubjectRecord>, LoopError> {
        Ok(self.document.subjects.get(subject).cloned())
    }

    fn subjects(&self) -> Result<Vec<SubjectRecord>, LoopError> {
        Ok(self.document.subjects.values().cloned().collect())
    }

    fn load_state(&self, key: &StateKey) -> Result<Option<LearnedState>, LoopError> {
        Ok(self
            .document
            .profiles
            .get(&key.storage_key())
            .map(|state| self.sanitize(state)))
    }

    fn save_state(&mut self, key: &StateKey, state: &LearnedState) -> Result<(), LoopError> {
        let state = self.sanitize(state);
        self.document.profiles.insert(key.storage_key(), state);
        self.flush()
    }

    fn append_break_event(&mut self, event: &BreakEventRecord) -> Result<(), LoopError> {
        self.document.break_events.push(event.clone());
        self.flush()
    }

    fn record_session(&mut self, record: &SessionRecord) -> Result<(), LoopError> {
        match self
            .document
            .sessions
            .iter_mut()
            .find(|existing| existing.id == record.id)
        {
            Some(existing) => *existing = record.clone(),
            None => self.document.sessions.push(record.clone()),
        }
        self.flush()
    }
}
