//! Workflow ledger
//!
//! Two JSON documents under `state_management/`:
//!
//! - `agent_registry.json`: the roster with each agent's status and current task
//! - `task_continuum.json`: templates, active and completed workflows, escalation rules
//!
//! Every save writes a temp file next to the target and renames it over the
//! existing one, so a reader never sees a half-written document.
//!
//! Only one process may drive the ledger. [`Ledger::lock`] takes an advisory
//! lock on `ledger.lock`; the OS releases it when the holder exits.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::template::{default_templates, WorkflowTemplate};
use super::types::{AgentId, AgentRecord, CompletedWorkflow, EscalationRules, WorkflowInstance};

pub const STATE_DIR: &str = "state_management";
pub const AGENT_REGISTRY_FILE: &str = "agent_registry.json";
pub const TASK_CONTINUUM_FILE: &str = "task_continuum.json";
pub const LOCK_FILE: &str = "ledger.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistryDoc {
    pub agents: Vec<AgentRecord>,
    pub last_updated: DateTime<Utc>,
}

impl AgentRegistryDoc {
    /// Every roster member on standby
    pub fn fresh() -> Self {
        Self {
            agents: AgentId::ALL.into_iter().map(AgentRecord::standby).collect(),
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContinuumDoc {
    pub workflow_templates: BTreeMap<String, WorkflowTemplate>,
    #[serde(default)]
    pub active_workflows: BTreeMap<String, WorkflowInstance>,
    #[serde(default)]
    pub completed_workflows: BTreeMap<String, CompletedWorkflow>,
    #[serde(default)]
    pub escalation_rules: EscalationRules,
    pub last_updated: DateTime<Utc>,
}

impl TaskContinuumDoc {
    pub fn fresh() -> Self {
        Self {
            workflow_templates: default_templates(),
            active_workflows: BTreeMap::new(),
            completed_workflows: BTreeMap::new(),
            escalation_rules: EscalationRules::default(),
            last_updated: Utc::now(),
        }
    }
}

/// Exclusive hold on a ledger directory, released on drop
#[derive(Debug)]
pub struct LedgerLock {
    _file: File,
}

/// File-backed ledger location
#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    /// Ledger rooted at `<data_dir>/state_management`
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(STATE_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry_path(&self) -> PathBuf {
        self.dir.join(AGENT_REGISTRY_FILE)
    }

    pub fn continuum_path(&self) -> PathBuf {
        self.dir.join(TASK_CONTINUUM_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Claim the ledger for this process
    ///
    /// Fails while another live process holds it.
    pub fn lock(&self) -> Result<LedgerLock> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.lock_path();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "Workflow ledger {} is in use by another process",
                self.dir.display()
            )
        })?;

        // Holder pid, for whoever finds the lock taken
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;

        debug!("Locked {}", path.display());
        Ok(LedgerLock { _file: file })
    }

    pub async fn load_registry(&self) -> Result<Option<AgentRegistryDoc>> {
        read_json(&self.registry_path()).await
    }

    pub async fn load_continuum(&self) -> Result<Option<TaskContinuumDoc>> {
        read_json(&self.continuum_path()).await
    }

    pub async fn save_registry(&self, doc: &AgentRegistryDoc) -> Result<()> {
        self.write_atomic(&self.registry_path(), doc).await
    }

    pub async fn save_continuum(&self, doc: &TaskContinuumDoc) -> Result<()> {
        self.write_atomic(&self.continuum_path(), doc).await
    }

    async fn write_atomic<T: Serialize>(&self, path: &Path, doc: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        debug!("Saved {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let doc = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(Some(doc))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
