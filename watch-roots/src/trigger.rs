//! Trigger definitions and the per-root trigger table.
//!
//! A trigger is a named command run in reaction to changes under a root.
//! The definition document supplied by the client is retained verbatim so
//! that saving and reloading state reproduces exactly what was submitted,
//! including members this crate does not interpret (such as a query
//! `expression`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WatchError};

/// Member whose presence marks the unsupported legacy format.
pub const LEGACY_MARKER: &str = "rules";

/// How the list of changed files is fed to the command's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StdinStyle {
    /// Stdin is connected to the null device.
    #[default]
    None,

    /// One changed file name per line.
    NameList,

    /// A JSON array of file objects, optionally bounded in size.
    JsonList {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_entries: Option<u32>,
    },
}

/// Redirection of stdout or stderr to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRedirect {
    /// Target file name.
    pub name: String,

    /// Append instead of truncating.
    #[serde(default)]
    pub append: bool,
}

/// Format of a stored definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionVersion {
    /// Definitions carrying a `rules` member. Always skipped.
    Legacy,
    /// Current format.
    Current,
}

impl DefinitionVersion {
    pub fn of(definition: &Value) -> Self {
        if definition.get(LEGACY_MARKER).is_some() {
            Self::Legacy
        } else {
            Self::Current
        }
    }
}

#[derive(Debug, Deserialize)]
struct TriggerSpec {
    name: String,
    command: Vec<String>,
    #[serde(default)]
    stdin: StdinStyle,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    stdout: Option<OutputRedirect>,
    #[serde(default)]
    stderr: Option<OutputRedirect>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    append_files: bool,
}

/// A parsed trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerCommand {
    /// Unique name within the root.
    pub name: String,

    /// Command and arguments.
    pub command: Vec<String>,

    /// Environment overrides.
    pub env: BTreeMap<String, String>,

    /// How changed files reach stdin.
    pub stdin: StdinStyle,

    /// Where stdout goes; inherited when absent.
    pub stdout: Option<OutputRedirect>,

    /// Where stderr goes; inherited when absent.
    pub stderr: Option<OutputRedirect>,

    /// Fields reported for each changed file.
    pub fields: Vec<String>,

    /// Append changed file names to the argument list.
    pub append_files: bool,

    /// Pid of the running invocation, if any.
    pub running_pid: Option<u32>,

    definition: Value,
}

impl TriggerCommand {
    /// Parse a definition document.
    ///
    /// Legacy definitions fail with [`WatchError::LegacyTrigger`], anything
    /// else that is unusable fails with [`WatchError::TriggerParse`].
    pub fn parse(definition: Value) -> Result<Self> {
        if DefinitionVersion::of(&definition) == DefinitionVersion::Legacy {
            let name = definition
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(WatchError::LegacyTrigger(name));
        }

        if !definition.is_object() {
            return Err(WatchError::TriggerParse(
                "trigger definition must be an object".to_string(),
            ));
        }

        let spec: TriggerSpec = serde_json::from_value(definition.clone())
            .map_err(|e| WatchError::TriggerParse(e.to_string()))?;

        if spec.name.is_empty() {
            return Err(WatchError::TriggerParse(
                "trigger name must not be empty".to_string(),
            ));
        }
        if spec.command.is_empty() {
            return Err(WatchError::TriggerParse(format!(
                "trigger {} must have a non-empty command",
                spec.name
            )));
        }

        Ok(Self {
            name: spec.name,
            command: spec.command,
            env: spec.env,
            stdin: spec.stdin,
            stdout: spec.stdout,
            stderr: spec.stderr,
            fields: spec.fields,
            append_files: spec.append_files,
            running_pid: None,
            definition,
        })
    }

    /// The definition exactly as it was submitted.
    pub fn definition(&self) -> &Value {
        &self.definition
    }

    /// Record the pid of a newly spawned invocation.
    pub fn mark_running(&mut self, pid: u32) {
        self.running_pid = Some(pid);
    }

    /// Clear the pid once the invocation has been reaped.
    pub fn mark_idle(&mut self) {
        self.running_pid = None;
    }

    pub fn is_running(&self) -> bool {
        self.running_pid.is_some()
    }
}

/// Triggers installed on a root, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TriggerTable {
    triggers: BTreeMap<String, TriggerCommand>,
}

impl TriggerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a trigger, replacing any trigger with the same name.
    pub fn install(&mut self, command: TriggerCommand) -> Option<TriggerCommand> {
        self.triggers.insert(command.name.clone(), command)
    }

    pub fn remove(&mut self, name: &str) -> Option<TriggerCommand> {
        self.triggers.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TriggerCommand> {
        self.triggers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TriggerCommand> {
        self.triggers.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TriggerCommand> {
        self.triggers.values()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// The retained definitions, ordered by trigger name.
    pub fn to_documents(&self) -> Vec<Value> {
        self.triggers
            .values()
            .map(|cmd| cmd.definition.clone())
            .collect()
    }
}
