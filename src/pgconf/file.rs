//! `postgresql.conf` reading and writing with a managed region.
//!
//! Settings written by the reconciliation core live between two marker
//! comments. Everything outside the markers is preserved verbatim, so
//! operator edits and `initdb` defaults survive reconfiguration.

use super::diff::{diff, ConfigChanges};
use super::merge::{enforce_standby_floor, merge};
use super::{SettingValue, Settings};
use crate::error::{ControlError, ControlResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BEGIN_MARKER: &str = "# BEGIN pgcontrol managed settings";
pub const END_MARKER: &str = "# END pgcontrol managed settings";

/// A parsed configuration file
#[derive(Debug, Clone, PartialEq)]
pub struct PgConfFile {
    path: PathBuf,
    before: Vec<String>,
    managed: Settings,
    after: Vec<String>,
    has_region: bool,
}

impl PgConfFile {
    /// Load `path`; a missing file is treated as empty
    pub async fn load(path: impl AsRef<Path>) -> ControlResult<Self> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ControlError::io(path, e)),
        };
        Ok(Self::parse(path, &content))
    }

    pub fn parse(path: impl Into<PathBuf>, content: &str) -> Self {
        let mut before = Vec::new();
        let mut managed = Settings::new();
        let mut after = Vec::new();
        let mut has_region = false;
        let mut in_region = false;

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed == BEGIN_MARKER && !has_region {
                has_region = true;
                in_region = true;
            } else if trimmed == END_MARKER && in_region {
                in_region = false;
            } else if in_region {
                if let Some((name, value)) = parse_line(line) {
                    managed.insert(name, value);
                }
            } else if has_region {
                after.push(line.to_string());
            } else {
                before.push(line.to_string());
            }
        }

        Self {
            path: path.into(),
            before,
            managed,
            after,
            has_region,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings inside the managed region
    pub fn managed(&self) -> &Settings {
        &self.managed
    }

    /// Effective settings, later lines overriding earlier ones as PostgreSQL reads them
    pub fn effective(&self) -> Settings {
        let mut settings = Settings::new();
        for line in &self.before {
            if let Some((name, value)) = parse_line(line) {
                settings.insert(name, value);
            }
        }
        settings.extend(self.managed.iter().map(|(k, v)| (k.clone(), v.clone())));
        for line in &self.after {
            if let Some((name, value)) = parse_line(line) {
                settings.insert(name, value);
            }
        }
        settings
    }

    pub fn replace_managed(&mut self, settings: Settings) {
        self.managed = settings;
        self.has_region = true;
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.before {
            out.push_str(line);
            out.push('\n');
        }
        if self.has_region {
            out.push_str(BEGIN_MARKER);
            out.push('\n');
            for (name, value) in &self.managed {
                out.push_str(&format!("{name} = {value}\n"));
            }
            out.push_str(END_MARKER);
            out.push('\n');
        }
        for line in &self.after {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Write the file through a temporary sibling and rename
    pub async fn save(&self) -> ControlResult<()> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "postgresql.conf".to_string());
        let tmp = self.path.with_file_name(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp, self.render())
            .await
            .map_err(|e| ControlError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ControlError::io(&self.path, e))?;
        debug!(path = %self.path.display(), "configuration file saved");
        Ok(())
    }
}

/// How desired settings combine with what is already in the file
#[derive(Debug, Clone, Copy)]
pub enum ApplyMode<'a> {
    /// Managed region becomes exactly the desired settings
    Replace,
    /// Desired settings are merged into the existing managed region, and
    /// floor keys are kept at or above the primary's values. Without an
    /// explicit snapshot, the file's current content stands in for the
    /// primary since a base backup copies it from there.
    Merge {
        primary_snapshot: Option<&'a Settings>,
        floor_keys: &'a [String],
    },
}

/// Bring the file at `path` to the desired settings.
///
/// The file is rewritten only when the effective configuration changes.
pub async fn apply_configuration(
    path: &Path,
    desired: &Settings,
    mode: ApplyMode<'_>,
) -> ControlResult<ConfigChanges> {
    let mut file = PgConfFile::load(path).await?;
    let before = file.effective();

    let managed = match mode {
        ApplyMode::Replace => desired.clone(),
        ApplyMode::Merge {
            primary_snapshot,
            floor_keys,
        } => {
            let mut merged = merge(file.managed(), std::slice::from_ref(desired));
            let primary = primary_snapshot.unwrap_or(&before);
            let raised = enforce_standby_floor(&mut merged, primary, floor_keys);
            if !raised.is_empty() {
                info!(path = %path.display(), settings = ?raised, "kept standby settings at primary values");
            }
            merged
        }
    };

    file.replace_managed(managed);
    let changes = diff(&before, &file.effective());
    if !changes.is_empty() {
        file.save().await?;
        info!(
            path = %path.display(),
            changed = changes.len(),
            "configuration updated"
        );
    }
    Ok(changes)
}

/// Parse `name = value` or `name value`, ignoring comments and includes
fn parse_line(line: &str) -> Option<(String, SettingValue)> {
    let line = strip_comment(line).trim();
    if line.is_empty() {
        return None;
    }
    let split = line.find(|c: char| c == '=' || c.is_whitespace())?;
    let name = line[..split].trim();
    let rest = line[split..].trim_start();
    let value = rest.strip_prefix('=').unwrap_or(rest).trim();
    if name.is_empty() || value.is_empty() || name.starts_with("include") {
        return None;
    }
    Some((name.to_lowercase(), SettingValue::parse(value)))
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (idx, c) in line.char_indices() {
        match c {
            '\'' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..idx],
            _ => {}
        }
    }
    line
}
