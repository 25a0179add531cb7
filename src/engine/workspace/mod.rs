// Lucy Engine — Workspace Store
//
// Atomic, workspace-scoped filesystem I/O. Each Slack workspace owns a
// directory tree:
//
//     {root}/{workspace_id}/
//     ├── company/SKILL.md
//     ├── team/SKILL.md
//     ├── skills/{slug}/SKILL.md
//     ├── crons/{slug}/task.json
//     ├── scripts/
//     ├── data/
//     ├── logs/
//     └── state.json
//
// Every relative path is validated against traversal before it touches the
// filesystem. Writes are atomic (temp file + rename).

pub mod activity;
pub mod channels;
pub mod memory;
pub mod preferences;
pub mod skills;
pub mod slack_logs;
pub mod snapshots;

use crate::atoms::error::{EngineError, EngineResult};
use chrono::Utc;
use log::{info, warn};
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};

const WORKSPACE_DIRS: [&str; 7] = ["company", "team", "skills", "crons", "scripts", "data", "logs"];

/// File extensions included in full-text search.
const SEARCHABLE_EXTENSIONS: [&str; 5] = ["md", "json", "txt", "yaml", "py"];

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

/// Filesystem store for a single workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    workspace_id: String,
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(workspace_id: &str, base_path: &Path) -> Self {
        WorkspaceStore {
            workspace_id: workspace_id.to_string(),
            root: base_path.join(workspace_id),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the standard directory tree and state.json if missing.
    pub fn ensure_structure(&self) -> EngineResult<()> {
        for dir in WORKSPACE_DIRS {
            std::fs::create_dir_all(self.root.join(dir))?;
        }

        if !self.root.join("state.json").exists() {
            let state = json!({
                "workspace_id": self.workspace_id,
                "created_at": Utc::now().to_rfc3339(),
            });
            self.write("state.json", &serde_json::to_string_pretty(&state)?)?;
        }

        info!(
            "[workspace] Structure ensured for {} at {}",
            self.workspace_id,
            self.root.display()
        );
        Ok(())
    }

    /// Read a file. Returns None if it does not exist.
    pub fn read(&self, relative_path: &str) -> EngineResult<Option<String>> {
        let path = self.resolve(relative_path)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    /// Write content atomically: write to a temp sibling, then rename.
    pub fn write(&self, relative_path: &str, content: &str) -> EngineResult<PathBuf> {
        let path = self.resolve(relative_path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!(
            "{}tmp",
            path.extension()
                .map(|e| format!("{}.", e.to_string_lossy()))
                .unwrap_or_default()
        ));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Append content, creating the file if needed.
    pub fn append(&self, relative_path: &str, content: &str) -> EngineResult<PathBuf> {
        use std::io::Write;
        let path = self.resolve(relative_path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(content.as_bytes())?;
        Ok(path)
    }

    /// Delete a file. Returns true if deleted, false if it was not there.
    pub fn delete(&self, relative_path: &str) -> EngineResult<bool> {
        let path = self.resolve(relative_path)?;
        if path.is_file() {
            std::fs::remove_file(path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete a directory tree (used by cron self-deletion).
    pub fn delete_dir(&self, relative_path: &str) -> EngineResult<bool> {
        let path = self.resolve(relative_path)?;
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// List entries in a directory as workspace-relative paths, sorted.
    /// Directories get a trailing "/".
    pub fn list(&self, relative_path: &str) -> EngineResult<Vec<String>> {
        let path = self.resolve(relative_path)?;
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| entry.file_name().to_string_lossy().to_string());
            let suffix = if entry.file_type()?.is_dir() { "/" } else { "" };
            entries.push(format!("{}{}", rel, suffix));
        }
        entries.sort();
        Ok(entries)
    }

    /// Case-insensitive full-text search across workspace files, restricted
    /// to the searchable extensions.
    pub fn search(&self, query: &str, relative_path: &str) -> EngineResult<Vec<SearchHit>> {
        let base = self.resolve(relative_path)?;
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        self.search_dir(&base, &needle, &mut hits)?;
        Ok(hits)
    }

    fn search_dir(&self, dir: &Path, needle: &str, hits: &mut Vec<SearchHit>) -> EngineResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.search_dir(&path, needle, hits)?;
                continue;
            }
            let searchable = path
                .extension()
                .map(|e| SEARCHABLE_EXTENSIONS.contains(&e.to_string_lossy().as_ref()))
                .unwrap_or(false);
            if !searchable {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if line.to_lowercase().contains(needle) {
                    let rel = path
                        .strip_prefix(&self.root)
                        .map(|p| p.to_string_lossy().to_string())
                        .unwrap_or_else(|_| path.to_string_lossy().to_string());
                    hits.push(SearchHit {
                        path: rel,
                        line_number: idx + 1,
                        line: line.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Copy seed templates into the workspace on first onboarding.
    /// Existing files are never overwritten. Returns the copy count.
    pub fn copy_seeds(&self, seeds_dir: &Path, target_subdir: &str) -> EngineResult<usize> {
        if !seeds_dir.is_dir() {
            warn!("[workspace] Seeds dir not found: {}", seeds_dir.display());
            return Ok(0);
        }
        let dest_base = if target_subdir.is_empty() {
            self.root.clone()
        } else {
            self.resolve(target_subdir)?
        };
        let mut count = 0;
        copy_seeds_into(seeds_dir, &dest_base, &mut count)?;
        if count > 0 {
            info!(
                "[workspace] Copied {} seed files into {}/{}",
                count, self.workspace_id, target_subdir
            );
        }
        Ok(count)
    }

    /// Read state.json as a JSON object (empty object if missing).
    pub fn read_state(&self) -> EngineResult<Map<String, Value>> {
        match self.read("state.json")? {
            Some(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => Ok(map),
                _ => Ok(Map::new()),
            },
            None => Ok(Map::new()),
        }
    }

    /// Merge updates into state.json and stamp updated_at.
    pub fn update_state(&self, updates: Map<String, Value>) -> EngineResult<()> {
        let mut state = self.read_state()?;
        for (k, v) in updates {
            state.insert(k, v);
        }
        state.insert("updated_at".into(), json!(Utc::now().to_rfc3339()));
        self.write(
            "state.json",
            &serde_json::to_string_pretty(&Value::Object(state))?,
        )?;
        Ok(())
    }

    /// Resolve a relative path beneath the workspace root.
    /// Rejects absolute paths and any `..` component with `PathTraversal` —
    /// the check is lexical so it also covers not-yet-existing files.
    pub fn resolve(&self, relative_path: &str) -> EngineResult<PathBuf> {
        let rel = Path::new(relative_path);
        let mut clean = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(EngineError::PathTraversal(relative_path.to_string()));
                }
            }
        }
        Ok(self.root.join(clean))
    }
}

fn copy_seeds_into(src: &Path, dest: &Path, count: &mut usize) -> EngineResult<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_seeds_into(&from, &to, count)?;
        } else if entry.file_name() != ".gitkeep" && !to.exists() {
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&from, &to)?;
            *count += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, WorkspaceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = WorkspaceStore::new("T012345", tmp.path());
        ws.ensure_structure().unwrap();
        (tmp, ws)
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_tmp, ws) = store();
        ws.write("notes/today.md", "remember the milk").unwrap();
        assert_eq!(
            ws.read("notes/today.md").unwrap().as_deref(),
            Some("remember the milk")
        );
    }

    #[test]
    fn test_traversal_rejected_everywhere() {
        let (_tmp, ws) = store();
        for path in ["../escape.txt", "a/../../escape.txt", "/etc/passwd"] {
            assert!(matches!(
                ws.write(path, "x"),
                Err(EngineError::PathTraversal(_))
            ));
            assert!(matches!(ws.read(path), Err(EngineError::PathTraversal(_))));
            assert!(matches!(ws.delete(path), Err(EngineError::PathTraversal(_))));
        }
    }

    #[test]
    fn test_ensure_structure_creates_state() {
        let (_tmp, ws) = store();
        let state = ws.read_state().unwrap();
        assert_eq!(
            state.get("workspace_id").and_then(|v| v.as_str()),
            Some("T012345")
        );
        assert!(state.contains_key("created_at"));
    }

    #[test]
    fn test_update_state_merges_and_stamps() {
        let (_tmp, ws) = store();
        let mut updates = Map::new();
        updates.insert("onboarded_at".into(), json!("2026-01-01T00:00:00Z"));
        ws.update_state(updates).unwrap();

        let state = ws.read_state().unwrap();
        assert!(state.contains_key("created_at"));
        assert!(state.contains_key("onboarded_at"));
        assert!(state.contains_key("updated_at"));
    }

    #[test]
    fn test_append_and_delete() {
        let (_tmp, ws) = store();
        ws.append("logs/x.md", "line 1\n").unwrap();
        ws.append("logs/x.md", "line 2\n").unwrap();
        assert_eq!(ws.read("logs/x.md").unwrap().unwrap(), "line 1\nline 2\n");
        assert!(ws.delete("logs/x.md").unwrap());
        assert!(!ws.delete("logs/x.md").unwrap());
    }

    #[test]
    fn test_list_marks_directories() {
        let (_tmp, ws) = store();
        ws.write("data/metrics/2026-01-01.json", "{}").unwrap();
        let entries = ws.list("data").unwrap();
        assert!(entries.iter().any(|e| e == "data/metrics/"));
    }

    #[test]
    fn test_search_restricted_to_extensions() {
        let (_tmp, ws) = store();
        ws.write("skills/a/SKILL.md", "alpha needle here").unwrap();
        ws.write("scripts/bin.exe", "needle binary").unwrap();
        let hits = ws.search("NEEDLE", ".").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "skills/a/SKILL.md");
        assert_eq!(hits[0].line_number, 1);
    }

    #[test]
    fn test_copy_seeds_never_overwrites() {
        let (_tmp, ws) = store();
        let seeds = tempfile::tempdir().unwrap();
        std::fs::write(seeds.path().join("SKILL.md"), "seed content").unwrap();

        ws.write("company/SKILL.md", "existing").unwrap();
        let copied = ws.copy_seeds(seeds.path(), "company").unwrap();
        assert_eq!(copied, 0);
        assert_eq!(ws.read("company/SKILL.md").unwrap().unwrap(), "existing");

        let copied = ws.copy_seeds(seeds.path(), "team").unwrap();
        assert_eq!(copied, 1);
    }
}
