//! Snapshot file management for the CLI.
//!
//! Everything here is blocking (std::fs, editor processes, stdin prompts)
//! and is meant to run on tokio's blocking pool.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use clientsync_common::SNAPSHOT_EXTENSION;

/// Content of a freshly added file before the editor opens.
const NEW_FILE_TEMPLATE: &str = "{\n\n}";

/// Resolve `name` inside `dir`, rejecting anything that is not a bare file name.
pub fn resolve(dir: &Path, name: &str) -> Result<PathBuf> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        bail!("Invalid file name: '{}'", name);
    }
    Ok(dir.join(name))
}

fn has_snapshot_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == SNAPSHOT_EXTENSION)
        .unwrap_or(false)
}

/// Pretty-printed content of a snapshot file.
pub fn show(dir: &Path, name: &str) -> Result<String> {
    let path = resolve(dir, name)?;
    let content =
        fs::read(&path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    let value: Value = serde_json::from_slice(&content)
        .with_context(|| format!("'{}' is not valid JSON", name))?;
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Delete a snapshot file.
pub fn delete(dir: &Path, name: &str) -> Result<()> {
    let path = resolve(dir, name)?;
    if !path.is_file() {
        bail!("File '{}' not found", name);
    }
    fs::remove_file(&path).with_context(|| format!("Failed to delete '{}'", path.display()))?;
    info!(file = name, "Snapshot file deleted");
    Ok(())
}

/// Ask a yes/no question on stdin. Anything but `y`/`yes`/`s` is a no.
pub fn confirm(question: &str) -> Result<bool> {
    print!("{} (y/n): ", question);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

/// Whether a prompt answer means yes.
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "s")
}

/// Editor to launch: `$EDITOR`, else the platform default.
pub fn editor_command() -> String {
    match std::env::var("EDITOR") {
        Ok(editor) if !editor.trim().is_empty() => editor,
        _ if cfg!(windows) => "notepad".to_string(),
        _ => "vi".to_string(),
    }
}

fn run_editor(editor: &str, path: &Path) -> Result<()> {
    let status = Command::new(editor)
        .arg(path)
        .status()
        .with_context(|| format!("Failed to launch editor '{}'", editor))?;
    if !status.success() {
        warn!(editor, "Editor exited with {}", status);
    }
    Ok(())
}

/// Create a new snapshot file from a template, then open it in `editor`.
pub fn add(dir: &Path, name: &str, editor: &str) -> Result<()> {
    let path = resolve(dir, name)?;
    if !has_snapshot_extension(&path) {
        bail!("File name must end in .{}", SNAPSHOT_EXTENSION);
    }

    fs::create_dir_all(dir).with_context(|| format!("Failed to create '{}'", dir.display()))?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => anyhow::anyhow!("File '{}' already exists", name),
            _ => anyhow::Error::new(e).context(format!("Failed to create '{}'", name)),
        })?;
    file.write_all(NEW_FILE_TEMPLATE.as_bytes())?;
    drop(file);

    run_editor(editor, &path)?;

    let content = fs::read(&path)?;
    if serde_json::from_slice::<Value>(&content).is_err() {
        bail!("'{}' was saved but is not valid JSON", name);
    }
    info!(file = name, "Snapshot file added");
    Ok(())
}

/// Open an existing snapshot file in `editor`, keeping a `.bak` copy.
pub fn edit(dir: &Path, name: &str, editor: &str) -> Result<()> {
    let path = resolve(dir, name)?;
    if !path.is_file() {
        bail!("File '{}' not found", name);
    }

    let backup = backup_path(&path);
    fs::copy(&path, &backup)
        .with_context(|| format!("Failed to back up '{}'", path.display()))?;

    run_editor(editor, &path)?;
    finish_edit(&path, &backup)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

/// Keep the edit if it is valid JSON, otherwise restore the backup.
pub fn finish_edit(path: &Path, backup: &Path) -> Result<()> {
    let valid = fs::read(path)
        .ok()
        .map(|content| serde_json::from_slice::<Value>(&content).is_ok())
        .unwrap_or(false);

    if valid {
        fs::remove_file(backup).ok();
        info!(file = %path.display(), "Snapshot file edited");
        return Ok(());
    }

    fs::rename(backup, path)
        .with_context(|| format!("Failed to restore backup of '{}'", path.display()))?;
    bail!(
        "Edited content is not valid JSON, '{}' was restored",
        path.display()
    )
}
