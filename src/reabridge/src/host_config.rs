//! Edits the web-interface entries in the host's `reaper.ini`.
//!
//! Control surfaces live in the `[reaper]` section as `csurf_cnt=<n>` plus
//! `csurf_0 … csurf_<n-1>`. A web interface entry reads
//! `HTTP 0 <port> '' 'index.html' 0 ''`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

pub const INI_FILE: &str = "reaper.ini";
const SECTION: &str = "[reaper]";
const COUNT_KEY: &str = "csurf_cnt";
const ENTRY_PREFIX: &str = "csurf_";

#[derive(Debug, Error)]
pub enum HostConfigError {
    #[error("failed to read host config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write host config {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

pub fn web_interface_entry(port: u16) -> String {
    format!("HTTP 0 {port} '' 'index.html' 0 ''")
}

/// Adds a web interface on `port`. Returns `false` when one already exists.
pub fn add_web_interface(path: &Path, port: u16) -> Result<bool, HostConfigError> {
    let text = read_or_empty(path)?;
    match with_web_interface(&text, port) {
        Some(updated) => {
            write(path, &updated)?;
            info!(path = %path.display(), port, "added web interface to host config");
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Removes every web interface on `port`. Returns `false` when none existed.
pub fn remove_web_interface(path: &Path, port: u16) -> Result<bool, HostConfigError> {
    if !path.exists() {
        return Ok(false);
    }
    let text = read_or_empty(path)?;
    match without_web_interface(&text, port) {
        Some(updated) => {
            write(path, &updated)?;
            info!(path = %path.display(), port, "removed web interface from host config");
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn has_web_interface(text: &str, port: u16) -> bool {
    let lines = lines_of(text);
    let Some((start, end)) = section_range(&lines) else {
        return false;
    };
    surfaces(&lines[start..end])
        .iter()
        .any(|entry| is_web_interface(entry, port))
}

pub fn with_web_interface(text: &str, port: u16) -> Option<String> {
    if has_web_interface(text, port) {
        return None;
    }
    Some(rewrite(text, |entries| entries.push(web_interface_entry(port))))
}

pub fn without_web_interface(text: &str, port: u16) -> Option<String> {
    if !has_web_interface(text, port) {
        return None;
    }
    Some(rewrite(text, |entries| {
        entries.retain(|entry| !is_web_interface(entry, port))
    }))
}

fn is_web_interface(entry: &str, port: u16) -> bool {
    let mut fields = entry.split_whitespace();
    fields.next() == Some("HTTP") && fields.nth(1) == Some(port.to_string().as_str())
}

/// Rebuilds the `[reaper]` surface list after `edit`, renumbering entries.
fn rewrite(text: &str, edit: impl FnOnce(&mut Vec<String>)) -> String {
    let mut lines = lines_of(text);
    let (start, end) = match section_range(&lines) {
        Some(range) => range,
        None => {
            if lines.last().is_some_and(|line| !line.is_empty()) {
                lines.push(String::new());
            }
            lines.push(SECTION.to_string());
            (lines.len() - 1, lines.len())
        }
    };

    let mut entries = surfaces(&lines[start..end]);
    edit(&mut entries);

    let mut body: Vec<String> = lines[start + 1..end]
        .iter()
        .filter(|line| surface_index(line).is_none() && !is_count_line(line))
        .cloned()
        .collect();
    let trailing_blank = body.iter().rev().take_while(|line| line.is_empty()).count();
    let insert_at = body.len() - trailing_blank;
    let mut surface_lines = vec![format!("{COUNT_KEY}={}", entries.len())];
    surface_lines.extend(
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| format!("{ENTRY_PREFIX}{index}={entry}")),
    );
    body.splice(insert_at..insert_at, surface_lines);

    lines.splice(start + 1..end, body);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn lines_of(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

/// Header index and end (exclusive) of the `[reaper]` section.
fn section_range(lines: &[String]) -> Option<(usize, usize)> {
    let start = lines
        .iter()
        .position(|line| line.trim().eq_ignore_ascii_case(SECTION))?;
    let end = lines[start + 1..]
        .iter()
        .position(|line| line.trim_start().starts_with('['))
        .map_or(lines.len(), |offset| start + 1 + offset);
    Some((start, end))
}

/// Surface entries of a section, ordered by index.
fn surfaces(section: &[String]) -> Vec<String> {
    let mut indexed: Vec<(usize, String)> = section
        .iter()
        .filter_map(|line| {
            let index = surface_index(line)?;
            let (_, value) = line.split_once('=')?;
            Some((index, value.to_string()))
        })
        .collect();
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, value)| value).collect()
}

fn surface_index(line: &str) -> Option<usize> {
    let (key, _) = line.split_once('=')?;
    key.trim().strip_prefix(ENTRY_PREFIX)?.parse().ok()
}

fn is_count_line(line: &str) -> bool {
    line.split_once('=')
        .is_some_and(|(key, _)| key.trim() == COUNT_KEY)
}

fn read_or_empty(path: &Path) -> Result<String, HostConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(HostConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write(path: &Path, text: &str) -> Result<(), HostConfigError> {
    fs::write(path, text).map_err(|source| HostConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
