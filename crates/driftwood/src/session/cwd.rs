//! Best-effort working-directory tracking.
//!
//! Two independent signals feed the tracker: bare `cd` invocations parsed
//! out of submitted command lines, and a path token embedded in the
//! terminal's reported window title, which takes precedence when present.
//! Compound or piped commands are never parsed; the answer there is "no
//! update", not an error.

use std::mem;
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CwdResolution {
    Resolved(PathBuf),
    Unresolved,
}

#[derive(Debug)]
pub struct CwdTracker {
    current: PathBuf,
    previous: Option<PathBuf>,
    home: Option<PathBuf>,
}

impl CwdTracker {
    pub fn new(initial: PathBuf, home: Option<PathBuf>) -> Self {
        CwdTracker {
            current: initial,
            previous: None,
            home,
        }
    }

    pub fn current(&self) -> &Path {
        &self.current
    }

    /// Applies a submitted command line if it is a bare `cd`.
    pub fn observe_command(&mut self, line: &str) -> CwdResolution {
        match parse_cd_target(
            line,
            &self.current,
            self.previous.as_deref(),
            self.home.as_deref(),
        ) {
            Some(path) => {
                self.previous = Some(mem::replace(&mut self.current, path.clone()));
                CwdResolution::Resolved(path)
            }
            None => CwdResolution::Unresolved,
        }
    }

    /// Applies a window title carrying a path token.
    pub fn observe_title(&mut self, title: &str) -> CwdResolution {
        match title_path_token(title, self.home.as_deref()) {
            Some(path) => {
                if path != self.current {
                    self.previous = Some(mem::replace(&mut self.current, path.clone()));
                }
                CwdResolution::Resolved(path)
            }
            None => CwdResolution::Unresolved,
        }
    }
}

fn parse_cd_target(
    line: &str,
    current: &Path,
    previous: Option<&Path>,
    home: Option<&Path>,
) -> Option<PathBuf> {
    let line = line.trim();
    // Anything compound is out of scope for the heuristic.
    if line.contains(['|', ';', '&']) {
        return None;
    }
    let mut words = line.split_whitespace();
    if words.next()? != "cd" {
        return None;
    }
    let target = words.next();
    if words.next().is_some() {
        return None;
    }
    match target {
        None | Some("~") => home.map(Path::to_path_buf),
        Some("-") => previous.map(Path::to_path_buf),
        Some(arg) => expand_path(arg, current, home),
    }
}

fn expand_path(arg: &str, current: &Path, home: Option<&Path>) -> Option<PathBuf> {
    if let Some(rest) = arg.strip_prefix("~/") {
        return home.map(|home| normalize(&home.join(rest)));
    }
    let path = Path::new(arg);
    if path.is_absolute() {
        Some(normalize(path))
    } else {
        Some(normalize(&current.join(path)))
    }
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem; `..` at the root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::RootDir);
                }
            }
            other => normalized.push(other),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(Component::RootDir);
    }
    normalized
}

/// Finds a path token in a window title such as `host: ~/src` or
/// `/var/log - tail`.
fn title_path_token(title: &str, home: Option<&Path>) -> Option<PathBuf> {
    for token in title.split_whitespace() {
        if token == "~" {
            return home.map(Path::to_path_buf);
        }
        if let Some(rest) = token.strip_prefix("~/") {
            return home.map(|home| normalize(&home.join(rest)));
        }
        if token.starts_with('/') {
            return Some(normalize(Path::new(token)));
        }
    }
    None
}
