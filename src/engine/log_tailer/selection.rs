use crate::error::LogError;
use crate::services::cmd_runner::expand_vars;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Newest modification time wins; ties go to the lexicographically greatest path.
pub fn pick_newest(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)))
}

/// Expand `pattern` and return the file a tail should follow, if any.
pub fn select_latest(pattern: &str) -> Result<Option<PathBuf>, LogError> {
    let expanded = expand_vars(pattern);
    let entries = glob::glob(&expanded).map_err(|e| LogError::Pattern {
        glob: pattern.to_string(),
        message: e.to_string(),
    })?;
    let candidates: Vec<Candidate> = entries
        .filter_map(Result::ok)
        .filter_map(|path| {
            let meta = std::fs::metadata(&path).ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some(Candidate { path, modified })
        })
        .collect();
    Ok(pick_newest(&candidates).map(|c| c.path.clone()))
}
