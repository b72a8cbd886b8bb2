//! Render artifact naming convention.
//!
//! Every job writes exactly one file at a deterministic location:
//! `{output_dir}/{session}/{job_id}.{ext}`. Job ids are UUIDs, so paths
//! never collide; the session segment is sanitised so an arbitrary
//! session id cannot escape the output directory.

use std::path::{Path, PathBuf};

use crate::render::ImageFormat;
use crate::types::JobId;

/// Maximum length of the session directory segment.
const MAX_SEGMENT_LEN: usize = 64;

/// Reduce a session id to `[A-Za-z0-9_-]`, replacing everything else with `_`.
///
/// ```
/// use molview_core::naming::session_dir_name;
///
/// assert_eq!(session_dir_name("abc-123"), "abc-123");
/// assert_eq!(session_dir_name("../etc/passwd"), "___etc_passwd");
/// assert_eq!(session_dir_name(""), "_");
/// ```
pub fn session_dir_name(session_id: &str) -> String {
    let name: String = session_id
        .chars()
        .take(MAX_SEGMENT_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

/// Directory holding all artifacts for `session_id`.
pub fn session_output_dir(output_dir: &Path, session_id: &str) -> PathBuf {
    output_dir.join(session_dir_name(session_id))
}

/// Output file path for a single render job.
pub fn job_output_path(
    output_dir: &Path,
    session_id: &str,
    job_id: JobId,
    format: ImageFormat,
) -> PathBuf {
    session_output_dir(output_dir, session_id).join(format!("{job_id}.{}", format.extension()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_layout() {
        let id = uuid::Uuid::nil();
        let path = job_output_path(Path::new("/renders"), "s1", id, ImageFormat::Jpeg);
        assert_eq!(
            path,
            PathBuf::from("/renders/s1/00000000-0000-0000-0000-000000000000.jpg")
        );
    }

    #[test]
    fn traversal_is_neutralised() {
        let path = job_output_path(
            Path::new("/renders"),
            "../../tmp",
            uuid::Uuid::nil(),
            ImageFormat::Png,
        );
        assert!(path.starts_with("/renders"));
        assert_eq!(path.components().count(), 4);
    }

    #[test]
    fn long_session_ids_are_capped() {
        let long = "a".repeat(500);
        assert_eq!(session_dir_name(&long).len(), MAX_SEGMENT_LEN);
    }

    #[test]
    fn distinct_jobs_get_distinct_paths() {
        let dir = Path::new("/renders");
        let a = job_output_path(dir, "s", uuid::Uuid::new_v4(), ImageFormat::Png);
        let b = job_output_path(dir, "s", uuid::Uuid::new_v4(), ImageFormat::Png);
        assert_ne!(a, b);
    }
}
