//! Deterministic names for the files a job produces.
//!
//! The annotator writes its outputs next to the staged input, and the
//! results bucket mirrors that layout under the user's prefix, so every
//! location here can be recomputed from the job record alone.

use std::path::{Path, PathBuf};

use crate::storage::store::ObjectLocation;

pub const RESULT_SUFFIX: &str = ".annot.vcf";
pub const LOG_SUFFIX: &str = ".count.log";

/// File name stem up to the first `.`.
pub fn file_stem(input_file_name: &str) -> &str {
    input_file_name
        .split_once('.')
        .map_or(input_file_name, |(stem, _)| stem)
}

pub fn result_file_name(input_file_name: &str) -> String {
    format!("{}{RESULT_SUFFIX}", file_stem(input_file_name))
}

pub fn log_file_name(input_file_name: &str) -> String {
    format!("{input_file_name}{LOG_SUFFIX}")
}

pub fn input_key(key_prefix: &str, user_id: &str, job_id: &str, input_file_name: &str) -> String {
    format!("{key_prefix}{user_id}/{job_id}~{input_file_name}")
}

fn job_result_prefix(key_prefix: &str, user_id: &str, job_id: &str) -> String {
    format!("{key_prefix}{user_id}/{job_id}/")
}

pub fn result_location(
    results_bucket: &str,
    key_prefix: &str,
    user_id: &str,
    job_id: &str,
    input_file_name: &str,
) -> ObjectLocation {
    ObjectLocation::new(
        results_bucket,
        format!(
            "{}{}",
            job_result_prefix(key_prefix, user_id, job_id),
            result_file_name(input_file_name)
        ),
    )
}

pub fn log_location(
    results_bucket: &str,
    key_prefix: &str,
    user_id: &str,
    job_id: &str,
    input_file_name: &str,
) -> ObjectLocation {
    ObjectLocation::new(
        results_bucket,
        format!(
            "{}{}",
            job_result_prefix(key_prefix, user_id, job_id),
            log_file_name(input_file_name)
        ),
    )
}

/// Working directory holding one job's staged input and outputs.
pub fn staging_dir(staging_root: &Path, user_id: &str, job_id: &str) -> PathBuf {
    staging_root.join(user_id).join(job_id)
}

/// Output locations of a finished run, derived from the staged input path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifacts {
    pub result: PathBuf,
    pub log: PathBuf,
}

impl LocalArtifacts {
    pub fn for_staged_input(staged_input: &Path) -> Option<Self> {
        let dir = staged_input.parent()?;
        let file_name = staged_input.file_name()?.to_str()?;

        Some(Self {
            result: dir.join(result_file_name(file_name)),
            log: dir.join(log_file_name(file_name)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_names_use_first_dot_stem() {
        assert_eq!(result_file_name("free_1.part.vcf"), "free_1.annot.vcf");
        assert_eq!(log_file_name("free_1.part.vcf"), "free_1.part.vcf.count.log");
        assert_eq!(result_file_name("noext"), "noext.annot.vcf");
    }

    #[test]
    fn test_result_and_log_share_job_prefix() {
        let result = result_location("results", "gas/", "u1", "j1", "sample.vcf");
        let log = log_location("results", "gas/", "u1", "j1", "sample.vcf");

        assert_eq!(result.bucket, "results");
        assert_eq!(result.key, "gas/u1/j1/sample.annot.vcf");
        assert_eq!(log.key, "gas/u1/j1/sample.vcf.count.log");
    }

    #[test]
    fn test_local_artifacts_sit_next_to_staged_input() {
        let staged = staging_dir(Path::new("/tmp/stage"), "u1", "j1").join("sample.vcf");
        let artifacts = LocalArtifacts::for_staged_input(&staged).expect("artifacts");

        assert_eq!(artifacts.result, Path::new("/tmp/stage/u1/j1/sample.annot.vcf"));
        assert_eq!(artifacts.log, Path::new("/tmp/stage/u1/j1/sample.vcf.count.log"));
    }
}
