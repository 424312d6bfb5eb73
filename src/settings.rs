//! Policy discovery for the host process

use std::path::{Path, PathBuf};

use browserflow_policy_center::{load_snapshot_with_options, LoadOptions, PolicyError, PolicySnapshot};
use tracing::debug;

const LOCAL_POLICY: &str = "config/browserflow.yaml";

/// Candidate policy files in lookup order, first existing one wins.
pub fn policy_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_POLICY)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("browserflow").join("policy.yaml"));
    }
    paths
}

/// Loads the effective policy.
///
/// An explicit `path` must exist. Without one the search paths are tried and
/// built-in defaults are used when none exists. Environment overlays and
/// `overrides` (`path=value` pairs) are applied on top.
pub fn load_policy(path: Option<&Path>, overrides: &[String]) -> Result<PolicySnapshot, PolicyError> {
    let file = match path {
        Some(explicit) => Some(explicit.to_path_buf()),
        None => policy_search_paths().into_iter().find(|candidate| candidate.exists()),
    };
    if let Some(file) = &file {
        debug!(path = %file.display(), "using policy file");
    }

    let options = LoadOptions {
        paths: file.into_iter().collect(),
        include_env: true,
        include_cli_env: true,
        cli_overrides: overrides.to_vec(),
    };
    load_snapshot_with_options(&options)
}
