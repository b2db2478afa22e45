//! Artifact bundling
//!
//! Packs the paths a job declares under `artifacts` into one gzipped tar
//! archive, relative to the job workspace.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::{Component, Path};

/// A packed archive plus the declared paths that did not exist
#[derive(Debug)]
pub struct Bundle {
    pub data: Vec<u8>,
    pub files: usize,
    pub missing: Vec<String>,
}

/// Only plain relative paths inside the workspace may be archived
fn is_workspace_relative(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Pack `paths` from `workspace`; `None` when none of them exist
pub fn bundle(workspace: &Path, paths: &[String]) -> Result<Option<Bundle>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut files = 0;
    let mut missing = Vec::new();

    for declared in paths {
        let relative = Path::new(declared);
        if !is_workspace_relative(relative) {
            anyhow::bail!("Artifact path {} leaves the workspace", declared);
        }

        let full = workspace.join(relative);
        if full.is_dir() {
            builder
                .append_dir_all(relative, &full)
                .with_context(|| format!("Failed to add directory {}", declared))?;
            files += 1;
        } else if full.is_file() {
            builder
                .append_path_with_name(&full, relative)
                .with_context(|| format!("Failed to add file {}", declared))?;
            files += 1;
        } else {
            missing.push(declared.clone());
        }
    }

    if files == 0 {
        return Ok(None);
    }

    let encoder = builder.into_inner().context("Failed to finish tar archive")?;
    let data = encoder.finish().context("Failed to finish gzip compression")?;

    Ok(Some(Bundle {
        data,
        files,
        missing,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn entries(data: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(data));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_bundle_files_and_directories() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(workspace.path().join("dist/js")).unwrap();
        std::fs::write(workspace.path().join("dist/js/app.js"), "app").unwrap();
        std::fs::write(workspace.path().join("report.xml"), "<ok/>").unwrap();

        let bundle = bundle(
            workspace.path(),
            &["dist".to_string(), "report.xml".to_string(), "gone.log".to_string()],
        )
        .unwrap()
        .unwrap();

        assert_eq!(bundle.files, 2);
        assert_eq!(bundle.missing, vec!["gone.log".to_string()]);
        let names = entries(&bundle.data);
        assert!(names.contains(&"dist/js/app.js".to_string()));
        assert!(names.contains(&"report.xml".to_string()));
    }

    #[test]
    fn test_nothing_to_bundle() {
        let workspace = tempfile::tempdir().unwrap();
        assert!(bundle(workspace.path(), &["missing".to_string()]).unwrap().is_none());
    }

    #[test]
    fn test_paths_must_stay_in_workspace() {
        let workspace = tempfile::tempdir().unwrap();
        assert!(bundle(workspace.path(), &["../etc/passwd".to_string()]).is_err());
        assert!(bundle(workspace.path(), &["/etc/passwd".to_string()]).is_err());
    }
}
