// src/sys/packager.rs

use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::{RelayError, Result};
use crate::sys::traits::{ArtifactPackager, PackageSummary};

/// Zips a job's output directory into a sibling `<job_id>.zip`.
pub struct ZipArtifactPackager {
    compression_level: i64,
}

impl ZipArtifactPackager {
    pub fn new() -> Self {
        Self { compression_level: 6 }
    }
}

impl Default for ZipArtifactPackager {
    fn default() -> Self {
        Self::new()
    }
}

/// `a/b/c.txt` relative to `root`, always with `/` separators.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn write_archive(source_dir: &Path, archive_path: &Path, level: i64) -> Result<PackageSummary> {
    let tmp_path = PathBuf::from(format!("{}.tmp", archive_path.display()));
    let file = File::create(&tmp_path)
        .map_err(|e| RelayError::io(format!("Failed to create {}", tmp_path.display()), e))?;

    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(level))
        .unix_permissions(0o644);

    let mut files = 0;
    let walker = WalkDir::new(source_dir).follow_links(false).sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| {
            let context = format!("Failed to walk {}", source_dir.display());
            RelayError::io(context, io::Error::other(e))
        })?;
        let Some(name) = entry_name(source_dir, entry.path()) else {
            continue; // the root itself
        };

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut src = File::open(entry.path())
                .map_err(|e| RelayError::io(format!("Failed to read {}", entry.path().display()), e))?;
            io::copy(&mut src, &mut zip)
                .map_err(|e| RelayError::io(format!("Failed to compress {}", entry.path().display()), e))?;
            files += 1;
        }
        // Symlinks are skipped: the playbook output is plain files.
    }

    zip.finish()?;

    // Atomic swap into place.
    std::fs::rename(&tmp_path, archive_path)
        .map_err(|e| RelayError::io(format!("Failed to publish {}", archive_path.display()), e))?;

    let bytes = std::fs::metadata(archive_path).map(|m| m.len()).unwrap_or(0);
    Ok(PackageSummary { files, bytes })
}

#[async_trait]
impl ArtifactPackager for ZipArtifactPackager {
    async fn package(&self, source_dir: &Path, archive_path: &Path) -> Result<PackageSummary> {
        let source_dir = source_dir.to_path_buf();
        let archive_path = archive_path.to_path_buf();
        let level = self.compression_level;

        tokio::task::spawn_blocking(move || {
            let result = write_archive(&source_dir, &archive_path, level);
            if result.is_err() {
                let _ = std::fs::remove_file(format!("{}.tmp", archive_path.display()));
            }
            result
        })
        .await
        .map_err(|e| RelayError::io("Archive task panicked", io::Error::other(e)))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;

    /// Reads every file entry back as `name -> contents`.
    pub(crate) fn unzip(bytes: &[u8]) -> BTreeMap<String, String> {
        let mut archive = zip::ZipArchive::new(io::Cursor::new(bytes)).unwrap();
        let mut out = BTreeMap::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            if entry.is_dir() {
                continue;
            }
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            out.insert(entry.name().to_string(), contents);
        }
        out
    }

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join("10.0.0.1")).unwrap();
        std::fs::create_dir_all(dir.join("empty")).unwrap();
        std::fs::write(dir.join("summary.txt"), "ok=3 failed=0\n").unwrap();
        std::fs::write(dir.join("10.0.0.1").join("facts.json"), "{\"cpu\": 4}").unwrap();
    }

    #[tokio::test]
    async fn archive_reproduces_output_tree() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("job");
        populate(&output);
        let archive = root.path().join("job.zip");

        let summary = ZipArtifactPackager::new().package(&output, &archive).await.unwrap();

        assert_eq!(summary.files, 2);
        assert!(summary.bytes > 0);
        assert!(!root.path().join("job.zip.tmp").exists());

        let entries = unzip(&std::fs::read(&archive).unwrap());
        let expected: BTreeMap<String, String> = [
            ("10.0.0.1/facts.json".to_string(), "{\"cpu\": 4}".to_string()),
            ("summary.txt".to_string(), "ok=3 failed=0\n".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(entries, expected);

        let names: Vec<String> = {
            let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
            (0..zip.len()).map(|i| zip.by_index(i).unwrap().name().to_string()).collect()
        };
        assert!(names.contains(&"empty/".to_string()));
    }

    #[tokio::test]
    async fn packaging_twice_yields_identical_contents() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("job");
        populate(&output);
        let packager = ZipArtifactPackager::new();

        packager.package(&output, &root.path().join("a.zip")).await.unwrap();
        packager.package(&output, &root.path().join("b.zip")).await.unwrap();

        let a = unzip(&std::fs::read(root.path().join("a.zip")).unwrap());
        let b = unzip(&std::fs::read(root.path().join("b.zip")).unwrap());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn empty_output_dir_still_packages() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("job");
        std::fs::create_dir_all(&output).unwrap();

        let summary = ZipArtifactPackager::new()
            .package(&output, &root.path().join("job.zip"))
            .await
            .unwrap();

        assert_eq!(summary.files, 0);
        assert!(unzip(&std::fs::read(root.path().join("job.zip")).unwrap()).is_empty());
    }

    #[tokio::test]
    async fn missing_output_dir_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let err = ZipArtifactPackager::new()
            .package(&root.path().join("nope"), &root.path().join("nope.zip"))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Io { .. }));
        assert!(!root.path().join("nope.zip.tmp").exists());
    }
}
