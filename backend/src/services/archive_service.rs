//! Source archive generation and upload extraction.

use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use flate2::{Compression, GzBuilder};
use walkdir::WalkDir;

use crate::config::{ArchiveFormat, Config};
use crate::error::{AppError, Result};
use crate::models::identifiers::ModuleProviderId;
use crate::models::module_provider::ModuleProvider;
use crate::models::module_version::ArchiveInfo;
use crate::models::version::Version;
use crate::storage::{self, StorageBackend};

pub const EXTERNALLY_HOSTED_SKIP_REASON: &str =
    "Module is hosted externally and DELETE_EXTERNALLY_HOSTED_ARTIFACTS is enabled; \
     Terraform downloads the source from the upstream repository";

const FILE_MODE: u32 = 0o644;

/// Bounds applied while extracting an uploaded archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    /// Total decompressed bytes across all entries.
    pub max_bytes: u64,
    /// Entries of any type, directories included.
    pub max_entries: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024 * 1024,
            max_entries: 10_000,
        }
    }
}

/// A file to be placed in an archive, keyed by its forward-slash relative path.
#[derive(Debug, Clone, PartialEq)]
struct SourceFile {
    path: String,
    content: Vec<u8>,
}

pub struct ArchiveService {
    storage: Arc<dyn StorageBackend>,
    formats: Vec<ArchiveFormat>,
    delete_externally_hosted: bool,
    extract_limits: ExtractLimits,
}

impl ArchiveService {
    pub fn new(config: &Config, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            formats: config.archive_formats.clone(),
            delete_externally_hosted: config.delete_externally_hosted_artifacts,
            extract_limits: ExtractLimits {
                max_bytes: config.upload_max_extracted_bytes,
                max_entries: config.upload_max_entries,
            },
        }
    }

    /// Extract an uploaded archive within the configured limits.
    pub async fn extract_upload(&self, content: Bytes, dest: &Path) -> Result<usize> {
        extract_upload(content, dest, self.extract_limits).await
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Whether archives for this provider are skipped by policy.
    pub fn skips(&self, provider: &ModuleProvider) -> bool {
        self.delete_externally_hosted && provider.is_externally_hosted()
    }

    /// Build every configured archive of `source_dir` and store it.
    pub async fn generate(
        &self,
        provider: &ModuleProvider,
        version: &Version,
        source_dir: &Path,
    ) -> Result<ArchiveInfo> {
        let root = source_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&root))
            .await
            .map_err(|e| AppError::Internal(format!("Archive task failed: {}", e)))??;

        if self.skips(provider) {
            tracing::info!(
                provider = %provider.ident,
                version = %version,
                "Skipping archive generation for externally hosted module"
            );
            return Ok(ArchiveInfo {
                keys: Vec::new(),
                total_bytes: 0,
                source_file_count: files.len() as u64,
                skipped_reason: Some(EXTERNALLY_HOSTED_SKIP_REASON.to_string()),
            });
        }

        let files = Arc::new(files);
        let mut info = ArchiveInfo {
            source_file_count: files.len() as u64,
            ..Default::default()
        };
        for format in &self.formats {
            let format = *format;
            let input = files.clone();
            let bytes = tokio::task::spawn_blocking(move || build_archive(format, &input))
                .await
                .map_err(|e| AppError::Internal(format!("Archive task failed: {}", e)))??;

            let key = storage::archive_key(&provider.ident, version, format.extension());
            info.total_bytes += bytes.len() as u64;
            self.storage
                .put(&key, Bytes::from(bytes))
                .await
                .map_err(|e| AppError::ArchiveFailed(format!("Cannot store {}: {}", key, e)))?;
            info.keys.push((format.extension().to_string(), key));
        }

        tracing::info!(
            provider = %provider.ident,
            version = %version,
            files = info.source_file_count,
            bytes = info.total_bytes,
            "Generated source archives"
        );
        Ok(info)
    }

    pub async fn read(&self, key: &str) -> Result<Bytes> {
        self.storage.get(key).await
    }

    /// Remove stored archives listed in `info`.
    pub async fn delete(&self, info: &ArchiveInfo) -> Result<()> {
        for (_, key) in &info.keys {
            self.storage.delete(key).await?;
        }
        Ok(())
    }

    pub async fn delete_version(&self, id: &ModuleProviderId, version: &Version) -> Result<()> {
        self.storage
            .delete_prefix(&storage::version_prefix(id, version))
            .await
    }

    pub async fn delete_provider(&self, id: &ModuleProviderId) -> Result<()> {
        self.storage.delete_prefix(&storage::provider_prefix(id)).await
    }
}

fn collect_files(root: &Path) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| AppError::ArchiveFailed(format!("Cannot walk source: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| AppError::ArchiveFailed(e.to_string()))?;
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(SourceFile {
            path,
            content: std::fs::read(entry.path())?,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn build_archive(format: ArchiveFormat, files: &[SourceFile]) -> Result<Vec<u8>> {
    match format {
        ArchiveFormat::Zip => build_zip(files),
        ArchiveFormat::TarGz => build_tar_gz(files),
    }
    .map_err(|e| match e {
        AppError::ArchiveFailed(_) => e,
        other => AppError::ArchiveFailed(other.to_string()),
    })
}

fn build_zip(files: &[SourceFile]) -> Result<Vec<u8>> {
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(FILE_MODE);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for file in files {
        writer
            .start_file(file.path.as_str(), options)
            .map_err(|e| AppError::ArchiveFailed(format!("zip entry {}: {}", file.path, e)))?;
        writer.write_all(&file.content)?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| AppError::ArchiveFailed(format!("zip finish: {}", e)))?;
    Ok(cursor.into_inner())
}

fn build_tar_gz(files: &[SourceFile]) -> Result<Vec<u8>> {
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.content.len() as u64);
        header.set_mode(FILE_MODE);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, &file.path, file.content.as_slice())?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Upload archive formats recognised by their leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Zip,
    TarGz,
}

impl UploadFormat {
    pub fn detect(content: &[u8]) -> Option<Self> {
        if content.starts_with(b"PK\x03\x04") {
            Some(Self::Zip)
        } else if content.starts_with(&[0x1f, 0x8b]) {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

fn safe_relative_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(AppError::Validation(format!(
                    "Archive entry escapes extraction root: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(clean)
}

/// Extract an uploaded `.zip` or `.tar.gz` into `dest`. Returns the number of
/// files written. Entries that would land outside `dest`, or that push the
/// archive past `limits`, are rejected.
pub async fn extract_upload(content: Bytes, dest: &Path, limits: ExtractLimits) -> Result<usize> {
    let format = UploadFormat::detect(&content).ok_or_else(|| {
        AppError::Validation("Upload must be a zip or tar.gz archive".to_string())
    })?;
    let target = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut budget = ExtractBudget::new(limits);
        match format {
            UploadFormat::Zip => extract_zip(&content, &target, &mut budget),
            UploadFormat::TarGz => extract_tar_gz(&content, &target, &mut budget),
        }
    })
    .await
    .map_err(|e| AppError::Internal(format!("Archive extraction task failed: {}", e)))?
}

/// Running totals of an extraction against its limits.
struct ExtractBudget {
    limits: ExtractLimits,
    bytes: u64,
    entries: usize,
}

impl ExtractBudget {
    fn new(limits: ExtractLimits) -> Self {
        Self {
            limits,
            bytes: 0,
            entries: 0,
        }
    }

    fn count_entry(&mut self) -> Result<()> {
        self.entries += 1;
        if self.entries > self.limits.max_entries {
            return Err(AppError::Validation(format!(
                "Upload contains more than {} entries",
                self.limits.max_entries
            )));
        }
        Ok(())
    }

    fn remaining(&self) -> u64 {
        self.limits.max_bytes.saturating_sub(self.bytes)
    }

    fn too_large(&self) -> AppError {
        AppError::Validation(format!(
            "Upload expands to more than {} bytes",
            self.limits.max_bytes
        ))
    }

    fn consume(&mut self, written: u64) -> Result<()> {
        self.bytes += written;
        if self.bytes > self.limits.max_bytes {
            return Err(self.too_large());
        }
        Ok(())
    }
}

fn write_entry(
    target: &Path,
    relative: &Path,
    reader: &mut dyn Read,
    budget: &mut ExtractBudget,
) -> Result<()> {
    let out_path = target.join(relative);
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out_file = std::fs::File::create(&out_path)?;
    // One byte past the budget is enough to detect an overrun.
    let mut limited = Read::take(reader, budget.remaining().saturating_add(1));
    let written = std::io::copy(&mut limited, &mut out_file)?;
    budget.consume(written)
}

fn extract_zip(content: &[u8], target: &Path, budget: &mut ExtractBudget) -> Result<usize> {
    let mut archive = zip::ZipArchive::new(Cursor::new(content))
        .map_err(|e| AppError::Validation(format!("Failed to open zip archive: {}", e)))?;
    if archive.len() > budget.limits.max_entries {
        return Err(AppError::Validation(format!(
            "Upload contains more than {} entries",
            budget.limits.max_entries
        )));
    }
    let mut written = 0;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| AppError::Validation(format!("Failed to read zip entry {}: {}", i, e)))?;
        budget.count_entry()?;
        let name = file.name().to_string();
        if file.enclosed_name().is_none() {
            return Err(AppError::Validation(format!(
                "Archive entry escapes extraction root: {}",
                name
            )));
        }
        let relative = safe_relative_path(Path::new(&name))?;
        if file.is_dir() {
            std::fs::create_dir_all(target.join(&relative))?;
        } else if !file.is_symlink() {
            if file.size() > budget.remaining() {
                return Err(budget.too_large());
            }
            write_entry(target, &relative, &mut file, budget)?;
            written += 1;
        }
    }
    Ok(written)
}

fn extract_tar_gz(content: &[u8], target: &Path, budget: &mut ExtractBudget) -> Result<usize> {
    let decoder = flate2::read::GzDecoder::new(content);
    let mut archive = tar::Archive::new(decoder);
    let mut written = 0;
    let entries = archive
        .entries()
        .map_err(|e| AppError::Validation(format!("Failed to read tar.gz archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| AppError::Validation(format!("Corrupt tar entry: {}", e)))?;
        budget.count_entry()?;
        let path = entry
            .path()
            .map_err(|e| AppError::Validation(format!("Invalid tar entry path: {}", e)))?
            .into_owned();
        let relative = safe_relative_path(&path)?;
        match entry.header().entry_type() {
            tar::EntryType::Directory => std::fs::create_dir_all(target.join(&relative))?,
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if relative.as_os_str().is_empty() {
                    continue;
                }
                if entry.size() > budget.remaining() {
                    return Err(budget.too_large());
                }
                write_entry(target, &relative, &mut entry, budget)?;
                written += 1;
            }
            // Links and special files are never extracted.
            _ => continue,
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::module_provider::GitConfig;
    use crate::storage::filesystem::FilesystemStorage;

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("modules/sub")).unwrap();
        std::fs::write(dir.path().join("main.tf"), "resource \"null_resource\" \"a\" {}").unwrap();
        std::fs::write(dir.path().join("modules/sub/main.tf"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "# Module").unwrap();
        dir
    }

    fn provider(clone_url: Option<&str>) -> ModuleProvider {
        ModuleProvider::new(
            ModuleProviderId::new("acme", "vpc", "aws").unwrap(),
            GitConfig {
                repo_clone_url_template: clone_url.map(str::to_string),
                ..GitConfig::default()
            },
        )
    }

    fn service(data: &Path, delete_external: bool) -> ArchiveService {
        let config = Config {
            delete_externally_hosted_artifacts: delete_external,
            archive_formats: vec![ArchiveFormat::Zip, ArchiveFormat::TarGz],
            ..Config::default()
        };
        ArchiveService::new(&config, Arc::new(FilesystemStorage::new(data)))
    }

    #[test]
    fn test_archives_are_deterministic() {
        let dir = source_tree();
        let files = collect_files(dir.path()).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "main.tf", "modules/sub/main.tf"]);

        assert_eq!(build_zip(&files).unwrap(), build_zip(&files).unwrap());
        assert_eq!(build_tar_gz(&files).unwrap(), build_tar_gz(&files).unwrap());
    }

    #[tokio::test]
    async fn test_generate_stores_archives() {
        let src = source_tree();
        let data = tempfile::tempdir().unwrap();
        let svc = service(data.path(), false);
        let version = Version::parse("1.0.0").unwrap();
        let info = svc.generate(&provider(None), &version, src.path()).await.unwrap();

        assert_eq!(info.source_file_count, 3);
        assert!(info.skipped_reason.is_none());
        assert_eq!(info.key_for("zip"), Some("acme/vpc/aws/1.0.0/source.zip"));
        let zip_bytes = svc.read("acme/vpc/aws/1.0.0/source.zip").await.unwrap();
        let tar_bytes = svc.read("acme/vpc/aws/1.0.0/source.tar.gz").await.unwrap();
        assert_eq!(info.total_bytes, (zip_bytes.len() + tar_bytes.len()) as u64);

        let out = tempfile::tempdir().unwrap();
        assert_eq!(extract_upload(tar_bytes, out.path(), ExtractLimits::default()).await.unwrap(), 3);
        assert!(out.path().join("modules/sub/main.tf").is_file());
    }

    #[tokio::test]
    async fn test_externally_hosted_skip() {
        let src = source_tree();
        let data = tempfile::tempdir().unwrap();
        let svc = service(data.path(), true);
        let version = Version::parse("1.0.0").unwrap();
        let info = svc
            .generate(&provider(Some("https://git.example.com/{module}.git")), &version, src.path())
            .await
            .unwrap();
        assert!(info.skipped_reason.is_some());
        assert!(info.keys.is_empty());
        assert_eq!(info.total_bytes, 0);
        assert!(!svc
            .storage()
            .exists("acme/vpc/aws/1.0.0/source.zip")
            .await
            .unwrap());

        // Without a clone URL the flag does not apply.
        let info = svc.generate(&provider(None), &version, src.path()).await.unwrap();
        assert!(info.skipped_reason.is_none());
    }

    #[tokio::test]
    async fn test_extract_zip_upload() {
        let files = vec![SourceFile {
            path: "main.tf".into(),
            content: b"variable \"x\" {}".to_vec(),
        }];
        let out = tempfile::tempdir().unwrap();
        let count = extract_upload(Bytes::from(build_zip(&files).unwrap()), out.path(), ExtractLimits::default())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            std::fs::read_to_string(out.path().join("main.tf")).unwrap(),
            "variable \"x\" {}"
        );
    }

    #[tokio::test]
    async fn test_extract_rejects_escaping_entries() {
        let mut raw = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let content = b"owned";
        header.set_size(content.len() as u64);
        header.set_mode(FILE_MODE);
        header.set_entry_type(tar::EntryType::Regular);
        // set_path refuses "..", so write the name bytes directly.
        header.as_old_mut().name[..9].copy_from_slice(b"../evil.t");
        header.set_cksum();
        raw.append(&header, &content[..]).unwrap();
        let tar_bytes = raw.into_inner().unwrap();

        let mut gz = GzBuilder::new().write(Vec::new(), Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        let gz_bytes = gz.finish().unwrap();

        let out = tempfile::tempdir().unwrap();
        let result = extract_upload(Bytes::from(gz_bytes), out.path(), ExtractLimits::default()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_extract_rejects_unknown_format() {
        let out = tempfile::tempdir().unwrap();
        let result = extract_upload(Bytes::from_static(b"plain text"), out.path(), ExtractLimits::default()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    fn zeros(path: &str, len: usize) -> SourceFile {
        SourceFile {
            path: path.into(),
            content: vec![0u8; len],
        }
    }

    #[tokio::test]
    async fn test_extract_enforces_size_limit() {
        let limits = ExtractLimits {
            max_bytes: 4096,
            max_entries: 100,
        };
        let files = vec![zeros("main.tf", 16), zeros("padding.bin", 64 * 1024)];

        let zip_bytes = Bytes::from(build_zip(&files).unwrap());
        assert!(zip_bytes.len() < 4096);
        let out = tempfile::tempdir().unwrap();
        let result = extract_upload(zip_bytes, out.path(), limits).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let tar_bytes = Bytes::from(build_tar_gz(&files).unwrap());
        assert!(tar_bytes.len() < 4096);
        let out = tempfile::tempdir().unwrap();
        let result = extract_upload(tar_bytes, out.path(), limits).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(!out.path().join("padding.bin").exists());

        // Within the limit the same archive extracts.
        let small = vec![zeros("main.tf", 16)];
        let out = tempfile::tempdir().unwrap();
        let count = extract_upload(Bytes::from(build_tar_gz(&small).unwrap()), out.path(), limits)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_extract_enforces_entry_limit() {
        let limits = ExtractLimits {
            max_bytes: 1024 * 1024,
            max_entries: 2,
        };
        let files = vec![zeros("a.tf", 1), zeros("b.tf", 1), zeros("c.tf", 1)];

        let out = tempfile::tempdir().unwrap();
        let result = extract_upload(Bytes::from(build_zip(&files).unwrap()), out.path(), limits).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let out = tempfile::tempdir().unwrap();
        let result = extract_upload(Bytes::from(build_tar_gz(&files).unwrap()), out.path(), limits).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
