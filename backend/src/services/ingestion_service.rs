//! Staged ingestion of module versions.
//!
//! ```text
//! fetch_source -> resolve_version -> parse -> security_scan -> archive_generate -> persist -> publish
//! ```
//!
//! The target version is derived from the request and the provider's tag
//! format before the run starts; `resolve_version` checks it against the
//! stored versions. The whole run shares one transaction and each stage runs
//! in its own savepoint. Fetch, version resolution, parse and persist failures
//! abort the run and roll everything back; scan and archive failures are
//! recorded and the run continues; a publish failure rolls back only the
//! publish.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::db::repository::ModuleProviderRepository;
use crate::db::{with_transaction, Store, TxContext};
use crate::error::{AppError, Result};
use crate::models::identifiers::ModuleProviderId;
use crate::models::module_provider::ModuleProvider;
use crate::models::module_version::{ArchiveInfo, ModuleVersion};
use crate::models::version::Version;
use crate::services::archive_service::ArchiveService;
use crate::services::auth_context::AuthContext;
use crate::services::command::CommandRunner;
use crate::services::git_service::{
    clone_dir, copy_subtree, tag_for_version, version_from_tag, FetchedSource, GitFetcher,
};
use crate::services::module_parser::{ModuleParser, ParseResult};
use crate::services::security_scan_service::SecurityScanService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchSource,
    ResolveVersion,
    Parse,
    SecurityScan,
    ArchiveGenerate,
    Persist,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FetchSource => "fetch_source",
            Stage::ResolveVersion => "resolve_version",
            Stage::Parse => "parse",
            Stage::SecurityScan => "security_scan",
            Stage::ArchiveGenerate => "archive_generate",
            Stage::Persist => "persist",
            Stage::Publish => "publish",
        }
    }
}

/// Where the module source comes from.
#[derive(Clone)]
pub enum IngestSource {
    /// Clone the provider's repository. At least one of `version` and
    /// `git_tag` is required; the other is derived from the tag format.
    Git {
        version: Option<Version>,
        git_tag: Option<String>,
    },
    /// A `.zip` or `.tar.gz` of the module tree.
    Upload { version: Version, content: Bytes },
}

impl std::fmt::Debug for IngestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestSource::Git { version, git_tag } => f
                .debug_struct("Git")
                .field("version", version)
                .field("git_tag", git_tag)
                .finish(),
            IngestSource::Upload { version, content } => f
                .debug_struct("Upload")
                .field("version", version)
                .field("bytes", &content.len())
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub ident: ModuleProviderId,
    pub source: IngestSource,
    pub publish: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub ident: ModuleProviderId,
    pub version: Version,
    pub git_sha: Option<String>,
    pub git_tag: Option<String>,
    pub published: bool,
    pub archive: ArchiveInfo,
    pub latest_version: Option<Version>,
    /// Non-fatal problems (scan, archive or publish failures).
    pub warnings: Vec<String>,
}

/// Version and tag an ingestion targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub version: Version,
    pub git_tag: Option<String>,
}

/// Work out the version and git ref of a request from the provider's tag format.
pub fn resolve_target(provider: &ModuleProvider, source: &IngestSource) -> Result<Target> {
    let format = provider.git.git_tag_format.as_str();
    match source {
        IngestSource::Git {
            version: Some(version),
            git_tag,
        } => Ok(Target {
            version: version.clone(),
            git_tag: Some(match git_tag {
                Some(tag) => tag.clone(),
                None => tag_for_version(format, version)?,
            }),
        }),
        IngestSource::Git {
            version: None,
            git_tag: Some(tag),
        } => Ok(Target {
            version: version_from_tag(format, tag)?,
            git_tag: Some(tag.clone()),
        }),
        IngestSource::Git {
            version: None,
            git_tag: None,
        } => Err(AppError::Validation(
            "Either version or git_tag must be provided".into(),
        )),
        IngestSource::Upload { version, .. } => Ok(Target {
            version: version.clone(),
            git_tag: None,
        }),
    }
}

/// Keys with an ingestion currently running in this process.
#[derive(Default)]
struct InProgress {
    keys: StdMutex<HashSet<String>>,
}

struct InProgressGuard<'a> {
    owner: &'a InProgress,
    key: String,
}

impl InProgress {
    fn acquire(&self, key: String) -> Result<InProgressGuard<'_>> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.clone()) {
            return Err(AppError::Conflict(format!(
                "Ingestion of {} is already in progress",
                key
            )));
        }
        Ok(InProgressGuard { owner: self, key })
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

struct ScanResults {
    tfsec: Option<serde_json::Value>,
    example_costs: Vec<Option<serde_json::Value>>,
}

pub struct IngestionService {
    store: Arc<dyn Store>,
    fetcher: GitFetcher,
    parser: ModuleParser,
    scanner: SecurityScanService,
    archives: Arc<ArchiveService>,
    scratch_root: PathBuf,
    in_progress: InProgress,
}

impl IngestionService {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        runner: Arc<dyn CommandRunner>,
        archives: Arc<ArchiveService>,
    ) -> Self {
        Self::with_fetcher(
            config,
            store,
            GitFetcher::new(config, runner.clone()),
            runner,
            archives,
        )
    }

    pub fn with_fetcher(
        config: &Config,
        store: Arc<dyn Store>,
        fetcher: GitFetcher,
        runner: Arc<dyn CommandRunner>,
        archives: Arc<ArchiveService>,
    ) -> Self {
        Self {
            store,
            fetcher,
            parser: ModuleParser::new(config, runner.clone()),
            scanner: SecurityScanService::new(config, runner),
            archives,
            scratch_root: Path::new(&config.data_directory).join(".scratch"),
            in_progress: InProgress::default(),
        }
    }

    /// Ingest one module version on behalf of `auth`.
    pub async fn ingest(
        &self,
        auth: &AuthContext,
        request: IngestRequest,
        cancel: CancellationToken,
    ) -> Result<IngestOutcome> {
        let namespace = request.ident.namespace.as_str();
        if !auth.can_upload_module_version(namespace) {
            return Err(auth.deny("upload module versions"));
        }
        if request.publish && !auth.can_publish_module_version(namespace) {
            return Err(auth.deny("publish module versions"));
        }

        let read_ctx = TxContext::new(cancel.clone());
        let provider = self
            .store
            .find_module_provider(&read_ctx, &request.ident)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Module provider {} does not exist", request.ident))
            })?;
        // The clone ref and the in-progress key need the target before fetching.
        // The resolve_version stage then checks it against the stored versions
        // inside the ingestion transaction.
        let target = resolve_target(&provider, &request.source)?;

        let key = format!("{}/{}", request.ident.key(), target.version);
        let _guard = self.in_progress.acquire(key)?;

        tokio::fs::create_dir_all(&self.scratch_root).await?;
        let scratch = tempfile::Builder::new()
            .prefix("ingest-")
            .tempdir_in(&self.scratch_root)?;

        let span = tracing::info_span!(
            "ingest",
            provider = %request.ident,
            version = %target.version,
            auth_method = auth.auth_method(),
        );
        let started = std::time::Instant::now();
        let result = self
            .run_pipeline(&provider, &request, &target, scratch.path(), &cancel)
            .instrument(span)
            .await;

        match &result {
            Ok(outcome) => tracing::info!(
                provider = %request.ident,
                version = %outcome.version,
                published = outcome.published,
                warnings = outcome.warnings.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Ingestion finished"
            ),
            Err(e) => tracing::warn!(
                provider = %request.ident,
                version = %target.version,
                kind = e.kind(),
                "Ingestion failed: {}",
                e
            ),
        }
        result
    }

    async fn run_pipeline(
        &self,
        provider: &ModuleProvider,
        request: &IngestRequest,
        target: &Target,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome> {
        let store = self.store.as_ref();
        let root = TxContext::new(cancel.clone());
        let module_dir = scratch.join("module");
        let archive_slot: StdMutex<Option<ArchiveInfo>> = StdMutex::new(None);
        let generated = &archive_slot;

        let result = with_transaction(store, &root, "ingest_module_version", |tx| async move {
            let mut warnings = Vec::new();

            let fetched = with_transaction(store, &tx, Stage::FetchSource.as_str(), |_| {
                self.fetch_source(provider, &request.source, target, scratch, &module_dir, cancel)
            })
            .await?;

            with_transaction(store, &tx, Stage::ResolveVersion.as_str(), |rtx| async move {
                let current = store
                    .find_module_provider(&rtx, &request.ident)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Module provider {} was deleted", request.ident))
                    })?;
                if current.get_version(&target.version).is_some() {
                    return Err(AppError::AlreadyExists(format!(
                        "Version {} of {} already exists",
                        target.version, request.ident
                    )));
                }
                Ok(())
            })
            .await?;

            let parsed = with_transaction(store, &tx, Stage::Parse.as_str(), |_| {
                self.parser.parse(&module_dir, cancel)
            })
            .await?;

            let scan = match with_transaction(store, &tx, Stage::SecurityScan.as_str(), |_| {
                self.scan(&module_dir, &parsed, cancel)
            })
            .await
            {
                Ok(scan) => scan,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    tracing::warn!(stage = Stage::SecurityScan.as_str(), "Continuing without scan results: {}", e);
                    warnings.push(format!("Security scan failed: {}", e));
                    ScanResults {
                        tfsec: None,
                        example_costs: Vec::new(),
                    }
                }
            };

            let archive = match with_transaction(store, &tx, Stage::ArchiveGenerate.as_str(), |_| {
                self.archives.generate(provider, &target.version, &module_dir)
            })
            .await
            {
                Ok(info) => info,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    tracing::warn!(stage = Stage::ArchiveGenerate.as_str(), "Continuing without archives: {}", e);
                    warnings.push(format!("Archive generation failed: {}", e));
                    ArchiveInfo {
                        skipped_reason: Some(format!("Archive generation failed: {}", e)),
                        ..Default::default()
                    }
                }
            };
            *generated.lock().unwrap_or_else(PoisonError::into_inner) = Some(archive.clone());

            let version = build_version(
                provider,
                target,
                fetched.as_ref(),
                parsed,
                scan,
                archive.clone(),
            );
            with_transaction(store, &tx, Stage::Persist.as_str(), |ptx| async move {
                let mut current = store
                    .find_module_provider(&ptx, &request.ident)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Module provider {} was deleted", request.ident))
                    })?;
                current.add_version(version)?;
                store.save_module_provider(&ptx, &current).await
            })
            .await
            .map_err(persist_error)?;

            let mut published = false;
            if request.publish {
                match with_transaction(store, &tx, Stage::Publish.as_str(), |ptx| async move {
                    self.publish_in(&ptx, &request.ident, &target.version).await
                })
                .await
                {
                    Ok(()) => published = true,
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(e) => {
                        tracing::warn!(stage = Stage::Publish.as_str(), "Publish rolled back: {}", e);
                        warnings.push(format!("Publish failed: {}", e));
                    }
                }
            }

            Ok(IngestOutcome {
                ident: request.ident.clone(),
                version: target.version.clone(),
                git_sha: fetched.map(|f| f.commit_sha),
                git_tag: target.git_tag.clone(),
                published,
                archive,
                latest_version: None,
                warnings,
            })
        })
        .await;

        match result {
            Ok(mut outcome) => {
                outcome.latest_version = self
                    .store
                    .find_module_provider(&TxContext::new(cancel.clone()), &request.ident)
                    .await?
                    .and_then(|p| p.latest_version().map(|v| v.version.clone()));
                Ok(outcome)
            }
            Err(err) => {
                let stored = generated
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(info) = stored {
                    if let Err(cleanup) = self.archives.delete(&info).await {
                        tracing::warn!("Failed to remove archives of aborted ingestion: {}", cleanup);
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_source(
        &self,
        provider: &ModuleProvider,
        source: &IngestSource,
        target: &Target,
        scratch: &Path,
        module_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<FetchedSource>> {
        match source {
            IngestSource::Upload { content, .. } => {
                tokio::fs::create_dir_all(module_dir).await?;
                let files = self.archives.extract_upload(content.clone(), module_dir).await?;
                if files == 0 {
                    return Err(AppError::Validation("Uploaded archive contains no files".into()));
                }
                Ok(None)
            }
            IngestSource::Git { .. } => {
                let clone_url = provider.clone_url(None).ok_or_else(|| {
                    AppError::Validation(format!(
                        "Module provider {} has no repository clone URL",
                        provider.ident
                    ))
                })?;
                let repo = clone_dir(scratch);
                let fetched = self
                    .fetcher
                    .fetch(&clone_url, target.git_tag.as_deref(), &repo, cancel)
                    .await?;
                copy_subtree(&repo, provider.git.git_path.as_deref(), module_dir).await?;
                tracing::debug!(commit = %fetched.commit_sha, "Fetched module source");
                Ok(Some(fetched))
            }
        }
    }

    async fn scan(
        &self,
        module_dir: &Path,
        parsed: &ParseResult,
        cancel: &CancellationToken,
    ) -> Result<ScanResults> {
        let tfsec = self.scanner.scan(module_dir, cancel).await?;
        let mut example_costs = Vec::with_capacity(parsed.examples.len());
        for example in &parsed.examples {
            example_costs.push(
                self.scanner
                    .estimate_cost(&module_dir.join(&example.path), cancel)
                    .await?,
            );
        }
        Ok(ScanResults {
            tfsec,
            example_costs,
        })
    }

    /// Publish inside `ctx`. Publishing an already published version is a no-op.
    async fn publish_in(&self, ctx: &TxContext, ident: &ModuleProviderId, version: &Version) -> Result<()> {
        let mut provider = self
            .store
            .find_module_provider(ctx, ident)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Module provider {} does not exist", ident)))?;
        if provider.get_version(version).is_some_and(|v| v.published) {
            return Ok(());
        }
        provider.publish_version(version, Utc::now())?;
        self.store.save_module_provider(ctx, &provider).await
    }
}

fn build_version(
    provider: &ModuleProvider,
    target: &Target,
    fetched: Option<&FetchedSource>,
    parsed: ParseResult,
    scan: ScanResults,
    archive: ArchiveInfo,
) -> ModuleVersion {
    let mut version = ModuleVersion::new(target.version.clone());
    version.git_sha = fetched.map(|f| f.commit_sha.clone());
    version.git_tag = target.git_tag.clone();
    version.git_path = provider.git.git_path.clone();
    version.owner = parsed.owner;
    version.description = parsed.description;
    version.variable_template = parsed.variable_template;
    version.details = parsed.details.with_tfsec(scan.tfsec);
    version.submodules = parsed.submodules;
    version.examples = parsed
        .examples
        .into_iter()
        .enumerate()
        .map(|(i, mut example)| {
            let cost = scan.example_costs.get(i).cloned().flatten();
            example.details = example.details.with_infracost(cost);
            example
        })
        .collect();
    version.module_files = parsed.module_files;
    version.archive = archive;
    version
}

fn persist_error(err: AppError) -> AppError {
    match err {
        AppError::AlreadyExists(_)
        | AppError::DomainViolation(_)
        | AppError::NotFound(_)
        | AppError::Cancelled
        | AppError::PersistFailed(_) => err,
        other => AppError::PersistFailed(other.to_string()),
    }
}
