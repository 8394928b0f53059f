//! Git source fetching and tag/version mapping.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::version::Version;
use crate::services::command::{CommandRunner, CommandSpec};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSource {
    pub commit_sha: String,
    pub committed_at: Option<DateTime<Utc>>,
}

/// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped at five minutes.
pub fn calculate_backoff(attempt: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    std::cmp::min(MAX_BACKOFF, base.saturating_mul(factor))
}

/// Insert `user:password@` into an https clone URL that carries no credentials.
pub fn inject_credentials(url: &str, username: Option<&str>, password: Option<&str>) -> String {
    let (Some(user), Some(pass)) = (username, password) else {
        return url.to_string();
    };
    let Some(rest) = url.strip_prefix("https://") else {
        return url.to_string();
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.contains('@') {
        return url.to_string();
    }
    format!(
        "https://{}:{}@{}",
        urlencoding::encode(user),
        urlencoding::encode(pass),
        rest
    )
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{(version|major|minor|patch|build)\}").expect("valid regex")
    })
}

/// Expand a provider's `git_tag_format` for a version.
///
/// Fails with [`AppError::VersionUnresolvable`] when the version has a
/// non-zero component or a pre-release that the format has no placeholder
/// for: the expanded tag would name a different version.
pub fn tag_for_version(format: &str, version: &Version) -> Result<String> {
    let has = |name: &str| placeholder_re().captures_iter(format).any(|caps| &caps[1] == name);
    if !has("version") {
        let dropped = [
            ("major", version.major != 0),
            ("minor", version.minor != 0),
            ("patch", version.patch != 0),
            ("build", version.prerelease.is_some()),
        ]
        .into_iter()
        .find(|(name, set)| *set && !has(*name));
        if let Some((name, _)) = dropped {
            return Err(AppError::VersionUnresolvable(format!(
                "Git tag format {} has no {{{}}} placeholder for version {}",
                format, name, version
            )));
        }
    }
    Ok(placeholder_re()
        .replace_all(format, |caps: &regex::Captures| match &caps[1] {
            "version" => version.to_string(),
            "major" => version.major.to_string(),
            "minor" => version.minor.to_string(),
            "patch" => version.patch.to_string(),
            _ => version.prerelease.clone().unwrap_or_default(),
        })
        .into_owned())
}

/// Anchored regex matching tags produced by `format`, with one named group per placeholder.
pub fn tag_regex(format: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    let mut last = 0;
    for caps in placeholder_re().captures_iter(format) {
        let Some(whole) = caps.get(0) else { continue };
        pattern.push_str(&regex::escape(&format[last..whole.start()]));
        let group = match &caps[1] {
            "version" => r"(?P<version>\d+\.\d+\.\d+(?:-[A-Za-z0-9]+)?)",
            "major" => r"(?P<major>\d+)",
            "minor" => r"(?P<minor>\d+)",
            "patch" => r"(?P<patch>\d+)",
            _ => r"(?P<build>[A-Za-z0-9]+)",
        };
        pattern.push_str(group);
        last = whole.end();
    }
    pattern.push_str(&regex::escape(&format[last..]));
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| AppError::Validation(format!("Invalid git tag format {}: {}", format, e)))
}

/// Derive the version a tag refers to. Missing numeric parts default to 0.
pub fn version_from_tag(format: &str, tag: &str) -> Result<Version> {
    let re = tag_regex(format)?;
    let caps = re.captures(tag).ok_or_else(|| {
        AppError::VersionUnresolvable(format!("Tag {} does not match format {}", tag, format))
    })?;

    if let Some(version) = caps.name("version") {
        return Version::parse(version.as_str())
            .map_err(|e| AppError::VersionUnresolvable(e.to_string()));
    }

    let part = |name: &str| -> Result<Option<u64>> {
        caps.name(name)
            .map(|m| {
                m.as_str()
                    .parse::<u64>()
                    .map_err(|e| AppError::VersionUnresolvable(format!("{}: {}", name, e)))
            })
            .transpose()
    };
    let (major, minor, patch) = (part("major")?, part("minor")?, part("patch")?);
    if major.is_none() && minor.is_none() && patch.is_none() {
        return Err(AppError::VersionUnresolvable(format!(
            "Git tag format {} carries no version placeholder",
            format
        )));
    }
    let mut version = Version::new(
        major.unwrap_or(0),
        minor.unwrap_or(0),
        patch.unwrap_or(0),
    );
    if let Some(build) = caps.name("build").filter(|b| !b.as_str().is_empty()) {
        version = version.with_prerelease(build.as_str());
    }
    Ok(version)
}

/// Reject absolute or parent-relative repository sub-paths.
pub fn validate_git_path(path: &str) -> Result<String> {
    let normalized = path.replace('\\', "/");
    let trimmed = normalized.trim_matches('/');
    if normalized.starts_with('/') && !trimmed.is_empty() || trimmed.split('/').any(|p| p == "..")
    {
        return Err(AppError::Validation(format!("Invalid git path: {}", path)));
    }
    Ok(trimmed
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect::<Vec<_>>()
        .join("/"))
}

/// Hidden files carried into the extracted module.
const KEPT_HIDDEN_FILES: &[&str] = &[".terraformignore", ".terrareg.json"];

fn is_excluded(name: &str) -> bool {
    name == ".git" || (name.starts_with('.') && !KEPT_HIDDEN_FILES.contains(&name))
}

/// Copy the repository sub-tree at `git_path` into `dest`, skipping `.git`
/// and hidden entries other than [`KEPT_HIDDEN_FILES`]. Returns the number
/// of files copied.
pub async fn copy_subtree(repo_root: &Path, git_path: Option<&str>, dest: &Path) -> Result<usize> {
    let sub = match git_path {
        Some(path) => validate_git_path(path)?,
        None => String::new(),
    };
    let source = if sub.is_empty() {
        repo_root.to_path_buf()
    } else {
        repo_root.join(&sub)
    };
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || copy_tree_blocking(&source, &dest))
        .await
        .map_err(|e| AppError::Internal(format!("Copy task failed: {}", e)))?
}

fn copy_tree_blocking(source: &Path, dest: &Path) -> Result<usize> {
    if !source.is_dir() {
        return Err(AppError::GitCloneFailed(format!(
            "Module path {} not found in repository",
            source.display()
        )));
    }
    std::fs::create_dir_all(dest)?;

    let mut copied = 0;
    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(&e.file_name().to_string_lossy()));
    for entry in walker {
        let entry = entry.map_err(|e| AppError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Clones repositories through the configured `git` binary.
pub struct GitFetcher {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Duration,
    depth: u32,
    attempts: u32,
    retry_base: Duration,
    username: Option<String>,
    password: Option<String>,
}

impl GitFetcher {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: config.git_binary.clone(),
            timeout: Duration::from_secs(config.git_clone_timeout_secs),
            depth: config.git_clone_depth,
            attempts: config.git_clone_retries.max(1),
            retry_base: Duration::from_secs(10),
            username: config.git_credentials_username.clone(),
            password: config.git_credentials_password.clone(),
        }
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    fn redact(&self, message: &str) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => message
                .replace(password.as_str(), "***")
                .replace(urlencoding::encode(password).as_ref(), "***"),
            _ => message.to_string(),
        }
    }

    fn git(&self) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .env("GIT_SSH_COMMAND", "ssh -o StrictHostKeyChecking=accept-new")
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout)
    }

    /// Clone `clone_url` at `git_ref` into `dest` (which must not exist or be
    /// empty), retrying with exponential backoff.
    pub async fn fetch(
        &self,
        clone_url: &str,
        git_ref: Option<&str>,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedSource> {
        let url = inject_credentials(clone_url, self.username.as_deref(), self.password.as_deref());
        let mut last_error = None;

        for attempt in 0..self.attempts {
            if attempt > 0 {
                let delay = calculate_backoff(attempt - 1, self.retry_base);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    "Retrying git clone"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                if tokio::fs::try_exists(dest).await.unwrap_or(false) {
                    tokio::fs::remove_dir_all(dest).await?;
                }
            }

            match self.clone_once(&url, git_ref, dest, cancel).await {
                Ok(()) => return self.resolve_head(dest, cancel).await,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, "Git clone failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::GitCloneFailed("No clone attempted".into())))
    }

    async fn clone_once(
        &self,
        url: &str,
        git_ref: Option<&str>,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut spec = self
            .git()
            .arg("clone")
            .arg(format!("--depth={}", self.depth.max(1)))
            .arg("--single-branch");
        if let Some(git_ref) = git_ref {
            spec = spec.arg("--branch").arg(git_ref);
        }
        let spec = spec.arg(url).arg(dest.to_string_lossy());

        let output = self.runner.run(spec, cancel).await.map_err(|e| match e {
            AppError::Cancelled => AppError::Cancelled,
            other => AppError::GitCloneFailed(self.redact(&other.to_string())),
        })?;
        if !output.success() {
            return Err(AppError::GitCloneFailed(
                self.redact(output.stderr_str().trim()),
            ));
        }
        Ok(())
    }

    async fn resolve_head(&self, repo: &Path, cancel: &CancellationToken) -> Result<FetchedSource> {
        let sha = self
            .runner
            .run(self.git().args(["rev-parse", "HEAD"]).current_dir(repo), cancel)
            .await?;
        if !sha.success() {
            return Err(AppError::GitCloneFailed(format!(
                "Unable to resolve HEAD: {}",
                sha.stderr_str().trim()
            )));
        }
        let date = self
            .runner
            .run(
                self.git().args(["log", "-1", "--format=%cI"]).current_dir(repo),
                cancel,
            )
            .await?;
        let committed_at = DateTime::parse_from_rfc3339(date.stdout_str().trim())
            .ok()
            .map(|d| d.with_timezone(&Utc));

        Ok(FetchedSource {
            commit_sha: sha.stdout_str().trim().to_string(),
            committed_at,
        })
    }
}

/// Scratch path for one clone below `root`.
pub fn clone_dir(root: &Path) -> PathBuf {
    root.join("repo")
}
