//! Module version entity and its child collections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::module_details::ModuleDetails;
use super::version::Version;

/// Schema version of the extraction that produced a version's details.
/// Bumped whenever the parser output changes shape.
pub const CURRENT_EXTRACTION_VERSION: i32 = 3;

/// Normalise a path to forward slashes relative to the module root.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submodule {
    pub path: String,
    pub details: ModuleDetails,
}

impl Submodule {
    pub fn new(path: &str, details: ModuleDetails) -> Self {
        Self {
            path: normalize_path(path),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub path: String,
    pub details: ModuleDetails,
    pub files: Vec<ExampleFile>,
}

impl Example {
    pub fn new(path: &str, details: ModuleDetails, files: Vec<ExampleFile>) -> Self {
        Self {
            path: normalize_path(path),
            details,
            files: files
                .into_iter()
                .map(|f| ExampleFile {
                    path: normalize_path(&f.path),
                    content: f.content,
                })
                .collect(),
        }
    }

    pub fn file(&self, path: &str) -> Option<&ExampleFile> {
        let path = normalize_path(path);
        self.files.iter().find(|f| f.path == path)
    }
}

/// Additional file stored with a version (CHANGELOG, LICENSE, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleFile {
    pub path: String,
    pub content: String,
}

/// Where the source archive for a version lives, or why there is none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Storage keys of generated archives, keyed by extension.
    pub keys: Vec<(String, String)>,
    pub total_bytes: u64,
    pub source_file_count: u64,
    pub skipped_reason: Option<String>,
}

impl ArchiveInfo {
    pub fn key_for(&self, extension: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(ext, _)| ext == extension)
            .map(|(_, key)| key.as_str())
    }
}

/// URL template overrides recorded per version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UrlOverrides {
    pub repo_base_url_template: Option<String>,
    pub repo_clone_url_template: Option<String>,
    pub repo_browse_url_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub id: Uuid,
    pub version: Version,
    pub internal: bool,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub git_sha: Option<String>,
    pub git_tag: Option<String>,
    pub git_path: Option<String>,
    pub url_overrides: UrlOverrides,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub variable_template: Option<serde_json::Value>,
    pub extraction_version: i32,
    pub details: ModuleDetails,
    pub submodules: Vec<Submodule>,
    pub examples: Vec<Example>,
    pub module_files: Vec<ModuleFile>,
    pub archive: ArchiveInfo,
    pub created_at: DateTime<Utc>,
}

impl ModuleVersion {
    /// New, unpublished version with empty details.
    pub fn new(version: Version) -> Self {
        Self {
            id: Uuid::new_v4(),
            version,
            internal: false,
            published: false,
            published_at: None,
            git_sha: None,
            git_tag: None,
            git_path: None,
            url_overrides: UrlOverrides::default(),
            owner: None,
            description: None,
            variable_template: None,
            extraction_version: CURRENT_EXTRACTION_VERSION,
            details: ModuleDetails::default(),
            submodules: Vec::new(),
            examples: Vec::new(),
            module_files: Vec::new(),
            archive: ArchiveInfo::default(),
            created_at: Utc::now(),
        }
    }

    pub fn beta(&self) -> bool {
        self.version.is_beta()
    }

    /// Eligible to be the provider's latest version.
    pub fn is_latest_candidate(&self) -> bool {
        self.published && !self.beta()
    }

    pub fn submodule(&self, path: &str) -> Option<&Submodule> {
        let path = normalize_path(path);
        self.submodules.iter().find(|s| s.path == path)
    }

    pub fn example(&self, path: &str) -> Option<&Example> {
        let path = normalize_path(path);
        self.examples.iter().find(|e| e.path == path)
    }

    pub fn module_file(&self, path: &str) -> Option<&ModuleFile> {
        let path = normalize_path(path);
        self.module_files.iter().find(|f| f.path == path)
    }

    pub fn is_outdated_extraction(&self) -> bool {
        self.extraction_version < CURRENT_EXTRACTION_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./modules/vpc/"), "modules/vpc");
        assert_eq!(normalize_path("modules\\vpc"), "modules/vpc");
        assert_eq!(normalize_path("/examples//basic"), "examples/basic");
        assert_eq!(normalize_path("."), "");
    }

    #[test]
    fn test_lookup_by_normalised_path() {
        let mut mv = ModuleVersion::new(Version::new(1, 0, 0));
        mv.submodules
            .push(Submodule::new("modules/nat/", ModuleDetails::default()));
        mv.examples.push(Example::new(
            "./examples/basic",
            ModuleDetails::default(),
            vec![ExampleFile {
                path: "examples\\basic\\main.tf".into(),
                content: "module \"x\" {}".into(),
            }],
        ));
        assert!(mv.submodule("./modules/nat").is_some());
        let example = mv.example("examples/basic/").unwrap();
        assert!(example.file("examples/basic/main.tf").is_some());
        assert!(mv.submodule("modules/other").is_none());
    }

    #[test]
    fn test_latest_candidate() {
        let mut mv = ModuleVersion::new(Version::new(1, 0, 0));
        assert!(!mv.is_latest_candidate());
        mv.published = true;
        assert!(mv.is_latest_candidate());
        let mut beta = ModuleVersion::new(Version::new(1, 1, 0).with_prerelease("beta"));
        beta.published = true;
        assert!(!beta.is_latest_candidate());
    }
}
