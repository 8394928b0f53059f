//! Extraction of module metadata from a source tree.
//!
//! The parser only reads files and runs `terraform-docs`; it never writes to
//! the module directory or the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::module_details::{ModuleDetails, TerraformDocs};
use crate::models::module_version::{
    normalize_path, Example, ExampleFile, ModuleFile, Submodule,
};
use crate::services::command::{CommandRunner, CommandSpec};

const DESCRIPTION_MIN_LENGTH: usize = 80;
const DESCRIPTION_MAX_LENGTH: usize = 130;
const METADATA_FILES: [&str; 2] = ["terrareg.json", ".terrareg.json"];
const README_FILE: &str = "README.md";
const TERRAFORM_DOCS_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything extracted from one module tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseResult {
    pub details: ModuleDetails,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub variable_template: Option<serde_json::Value>,
    pub submodules: Vec<Submodule>,
    pub examples: Vec<Example>,
    pub module_files: Vec<ModuleFile>,
}

/// Contents of `terrareg.json`.
#[derive(Debug, Clone, Default, Deserialize)]
struct ModuleMetadata {
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    variable_template: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub terraform_docs_binary: String,
    pub examples_directory: String,
    pub example_file_extensions: Vec<String>,
    pub additional_module_files: Vec<String>,
}

impl ParserSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            terraform_docs_binary: config.terraform_docs_binary.clone(),
            examples_directory: normalize_path(&config.examples_directory),
            example_file_extensions: config.example_file_extensions.clone(),
            additional_module_files: config.additional_module_files.clone(),
        }
    }
}

/// Files gathered by the blocking directory scan.
#[derive(Debug, Default)]
struct Layout {
    readme: Option<String>,
    metadata: Option<ModuleMetadata>,
    submodules: Vec<DirLayout>,
    examples: Vec<DirLayout>,
    module_files: Vec<ModuleFile>,
}

#[derive(Debug)]
struct DirLayout {
    path: String,
    readme: Option<String>,
    files: Vec<ExampleFile>,
}

pub struct ModuleParser {
    runner: Arc<dyn CommandRunner>,
    settings: ParserSettings,
}

impl ModuleParser {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_settings(ParserSettings::from_config(config), runner)
    }

    pub fn with_settings(settings: ParserSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &ParserSettings {
        &self.settings
    }

    /// Parse the module rooted at `module_dir`.
    pub async fn parse(&self, module_dir: &Path, cancel: &CancellationToken) -> Result<ParseResult> {
        let root = module_dir.to_path_buf();
        let settings = self.settings.clone();
        let layout = tokio::task::spawn_blocking(move || scan_layout(&root, &settings))
            .await
            .map_err(|e| AppError::Internal(format!("Module scan task failed: {}", e)))??;

        let root_docs = self.terraform_docs(module_dir, cancel).await?;
        let details = build_details(layout.readme.clone(), root_docs);

        let mut submodules = Vec::with_capacity(layout.submodules.len());
        for dir in &layout.submodules {
            let docs = self.terraform_docs(&module_dir.join(&dir.path), cancel).await?;
            submodules.push(Submodule::new(
                &dir.path,
                build_details(dir.readme.clone(), docs),
            ));
        }

        let mut examples = Vec::with_capacity(layout.examples.len());
        for dir in &layout.examples {
            let docs = self.terraform_docs(&module_dir.join(&dir.path), cancel).await?;
            examples.push(Example::new(
                &dir.path,
                build_details(dir.readme.clone(), docs),
                dir.files.clone(),
            ));
        }

        let metadata = layout.metadata.unwrap_or_default();
        let description = metadata
            .description
            .filter(|d| !d.trim().is_empty())
            .or_else(|| layout.readme.as_deref().and_then(extract_description));

        tracing::debug!(
            submodules = submodules.len(),
            examples = examples.len(),
            module_files = layout.module_files.len(),
            "Parsed module tree"
        );

        Ok(ParseResult {
            details,
            description,
            owner: metadata.owner,
            variable_template: metadata.variable_template,
            submodules,
            examples,
            module_files: layout.module_files,
        })
    }

    async fn terraform_docs(&self, dir: &Path, cancel: &CancellationToken) -> Result<TerraformDocs> {
        let spec = CommandSpec::new(&self.settings.terraform_docs_binary)
            .args(["json", "--sort=false", "."])
            .current_dir(dir)
            .timeout(TERRAFORM_DOCS_TIMEOUT);
        let output = self.runner.run(spec, cancel).await.map_err(|e| match e {
            AppError::Cancelled => AppError::Cancelled,
            other => AppError::ParseFailed(format!("terraform-docs could not run: {}", other)),
        })?;
        if !output.success() {
            return Err(AppError::ParseFailed(format!(
                "terraform-docs failed in {}: {}",
                dir.display(),
                output.stderr_str().trim()
            )));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            AppError::ParseFailed(format!("Invalid terraform-docs output: {}", e))
        })
    }
}

fn build_details(readme: Option<String>, docs: TerraformDocs) -> ModuleDetails {
    let terraform_version = docs.terraform_version_constraint().map(str::to_string);
    ModuleDetails::default()
        .with_readme(readme)
        .with_terraform_version(terraform_version)
        .with_terraform_docs(Some(docs))
}

/// Pick a short description from README prose.
///
/// Headings, lists, tables and lines carrying links, e-mail addresses or HTML
/// are skipped. Sentences of the first usable line are joined until the text
/// reaches [`DESCRIPTION_MIN_LENGTH`] characters without passing
/// [`DESCRIPTION_MAX_LENGTH`].
pub fn extract_description(readme: &str) -> Option<String> {
    readme.lines().find_map(|line| {
        let line = line.trim();
        if line.is_empty() || is_markup(line) {
            return None;
        }
        let mut description = String::new();
        for sentence in line.split(". ") {
            let sentence = sentence.trim().trim_end_matches('.');
            if sentence.is_empty() {
                continue;
            }
            let candidate = if description.is_empty() {
                sentence.to_string()
            } else {
                format!("{}. {}", description, sentence)
            };
            if candidate.chars().count() > DESCRIPTION_MAX_LENGTH {
                break;
            }
            description = candidate;
            if description.chars().count() >= DESCRIPTION_MIN_LENGTH {
                break;
            }
        }
        (!description.is_empty()).then_some(description)
    })
}

fn is_markup(line: &str) -> bool {
    const PREFIXES: [&str; 8] = ["#", "-", "*", "|", ">", "!", "[", "```"];
    PREFIXES.iter().any(|p| line.starts_with(p))
        || line.contains("://")
        || line.contains("www.")
        || line.contains('@')
        || line.contains('<')
        || line.contains("](")
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn relative(root: &Path, path: &Path) -> String {
    normalize_path(&path.strip_prefix(root).unwrap_or(path).to_string_lossy())
}

fn has_terraform_files(dir: &Path) -> Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().is_some_and(|e| e == "tf") {
            return Ok(true);
        }
    }
    Ok(false)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_plain_relative(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

fn scan_layout(root: &Path, settings: &ParserSettings) -> Result<Layout> {
    if !root.is_dir() {
        return Err(AppError::ParseFailed(format!(
            "Module directory {} does not exist",
            root.display()
        )));
    }

    let mut layout = Layout {
        readme: read_optional(&root.join(README_FILE))?,
        ..Default::default()
    };

    for name in METADATA_FILES {
        if let Some(raw) = read_optional(&root.join(name))? {
            let metadata = serde_json::from_str(&raw)
                .map_err(|e| AppError::ParseFailed(format!("Invalid {}: {}", name, e)))?;
            layout.metadata = Some(metadata);
            break;
        }
    }

    for name in &settings.additional_module_files {
        if !is_plain_relative(name) {
            continue;
        }
        let path = root.join(name);
        if path.is_file() {
            if let Some(content) = read_optional(&path)? {
                layout.module_files.push(ModuleFile {
                    path: normalize_path(name),
                    content,
                });
            }
        }
    }

    let examples_root: PathBuf = root.join(&settings.examples_directory);

    // Submodules: every directory below the root holding .tf files, outside
    // the examples tree.
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e) && !e.path().starts_with(&examples_root));
    for entry in walker {
        let entry = entry.map_err(|e| AppError::ParseFailed(format!("Cannot walk module: {}", e)))?;
        if !entry.file_type().is_dir() || !has_terraform_files(entry.path())? {
            continue;
        }
        layout.submodules.push(DirLayout {
            path: relative(root, entry.path()),
            readme: read_optional(&entry.path().join(README_FILE))?,
            files: Vec::new(),
        });
    }

    if examples_root.is_dir() {
        let mut dirs = std::fs::read_dir(&examples_root)?
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();
        dirs.sort();
        for dir in dirs {
            if !has_terraform_files(&dir)? {
                continue;
            }
            let path = relative(root, &dir);
            layout.examples.push(DirLayout {
                files: example_files(root, &dir, &settings.example_file_extensions)?,
                readme: read_optional(&dir.join(README_FILE))?,
                path,
            });
        }
    }

    Ok(layout)
}

fn example_files(root: &Path, dir: &Path, extensions: &[String]) -> Result<Vec<ExampleFile>> {
    let mut files = Vec::new();
    let mut paths = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect::<Vec<_>>();
    paths.sort();
    for path in paths {
        let matches = path
            .extension()
            .map(|ext| extensions.iter().any(|wanted| ext == wanted.as_str()))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        if let Some(content) = read_optional(&path)? {
            files.push(ExampleFile {
                path: relative(root, &path),
                content,
            });
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::command::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct DocsRunner {
        calls: Mutex<Vec<PathBuf>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandRunner for DocsRunner {
        async fn run(&self, spec: CommandSpec, _cancel: &CancellationToken) -> Result<CommandOutput> {
            let dir = spec.working_dir.clone().unwrap_or_default();
            self.calls.lock().unwrap().push(dir.clone());
            if self.fail {
                return Ok(CommandOutput {
                    status: Some(1),
                    stdout: Vec::new(),
                    stderr: b"Error: Failed to read module directory".to_vec(),
                });
            }
            let name = dir.file_name().unwrap().to_string_lossy().to_string();
            let body = serde_json::json!({
                "header": "",
                "footer": "",
                "inputs": [{"name": format!("{}_input", name), "type": "string", "required": true}],
                "outputs": null,
                "providers": null,
                "requirements": [{"name": "terraform", "version": ">= 1.3"}],
                "resources": null,
                "modules": null
            });
            Ok(CommandOutput {
                status: Some(0),
                stdout: serde_json::to_vec(&body).unwrap(),
                stderr: Vec::new(),
            })
        }
    }

    fn settings() -> ParserSettings {
        ParserSettings {
            terraform_docs_binary: "terraform-docs".into(),
            examples_directory: "examples".into(),
            example_file_extensions: vec!["tf".into(), "tfvars".into()],
            additional_module_files: vec!["CHANGELOG.md".into(), "../secret".into()],
        }
    }

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    fn module_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "main.tf", "resource \"null_resource\" \"this\" {}");
        write(
            root,
            "README.md",
            "# VPC\n\n[![badge](https://img.shields.io/x)](https://example.com)\n\nCreates a VPC with public and private subnets. Supports NAT gateways.\n",
        );
        write(root, "CHANGELOG.md", "## 1.0.0\n");
        write(root, "modules/subnet/main.tf", "");
        write(root, "modules/subnet/README.md", "Subnet helper");
        write(root, "modules/docs/notes.md", "no terraform here");
        write(root, ".github/workflows/main.tf", "");
        write(root, "examples/basic/main.tf", "module \"vpc\" {}");
        write(root, "examples/basic/terraform.tfvars", "cidr = \"10.0.0.0/16\"");
        write(root, "examples/basic/run.sh", "terraform apply");
        write(root, "examples/basic/nested/main.tf", "");
        write(root, "examples/empty/README.md", "nothing");
        dir
    }

    #[tokio::test]
    async fn test_parse_module_tree() {
        let dir = module_tree();
        let runner = Arc::new(DocsRunner {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let parser = ModuleParser::with_settings(settings(), runner.clone());
        let result = parser
            .parse(dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            result.description.as_deref(),
            Some("Creates a VPC with public and private subnets. Supports NAT gateways")
        );
        assert_eq!(result.details.terraform_version.as_deref(), Some(">= 1.3"));
        assert!(result.details.readme_content.unwrap().starts_with("# VPC"));

        let submodules: Vec<_> = result.submodules.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(submodules, vec!["modules/subnet"]);
        assert_eq!(
            result.submodules[0].details.docs().inputs[0].name,
            "subnet_input"
        );

        assert_eq!(result.examples.len(), 1);
        let example = &result.examples[0];
        assert_eq!(example.path, "examples/basic");
        let files: Vec<_> = example.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(files, vec!["examples/basic/main.tf", "examples/basic/terraform.tfvars"]);

        assert_eq!(result.module_files.len(), 1);
        assert_eq!(result.module_files[0].path, "CHANGELOG.md");
        assert_eq!(runner.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_metadata_file_overrides_readme() {
        let dir = module_tree();
        write(
            dir.path(),
            "terrareg.json",
            r#"{"owner": "platform-team", "description": "Shared VPC", "variable_template": [{"name": "cidr"}]}"#,
        );
        let runner = Arc::new(DocsRunner {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let result = ModuleParser::with_settings(settings(), runner)
            .parse(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.description.as_deref(), Some("Shared VPC"));
        assert_eq!(result.owner.as_deref(), Some("platform-team"));
        assert!(result.variable_template.is_some());
    }

    #[tokio::test]
    async fn test_terraform_docs_failure_is_parse_failed() {
        let dir = module_tree();
        let runner = Arc::new(DocsRunner {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });
        let result = ModuleParser::with_settings(settings(), runner)
            .parse(dir.path(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::ParseFailed(_))));
    }

    #[tokio::test]
    async fn test_invalid_metadata_is_parse_failed() {
        let dir = module_tree();
        write(dir.path(), ".terrareg.json", "{not json");
        let runner = Arc::new(DocsRunner {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let result = ModuleParser::with_settings(settings(), runner)
            .parse(dir.path(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::ParseFailed(_))));
    }

    #[test]
    fn test_description_skips_markup_and_urls() {
        let readme = "# Title\n\n- bullet item\nContact admin@example.com for help.\nSee https://example.com.\nDeploys a thing.\n";
        assert_eq!(extract_description(readme).as_deref(), Some("Deploys a thing"));
    }

    #[test]
    fn test_description_stops_after_min_length() {
        let readme = "This module provisions a highly available PostgreSQL cluster on AWS. It also sets up backups. And alarms.";
        assert_eq!(
            extract_description(readme).as_deref(),
            Some("This module provisions a highly available PostgreSQL cluster on AWS. It also sets up backups")
        );
    }

    #[test]
    fn test_description_respects_max_length() {
        let long = "word ".repeat(30);
        let readme = format!("{}\nShort fallback line.", long.trim());
        assert_eq!(extract_description(&readme).as_deref(), Some("Short fallback line"));
        assert_eq!(extract_description("# Only a heading"), None);
    }
}
