//! Immutable details extracted from a module, submodule or example.

use serde::{Deserialize, Serialize};

/// A single `terraform-docs` input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocInput {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocOutput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocProvider {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRequirement {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocResource {
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocModuleCall {
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Decoded `terraform-docs json` output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerraformDocs {
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub footer: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub inputs: Vec<DocInput>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub outputs: Vec<DocOutput>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub providers: Vec<DocProvider>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub requirements: Vec<DocRequirement>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub resources: Vec<DocResource>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub modules: Vec<DocModuleCall>,
}

// terraform-docs emits `null` rather than `[]` for empty sections.
fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl TerraformDocs {
    /// Version constraint declared for the `terraform` requirement, if any.
    pub fn terraform_version_constraint(&self) -> Option<&str> {
        self.requirements
            .iter()
            .find(|r| r.name == "terraform")
            .and_then(|r| r.version.as_deref())
    }
}

/// Value object; every update returns a new instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleDetails {
    #[serde(default)]
    pub readme_content: Option<String>,
    #[serde(default)]
    pub terraform_docs: Option<TerraformDocs>,
    #[serde(default)]
    pub tfsec: Option<serde_json::Value>,
    #[serde(default)]
    pub infracost: Option<serde_json::Value>,
    #[serde(default)]
    pub terraform_graph: Option<String>,
    #[serde(default)]
    pub module_graph: Option<String>,
    #[serde(default)]
    pub terraform_version: Option<String>,
}

impl ModuleDetails {
    pub fn with_readme(&self, readme: Option<String>) -> Self {
        Self {
            readme_content: readme,
            ..self.clone()
        }
    }

    pub fn with_terraform_docs(&self, docs: Option<TerraformDocs>) -> Self {
        Self {
            terraform_docs: docs,
            ..self.clone()
        }
    }

    pub fn with_tfsec(&self, tfsec: Option<serde_json::Value>) -> Self {
        Self {
            tfsec,
            ..self.clone()
        }
    }

    pub fn with_infracost(&self, infracost: Option<serde_json::Value>) -> Self {
        Self {
            infracost,
            ..self.clone()
        }
    }

    pub fn with_terraform_graph(&self, graph: Option<String>) -> Self {
        Self {
            terraform_graph: graph,
            ..self.clone()
        }
    }

    pub fn with_module_graph(&self, graph: Option<String>) -> Self {
        Self {
            module_graph: graph,
            ..self.clone()
        }
    }

    pub fn with_terraform_version(&self, version: Option<String>) -> Self {
        Self {
            terraform_version: version,
            ..self.clone()
        }
    }

    pub fn docs(&self) -> TerraformDocs {
        self.terraform_docs.clone().unwrap_or_default()
    }

    /// True when no terraform-docs output was recorded.
    pub fn is_empty(&self) -> bool {
        self.terraform_docs
            .as_ref()
            .map(|d| d.inputs.is_empty() && d.outputs.is_empty() && d.resources.is_empty())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_helpers_leave_original_untouched() {
        let base = ModuleDetails::default().with_readme(Some("# Hello".into()));
        let updated = base.with_tfsec(Some(serde_json::json!({"results": []})));
        assert!(base.tfsec.is_none());
        assert_eq!(updated.readme_content.as_deref(), Some("# Hello"));
        assert_ne!(base, updated);
    }

    #[test]
    fn test_structural_equality() {
        let a = ModuleDetails::default().with_terraform_version(Some(">= 1.0".into()));
        let b = ModuleDetails::default().with_terraform_version(Some(">= 1.0".into()));
        assert_eq!(a, b);
    }

    #[test]
    fn test_terraform_docs_null_sections() {
        let docs: TerraformDocs = serde_json::from_str(
            r#"{"header":"","footer":"","inputs":null,"outputs":[{"name":"id","description":"The id"}],
                "providers":null,"requirements":[{"name":"terraform","version":">= 1.3"}],
                "resources":null,"modules":null}"#,
        )
        .unwrap();
        assert!(docs.inputs.is_empty());
        assert_eq!(docs.outputs.len(), 1);
        assert_eq!(docs.terraform_version_constraint(), Some(">= 1.3"));
    }

    #[test]
    fn test_is_empty() {
        assert!(ModuleDetails::default().is_empty());
        let docs = TerraformDocs {
            outputs: vec![DocOutput {
                name: "id".into(),
                description: None,
            }],
            ..Default::default()
        };
        assert!(!ModuleDetails::default().with_terraform_docs(Some(docs)).is_empty());
    }
}
