//! Declarative resource wiring.
//!
//! A YAML document names typed resources (`llm`, `sysprompt`,
//! `tool_aligner`) and maps each *user* (an agent class) to the resources it
//! consumes by rid. [`ResourceProvider`] resolves a user's rid to a concrete
//! value, validating that the resource's category matches what the user
//! asked for. Each resolution builds a fresh instance, so two agents never
//! share a chat adapter.
//!
//! ```yaml
//! resources:
//!   coder_llm:
//!     category: llm
//!     type: ollama
//!     host: http://localhost:11434
//!     model: qwen2.5-coder
//!     induced_tools: true
//!   coder_prompt:
//!     category: sysprompt
//!     txt: "You write Python."
//! users:
//!   coder:
//!     resources:
//!       llm: coder_llm
//!       sysprompt: coder_prompt
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::align::ToolAligner;
use crate::chat::mock::MockChat;
use crate::chat::ollama::{OllamaChat, OllamaConfig};
use crate::chat::BoxedChatModel;

/// A type alias for `Result<T, ResourceError>`.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Error type for resource loading and resolution.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration did not parse.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// No resource with this name is declared.
    #[error("resource '{0}' not found in configuration")]
    UnknownResource(String),

    /// No user with this name is declared.
    #[error("user '{0}' not found in configuration")]
    UnknownUser(String),

    /// The user does not map this rid to any resource.
    #[error("user '{user}' has no resource mapped for rid '{rid}'")]
    UnmappedRid {
        /// The user.
        user: String,
        /// The unmapped rid.
        rid: String,
    },

    /// The resource exists but has the wrong category.
    #[error("resource '{name}' has category '{actual}', expected '{expected}'")]
    CategoryMismatch {
        /// The resource name.
        name: String,
        /// What the caller needed.
        expected: &'static str,
        /// What the configuration declares.
        actual: &'static str,
    },

    /// The resource could not be constructed.
    #[error("failed to build resource '{name}': {message}")]
    Build {
        /// The resource name.
        name: String,
        /// Why it failed.
        message: String,
    },
}

/// Backend type of an LLM resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmKind {
    /// An Ollama server.
    Ollama,
    /// A scripted mock model.
    Mock,
}

/// Declaration of an LLM resource.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSpec {
    /// Backend type.
    #[serde(rename = "type")]
    pub kind: LlmKind,
    /// Server base URL (Ollama).
    #[serde(default)]
    pub host: Option<String>,
    /// Model identifier.
    #[serde(default)]
    pub model: Option<String>,
    /// Use the induced tool-call protocol instead of native tools.
    #[serde(default)]
    pub induced_tools: bool,
    /// Forwarded to the backend's thinking switch when set.
    #[serde(default)]
    pub thinking: Option<bool>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Scripted responses (mock only).
    #[serde(default)]
    pub responses: Vec<String>,
}

/// Declaration of a system-prompt resource: inline text or a file.
#[derive(Debug, Clone, Deserialize)]
pub struct SyspromptSpec {
    /// Inline prompt text.
    #[serde(default)]
    pub txt: Option<String>,
    /// Path to a prompt file, resolved relative to the config file.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_owned()
}

fn default_threads() -> usize {
    1
}

fn default_name_lexical() -> f64 {
    85.0
}

fn default_name_semantic() -> f32 {
    0.7
}

fn default_args_lexical() -> f64 {
    80.0
}

fn default_args_semantic() -> f32 {
    0.65
}

/// Declaration of a tool-aligner resource.
#[derive(Debug, Clone, Deserialize)]
pub struct AlignerSpec {
    /// Embedding model code.
    #[serde(default = "default_embedding_model")]
    pub model_name: String,
    /// Embedding thread count.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Lexical threshold for tool names (0-100).
    #[serde(default = "default_name_lexical")]
    pub tool_name_lexical_threshold: f64,
    /// Semantic threshold for tool names (0-1).
    #[serde(default = "default_name_semantic")]
    pub tool_name_semantic_threshold: f32,
    /// Lexical threshold for argument keys (0-100).
    #[serde(default = "default_args_lexical")]
    pub tool_args_lexical_threshold: f64,
    /// Semantic threshold for argument keys (0-1).
    #[serde(default = "default_args_semantic")]
    pub tool_args_semantic_threshold: f32,
}

/// A declared resource, tagged by category.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ResourceSpec {
    /// A chat model.
    Llm(LlmSpec),
    /// A system prompt.
    Sysprompt(SyspromptSpec),
    /// A tool aligner.
    ToolAligner(AlignerSpec),
}

impl ResourceSpec {
    const fn category(&self) -> &'static str {
        match self {
            Self::Llm(_) => "llm",
            Self::Sysprompt(_) => "sysprompt",
            Self::ToolAligner(_) => "tool_aligner",
        }
    }
}

/// A resource user: its rid-to-resource-name mapping.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserSpec {
    /// Maps the user's declared rids to resource names.
    #[serde(default)]
    pub resources: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResourcesConfig {
    #[serde(default)]
    resources: HashMap<String, ResourceSpec>,
    #[serde(default)]
    users: HashMap<String, UserSpec>,
}

/// Resolves users' resource ids into concrete values.
#[derive(Debug, Default)]
pub struct ResourceProvider {
    config: ResourcesConfig,
    base_dir: PathBuf,
}

impl ResourceProvider {
    /// Load a provider from a YAML file. Relative prompt sources resolve
    /// against the file's directory.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ResourceResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ResourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::from_yaml_str(&text, base_dir)
    }

    /// Parse a provider from YAML text.
    pub fn from_yaml_str(text: &str, base_dir: impl Into<PathBuf>) -> ResourceResult<Self> {
        let config: ResourcesConfig =
            serde_yaml::from_str(text).map_err(|e| ResourceError::Parse(e.to_string()))?;
        Ok(Self {
            config,
            base_dir: base_dir.into(),
        })
    }

    /// Names of all declared users.
    #[must_use]
    pub fn user_names(&self) -> Vec<String> {
        self.config.users.keys().cloned().collect()
    }

    fn spec_for(&self, user: &str, rid: &str) -> ResourceResult<(&str, &ResourceSpec)> {
        let user_spec = self
            .config
            .users
            .get(user)
            .ok_or_else(|| ResourceError::UnknownUser(user.to_owned()))?;
        let name = user_spec
            .resources
            .get(rid)
            .ok_or_else(|| ResourceError::UnmappedRid {
                user: user.to_owned(),
                rid: rid.to_owned(),
            })?;
        let spec = self
            .config
            .resources
            .get(name)
            .ok_or_else(|| ResourceError::UnknownResource(name.clone()))?;
        Ok((name, spec))
    }

    /// Build the chat model a user maps to `rid`.
    pub fn llm(&self, user: &str, rid: &str) -> ResourceResult<BoxedChatModel> {
        let (name, spec) = self.spec_for(user, rid)?;
        let ResourceSpec::Llm(llm) = spec else {
            return Err(ResourceError::CategoryMismatch {
                name: name.to_owned(),
                expected: "llm",
                actual: spec.category(),
            });
        };
        info!(user, rid, resource = name, "building llm resource");
        match llm.kind {
            LlmKind::Ollama => {
                let model = llm.model.clone().ok_or_else(|| ResourceError::Build {
                    name: name.to_owned(),
                    message: "ollama llm needs a 'model' field".into(),
                })?;
                let mut config = OllamaConfig {
                    model,
                    thinking: llm.thinking,
                    induced_tools: llm.induced_tools,
                    timeout_secs: llm.timeout_secs,
                    ..OllamaConfig::default()
                };
                if let Some(host) = llm.host.clone() {
                    config.host = host;
                }
                let chat = OllamaChat::new(config).map_err(|e| ResourceError::Build {
                    name: name.to_owned(),
                    message: e.to_string(),
                })?;
                Ok(Box::new(chat))
            }
            LlmKind::Mock => Ok(Box::new(MockChat::from_texts(
                llm.model.clone().unwrap_or_else(|| "mock".to_owned()),
                llm.responses.clone(),
            ))),
        }
    }

    /// Resolve the system prompt a user maps to `rid`.
    pub fn sysprompt(&self, user: &str, rid: &str) -> ResourceResult<String> {
        let (name, spec) = self.spec_for(user, rid)?;
        let ResourceSpec::Sysprompt(prompt) = spec else {
            return Err(ResourceError::CategoryMismatch {
                name: name.to_owned(),
                expected: "sysprompt",
                actual: spec.category(),
            });
        };
        if let Some(text) = &prompt.txt {
            return Ok(text.clone());
        }
        if let Some(source) = &prompt.source {
            let path = if source.is_absolute() {
                source.clone()
            } else {
                self.base_dir.join(source)
            };
            return std::fs::read_to_string(&path).map_err(|source| ResourceError::Io {
                path,
                source,
            });
        }
        Err(ResourceError::Build {
            name: name.to_owned(),
            message: "sysprompt needs a 'txt' or 'source' field".into(),
        })
    }

    /// Build the tool aligner a user maps to `rid`.
    ///
    /// Requires the `fastembed` feature for the embedding backend.
    pub fn aligner(&self, user: &str, rid: &str) -> ResourceResult<ToolAligner> {
        let (name, spec) = self.spec_for(user, rid)?;
        let ResourceSpec::ToolAligner(aligner) = spec else {
            return Err(ResourceError::CategoryMismatch {
                name: name.to_owned(),
                expected: "tool_aligner",
                actual: spec.category(),
            });
        };
        self.build_aligner(name, aligner)
    }

    #[cfg(feature = "fastembed")]
    fn build_aligner(&self, name: &str, spec: &AlignerSpec) -> ResourceResult<ToolAligner> {
        info!(
            resource = name,
            model = %spec.model_name,
            threads = spec.threads,
            "building tool aligner"
        );
        let embedder =
            crate::align::FastEmbedder::new(&spec.model_name).map_err(|e| ResourceError::Build {
                name: name.to_owned(),
                message: e.to_string(),
            })?;
        Ok(ToolAligner::new(
            std::sync::Arc::new(embedder),
            spec.tool_name_lexical_threshold,
            spec.tool_name_semantic_threshold,
            spec.tool_args_lexical_threshold,
            spec.tool_args_semantic_threshold,
        ))
    }

    #[cfg(not(feature = "fastembed"))]
    fn build_aligner(&self, name: &str, _spec: &AlignerSpec) -> ResourceResult<ToolAligner> {
        Err(ResourceError::Build {
            name: name.to_owned(),
            message: "built without the 'fastembed' feature, no embedding backend available"
                .into(),
        })
    }
}
