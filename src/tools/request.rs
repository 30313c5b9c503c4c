//! Tool triggers parsed from step input entries

/// A recognized tool trigger with its payload
///
/// Triggers are plain `(key, value)` entries in a step's `input` or `tools`
/// map; anything unrecognized stays in the map untouched, so process files
/// can carry forward-compatible keys without breaking older engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    WorkspaceTree,
    WorkspaceSummary,
    WorkspaceSearch { query: String },
    WorkspaceEmbeddings { query: String },
    WebSearch { query: String },
    ReadFile { path: String },
    RunShell { command: String },
    AskUser { question: String },
}

impl ToolRequest {
    /// Parse an input entry into a trigger, if the key is recognized.
    ///
    /// Boolean triggers (`workspace_tree`, `workspace_summary`) require a
    /// truthy value; payload triggers require a non-empty value.
    pub fn from_entry(key: &str, value: &str) -> Option<Self> {
        let value = value.trim();
        match key {
            "workspace_tree" if is_truthy(value) => Some(Self::WorkspaceTree),
            "workspace_summary" if is_truthy(value) => Some(Self::WorkspaceSummary),
            "workspace_search" if !value.is_empty() => Some(Self::WorkspaceSearch { query: value.into() }),
            "workspace_embeddings" if !value.is_empty() => Some(Self::WorkspaceEmbeddings { query: value.into() }),
            "web_search" if !value.is_empty() => Some(Self::WebSearch { query: value.into() }),
            "read_file" if !value.is_empty() => Some(Self::ReadFile { path: value.into() }),
            "run_shell" if !value.is_empty() => Some(Self::RunShell { command: value.into() }),
            "ask_user" if !value.is_empty() => Some(Self::AskUser { question: value.into() }),
            _ => None,
        }
    }

    /// The input key the tool's output is written under
    pub fn output_key(&self) -> &'static str {
        match self {
            Self::WorkspaceTree => "workspace_tree_content",
            Self::WorkspaceSummary => "workspace_summary_content",
            Self::WorkspaceSearch { .. } => "workspace_search_results",
            Self::WorkspaceEmbeddings { .. } => "workspace_embeddings_results",
            Self::WebSearch { .. } => "web_search_results",
            Self::ReadFile { .. } => "read_file_content",
            Self::RunShell { .. } => "shell_command_output",
            Self::AskUser { .. } => "ask_user_response",
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkspaceTree => "workspace_tree",
            Self::WorkspaceSummary => "workspace_summary",
            Self::WorkspaceSearch { .. } => "workspace_search",
            Self::WorkspaceEmbeddings { .. } => "workspace_embeddings",
            Self::WebSearch { .. } => "web_search",
            Self::ReadFile { .. } => "read_file",
            Self::RunShell { .. } => "run_shell",
            Self::AskUser { .. } => "ask_user",
        }
    }
}

/// Flag values accepted as "on"
pub fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "enabled" | "on" | "yes")
}
