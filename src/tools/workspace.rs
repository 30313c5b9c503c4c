//! Workspace backend for tool-context enrichment
//!
//! [`LocalWorkspace`] serves tool requests against the real project
//! directory: tree and summary via walkdir, keyword search via the grep
//! crates, web content via reqwest converted to markdown, shell commands
//! through `sh -c`, and interactive questions through rustyline. The
//! embedding index stays external and is injected when available.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{WrapErr, bail, eyre};
use grep_regex::RegexMatcherBuilder;
use grep_searcher::sinks::UTF8;
use grep_searcher::{BinaryDetection, SearcherBuilder};
use tracing::debug;
use walkdir::WalkDir;

use super::ExecutionMode;

/// Fixed response `ask_user` returns when no interactive session exists
pub const NON_INTERACTIVE_RESPONSE: &str = "[no interactive session: proceeding with defaults]";

/// Maximum characters a single tool may contribute to a step input
const MAX_TOOL_OUTPUT: usize = 50_000;

/// Maximum bytes accepted from a web response
const MAX_WEB_BODY: usize = 1_000_000;

/// A hit returned by the external embedding index
#[derive(Debug, Clone)]
pub struct EmbeddingHit {
    pub path: String,
    pub score: f32,
    pub snippet: String,
}

/// External semantic index over the workspace
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    async fn query(&self, query: &str, limit: usize) -> eyre::Result<Vec<EmbeddingHit>>;
}

/// The capabilities tools need from the outside world
#[async_trait]
pub trait Workspace: Send + Sync {
    async fn tree(&self) -> eyre::Result<String>;
    async fn summary(&self) -> eyre::Result<String>;
    async fn keyword_search(&self, query: &str) -> eyre::Result<String>;
    async fn embedding_search(&self, query: &str) -> eyre::Result<String>;
    async fn web_search(&self, query: &str) -> eyre::Result<String>;
    async fn read_file(&self, path: &str) -> eyre::Result<String>;
    async fn run_shell(&self, command: &str) -> eyre::Result<String>;
    async fn ask_user(&self, question: &str, mode: ExecutionMode) -> eyre::Result<String>;
}

/// Workspace backed by a local project directory
pub struct LocalWorkspace {
    root: PathBuf,
    embeddings: Option<Arc<dyn EmbeddingIndex>>,
    http: reqwest::Client,
    shell_timeout: Duration,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            embeddings: None,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            shell_timeout: Duration::from_secs(60),
        }
    }

    /// Attach an external embedding index
    pub fn with_embeddings(mut self, index: Arc<dyn EmbeddingIndex>) -> Self {
        self.embeddings = Some(index);
        self
    }

    pub fn with_shell_timeout(mut self, timeout: Duration) -> Self {
        self.shell_timeout = timeout;
        self
    }

    /// Resolve a relative path, refusing anything that escapes the root
    fn resolve(&self, rel: &str) -> eyre::Result<PathBuf> {
        let joined = self.root.join(rel);
        let canon = joined
            .canonicalize()
            .wrap_err_with(|| format!("cannot resolve '{rel}'"))?;
        let root = self.root.canonicalize().wrap_err("cannot resolve workspace root")?;
        if !canon.starts_with(&root) {
            bail!("path '{rel}' escapes the workspace");
        }
        Ok(canon)
    }

    /// Source files worth searching: skip hidden entries and build output
    fn source_files(&self) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            // depth 0 is the root itself; never filter it
            .filter_entry(|e| e.depth() == 0 || !is_ignored(e.file_name().to_string_lossy().as_ref()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
    }
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name == "target" || name == "node_modules"
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn tree(&self) -> eyre::Result<String> {
        let mut lines = Vec::new();
        let root_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());
        lines.push(format!("{root_name}/"));

        for entry in WalkDir::new(&self.root)
            .max_depth(4)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored(e.file_name().to_string_lossy().as_ref()))
            .filter_map(|e| e.ok())
            .filter(|e| e.depth() > 0)
        {
            let indent = "  ".repeat(entry.depth());
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                lines.push(format!("{indent}{name}/"));
            } else {
                lines.push(format!("{indent}{name}"));
            }
        }

        Ok(truncate_output(lines.join("\n")))
    }

    async fn summary(&self) -> eyre::Result<String> {
        let mut by_extension: BTreeMap<String, usize> = BTreeMap::new();
        let mut total = 0usize;
        for path in self.source_files() {
            total += 1;
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_else(|| "(none)".to_string());
            *by_extension.entry(ext).or_default() += 1;
        }

        let mut out = format!("Workspace: {}\nFiles: {total}\n", self.root.display());
        for (ext, count) in &by_extension {
            out.push_str(&format!("  .{ext}: {count}\n"));
        }

        for readme in ["README.md", "README", "readme.md"] {
            let path = self.root.join(readme);
            if path.is_file() {
                let content = tokio::fs::read_to_string(&path).await?;
                let head: Vec<&str> = content.lines().take(40).collect();
                out.push_str(&format!("\n--- {readme} ---\n{}\n", head.join("\n")));
                break;
            }
        }

        Ok(truncate_output(out))
    }

    async fn keyword_search(&self, query: &str) -> eyre::Result<String> {
        let matcher = RegexMatcherBuilder::new()
            .fixed_strings(true)
            .case_insensitive(true)
            .build(query)
            .wrap_err("bad search query")?;

        let mut searcher = SearcherBuilder::new()
            .binary_detection(BinaryDetection::quit(b'\x00'))
            .line_number(true)
            .build();

        let mut matches = Vec::new();
        let root = self.root.clone();
        for path in self.source_files() {
            if matches.len() >= 100 {
                break;
            }
            let rel = path.strip_prefix(&root).unwrap_or(&path).display().to_string();
            let result = searcher.search_path(
                &matcher,
                &path,
                UTF8(|line_number, line| {
                    matches.push(format!("{rel}:{line_number}: {}", line.trim_end()));
                    Ok(matches.len() < 100)
                }),
            );
            if let Err(e) = result {
                debug!(path = %rel, error = %e, "Skipping unsearchable file");
            }
        }

        if matches.is_empty() {
            return Ok(format!("no matches for '{query}'"));
        }
        Ok(truncate_output(matches.join("\n")))
    }

    async fn embedding_search(&self, query: &str) -> eyre::Result<String> {
        let index = self
            .embeddings
            .as_ref()
            .ok_or_else(|| eyre!("no embedding index configured"))?;

        let hits = index.query(query, 8).await?;
        if hits.is_empty() {
            return Ok(format!("no semantic matches for '{query}'"));
        }

        let rendered: Vec<String> = hits
            .iter()
            .map(|h| format!("{} (score {:.3})\n{}", h.path, h.score, h.snippet))
            .collect();
        Ok(truncate_output(rendered.join("\n\n")))
    }

    async fn web_search(&self, query: &str) -> eyre::Result<String> {
        let response = self
            .http
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
            .wrap_err("web search request failed")?;

        if !response.status().is_success() {
            bail!("web search returned HTTP {}", response.status());
        }

        let body = response.text().await.wrap_err("failed to read search response")?;
        if body.len() > MAX_WEB_BODY {
            bail!("search response too large ({} bytes)", body.len());
        }

        let markdown = html2md::rewrite_html(&body, false);
        Ok(truncate_output(markdown))
    }

    async fn read_file(&self, path: &str) -> eyre::Result<String> {
        let resolved = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .wrap_err_with(|| format!("failed to read '{path}'"))?;
        Ok(truncate_output(content))
    }

    async fn run_shell(&self, command: &str) -> eyre::Result<String> {
        let output = tokio::time::timeout(
            self.shell_timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.root)
                .output(),
        )
        .await
        .map_err(|_| eyre!("shell command timed out after {:?}", self.shell_timeout))?
        .wrap_err("failed to spawn shell")?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        if !output.status.success() {
            combined.push_str(&format!("\n[exit code: {}]", output.status.code().unwrap_or(-1)));
        }

        Ok(truncate_output(combined))
    }

    async fn ask_user(&self, question: &str, mode: ExecutionMode) -> eyre::Result<String> {
        if mode == ExecutionMode::NonInteractive {
            return Ok(NON_INTERACTIVE_RESPONSE.to_string());
        }

        let prompt = format!("{question} ");
        let answer = tokio::task::spawn_blocking(move || -> eyre::Result<String> {
            let mut editor = rustyline::DefaultEditor::new().wrap_err("cannot open terminal")?;
            editor.readline(&prompt).wrap_err("prompt aborted")
        })
        .await
        .wrap_err("prompt task failed")??;

        Ok(answer.trim().to_string())
    }
}

/// Cap tool output so one tool cannot blow up a prompt
fn truncate_output(s: String) -> String {
    if s.len() <= MAX_TOOL_OUTPUT {
        return s;
    }
    let mut end = MAX_TOOL_OUTPUT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...\n[truncated, {} chars total]", &s[..end], s.len())
}
