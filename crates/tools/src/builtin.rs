//! Built-in tool handlers: workspace-constrained file I/O and shell
//! execution. Hosts register further handlers (memory ops, scheduler ops,
//! channel ops) on top of these.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use valet_domain::cancel::CancelToken;

use crate::error::{ToolError, ToolErrorType};
use crate::registry::{ToolHandler, ToolRegistry, ToolSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate and resolve a requested path within the workspace root.
///
/// 1. Rejects absolute paths and raw `..` components.
/// 2. Joins the requested path onto the canonicalized workspace root.
/// 3. Canonicalizes the result (walking up to the nearest existing
///    ancestor when the target doesn't exist yet, so symlinks resolve)
///    and checks the resolved path is still contained in the root.
fn validate_path(workspace_root: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(ToolError::new(
            ToolErrorType::Permission,
            "file",
            format!("absolute paths are not allowed (got '{requested}')"),
        )
        .with_retry_suggestion("use a path relative to the workspace root"));
    }
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ToolError::new(
                ToolErrorType::Permission,
                "file",
                "path must not contain '..' components",
            ));
        }
    }

    // Canonicalize the workspace root (must exist).
    let canonical_root = workspace_root.canonicalize().map_err(|e| {
        ToolError::new(
            ToolErrorType::Permanent,
            "file",
            format!(
                "cannot resolve workspace root '{}': {e}",
                workspace_root.display()
            ),
        )
    })?;

    let candidate = canonical_root.join(requested_path);

    // If the target already exists we can canonicalize directly. Otherwise
    // canonicalize the longest existing prefix and append the remaining
    // components, then check containment.
    let resolved = if candidate.exists() {
        candidate.canonicalize().map_err(|e| {
            ToolError::new(
                ToolErrorType::Permanent,
                "file",
                format!("cannot resolve path '{}': {e}", candidate.display()),
            )
        })?
    } else {
        // Walk up to the nearest existing ancestor.
        let mut existing = candidate.as_path();
        let mut tail_parts: Vec<&std::ffi::OsStr> = Vec::new();
        loop {
            if existing.exists() {
                break;
            }
            match existing.parent() {
                Some(parent) => {
                    if let Some(file_name) = existing.file_name() {
                        tail_parts.push(file_name);
                    }
                    existing = parent;
                }
                None => break,
            }
        }
        let mut resolved = existing.canonicalize().map_err(|e| {
            ToolError::new(
                ToolErrorType::Permanent,
                "file",
                format!("cannot resolve ancestor of '{}': {e}", candidate.display()),
            )
        })?;
        for part in tail_parts.into_iter().rev() {
            resolved.push(part);
        }
        resolved
    };

    // Containment check.
    if !resolved.starts_with(&canonical_root) {
        return Err(ToolError::new(
            ToolErrorType::Permission,
            "file",
            format!(
                "path '{}' resolves outside workspace root '{}'",
                requested,
                canonical_root.display()
            ),
        ));
    }

    Ok(resolved)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// read_file / write_file / list_dir
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
}

pub struct ReadFileTool {
    workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl ToolHandler for ReadFileTool {
    async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
        let args: ReadFileArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::validation("read_file", format!("invalid arguments: {e}")))?;
        let path = validate_path(&self.workspace_root, &args.path)?;
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                ToolErrorType::ResourceNotFound
            } else {
                ToolErrorType::Permanent
            };
            ToolError::new(kind, "read_file", format!("cannot read '{}': {e}", args.path))
        })
    }
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

pub struct WriteFileTool {
    workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl ToolHandler for WriteFileTool {
    async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
        let args: WriteFileArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::validation("write_file", format!("invalid arguments: {e}")))?;
        let path = validate_path(&self.workspace_root, &args.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::new(ToolErrorType::Permanent, "write_file", e.to_string())
            })?;
        }
        tokio::fs::write(&path, args.content.as_bytes())
            .await
            .map_err(|e| {
                ToolError::new(
                    ToolErrorType::Permanent,
                    "write_file",
                    format!("cannot write '{}': {e}", args.path),
                )
            })?;
        Ok(format!("wrote {} bytes to {}", args.content.len(), args.path))
    }
}

#[derive(Deserialize)]
struct ListDirArgs {
    #[serde(default = "default_dot")]
    path: String,
}

fn default_dot() -> String {
    ".".into()
}

pub struct ListDirTool {
    workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl ToolHandler for ListDirTool {
    async fn call(&self, args: Value, _cancel: &CancelToken) -> Result<String, ToolError> {
        let args: ListDirArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::validation("list_dir", format!("invalid arguments: {e}")))?;
        let path = validate_path(&self.workspace_root, &args.path)?;

        let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| {
            ToolError::new(
                ToolErrorType::ResourceNotFound,
                "list_dir",
                format!("cannot list '{}': {e}", args.path),
            )
        })?;

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let meta = entry.metadata().await.ok();
            let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
            let size = meta.map(|m| m.len()).unwrap_or(0);
            entries.push(serde_json::json!({
                "name": entry.file_name().to_string_lossy(),
                "is_dir": is_dir,
                "size": size,
            }));
        }
        entries.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or("")
                .cmp(b["name"].as_str().unwrap_or(""))
        });
        Ok(serde_json::json!({ "entries": entries }).to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// exec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct ExecArgs {
    command: String,
    #[serde(default)]
    workdir: Option<String>,
    /// Override hard timeout (seconds).
    #[serde(default)]
    timeout_sec: Option<u64>,
}

pub struct ExecTool {
    workspace_root: PathBuf,
    default_timeout: Duration,
}

#[async_trait::async_trait]
impl ToolHandler for ExecTool {
    async fn call(&self, args: Value, cancel: &CancelToken) -> Result<String, ToolError> {
        let args: ExecArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::validation("exec", format!("invalid arguments: {e}")))?;
        if args.command.trim().is_empty() {
            return Err(ToolError::validation("exec", "command is empty"));
        }

        let timeout = args
            .timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&args.command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        match &args.workdir {
            Some(wd) => {
                cmd.current_dir(validate_path(&self.workspace_root, wd)?);
            }
            None => {
                cmd.current_dir(&self.workspace_root);
            }
        }

        let child = cmd.spawn().map_err(|e| {
            ToolError::new(ToolErrorType::Permanent, "exec", format!("spawn failed: {e}"))
        })?;

        let output_fut = child.wait_with_output();
        tokio::pin!(output_fut);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(Duration::from_millis(100));

        let output = loop {
            tokio::select! {
                result = &mut output_fut => {
                    break result.map_err(|e| {
                        ToolError::new(ToolErrorType::Permanent, "exec", e.to_string())
                    })?;
                }
                _ = &mut deadline => {
                    return Err(ToolError::timeout(
                        "exec",
                        format!("command exceeded {}s timeout", timeout.as_secs()),
                    )
                    .with_retry_suggestion("re-run with a larger timeout_sec or in smaller steps"));
                }
                _ = poll.tick() => {
                    if cancel.is_cancelled() {
                        return Err(ToolError::new(
                            ToolErrorType::Transient,
                            "exec",
                            "command cancelled by user",
                        ));
                    }
                }
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }
        if !output.status.success() {
            text.push_str(&format!(
                "\n[exit code: {}]",
                output.status.code().unwrap_or(-1)
            ));
        }
        Ok(text)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Register the built-in filesystem and shell tools.
pub fn register_builtins(
    registry: &ToolRegistry,
    workspace_root: &Path,
    exec_timeout: Duration,
) {
    registry.register(
        ToolSpec::new(
            "read_file",
            "Read a text file from the workspace.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the workspace root" }
                },
                "required": ["path"]
            }),
        )
        .category("filesystem")
        .parallel_safe(),
        Arc::new(ReadFileTool {
            workspace_root: workspace_root.to_path_buf(),
        }),
    );

    registry.register(
        ToolSpec::new(
            "write_file",
            "Write a text file in the workspace, creating parent directories.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the workspace root" },
                    "content": { "type": "string", "description": "Full file content" }
                },
                "required": ["path", "content"]
            }),
        )
        .category("filesystem"),
        Arc::new(WriteFileTool {
            workspace_root: workspace_root.to_path_buf(),
        }),
    );

    registry.register(
        ToolSpec::new(
            "list_dir",
            "List entries of a workspace directory.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory relative to the workspace root (default '.')" }
                }
            }),
        )
        .category("filesystem")
        .parallel_safe(),
        Arc::new(ListDirTool {
            workspace_root: workspace_root.to_path_buf(),
        }),
    );

    registry.register(
        ToolSpec::new(
            "exec",
            "Run a shell command in the workspace and return its output.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to execute" },
                    "workdir": { "type": "string", "description": "Working directory relative to the workspace" },
                    "timeout_sec": { "type": "integer", "description": "Hard timeout in seconds" }
                },
                "required": ["command"]
            }),
        )
        .category("shell")
        .detailed_help(
            "Runs `sh -c <command>` inside the workspace. stdout and stderr are \
             captured; a non-zero exit code is appended to the output. Long \
             commands are killed at the timeout.",
        ),
        Arc::new(ExecTool {
            workspace_root: workspace_root.to_path_buf(),
            default_timeout: exec_timeout,
        }),
    );
}
