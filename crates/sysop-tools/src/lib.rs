mod shell;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysop_core::{
    FILES_DELETE, FILES_LIST, FILES_READ, FILES_WRITE, TERMINAL_RUN, ToolsConfig,
};
use sysop_jsonrpc::Dispatcher;
use tracing::debug;

/// Every command name this crate can register on a dispatcher.
pub const COMMANDS: &[&str] = &[TERMINAL_RUN, FILES_LIST, FILES_READ, FILES_WRITE, FILES_DELETE];

/// Local implementations of the step commands. Relative paths resolve
/// against the workspace; a leading `~` expands to the home directory.
pub struct CommandHost {
    workspace: PathBuf,
    cfg: ToolsConfig,
    runner: Arc<dyn ShellRunner + Send + Sync>,
}

impl CommandHost {
    pub fn new(workspace: &Path, cfg: ToolsConfig) -> Self {
        Self::with_runner(workspace, cfg, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(
        workspace: &Path,
        cfg: ToolsConfig,
        runner: Arc<dyn ShellRunner + Send + Sync>,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            cfg,
            runner,
        }
    }

    pub fn run(&self, command: &str, args: &Value) -> Result<Value> {
        debug!(%command, "running step command");
        match command {
            TERMINAL_RUN => {
                let cmd = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
                self.terminal_run(cmd)
            }
            FILES_LIST => {
                let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
                let limit = args
                    .get("limit")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize)
                    .unwrap_or(self.cfg.list_limit);
                Ok(self.list_files(path, limit))
            }
            FILES_READ => self.read_file(required_path(args)?),
            FILES_WRITE => {
                let content = args
                    .get("content")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("content missing"))?;
                self.write_file(required_path(args)?, content)
            }
            FILES_DELETE => self.delete_file(required_path(args)?),
            other => Err(anyhow!("Unknown command {other}")),
        }
    }

    fn terminal_run(&self, cmd: &str) -> Result<Value> {
        if cmd.trim().is_empty() {
            return Ok(json!({"stdout": "", "stderr": "empty command", "status": null, "timed_out": false}));
        }
        let timeout = Duration::from_secs(self.cfg.command_timeout_seconds.max(1));
        let out = self.runner.run(cmd, &self.workspace, timeout)?;
        let mut payload = json!({
            "stdout": out.stdout,
            "stderr": out.stderr,
            "status": out.status,
            "timed_out": out.timed_out,
        });
        if let Some(error) = shell_failure(&out, timeout) {
            payload["error"] = json!(error);
        }
        Ok(payload)
    }

    fn list_files(&self, path: &str, limit: usize) -> Value {
        let dir = self.resolve(path);
        if !dir.exists() {
            return json!({"error": "path not found", "path": dir.display().to_string()});
        }
        if !dir.is_dir() {
            return json!({"error": "path is not a directory", "path": dir.display().to_string()});
        }
        let mut entries: Vec<(String, bool)> = match fs::read_dir(&dir) {
            Ok(read) => read
                .filter_map(|e| e.ok())
                .map(|e| (e.file_name().to_string_lossy().to_string(), e.path().is_dir()))
                .collect(),
            Err(err) => {
                return json!({"error": err.to_string(), "path": dir.display().to_string()});
            }
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let total = entries.len();
        let items: Vec<Value> = entries
            .into_iter()
            .take(limit)
            .map(|(name, is_dir)| json!({"name": name, "is_dir": is_dir}))
            .collect();
        json!({
            "path": dir.display().to_string(),
            "items": items,
            "truncated": total > limit,
        })
    }

    fn read_file(&self, path: &str) -> Result<Value> {
        let full = self.resolve(path);
        if !full.exists() {
            return Ok(json!({"error": "not found", "path": full.display().to_string()}));
        }
        let max = self.cfg.read_max_bytes;
        let mut bytes = Vec::new();
        fs::File::open(&full)?
            .take(max.saturating_add(1))
            .read_to_end(&mut bytes)?;
        let truncated = bytes.len() as u64 > max;
        let slice = if truncated { &bytes[..max as usize] } else { &bytes[..] };
        let content = match std::str::from_utf8(slice) {
            Ok(text) => text.to_string(),
            // a cut in the middle of a multi-byte char is fine, anything else is binary
            Err(err) if truncated && err.error_len().is_none() => {
                String::from_utf8_lossy(&slice[..err.valid_up_to()]).to_string()
            }
            Err(_) => {
                return Ok(json!({
                    "error": "file is not valid UTF-8",
                    "path": full.display().to_string(),
                }));
            }
        };
        Ok(json!({
            "path": full.display().to_string(),
            "content": content,
            "truncated": truncated,
        }))
    }

    fn write_file(&self, path: &str, content: &str) -> Result<Value> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, content)?;
        Ok(json!({"path": full.display().to_string(), "written": content.len()}))
    }

    fn delete_file(&self, path: &str) -> Result<Value> {
        let full = self.resolve(path);
        if !full.exists() {
            return Ok(json!({"error": "not found", "path": full.display().to_string()}));
        }
        if full.is_dir() {
            return Ok(json!({
                "error": "path is a directory; use terminal.run for recursive removal",
                "path": full.display().to_string(),
            }));
        }
        fs::remove_file(&full)?;
        Ok(json!({"path": full.display().to_string(), "deleted": true}))
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let expanded = expand_home(path);
        if expanded.is_absolute() {
            expanded
        } else {
            self.workspace.join(expanded)
        }
    }
}

fn required_path(args: &Value) -> Result<&str> {
    args.get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("path missing"))
}

fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok());
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => PathBuf::from(home),
        (Some(rest), Some(home)) if rest.starts_with('/') || rest.starts_with('\\') => {
            Path::new(&home).join(&rest[1..])
        }
        _ => PathBuf::from(path),
    }
}

fn shell_failure(out: &ShellRunResult, timeout: Duration) -> Option<String> {
    if out.timed_out {
        return Some(format!("command timed out after {}s", timeout.as_secs()));
    }
    match out.status {
        Some(0) => None,
        Some(code) => {
            let detail = out.stderr.lines().find(|l| !l.trim().is_empty());
            Some(match detail {
                Some(line) => format!("exit status {code}: {}", line.trim()),
                None => format!("exit status {code}"),
            })
        }
        None => Some("terminated by signal".to_string()),
    }
}

/// Registers every local step command on `dispatcher` as a blocking handler.
pub fn register_command_handlers(dispatcher: &Dispatcher, host: Arc<CommandHost>) {
    for name in COMMANDS {
        let host = Arc::clone(&host);
        dispatcher.register_blocking(*name, move |params| host.run(name, &params));
    }
}
