use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellRunResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub trait ShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult>;
}

/// How long readers may keep draining after a timed-out command is killed.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs commands through the platform shell and kills them, along with
/// anything they spawned, once the timeout elapses.
#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult> {
        let mut child = spawn_command(cmd, cwd)?;
        // Drain pipes while waiting so chatty commands cannot fill them and stall.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let timed_out = match child.wait_timeout(timeout)? {
            Some(_) => false,
            None => {
                kill_tree(&mut child)?;
                true
            }
        };
        let status = child.wait()?;

        // A detached grandchild may still hold the pipes; stop waiting for it.
        let deadline = timed_out.then_some(KILL_DRAIN_GRACE);
        Ok(ShellRunResult {
            status: status.code(),
            stdout: collect(stdout, deadline)?,
            stderr: collect(stderr, deadline)?,
            timed_out,
        })
    }
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    let pgid = i32::try_from(child.id()).map_err(|_| anyhow!("child pid out of range"))?;
    // SAFETY: signals the process group created for this child at spawn.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        child.kill()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill()?;
    Ok(())
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<Vec<u8>>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
        rx
    })
}

fn collect(reader: Option<Receiver<Vec<u8>>>, deadline: Option<Duration>) -> Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let bytes = match deadline {
        None => reader
            .recv()
            .map_err(|_| anyhow!("output reader thread panicked"))?,
        Some(grace) => match reader.recv_timeout(grace) {
            Ok(bytes) => bytes,
            Err(RecvTimeoutError::Timeout) => Vec::new(),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        },
    };
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

fn spawn_command(cmd: &str, cwd: &Path) -> Result<Child> {
    let cwd = if cwd.exists() {
        std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf())
    } else {
        cwd.to_path_buf()
    };
    let mut errors = Vec::new();
    for mut command in candidate_commands(cmd) {
        command
            .current_dir(&cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let program = command.get_program().to_string_lossy().to_string();
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{program}: {err}")),
        }
    }
    Err(anyhow!(
        "failed to spawn command '{cmd}' in '{}': {}",
        cwd.display(),
        errors.join(" | ")
    ))
}

#[cfg(target_os = "windows")]
fn candidate_commands(cmd: &str) -> Vec<Command> {
    let mut cmd_shell = Command::new("cmd");
    cmd_shell.arg("/C").arg(cmd);
    let mut ps_shell = Command::new("powershell");
    ps_shell.args(["-NoLogo", "-NoProfile", "-Command", cmd]);
    vec![cmd_shell, ps_shell]
}

#[cfg(not(target_os = "windows"))]
fn candidate_commands(cmd: &str) -> Vec<Command> {
    let mut sh_shell = Command::new("sh");
    sh_shell.arg("-c").arg(cmd);
    let mut bash_shell = Command::new("bash");
    bash_shell.arg("-c").arg(cmd);
    vec![sh_shell, bash_shell]
}

#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_stderr_and_status() {
        let out = PlatformShellRunner
            .run(
                "echo sysop; echo oops >&2; exit 3",
                Path::new("."),
                Duration::from_secs(5),
            )
            .expect("run command");
        assert!(!out.timed_out);
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "sysop");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn kills_command_after_timeout() {
        let out = PlatformShellRunner
            .run("sleep 5", Path::new("."), Duration::from_millis(200))
            .expect("run command");
        assert!(out.timed_out);
    }

    #[test]
    fn timeout_bounds_compound_commands_with_children() {
        let started = std::time::Instant::now();
        let out = PlatformShellRunner
            .run("sleep 6; echo done", Path::new("."), Duration::from_millis(300))
            .expect("run command");
        assert!(out.timed_out);
        assert!(!out.stdout.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn large_output_does_not_stall() {
        let out = PlatformShellRunner
            .run(
                "i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done",
                Path::new("."),
                Duration::from_secs(20),
            )
            .expect("run command");
        assert!(!out.timed_out);
        assert_eq!(out.stdout.lines().count(), 20000);
    }
}
