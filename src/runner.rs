//! External command execution for provisioning and inspection
//!
//! The resolver never shells out directly. Everything that touches git or the
//! container runtime goes through [`CommandRunner`], so tests can swap in a
//! scripted stand-in (`testing::ScriptedRunner`, behind the `testing` feature).

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Go template producing `ip:port/proto:port/proto...` from `docker inspect`
pub const INSPECT_FORMAT: &str =
    "{{.NetworkSettings.IPAddress}}{{range $p, $conf := .NetworkSettings.Ports}}:{{$p}}{{end}}";

/// Errors from running an external command
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be started at all
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The program ran and exited unsuccessfully
    #[error("'{program} {action}' exited with code {code}: {detail}")]
    Failed {
        program: String,
        action: String,
        code: i32,
        detail: String,
    },
}

/// What `run_container` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A new container was created and started
    Started,
    /// A container with that name already existed; it is running now
    AlreadyRunning,
}

/// Capability for the external tools used during resolution
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Whether `dir` already holds a git checkout
    async fn has_checkout(&self, dir: &Path) -> bool;

    /// Shallow single-branch clone of `refspec` from `url` into `dir`
    async fn clone_shallow(&self, url: &str, refspec: &str, dir: &Path) -> Result<(), CommandError>;

    /// Fetch `refspec` at depth 1 and force-checkout it in `dir`
    async fn fetch_and_checkout(&self, dir: &Path, refspec: &str) -> Result<(), CommandError>;

    /// Full commit hash of HEAD in `dir`
    async fn head_commit(&self, dir: &Path) -> Result<String, CommandError>;

    /// Build an image tagged `tag` from the `context` directory
    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), CommandError>;

    /// Start a detached container `name` from `image` with all ports published
    async fn run_container(&self, name: &str, image: &str) -> Result<RunOutcome, CommandError>;

    /// Raw inspection output for container `name`: `ip:port/proto:...`
    async fn inspect(&self, name: &str) -> Result<String, CommandError>;
}

/// [`CommandRunner`] backed by the `git` and `docker` CLIs
#[derive(Debug, Clone)]
pub struct CliRunner {
    git_path: String,
    docker_path: String,
}

impl CliRunner {
    pub fn new(git_path: impl Into<String>, docker_path: impl Into<String>) -> Self {
        Self {
            git_path: git_path.into(),
            docker_path: docker_path.into(),
        }
    }

    fn git(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.arg("-C").arg(dir);
        cmd
    }

    fn clone_command(&self, url: &str, refspec: &str, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.arg("clone")
            .arg(format!("--branch={}", refspec))
            .arg("--single-branch")
            .arg("--depth=1")
            .arg("--")
            .arg(url)
            .arg(dir);
        cmd
    }

    fn fetch_command(&self, dir: &Path, refspec: &str) -> Command {
        let mut cmd = self.git(dir);
        cmd.arg("fetch")
            .arg("--depth=1")
            .arg("--force")
            .arg("origin")
            .arg(refspec);
        cmd
    }

    fn checkout_command(&self, dir: &Path, refspec: &str) -> Command {
        let mut cmd = self.git(dir);
        cmd.arg("checkout")
            .arg("--force")
            .arg(format!("origin/{}", refspec));
        cmd
    }

    fn build_command(&self, tag: &str, context: &Path) -> Command {
        let mut cmd = Command::new(&self.docker_path);
        cmd.arg("build").arg(format!("--tag={}", tag)).arg(context);
        cmd
    }

    fn run_command(&self, name: &str, image: &str) -> Command {
        let mut cmd = Command::new(&self.docker_path);
        cmd.arg("run")
            .arg("--detach")
            .arg("--publish-all")
            .arg(format!("--name={}", name))
            .arg(image);
        cmd
    }

    fn start_command(&self, name: &str) -> Command {
        let mut cmd = Command::new(&self.docker_path);
        cmd.arg("start").arg(name);
        cmd
    }

    fn inspect_command(&self, name: &str) -> Command {
        let mut cmd = Command::new(&self.docker_path);
        cmd.arg("inspect")
            .arg(format!("--format={}", INSPECT_FORMAT))
            .arg(name);
        cmd
    }
}

impl Default for CliRunner {
    fn default() -> Self {
        Self::new("git", "docker")
    }
}

#[async_trait]
impl CommandRunner for CliRunner {
    async fn has_checkout(&self, dir: &Path) -> bool {
        tokio::fs::metadata(dir.join(".git")).await.is_ok()
    }

    async fn clone_shallow(&self, url: &str, refspec: &str, dir: &Path) -> Result<(), CommandError> {
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CommandError::Spawn {
                    program: self.git_path.clone(),
                    source: e,
                })?;
        }

        let cmd = self.clone_command(url, refspec, dir);
        run_streamed(cmd, &self.git_path, "clone", "git").await?;
        Ok(())
    }

    async fn fetch_and_checkout(&self, dir: &Path, refspec: &str) -> Result<(), CommandError> {
        let fetch = self.fetch_command(dir, refspec);
        run_streamed(fetch, &self.git_path, "fetch", "git").await?;

        let checkout = self.checkout_command(dir, refspec);
        run_streamed(checkout, &self.git_path, "checkout", "git").await?;
        Ok(())
    }

    async fn head_commit(&self, dir: &Path) -> Result<String, CommandError> {
        let mut cmd = self.git(dir);
        cmd.args(["rev-parse", "HEAD"]);
        let stdout = run_captured(cmd, &self.git_path, "rev-parse").await?;
        Ok(stdout.trim().to_string())
    }

    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), CommandError> {
        let cmd = self.build_command(tag, context);
        run_streamed(cmd, &self.docker_path, "build", "docker").await?;
        Ok(())
    }

    async fn run_container(&self, name: &str, image: &str) -> Result<RunOutcome, CommandError> {
        let cmd = self.run_command(name, image);
        match run_captured(cmd, &self.docker_path, "run").await {
            Ok(id) => {
                info!(container = name, id = %id.trim(), "Container started");
                Ok(RunOutcome::Started)
            }
            Err(CommandError::Failed { detail, .. }) if is_name_conflict(&detail) => {
                debug!(container = name, "Container name in use, ensuring it is started");
                // `docker start` on a running container is a no-op
                let start = self.start_command(name);
                run_captured(start, &self.docker_path, "start").await?;
                Ok(RunOutcome::AlreadyRunning)
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, name: &str) -> Result<String, CommandError> {
        let cmd = self.inspect_command(name);
        run_captured(cmd, &self.docker_path, "inspect").await
    }
}

/// docker reports `Conflict. The container name "/x" is already in use`
fn is_name_conflict(stderr: &str) -> bool {
    stderr.contains("is already in use") || stderr.contains("Conflict.")
}

/// Run to completion, returning stdout; stderr becomes the failure detail
async fn run_captured(mut cmd: Command, program: &str, action: &str) -> Result<String, CommandError> {
    cmd.stdin(Stdio::null());
    debug!("Running: {:?}", cmd);

    let output = cmd.output().await.map_err(|e| CommandError::Spawn {
        program: program.to_string(),
        source: e,
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(CommandError::Failed {
            program: program.to_string(),
            action: action.to_string(),
            code: output.status.code().unwrap_or(-1),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run to completion while forwarding every output line to tracing.
///
/// The last output lines are kept as failure detail.
async fn run_streamed(
    mut cmd: Command,
    program: &str,
    action: &str,
    target: &'static str,
) -> Result<(), CommandError> {
    const TAIL_LINES: usize = 5;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!("Running: {:?}", cmd);

    let mut child = cmd.spawn().map_err(|e| CommandError::Spawn {
        program: program.to_string(),
        source: e,
    })?;

    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

    if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_reader.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            log_line(target, action, &line);
                            if tail.len() == TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            warn!(program, action, error = %e, "Error reading stdout");
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            log_line(target, action, &line);
                            if tail.len() == TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!(program, action, error = %e, "Error reading stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }
    }

    let status = child.wait().await.map_err(|e| CommandError::Spawn {
        program: program.to_string(),
        source: e,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(CommandError::Failed {
            program: program.to_string(),
            action: action.to_string(),
            code: status.code().unwrap_or(-1),
            detail: Vec::from(tail).join("\n"),
        })
    }
}

fn log_line(target: &'static str, action: &str, line: &str) {
    // tracing needs a literal target, hence the match
    match target {
        "git" => info!(target: "git", action, "{}", line),
        _ => info!(target: "docker", action, "{}", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_conflict_detection() {
        assert!(is_name_conflict(
            "docker: Error response from daemon: Conflict. The container name \"/master.app.acme.github.com\" is already in use by container \"abc\"."
        ));
        assert!(!is_name_conflict("Unable to find image 'x:y' locally"));
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_git_argv() {
        let runner = CliRunner::new("/usr/bin/git", "docker");
        let dir = Path::new("/opt/src/github.com/acme/app");

        let clone = runner.clone_command("https://github.com/acme/app.git", "master", dir);
        assert_eq!(clone.as_std().get_program(), "/usr/bin/git");
        assert_eq!(
            args(&clone),
            [
                "clone",
                "--branch=master",
                "--single-branch",
                "--depth=1",
                "--",
                "https://github.com/acme/app.git",
                "/opt/src/github.com/acme/app",
            ]
        );

        assert_eq!(
            args(&runner.fetch_command(dir, "master")),
            ["-C", "/opt/src/github.com/acme/app", "fetch", "--depth=1", "--force", "origin", "master"]
        );
        assert_eq!(
            args(&runner.checkout_command(dir, "master")),
            ["-C", "/opt/src/github.com/acme/app", "checkout", "--force", "origin/master"]
        );
    }

    #[test]
    fn test_docker_argv() {
        let runner = CliRunner::new("git", "/usr/local/bin/docker");

        let build = runner.build_command("github.com/acme/app:master", Path::new("/opt/src/x"));
        assert_eq!(build.as_std().get_program(), "/usr/local/bin/docker");
        assert_eq!(
            args(&build),
            ["build", "--tag=github.com/acme/app:master", "/opt/src/x"]
        );

        assert_eq!(
            args(&runner.run_command("master.app.acme.github.com", "github.com/acme/app:master")),
            [
                "run",
                "--detach",
                "--publish-all",
                "--name=master.app.acme.github.com",
                "github.com/acme/app:master",
            ]
        );
        assert_eq!(
            args(&runner.start_command("master.app.acme.github.com")),
            ["start", "master.app.acme.github.com"]
        );
        assert_eq!(
            args(&runner.inspect_command("master.app.acme.github.com")),
            [
                "inspect".to_string(),
                format!("--format={}", INSPECT_FORMAT),
                "master.app.acme.github.com".to_string(),
            ]
        );
    }

    #[test]
    fn test_inspect_format_shape() {
        assert!(INSPECT_FORMAT.starts_with("{{.NetworkSettings.IPAddress}}"));
        assert!(INSPECT_FORMAT.contains(":{{$p}}"));
    }

    #[tokio::test]
    async fn test_has_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CliRunner::default();

        assert!(!runner.has_checkout(dir.path()).await);
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        assert!(runner.has_checkout(dir.path()).await);
    }

    #[tokio::test]
    async fn test_spawn_error_for_missing_program() {
        let runner = CliRunner::new("/nonexistent/git-binary", "/nonexistent/docker-binary");
        let err = runner.inspect("anything").await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/docker-binary"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_command_reports_output_tail() {
        // `false`-like program that prints before failing
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two >&2; exit 3"]);
        let err = run_streamed(cmd, "sh", "test", "git").await.unwrap_err();
        match err {
            CommandError::Failed { code, detail, .. } => {
                assert_eq!(code, 3);
                assert!(detail.contains("one"));
                assert!(detail.contains("two"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
