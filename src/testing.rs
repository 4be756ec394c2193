//! Deterministic [`CommandRunner`] for tests
//!
//! `ScriptedRunner` never spawns a process. It records every call, keeps a
//! fake set of checkouts and containers, and answers `inspect` from scripted
//! output so resolution can be driven end to end without git or docker.

use crate::runner::{CommandError, CommandRunner, RunOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

/// Head commit reported when none was scripted
pub const DEFAULT_HEAD: &str = "1a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d";

/// One recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Clone { url: String, refspec: String, dir: PathBuf },
    Fetch { dir: PathBuf, refspec: String },
    Head { dir: PathBuf },
    Build { tag: String, context: PathBuf },
    Run { name: String, image: String },
    Inspect { name: String },
}

/// Steps that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Clone,
    Fetch,
    Head,
    Build,
    Run,
    Inspect,
}

impl Step {
    fn program(&self) -> &'static str {
        match self {
            Step::Clone | Step::Fetch | Step::Head => "git",
            Step::Build | Step::Run | Step::Inspect => "docker",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Step::Clone => "clone",
            Step::Fetch => "fetch",
            Step::Head => "rev-parse",
            Step::Build => "build",
            Step::Run => "run",
            Step::Inspect => "inspect",
        }
    }
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    checkouts: HashSet<PathBuf>,
    containers: HashSet<String>,
    inspections: HashMap<String, String>,
    failing: HashSet<Step>,
    head: Option<String>,
    build_delay: Option<Duration>,
    build_barrier: Option<Arc<Barrier>>,
    builds_in_progress: usize,
    peak_builds: usize,
}

/// Scripted stand-in for git and docker
#[derive(Default)]
pub struct ScriptedRunner {
    state: Mutex<State>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the `ip:port/proto:...` output for a container
    pub fn set_inspection(&self, container: &str, output: &str) {
        self.state
            .lock()
            .inspections
            .insert(container.to_string(), output.to_string());
    }

    /// Commit reported by `head_commit` from now on
    pub fn set_head(&self, commit: &str) {
        self.state.lock().head = Some(commit.to_string());
    }

    /// Make every future invocation of `step` fail (or succeed again)
    pub fn set_failing(&self, step: Step, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(step);
        } else {
            state.failing.remove(&step);
        }
    }

    /// Sleep inside every build, widening the window for concurrent callers
    pub fn set_build_delay(&self, delay: Duration) {
        self.state.lock().build_delay = Some(delay);
    }

    /// Every build waits on `barrier` before finishing
    pub fn set_build_barrier(&self, barrier: Arc<Barrier>) {
        self.state.lock().build_barrier = Some(barrier);
    }

    /// Pretend a container with this name already exists
    pub fn add_container(&self, name: &str) {
        self.state.lock().containers.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn clones(&self) -> usize {
        self.count(|c| matches!(c, Call::Clone { .. }))
    }

    pub fn fetches(&self) -> usize {
        self.count(|c| matches!(c, Call::Fetch { .. }))
    }

    pub fn builds(&self) -> usize {
        self.count(|c| matches!(c, Call::Build { .. }))
    }

    pub fn runs(&self) -> usize {
        self.count(|c| matches!(c, Call::Run { .. }))
    }

    pub fn inspects(&self) -> usize {
        self.count(|c| matches!(c, Call::Inspect { .. }))
    }

    /// Highest number of builds observed running at once
    pub fn peak_concurrent_builds(&self) -> usize {
        self.state.lock().peak_builds
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|&c| pred(c)).count()
    }

    /// Record the call, then report whether the step is scripted to fail
    fn record(&self, call: Call, step: Step) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing.contains(&step) {
            return Err(CommandError::Failed {
                program: step.program().to_string(),
                action: step.action().to_string(),
                code: 1,
                detail: format!("scripted {} failure", step.action()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn has_checkout(&self, dir: &Path) -> bool {
        self.state.lock().checkouts.contains(dir)
    }

    async fn clone_shallow(&self, url: &str, refspec: &str, dir: &Path) -> Result<(), CommandError> {
        self.record(
            Call::Clone {
                url: url.to_string(),
                refspec: refspec.to_string(),
                dir: dir.to_path_buf(),
            },
            Step::Clone,
        )?;
        self.state.lock().checkouts.insert(dir.to_path_buf());
        Ok(())
    }

    async fn fetch_and_checkout(&self, dir: &Path, refspec: &str) -> Result<(), CommandError> {
        self.record(
            Call::Fetch {
                dir: dir.to_path_buf(),
                refspec: refspec.to_string(),
            },
            Step::Fetch,
        )
    }

    async fn head_commit(&self, dir: &Path) -> Result<String, CommandError> {
        self.record(
            Call::Head {
                dir: dir.to_path_buf(),
            },
            Step::Head,
        )?;
        Ok(self
            .state
            .lock()
            .head
            .clone()
            .unwrap_or_else(|| DEFAULT_HEAD.to_string()))
    }

    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), CommandError> {
        self.record(
            Call::Build {
                tag: tag.to_string(),
                context: context.to_path_buf(),
            },
            Step::Build,
        )?;

        let (delay, barrier) = {
            let mut state = self.state.lock();
            state.builds_in_progress += 1;
            state.peak_builds = state.peak_builds.max(state.builds_in_progress);
            (state.build_delay, state.build_barrier.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }

        self.state.lock().builds_in_progress -= 1;
        Ok(())
    }

    async fn run_container(&self, name: &str, image: &str) -> Result<RunOutcome, CommandError> {
        self.record(
            Call::Run {
                name: name.to_string(),
                image: image.to_string(),
            },
            Step::Run,
        )?;
        if self.state.lock().containers.insert(name.to_string()) {
            Ok(RunOutcome::Started)
        } else {
            Ok(RunOutcome::AlreadyRunning)
        }
    }

    async fn inspect(&self, name: &str) -> Result<String, CommandError> {
        self.record(
            Call::Inspect {
                name: name.to_string(),
            },
            Step::Inspect,
        )?;
        self.state
            .lock()
            .inspections
            .get(name)
            .cloned()
            .ok_or_else(|| CommandError::Failed {
                program: "docker".to_string(),
                action: "inspect".to_string(),
                code: 1,
                detail: format!("Error: No such object: {}", name),
            })
    }
}
