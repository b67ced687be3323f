#![allow(dead_code)]

use async_trait::async_trait;
use code_runner::config::Config;
use code_runner::container::{ContainerEngine, ContainerSpec, SANDBOX_MOUNT};
use code_runner::error::EngineError;
use code_runner::profile::COMPILE_FAILED_EXIT;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// How a fake container behaves once started.
#[derive(Debug, Clone)]
pub enum Behavior {
    Exit {
        output: Vec<u8>,
        code: i64,
        delay: Duration,
    },
    Hang,
    /// `create` takes this long, then the container hangs.
    SlowCreate(Duration),
    FailCreate,
    FailStart,
}

impl Behavior {
    pub fn exit(output: &str, code: i64) -> Self {
        Behavior::Exit {
            output: output.as_bytes().to_vec(),
            code,
            delay: Duration::ZERO,
        }
    }

    pub fn slow_exit(output: &str, delay: Duration) -> Self {
        Behavior::Exit {
            output: output.as_bytes().to_vec(),
            code: 0,
            delay,
        }
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    live: HashMap<String, Behavior>,
    max_live: usize,
    created: Vec<ContainerSpec>,
    staged_at_create: Vec<bool>,
    killed: Vec<String>,
    removed: Vec<String>,
    remove_requests: Vec<String>,
}

/// In-memory container engine. Behaviour is chosen per container spec.
pub struct FakeEngine {
    behave: Box<dyn Fn(&ContainerSpec) -> Behavior + Send + Sync>,
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new(behave: impl Fn(&ContainerSpec) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            behave: Box::new(behave),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn always(behavior: Behavior) -> Self {
        Self::new(move |_| behavior.clone())
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn staged_at_create(&self) -> Vec<bool> {
        self.state.lock().unwrap().staged_at_create.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Every id or name `remove` was called with, found or not.
    pub fn remove_requests(&self) -> Vec<String> {
        self.state.lock().unwrap().remove_requests.clone()
    }

    fn behavior(&self, id: &str) -> Result<Behavior, EngineError> {
        self.state
            .lock()
            .unwrap()
            .live
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let behavior = (self.behave)(spec);
        match behavior {
            Behavior::FailCreate => return Err(EngineError::Other("No such image".into())),
            Behavior::SlowCreate(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let staged_file = spec
            .command
            .split('\'')
            .find(|part| part.starts_with(SANDBOX_MOUNT))
            .and_then(|p| p.strip_prefix(&format!("{}/", SANDBOX_MOUNT)))
            .map(|name| spec.host_dir.join(name).exists())
            .unwrap_or(false);

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.live.insert(id.clone(), behavior);
        state.max_live = state.max_live.max(state.live.len());
        state.created.push(spec.clone());
        state.staged_at_create.push(staged_file);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        match self.behavior(id)? {
            Behavior::FailStart => Err(EngineError::Other("cannot start".into())),
            _ => Ok(()),
        }
    }

    fn output<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<Vec<u8>, EngineError>> {
        match self.behavior(id) {
            Ok(Behavior::Exit { output, delay, .. }) => stream::once(async move {
                tokio::time::sleep(delay).await;
                Ok(output)
            })
            .boxed(),
            Ok(Behavior::Hang | Behavior::SlowCreate(_)) => stream::pending().boxed(),
            Ok(_) => stream::empty().boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn wait(&self, id: &str) -> Result<i64, EngineError> {
        match self.behavior(id)? {
            Behavior::Exit { code, .. } => Ok(code),
            Behavior::Hang | Behavior::SlowCreate(_) => std::future::pending().await,
            _ => Ok(1),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        self.state.lock().unwrap().killed.push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.remove_requests.push(id.to_string());
        if state.live.remove(id).is_none() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        state.removed.push(id.to_string());
        Ok(())
    }
}

/// The marker a failing compile step would print, read back from the command.
pub fn compile_marker(spec: &ContainerSpec) -> String {
    spec.command
        .split("echo '")
        .nth(1)
        .and_then(|rest| rest.split('\'').next())
        .unwrap_or_default()
        .to_string()
}

/// Output of a compile step that failed with `diagnostics`.
pub fn compile_failed(spec: &ContainerSpec, diagnostics: &str) -> Behavior {
    Behavior::exit(
        &format!("{}\n{}\n", diagnostics, compile_marker(spec)),
        COMPILE_FAILED_EXIT,
    )
}

pub fn test_config(workspace_root: &Path) -> Config {
    let mut config = Config::default();
    config.workspace_root = workspace_root.to_path_buf();
    config.timeout = Duration::from_millis(300);
    config
}

/// Number of entries left under the workspace root.
pub fn leftover_workspaces(root: &Path) -> usize {
    match std::fs::read_dir(root) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
