//! Recording fakes for the harness seams.
//!
//! Every fake is a cheap handle over shared state: hand one clone to the
//! `RunContext` and keep another to script responses and inspect calls.

use crate::build::{BuildSystem, BuildVars, Layer};
use crate::config::HarnessConfig;
use crate::emulator::{EmulatorHost, EmulatorSession, LaunchRequest, VmProcess};
use crate::error::{HarnessError, Result};
use crate::orchestrator::RunContext;
use crate::remote::RemoteChannel;
use crate::runner::{CommandOutput, CommandRunner, ShellCommand};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code,
    }
}

// --- local commands ---

#[derive(Default)]
struct RunnerState {
    responses: HashMap<String, VecDeque<CommandOutput>>,
    calls: Vec<ShellCommand>,
}

/// `CommandRunner` answering exact command lines from a script. Unscripted
/// lines succeed with no output.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Rc<RefCell<RunnerState>>,
}

impl ScriptedRunner {
    pub fn respond(&self, line: &str, out: CommandOutput) {
        self.state
            .borrow_mut()
            .responses
            .entry(line.to_string())
            .or_default()
            .push_back(out);
    }

    pub fn calls(&self) -> Vec<ShellCommand> {
        self.state.borrow().calls.clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.state.borrow().calls.iter().map(|c| c.line.clone()).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, cmd: &ShellCommand) -> Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        state.calls.push(cmd.clone());
        let out = next_reply(state.responses.get_mut(&cmd.line)).unwrap_or_default();
        if !out.success() && !cmd.ignore_status {
            return Err(HarnessError::CommandExecution {
                command: cmd.line.clone(),
                status: out.exit_code,
                output: out.transcript(),
            });
        }
        Ok(out)
    }
}

/// Pop scripted replies in order, repeating the last one forever.
fn next_reply<T: Clone>(queue: Option<&mut VecDeque<T>>) -> Option<T> {
    let queue = queue?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

// --- build system ---

#[derive(Default)]
struct BuildState {
    builds: Vec<Vec<String>>,
    cleans: Vec<Vec<String>>,
    layers: Vec<Layer>,
    added: Vec<PathBuf>,
    removed: Vec<PathBuf>,
    config: Vec<String>,
    vars: BTreeMap<String, String>,
    recipe_vars: BTreeMap<(String, String), String>,
    failing_target: Option<String>,
    fail_remove_layer: bool,
}

#[derive(Clone, Default)]
pub struct FakeBuild {
    state: Rc<RefCell<BuildState>>,
}

impl FakeBuild {
    pub fn set_layers(&self, layers: Vec<Layer>) {
        self.state.borrow_mut().layers = layers;
    }

    /// Lines already in the include file before the run.
    pub fn set_config(&self, lines: Vec<String>) {
        self.state.borrow_mut().config = lines;
    }

    pub fn set_var(&self, name: &str, value: &str) {
        self.state
            .borrow_mut()
            .vars
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_recipe_var(&self, recipe: &str, name: &str, value: &str) {
        self.state
            .borrow_mut()
            .recipe_vars
            .insert((recipe.to_string(), name.to_string()), value.to_string());
    }

    pub fn fail_build(&self, target: &str) {
        self.state.borrow_mut().failing_target = Some(target.to_string());
    }

    pub fn fail_remove_layer(&self) {
        self.state.borrow_mut().fail_remove_layer = true;
    }

    pub fn builds(&self) -> Vec<Vec<String>> {
        self.state.borrow().builds.clone()
    }

    pub fn cleans(&self) -> Vec<Vec<String>> {
        self.state.borrow().cleans.clone()
    }

    pub fn added(&self) -> Vec<PathBuf> {
        self.state.borrow().added.clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.state.borrow().removed.clone()
    }

    pub fn config(&self) -> Vec<String> {
        self.state.borrow().config.clone()
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl BuildSystem for FakeBuild {
    fn build(&mut self, targets: &[&str]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.builds.push(owned(targets));
        if let Some(failing) = &state.failing_target {
            if targets.contains(&failing.as_str()) {
                return Err(HarnessError::Build {
                    target: targets.join(" "),
                    output: format!("ERROR: {} do_compile failed", failing),
                });
            }
        }
        Ok(())
    }

    fn clean_all(&mut self, recipes: &[&str]) -> Result<()> {
        self.state.borrow_mut().cleans.push(owned(recipes));
        Ok(())
    }

    fn get_vars(&mut self, names: &[&str], recipe: Option<&str>) -> Result<BuildVars> {
        let state = self.state.borrow();
        let mut vars = BuildVars::default();
        for name in names {
            let scoped = recipe.and_then(|r| {
                state
                    .recipe_vars
                    .get(&(r.to_string(), name.to_string()))
            });
            if let Some(value) = scoped.or_else(|| state.vars.get(*name)) {
                vars.insert(*name, value.clone());
            }
        }
        Ok(vars)
    }

    fn list_layers(&mut self) -> Result<Vec<Layer>> {
        Ok(self.state.borrow().layers.clone())
    }

    fn add_layer(&mut self, path: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.added.push(path.to_path_buf());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        state.layers.push(Layer {
            name,
            path: path.to_path_buf(),
            priority: None,
        });
        Ok(())
    }

    fn remove_layer(&mut self, path: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_remove_layer {
            return Err(HarnessError::CommandExecution {
                command: format!("bitbake-layers remove-layer {}", path.display()),
                status: 1,
                output: "ERROR: layer not found".to_string(),
            });
        }
        state.removed.push(path.to_path_buf());
        state.layers.retain(|l| l.path != path);
        Ok(())
    }

    fn append_config(&mut self, line: &str) -> Result<()> {
        self.state.borrow_mut().config.push(line.to_string());
        Ok(())
    }

    fn config_mark(&self) -> usize {
        self.state.borrow().config.len()
    }

    fn truncate_config(&mut self, mark: usize) -> Result<()> {
        self.state.borrow_mut().config.truncate(mark);
        Ok(())
    }
}

// --- emulator ---

#[derive(Default)]
struct ProcessState {
    terminations: usize,
    stopped: bool,
    fail: bool,
}

#[derive(Clone, Default)]
pub struct FakeProcess {
    state: Rc<RefCell<ProcessState>>,
}

impl FakeProcess {
    /// A process whose termination reports an error.
    pub fn failing() -> Self {
        let process = Self::default();
        process.state.borrow_mut().fail = true;
        process
    }

    pub fn terminations(&self) -> usize {
        self.state.borrow().terminations
    }
}

impl VmProcess for FakeProcess {
    fn terminate(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.terminations += 1;
        state.stopped = true;
        if state.fail {
            return Err(HarnessError::Emulator("kill failed".to_string()));
        }
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        !self.state.borrow().stopped
    }
}

struct HostState {
    requests: Vec<LaunchRequest>,
    processes: Vec<FakeProcess>,
    next_port: u16,
    fixed_port: Option<u16>,
    fail_terminate: bool,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            processes: Vec::new(),
            next_port: 40000,
            fixed_port: None,
            fail_terminate: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeHost {
    state: Rc<RefCell<HostState>>,
}

impl FakeHost {
    /// Hand out `port` for every launch.
    pub fn fix_port(&self, port: u16) {
        self.state.borrow_mut().fixed_port = Some(port);
    }

    pub fn fail_terminate(&self) {
        self.state.borrow_mut().fail_terminate = true;
    }

    pub fn launches(&self) -> usize {
        self.state.borrow().requests.len()
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn terminations(&self) -> usize {
        self.state
            .borrow()
            .processes
            .iter()
            .map(FakeProcess::terminations)
            .sum()
    }
}

impl EmulatorHost for FakeHost {
    fn launch(&mut self, request: &LaunchRequest) -> Result<EmulatorSession> {
        let mut state = self.state.borrow_mut();
        state.requests.push(request.clone());
        let port = match state.fixed_port {
            Some(port) => port,
            None => {
                state.next_port += 1;
                state.next_port
            }
        };
        let process = if state.fail_terminate {
            FakeProcess::failing()
        } else {
            FakeProcess::default()
        };
        state.processes.push(process.clone());
        Ok(EmulatorSession::new(request, port, Box::new(process)))
    }
}

// --- remote ---

#[derive(Debug, Clone)]
pub enum Reply {
    Output(CommandOutput),
    /// ssh could not reach the device.
    Unreachable,
}

#[derive(Default)]
struct ChannelState {
    replies: HashMap<String, VecDeque<Reply>>,
    calls: Vec<(u16, String)>,
}

/// `RemoteChannel` answering exact commands from a script. Unscripted
/// commands succeed with no output.
#[derive(Clone, Default)]
pub struct ScriptedChannel {
    state: Rc<RefCell<ChannelState>>,
}

impl ScriptedChannel {
    pub fn respond(&self, command: &str, out: CommandOutput) {
        self.script(command, vec![Reply::Output(out)]);
    }

    /// Queue replies for `command`; the last one repeats.
    pub fn script(&self, command: &str, replies: Vec<Reply>) {
        self.state
            .borrow_mut()
            .replies
            .entry(command.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|(_, c)| c == command)
            .count()
    }
}

impl RemoteChannel for ScriptedChannel {
    fn send(&self, port: u16, command: &str) -> Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        state.calls.push((port, command.to_string()));
        match next_reply(state.replies.get_mut(command)) {
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Unreachable) => Err(HarnessError::Connection {
                port,
                detail: "Connection refused".to_string(),
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

// --- wiring ---

/// One of each fake plus a recording sleeper.
pub struct Fakes {
    pub config: HarnessConfig,
    pub build: FakeBuild,
    pub host: FakeHost,
    pub remote: ScriptedChannel,
    pub local: ScriptedRunner,
    sleeps: Rc<RefCell<Vec<Duration>>>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            config: HarnessConfig::default(),
            build: FakeBuild::default(),
            host: FakeHost::default(),
            remote: ScriptedChannel::default(),
            local: ScriptedRunner::default(),
            sleeps: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn context(&self) -> RunContext {
        let sleeps = self.sleeps.clone();
        RunContext::new(
            self.config.clone(),
            Box::new(self.build.clone()),
            Box::new(self.host.clone()),
            Box::new(self.remote.clone()),
            Box::new(self.local.clone()),
        )
        .with_sleeper(Rc::new(move |d: Duration| sleeps.borrow_mut().push(d)))
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}
