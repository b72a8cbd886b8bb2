//! In-memory fakes for the worker manager's OS and transport seams.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use molview_worker::config::WorkerConfig;
use molview_worker::runtime::{LaunchSpec, WorkerRuntime};
use molview_worker::transport::{
    CommandOutput, CommandTransport, TransportError, EXIT_COMMAND, NOOP_COMMAND,
};
use molview_worker::WorkerProcessManager;

/// Fast timings so failure paths finish quickly.
pub fn test_config(base_port: u16, max_instances: usize) -> WorkerConfig {
    WorkerConfig {
        base_port,
        max_instances,
        startup_poll_attempts: 5,
        startup_poll_interval: Duration::from_millis(10),
        probe_timeout: Duration::from_millis(50),
        command_timeout: Duration::from_secs(5),
        terminate_grace: Duration::from_millis(50),
        ..WorkerConfig::default()
    }
}

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub transport: Arc<FakeTransport>,
    pub manager: Arc<WorkerProcessManager>,
}

pub fn harness(config: WorkerConfig) -> Harness {
    let runtime = Arc::new(FakeRuntime::default());
    let transport = Arc::new(FakeTransport::new(Arc::clone(&runtime)));
    let manager = WorkerProcessManager::new(
        config,
        Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
        Arc::clone(&transport) as Arc<dyn CommandTransport>,
    );
    Harness {
        runtime,
        transport,
        manager,
    }
}

// ---------------------------------------------------------------------------
// FakeRuntime
// ---------------------------------------------------------------------------

/// Pretend processes: a pid, the port it serves, and whether it runs.
#[derive(Default)]
pub struct FakeRuntime {
    next_pid: AtomicU32,
    processes: Mutex<HashMap<u32, FakeProcess>>,
    /// Launch fails outright.
    pub fail_launch: AtomicBool,
    /// Launched processes exit straight away.
    pub exit_on_launch: AtomicBool,
    /// When set, each launch waits for a permit before returning.
    launch_gate: Mutex<Option<Arc<Semaphore>>>,
}

struct FakeProcess {
    port: u16,
    alive: bool,
}

impl FakeRuntime {
    /// Simulate a crash.
    pub fn crash(&self, pid: u32) {
        if let Some(process) = self.processes.lock().unwrap().get_mut(&pid) {
            process.alive = false;
        }
    }

    pub fn alive_on_port(&self, port: u16) -> bool {
        self.processes
            .lock()
            .unwrap()
            .values()
            .any(|p| p.port == port && p.alive)
    }

    pub fn exit_on_port(&self, port: u16) {
        for process in self.processes.lock().unwrap().values_mut() {
            if process.port == port {
                process.alive = false;
            }
        }
    }

    /// Hold every launch until the returned semaphore gets permits.
    pub fn gate_launches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.launch_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn running_count(&self) -> usize {
        self.processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.alive)
            .count()
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<u32> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"));
        }
        let gate = self.launch_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().unwrap().insert(
            pid,
            FakeProcess {
                port: spec.port,
                alive: !self.exit_on_launch.load(Ordering::SeqCst),
            },
        );
        Ok(pid)
    }

    async fn is_alive(&self, pid: u32) -> bool {
        self.processes
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|p| p.alive)
    }

    async fn kill(&self, pid: u32) -> io::Result<()> {
        self.crash(pid);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

/// Endpoint that answers when a live fake process owns the port.
pub struct FakeTransport {
    runtime: Arc<FakeRuntime>,
    /// Probes always fail, as if the endpoint never started.
    pub never_ready: AtomicBool,
    unreachable: Mutex<HashSet<u16>>,
    /// How long each command takes.
    pub command_delay: Mutex<Duration>,
    in_flight: Mutex<HashMap<u16, usize>>,
    max_in_flight: Mutex<HashMap<u16, usize>>,
    max_global_in_flight: Mutex<(usize, usize)>,
    commands: Mutex<Vec<(u16, String)>>,
}

impl FakeTransport {
    pub fn new(runtime: Arc<FakeRuntime>) -> Self {
        Self {
            runtime,
            never_ready: AtomicBool::new(false),
            unreachable: Mutex::new(HashSet::new()),
            command_delay: Mutex::new(Duration::ZERO),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: Mutex::new(HashMap::new()),
            max_global_in_flight: Mutex::new((0, 0)),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn set_unreachable(&self, port: u16) {
        self.unreachable.lock().unwrap().insert(port);
    }

    pub fn set_command_delay(&self, delay: Duration) {
        *self.command_delay.lock().unwrap() = delay;
    }

    /// Highest number of simultaneous commands seen on `port`.
    pub fn max_in_flight(&self, port: u16) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(&port)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous commands seen across all ports.
    pub fn max_global_in_flight(&self) -> usize {
        self.max_global_in_flight.lock().unwrap().1
    }

    /// Commands received on `port`, excluding startup no-ops.
    pub fn commands_for(&self, port: u16) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, c)| *p == port && c != NOOP_COMMAND)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn reachable(&self, port: u16) -> bool {
        !self.never_ready.load(Ordering::SeqCst)
            && !self.unreachable.lock().unwrap().contains(&port)
            && self.runtime.alive_on_port(port)
    }

    fn enter(&self, port: u16) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(port).or_insert(0);
        *count += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let entry = max.entry(port).or_insert(0);
        *entry = (*entry).max(*count);

        let mut global = self.max_global_in_flight.lock().unwrap();
        global.0 += 1;
        global.1 = global.1.max(global.0);
    }

    fn leave(&self, port: u16) {
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(&port) {
            *count -= 1;
        }
        self.max_global_in_flight.lock().unwrap().0 -= 1;
    }
}

#[async_trait]
impl CommandTransport for FakeTransport {
    async fn probe(&self, port: u16, _timeout: Duration) -> Result<(), TransportError> {
        if self.reachable(port) {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: 503,
                body: "unreachable".to_string(),
            })
        }
    }

    async fn execute(&self, port: u16, command: &str) -> Result<CommandOutput, TransportError> {
        if !self.reachable(port) {
            return Err(TransportError::ChannelClosed);
        }
        self.commands
            .lock()
            .unwrap()
            .push((port, command.to_string()));

        if command == EXIT_COMMAND {
            self.runtime.exit_on_port(port);
            return Ok(CommandOutput::default());
        }

        self.enter(port);
        let delay = *self.command_delay.lock().unwrap();
        if !delay.is_zero() && command != NOOP_COMMAND {
            tokio::time::sleep(delay).await;
        }
        self.leave(port);

        if command.starts_with("fail") {
            return Err(TransportError::Engine(format!("{command}: rejected")));
        }
        Ok(CommandOutput::default())
    }
}
