//! Helper functions for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use homelab_monitoring::actors::CollectorContext;
use homelab_monitoring::batch::cmd_marker;
use homelab_monitoring::config::{DiscoveryConfig, SchedulerConfig};
use homelab_monitoring::discovery::DiscoverySync;
use homelab_monitoring::executor::{ExecError, ExecOutput, RemoteExecutor, SshTarget};
use homelab_monitoring::node::{GuestRecord, GuestStatus, GuestType, NewNode, Node};
use homelab_monitoring::storage::{MemoryBackend, StorageBackend};

/// Scripted reply of the mock executor
#[derive(Debug, Clone)]
pub enum Reply {
    Output(String),
    Timeout,
    Refused,
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    needle: String,
    reply: Reply,
}

/// Remote executor answering from a list of rules
///
/// The most recently added rule whose needle occurs in the command (and
/// whose host matches, if set) wins. Commands without a rule are refused.
#[derive(Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    commands: Mutex<Vec<(String, String)>>,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, needle: &str, reply: Reply) {
        self.rules.lock().unwrap().push(Rule {
            host: None,
            needle: needle.to_string(),
            reply,
        });
    }

    pub fn on_host(&self, host: &str, needle: &str, reply: Reply) {
        self.rules.lock().unwrap().push(Rule {
            host: Some(host.to_string()),
            needle: needle.to_string(),
            reply,
        });
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `(host, command)` of every call so far
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    fn reply_for(&self, target: &SshTarget, command: &str) -> Option<Reply> {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| {
                command.contains(&r.needle) && r.host.as_ref().is_none_or(|h| *h == target.host)
            })
            .map(|r| r.reply.clone())
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.commands
            .lock()
            .unwrap()
            .push((target.host.clone(), command.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.reply_for(target, command) {
            Some(Reply::Output(stdout)) => Ok(ExecOutput::ok(stdout)),
            Some(Reply::Timeout) => Err(ExecError::Timeout(timeout)),
            Some(Reply::Refused) | None => {
                Err(ExecError::Connection("connection refused".to_string()))
            }
        }
    }
}

/// Scheduler settings with timers far enough out not to interfere
pub fn quiet_settings() -> SchedulerConfig {
    SchedulerConfig {
        child_first_poll_ms: 600_000,
        child_poll_interval_secs: 600,
        breaker_open_timeout_secs: 1,
        ..SchedulerConfig::default()
    }
}

pub fn context(
    storage: &Arc<MemoryBackend>,
    executor: &Arc<MockExecutor>,
    settings: SchedulerConfig,
) -> CollectorContext {
    CollectorContext::new(storage.clone(), executor.clone(), settings)
}

pub fn discovery(storage: &Arc<MemoryBackend>, executor: &Arc<MockExecutor>) -> DiscoverySync {
    DiscoverySync::new(storage.clone(), executor.clone(), DiscoveryConfig::default())
}

pub async fn create_standalone(storage: &MemoryBackend, name: &str, host: &str) -> Node {
    storage
        .upsert_node(NewNode::standalone(name, host))
        .await
        .unwrap()
}

/// Proxmox host with discovery switched on, already known as a hypervisor
pub async fn create_proxmox_host(storage: &MemoryBackend, name: &str, host: &str) -> Node {
    let mut new = NewNode::standalone(name, host);
    new.auto_discovery = true;
    new.capabilities.insert("proxmox", true);
    let node = storage.upsert_node(new).await.unwrap();
    storage.set_hypervisor(node.id, true).await.unwrap();
    node
}

pub async fn create_guest(
    storage: &MemoryBackend,
    host: &Node,
    vmid: u32,
    guest_type: GuestType,
    online: bool,
) -> Node {
    let name = format!("{guest_type}-{vmid}");
    let child = storage
        .create_child_node(NewNode::child_of(host, name, vmid, guest_type))
        .await
        .unwrap();
    storage.set_online(child.id, online, None).await.unwrap();
    storage.get_node(child.id).await.unwrap().unwrap()
}

/// Tier-1 batch output as a healthy host prints it
pub fn live_output(load: f64) -> String {
    format!(
        "{}\n 12:00:00 up 2 days,  3:00,  1 user,  load average: {load:.2}, 0.50, 0.25\n\
         {}\n               total        used        free      shared  buff/cache   available\n\
         Mem:      8000000000  2000000000  1000000000           0  5000000000  6000000000\n\
         Swap:     1000000000           0  1000000000\n\
         {}\n4\n",
        cmd_marker("system.uptime"),
        cmd_marker("system.memory"),
        cmd_marker("system.nproc"),
    )
}

/// Tier-2 batch output
pub fn status_output(disk_percent: u64, temp: f64) -> String {
    let total = 100_000_000_000u64;
    let used = total / 100 * disk_percent;
    format!(
        "{}\n/dev/sda1 {total} {used} {} {disk_percent}% /\n\
         {}\ncoretemp-isa-0000\nPackage id 0:\n  temp1_input: {temp:.3}\n\
         {}\nInter-|   Receive\n face |bytes\n    lo: 500 0 0 0 0 0 0 0 500 0 0 0 0 0 0 0\n  eth0: 1000 0 0 0 0 0 0 0 2000 0 0 0 0 0 0 0\n",
        cmd_marker("storage.df"),
        total - used,
        cmd_marker("sensors.thermal"),
        cmd_marker("network.interfaces"),
    )
}

/// Output of the global tick's host collection
pub fn host_output(guests: &[(u32, &str, &str)]) -> String {
    let mut out = String::from(
        "===STATS===\n 12:00:00 up 1 day,  1:00,  1 user,  load average: 1.00, 0.50, 0.25\n\
         ===MEM===\nMem: 1000 500 500 0 0 500\n\
         ===NPROC===\n2\n\
         ===DISK===\n/dev/sda1 1000 100 900 10% /\n",
    );

    if guests.is_empty() {
        out.push_str("===PVE===\n===QM===\n===PCT===\n");
        return out;
    }

    out.push_str("===PVE===\npve-manager/8.2.2/9355359cd7afbae4\n===QM===\n");
    out.push_str("      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID\n");
    for (vmid, name, status) in guests {
        out.push_str(&format!("       {vmid} {name} {status} 2048 32.00 0\n"));
    }
    out.push_str("===PCT===\nVMID       Status     Lock         Name\n");
    out
}

pub fn guest(vmid: u32, name: &str, status: GuestStatus, guest_type: GuestType) -> GuestRecord {
    GuestRecord {
        vmid,
        name: Some(name.to_string()),
        status,
        guest_type,
    }
}
