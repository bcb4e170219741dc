//! Hotplug event queue: serialises invocations of the external `network`
//! hotplug script so at most one runs at a time, with per-interface
//! up/down coalescing.
//!
//! An interface can have at most one event queued and one running.
//! Queueing the event already in effect — either the one currently
//! running, or the one already queued — cancels the redundant entry
//! rather than piling up a second run; queueing the opposite event
//! re-arms it.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;

use netifd_common::spawn_tracked;

/// Whether an interface's hotplug script should be told it came up or
/// down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotplugEvent {
    /// The interface reached UP.
    Up,
    /// The interface reached DOWN.
    Down,
}

/// Runs one hotplug invocation. Implemented by [`ProcessHotplugRunner`]
/// for real use and [`RecordingHotplugRunner`] for tests.
#[async_trait]
pub trait HotplugRunner: Send + Sync {
    /// Runs the hotplug command for `iface`/`event` to completion,
    /// returning its exit code (or a negative value on spawn failure).
    async fn run(&self, iface: &str, event: HotplugEvent) -> i32;
}

/// Runs the configured hotplug command as `<command> network` with
/// `ACTION=ifup|ifdown` and `INTERFACE=<name>` in its environment.
pub struct ProcessHotplugRunner {
    command: PathBuf,
}

impl ProcessHotplugRunner {
    /// Builds a runner that invokes `command`.
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

#[async_trait]
impl HotplugRunner for ProcessHotplugRunner {
    async fn run(&self, iface: &str, event: HotplugEvent) -> i32 {
        let action = match event {
            HotplugEvent::Up => "ifup",
            HotplugEvent::Down => "ifdown",
        };
        let mut command = Command::new(&self.command);
        command
            .arg("network")
            .env("ACTION", action)
            .env("INTERFACE", iface)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match spawn_tracked(command) {
            Ok(mut child) => child.wait().await.ok().and_then(|status| status.code()).unwrap_or(-1),
            Err(err) => {
                tracing::warn!(iface, error = %err, "failed to spawn hotplug command");
                -1
            }
        }
    }
}

/// Records every invocation instead of spawning a process, for tests.
#[derive(Default)]
pub struct RecordingHotplugRunner {
    /// Every `(iface, event)` pair this runner was asked to run, in
    /// the order it ran them.
    pub calls: Mutex<Vec<(String, HotplugEvent)>>,
}

#[async_trait]
impl HotplugRunner for RecordingHotplugRunner {
    async fn run(&self, iface: &str, event: HotplugEvent) -> i32 {
        self.calls.lock().expect("lock poisoned").push((iface.to_string(), event));
        0
    }
}

struct Shared {
    pending: VecDeque<String>,
    pending_ev: HashMap<String, HotplugEvent>,
    current: Option<String>,
    current_ev: Option<HotplugEvent>,
    runner: Arc<dyn HotplugRunner>,
}

/// The hotplug event queue. One instance is shared by the whole daemon;
/// cloning shares the same underlying state.
#[derive(Clone)]
pub struct HotplugQueue {
    shared: Arc<Mutex<Shared>>,
}

impl HotplugQueue {
    /// Builds an empty queue driven by `runner`.
    pub fn new(runner: Arc<dyn HotplugRunner>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                pending: VecDeque::new(),
                pending_ev: HashMap::new(),
                current: None,
                current_ev: None,
                runner,
            })),
        }
    }

    /// Queues `event` for `iface`, starting the queue if it was idle.
    pub fn queue_event(&self, iface: &str, event: HotplugEvent) {
        let mut guard = self.shared.lock().expect("lock poisoned");
        let last_ev = if guard.current.as_deref() == Some(iface) {
            guard.current_ev
        } else {
            guard.pending_ev.get(iface).copied()
        };

        guard.pending_ev.insert(iface.to_string(), event);
        let queued = guard.pending.iter().any(|name| name == iface);
        if last_ev == Some(event) && queued {
            guard.pending.retain(|name| name != iface);
        } else if last_ev != Some(event) && !queued {
            guard.pending.push_back(iface.to_string());
        }

        let idle = guard.current.is_none();
        drop(guard);
        if idle {
            Self::drive(self.shared.clone());
        }
    }

    /// Removes `iface` from the queue. If it's the entry currently
    /// running, its eventual completion is ignored.
    pub fn dequeue_event(&self, iface: &str) {
        let mut guard = self.shared.lock().expect("lock poisoned");
        if guard.current.as_deref() == Some(iface) {
            guard.current = None;
        }
        guard.pending.retain(|name| name != iface);
    }

    /// Whether an invocation is currently running.
    pub fn is_running(&self) -> bool {
        self.shared.lock().expect("lock poisoned").current.is_some()
    }

    fn drive(shared: Arc<Mutex<Shared>>) {
        let Some((name, event, runner)) = ({
            let mut guard = shared.lock().expect("lock poisoned");
            if guard.current.is_some() {
                None
            } else {
                guard.pending.pop_front().map(|name| {
                    let event = guard.pending_ev.remove(&name).unwrap_or(HotplugEvent::Down);
                    guard.current = Some(name.clone());
                    guard.current_ev = Some(event);
                    (name, event, guard.runner.clone())
                })
            }
        }) else {
            return;
        };

        tokio::spawn(async move {
            let code = runner.run(&name, event).await;
            if code != 0 {
                tracing::warn!(iface = %name, code, "hotplug command exited non-zero");
            }
            let mut guard = shared.lock().expect("lock poisoned");
            if guard.current.as_deref() == Some(name.as_str()) {
                guard.current = None;
                guard.current_ev = None;
            }
            drop(guard);
            Self::drive(shared.clone());
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn wait_for(queue: &HotplugQueue, runner: &RecordingHotplugRunner, count: usize) {
        for _ in 0..50 {
            if runner.calls.lock().expect("lock poisoned").len() >= count && !queue.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} hotplug calls");
    }

    #[tokio::test]
    async fn queues_run_one_at_a_time_in_order() {
        let runner = Arc::new(RecordingHotplugRunner::default());
        let queue = HotplugQueue::new(runner.clone());

        queue.queue_event("lan", HotplugEvent::Up);
        queue.queue_event("wan", HotplugEvent::Up);
        wait_for(&queue, &runner, 2).await;

        let calls = runner.calls.lock().expect("lock poisoned");
        assert_eq!(*calls, vec![("lan".into(), HotplugEvent::Up), ("wan".into(), HotplugEvent::Up)]);
    }

    #[tokio::test]
    async fn requeueing_the_same_event_while_still_queued_cancels_it() {
        let runner = Arc::new(RecordingHotplugRunner::default());
        let queue = HotplugQueue::new(runner.clone());

        // "lan" up starts running immediately; "wan" up queues behind it,
        // then gets queued again with the same event before it runs —
        // the second request already matches what's pending, so it
        // drops "wan" out of the queue instead of running it twice.
        queue.queue_event("lan", HotplugEvent::Up);
        queue.queue_event("wan", HotplugEvent::Up);
        queue.queue_event("wan", HotplugEvent::Up);
        wait_for(&queue, &runner, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = runner.calls.lock().expect("lock poisoned");
        assert!(calls.iter().all(|(name, _)| name != "wan"));
    }

    #[tokio::test]
    async fn flipping_back_before_it_runs_cancels_the_run() {
        let runner = Arc::new(RecordingHotplugRunner::default());
        let queue = HotplugQueue::new(runner.clone());

        queue.queue_event("lan", HotplugEvent::Up);
        queue.queue_event("wan", HotplugEvent::Down);
        queue.queue_event("wan", HotplugEvent::Up);
        queue.queue_event("wan", HotplugEvent::Down);
        wait_for(&queue, &runner, 2).await;

        let calls = runner.calls.lock().expect("lock poisoned");
        let wan_calls: Vec<_> = calls.iter().filter(|(name, _)| name == "wan").collect();
        assert_eq!(wan_calls, vec![&("wan".to_string(), HotplugEvent::Down)]);
    }

    #[tokio::test]
    async fn dequeue_removes_a_not_yet_run_entry() {
        let runner = Arc::new(RecordingHotplugRunner::default());
        let queue = HotplugQueue::new(runner.clone());

        queue.queue_event("lan", HotplugEvent::Up);
        queue.queue_event("wan", HotplugEvent::Up);
        queue.dequeue_event("wan");
        wait_for(&queue, &runner, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = runner.calls.lock().expect("lock poisoned");
        assert!(calls.iter().all(|(name, _)| name != "wan"));
    }
}
