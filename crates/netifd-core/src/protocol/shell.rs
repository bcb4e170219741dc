//! The `shell` protocol handler: runs an external script to drive
//! setup/teardown, serialising the two so they never overlap.
//!
//! Setup and teardown each run as a child process (`<script> <proto>
//! setup|teardown <ifname> <json-config> [<main-ifname>]`). A teardown
//! requested while setup is still running doesn't run concurrently with
//! it: the setup task is signalled (SIGTERM now, SIGKILL after a
//! 1-second grace) and the teardown task is deferred until it exits.
//! State that the spawned tasks need to reach back into is kept in an
//! `Arc<Mutex<_>>` shared between the synchronous [`ProtocolHandler`]
//! methods and the `tokio::spawn`ed task bodies — the handler itself
//! isn't on the event loop's task, so this is the seam where the
//! otherwise-synchronous core touches real asynchrony.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{LinkUpdate, Notify, ProtoCommand, ProtoEvent, ProtoEventSender, ProtocolFactory, ProtocolHandler};
use crate::error::Result;
use netifd_common::{send_signal, spawn_tracked, terminate};

/// How long a setup task gets between SIGTERM and SIGKILL when a
/// teardown interrupts it.
const KILL_GRACE: Duration = Duration::from_secs(1);

struct Shared {
    proto: String,
    script: PathBuf,
    iface: String,
    config: Value,
    main_ifname: Option<String>,
    events: ProtoEventSender,
    setup_cancel: Option<CancellationToken>,
    setup_running: bool,
    teardown_pending: bool,
    last_setup_exit: Option<i32>,
    /// Pid of the long-lived helper process started via a `run helper
    /// command` notify with `keep` set, if one is currently running.
    proto_task_pid: Option<u32>,
    /// Whether the teardown's DOWN event should be deferred to the
    /// proto task's exit instead of firing as soon as the teardown
    /// script itself completes.
    teardown_wait_task: bool,
    /// Set once teardown has run and is waiting on the proto task;
    /// the proto task's completion handler fires DOWN when it sees this.
    teardown_waiting: bool,
}

impl Shared {
    fn new(proto: String, script: PathBuf, iface: String, config: Value, main_ifname: Option<String>, events: ProtoEventSender) -> Self {
        Self {
            proto,
            script,
            iface,
            config,
            main_ifname,
            events,
            setup_cancel: None,
            setup_running: false,
            teardown_pending: false,
            last_setup_exit: None,
            proto_task_pid: None,
            teardown_wait_task: false,
            teardown_waiting: false,
        }
    }
}

/// A running `shell` protocol instance.
pub struct ShellProtocol {
    shared: Arc<Mutex<Shared>>,
}

impl ProtocolHandler for ShellProtocol {
    fn handle(&mut self, cmd: ProtoCommand) {
        match cmd {
            ProtoCommand::Setup => spawn_setup(self.shared.clone()),
            ProtoCommand::Teardown { force } => request_teardown(self.shared.clone(), force),
        }
    }

    fn notify(&mut self, message: Notify) {
        match message {
            Notify::UpdateLink(update) if !update.link_up => {
                let shared = self.shared.lock().expect("lock poisoned");
                let _ = shared.events.send((shared.iface.clone(), ProtoEvent::LinkLost));
            }
            Notify::UpdateLink(update) => {
                let shared = self.shared.lock().expect("lock poisoned");
                let _ = shared.events.send((shared.iface.clone(), ProtoEvent::Up(Box::new(update))));
            }
            Notify::RunCommand { command, keep } => spawn_proto_task(self.shared.clone(), command, keep),
            Notify::SignalCommand { signal } => {
                let pid = self.shared.lock().expect("lock poisoned").proto_task_pid;
                if let Some(pid) = pid
                    && let Err(err) = send_signal(pid, signal)
                {
                    tracing::warn!(pid, signal, error = %err, "failed to signal proto task");
                }
            }
        }
    }
}

/// Spawns the long-lived helper process named by a `run helper command`
/// notify. If `keep` is set it's tracked as *the* proto task: a teardown
/// that arrives while it's still running defers its DOWN event until
/// this process exits instead of firing as soon as the teardown script
/// completes.
fn spawn_proto_task(shared: Arc<Mutex<Shared>>, command: Vec<String>, keep: bool) {
    let Some((program, args)) = command.split_first() else {
        return;
    };
    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::null()).stderr(Stdio::null());

    match spawn_tracked(cmd) {
        Ok(mut child) => {
            let pid = child.id();
            {
                let mut guard = shared.lock().expect("lock poisoned");
                if keep {
                    guard.proto_task_pid = pid;
                    guard.teardown_wait_task = true;
                }
            }
            tokio::spawn(async move {
                let _ = child.wait().await;
                let iface = {
                    let mut guard = shared.lock().expect("lock poisoned");
                    if guard.proto_task_pid == pid {
                        guard.proto_task_pid = None;
                    }
                    let waiting = std::mem::take(&mut guard.teardown_waiting);
                    waiting.then(|| guard.iface.clone())
                };
                if let Some(iface) = iface {
                    let guard = shared.lock().expect("lock poisoned");
                    let _ = guard.events.send((iface, ProtoEvent::Down));
                }
            });
        }
        Err(err) => {
            let iface = shared.lock().expect("lock poisoned").iface.clone();
            tracing::warn!(iface, error = %err, "failed to spawn proto task");
        }
    }
}

fn spawn_setup(shared: Arc<Mutex<Shared>>) {
    let (proto, script, iface, config, main_ifname) = {
        let mut guard = shared.lock().expect("lock poisoned");
        if guard.setup_running {
            return;
        }
        guard.setup_running = true;
        guard.teardown_pending = false;
        let token = CancellationToken::new();
        guard.setup_cancel = Some(token);
        (guard.proto.clone(), guard.script.clone(), guard.iface.clone(), guard.config.clone(), guard.main_ifname.clone())
    };

    tokio::spawn(async move {
        let mut command = Command::new(&script);
        command
            .arg(&proto)
            .arg("setup")
            .arg(&iface)
            .arg(config.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(main) = &main_ifname {
            command.arg(main);
        }

        let exit_code = match spawn_tracked(command) {
            Ok(child) => run_cancellable(child, shared.clone()).await,
            Err(err) => {
                tracing::warn!(iface, error = %err, "failed to spawn setup task");
                None
            }
        };

        let teardown_pending = {
            let mut guard = shared.lock().expect("lock poisoned");
            guard.setup_running = false;
            guard.setup_cancel = None;
            guard.last_setup_exit = exit_code;
            guard.teardown_pending
        };
        if teardown_pending {
            spawn_teardown(shared, false);
        }
    });
}

async fn run_cancellable(mut child: tokio::process::Child, shared: Arc<Mutex<Shared>>) -> Option<i32> {
    let token = shared.lock().expect("lock poisoned").setup_cancel.clone()?;
    tokio::select! {
        status = child.wait() => status.ok().and_then(|s| s.code()),
        () = token.cancelled() => {
            let _ = terminate(&mut child, KILL_GRACE).await;
            None
        }
    }
}

fn request_teardown(shared: Arc<Mutex<Shared>>, force: bool) {
    let (setup_running, cancel) = {
        let mut guard = shared.lock().expect("lock poisoned");
        if guard.setup_running {
            guard.teardown_pending = true;
            (true, guard.setup_cancel.clone())
        } else {
            (false, None)
        }
    };
    if setup_running {
        // SIGTERM now, SIGKILL after the grace period;
        // `run_cancellable` performs the actual signalling once it
        // observes the token.
        if let Some(token) = cancel {
            token.cancel();
        }
        if force {
            // A forced teardown still can't outrun the escalation
            // timeline safely (the process may hold kernel state), but
            // it does skip waiting further once the task exits.
        }
        return;
    }
    spawn_teardown(shared, force);
}

fn spawn_teardown(shared: Arc<Mutex<Shared>>, _force: bool) {
    let (proto, script, iface, config, main_ifname, last_exit) = {
        let guard = shared.lock().expect("lock poisoned");
        (
            guard.proto.clone(),
            guard.script.clone(),
            guard.iface.clone(),
            guard.config.clone(),
            guard.main_ifname.clone(),
            guard.last_setup_exit,
        )
    };

    tokio::spawn(async move {
        let mut command = Command::new(&script);
        command
            .arg(&proto)
            .arg("teardown")
            .arg(&iface)
            .arg(config.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(main) = &main_ifname {
            command.arg(main);
        }
        if let Some(code) = last_exit {
            command.env("ERROR", code.to_string());
        }

        match spawn_tracked(command) {
            Ok(mut child) => {
                let _ = child.wait().await;
            }
            Err(err) => tracing::warn!(iface, error = %err, "failed to spawn teardown task"),
        }

        let mut guard = shared.lock().expect("lock poisoned");
        if guard.teardown_wait_task && guard.proto_task_pid.is_some() {
            // The proto task (e.g. a still-running dhcp client) outlives
            // the teardown script; its own exit fires DOWN instead.
            guard.teardown_waiting = true;
            return;
        }
        let _ = guard.events.send((guard.iface.clone(), ProtoEvent::Down));
    });
}

/// Builds the factory the [`super::ProtocolHandlerRegistry`] registers
/// this handler under. `script_dir` is the working directory containing
/// protocol scripts.
pub fn factory(script_dir: PathBuf) -> ProtocolFactory {
    Box::new(move |iface, config, events| -> Result<Box<dyn ProtocolHandler>> {
        let proto = config
            .get("__proto")
            .and_then(Value::as_str)
            .unwrap_or("shell")
            .to_string();
        let script = script_dir.join(format!("{proto}.sh"));
        let main_ifname = config.get("__main_ifname").and_then(Value::as_str).map(str::to_string);

        Ok(Box::new(ShellProtocol {
            shared: Arc::new(Mutex::new(Shared::new(proto, script, iface.to_string(), config, main_ifname, events))),
        }))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    fn script_path(body: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "#!/bin/sh\n{body}").expect("write script");
        let mut perms = file.as_file().metadata().expect("metadata").permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o755);
        }
        file.as_file().set_permissions(perms).expect("chmod");
        file
    }

    #[tokio::test]
    async fn teardown_during_setup_runs_exactly_once_after_setup_exits() {
        let script = script_path(
            r#"
if [ "$2" = "setup" ]; then
  trap 'exit 0' TERM
  sleep 5
else
  log=$(printf '%s' "$4" | sed -n 's/.*"log":"\([^"]*\)".*/\1/p')
  echo teardown-ran >> "$log"
fi
"#,
        );
        let log = tempfile::NamedTempFile::new().expect("log file");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handler = ShellProtocol {
            shared: Arc::new(Mutex::new(Shared::new(
                "test".into(),
                script.path().to_path_buf(),
                "wan".into(),
                serde_json::json!({ "log": log.path().to_string_lossy() }),
                None,
                tx,
            ))),
        };

        handler.handle(ProtoCommand::Setup);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handler.handle(ProtoCommand::Teardown { force: false });

        let (_iface, event) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for Down")
            .expect("channel closed");
        assert!(matches!(event, ProtoEvent::Down));

        let contents = std::fs::read_to_string(log.path()).unwrap_or_default();
        assert_eq!(contents.matches("teardown-ran").count(), 1);
    }

    #[tokio::test]
    async fn down_is_deferred_to_the_kept_proto_task_exiting() {
        let script = script_path("true");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handler = ShellProtocol {
            shared: Arc::new(Mutex::new(Shared::new(
                "test".into(),
                script.path().to_path_buf(),
                "wan".into(),
                serde_json::json!({}),
                None,
                tx,
            ))),
        };

        handler.notify(Notify::RunCommand { command: vec!["sleep".into(), "0.2".into()], keep: true });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.handle(ProtoCommand::Teardown { force: false });

        // The teardown script exits immediately, but DOWN must wait for
        // the kept proto task (~200ms) rather than firing right away.
        let before = tokio::time::Instant::now();
        let (_iface, event) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for Down")
            .expect("channel closed");
        assert!(matches!(event, ProtoEvent::Down));
        assert!(before.elapsed() >= Duration::from_millis(150), "DOWN fired before the proto task exited");
    }
}
