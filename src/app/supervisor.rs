use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::config::{ArtifactSettings, SupervisorSettings};
use crate::app::error::AppError;
use crate::app::logging::new_trace_id;
use crate::app::models::ViewerMessage;
use crate::app::registry::{hold, process_name, ManagedProcess, ProcessRegistry};
use crate::app::viewer::{send_message, ViewerChannel};
use crate::app::worker::CancelToken;

const EXIT_POLL: Duration = Duration::from_millis(50);
const EXIT_SETTLE: Duration = Duration::from_secs(1);

/// Receiver of parsed performance records.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: &serde_json::Value);
}

/// Forwards records to a live viewer as `perfDetail` messages.
pub struct ViewerMetricsSink {
    channel: Arc<dyn ViewerChannel>,
}

impl ViewerMetricsSink {
    pub fn new(channel: Arc<dyn ViewerChannel>) -> Self {
        Self { channel }
    }
}

impl MetricsSink for ViewerMetricsSink {
    fn record(&self, record: &serde_json::Value) {
        send_message(
            self.channel.as_ref(),
            &ViewerMessage::PerfDetail {
                detail: record.clone(),
            },
        );
    }
}

/// Writes records to the `perf` log target.
pub struct LogMetricsSink {
    pub serial: String,
}

impl MetricsSink for LogMetricsSink {
    fn record(&self, record: &serde_json::Value) {
        info!(target: "perf", serial = %self.serial, record = %record, "perf record");
    }
}

pub struct FanOutSink(pub Vec<Arc<dyn MetricsSink>>);

impl MetricsSink for FanOutSink {
    fn record(&self, record: &serde_json::Value) {
        for sink in &self.0 {
            sink.record(record);
        }
    }
}

/// Host-local auxiliary processes, at most one per logical name.
pub struct ProcessSupervisor {
    processes: Arc<ProcessRegistry>,
    metrics_readers: Mutex<HashMap<String, CancelToken>>,
    grace: Duration,
    supply_binary: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(
        processes: Arc<ProcessRegistry>,
        settings: &SupervisorSettings,
        artifacts: &ArtifactSettings,
    ) -> Self {
        Self {
            processes,
            metrics_readers: Mutex::new(HashMap::new()),
            grace: Duration::from_secs(settings.stop_grace_secs),
            supply_binary: PathBuf::from(&artifacts.supply_binary),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    /// Stops whatever runs under `name`, then spawns `command_line` through the platform shell
    /// with both output streams logged.
    pub fn start(&self, name: &str, command_line: &str) -> Result<Arc<ManagedProcess>, AppError> {
        let name_lock = self.processes.name_lock(name);
        let _name_guard = hold(&name_lock);
        self.stop_locked(name);

        let trace_id = new_trace_id();
        let mut child = spawn_shell(command_line, &trace_id)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let process = self.register(name, child, &trace_id);
        if let Some(stderr) = stderr {
            spawn_log_reader(name, "stderr", stderr, None);
        }
        if let Some(stdout) = stdout {
            spawn_log_reader(name, "stdout", stdout, Some(self.exit_watch(&process)));
        }
        Ok(process)
    }

    /// Like [`ProcessSupervisor::start`], but stdout is parsed line by line as JSON metrics and
    /// handed to `sink`. Malformed lines are dropped.
    pub fn start_perfmon_stream(
        &self,
        name: &str,
        command_line: &str,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Arc<ManagedProcess>, AppError> {
        let name_lock = self.processes.name_lock(name);
        let _name_guard = hold(&name_lock);
        self.stop_locked(name);

        let trace_id = new_trace_id();
        let mut child = spawn_shell(command_line, &trace_id)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let process = self.register(name, child, &trace_id);
        if let Some(stderr) = stderr {
            spawn_log_reader(name, "stderr", stderr, None);
        }
        if let Some(stdout) = stdout {
            let cancel = CancelToken::new();
            self.readers().insert(name.to_string(), cancel.clone());
            let owner = name.to_string();
            let watch = self.exit_watch(&process);
            let spawned = std::thread::Builder::new()
                .name(format!("{name}-metrics"))
                .spawn(move || {
                    read_metrics(&owner, stdout, sink.as_ref(), &cancel);
                    watch.settle();
                });
            if let Err(err) = spawned {
                warn!(trace_id = %trace_id, name = %name, error = %err, "failed to start metrics reader");
            }
        }
        Ok(process)
    }

    /// Terminates the process under `name`, children included. Returns `false` when nothing was
    /// running.
    pub fn stop(&self, name: &str) -> bool {
        let name_lock = self.processes.name_lock(name);
        let _name_guard = hold(&name_lock);
        self.stop_locked(name)
    }

    /// Relay that exposes the device on `port`. Announces the outcome to `channel`; port `0`
    /// means the relay could not be started.
    pub fn start_share(&self, serial: &str, port: u16, channel: Option<&dyn ViewerChannel>) -> u16 {
        let command = format!(
            "{} share -s {serial} --translate-port {port}",
            self.supply_binary.display()
        );
        let announced = match self.start(&process_name(serial, "sas"), &command) {
            Ok(_) => port,
            Err(err) => {
                warn!(trace_id = %err.trace_id, serial = %serial, error = %err, "failed to start share relay");
                0
            }
        };
        if let Some(channel) = channel {
            send_message(
                channel,
                &ViewerMessage::Sas {
                    is_enable: true,
                    port: announced,
                },
            );
        }
        announced
    }

    pub fn stop_share(&self, serial: &str) -> bool {
        self.stop(&process_name(serial, "sas"))
    }

    pub fn start_perfmon(
        &self,
        serial: &str,
        package: &str,
        interval_ms: u32,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Arc<ManagedProcess>, AppError> {
        let command = perfmon_command(&self.supply_binary.display().to_string(), serial, package, interval_ms);
        self.start_perfmon_stream(&process_name(serial, "perfmon"), &command, sink)
    }

    pub fn stop_perfmon(&self, serial: &str) -> bool {
        self.stop(&process_name(serial, "perfmon"))
    }

    fn readers(&self) -> MutexGuard<'_, HashMap<String, CancelToken>> {
        match self.metrics_readers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn exit_watch(&self, process: &Arc<ManagedProcess>) -> ExitWatch {
        ExitWatch {
            processes: Arc::clone(&self.processes),
            process: Arc::clone(process),
        }
    }

    fn register(&self, name: &str, child: Child, trace_id: &str) -> Arc<ManagedProcess> {
        let process = Arc::new(ManagedProcess::new(name.to_string(), child));
        info!(trace_id = %trace_id, name = %name, pid = process.pid, "process started");
        if let Some(displaced) = self.processes.put_process(Arc::clone(&process)) {
            warn!(name = %name, pid = displaced.pid, "displaced process entry");
            terminate(&displaced, self.grace);
        }
        process
    }

    fn stop_locked(&self, name: &str) -> bool {
        if let Some(reader) = self.readers().remove(name) {
            reader.cancel();
        }
        let Some(process) = self.processes.get_process(name) else {
            return false;
        };
        terminate(&process, self.grace);
        self.processes.remove_process(name);
        info!(name = %name, pid = process.pid, "process stopped");
        true
    }
}

pub fn perfmon_command(supply: &str, serial: &str, package: &str, interval_ms: u32) -> String {
    let mut parts = vec![
        supply.to_string(),
        "perfmon".to_string(),
        "-s".to_string(),
        serial.to_string(),
        "-r".to_string(),
        interval_ms.to_string(),
    ];
    if !package.is_empty() {
        parts.push(format!(
            "--proc-cpu --proc-fps --proc-mem --proc-threads -p {package}"
        ));
    }
    parts.push("-j --sys-cpu --sys-mem --sys-network".to_string());
    parts.join(" ")
}

fn spawn_shell(command_line: &str, trace_id: &str) -> Result<Child, AppError> {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.args(["/c", command_line]);
        command
    } else {
        let mut command = Command::new("sh");
        command.args(["-c", command_line]);
        command
    };
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::dependency(format!("Failed to start `{command_line}`: {err}"), trace_id))
}

/// Drops a registry entry once its process exits without being stopped.
struct ExitWatch {
    processes: Arc<ProcessRegistry>,
    process: Arc<ManagedProcess>,
}

impl ExitWatch {
    /// Called when the process's stdout closes. The entry stays if the process is still running
    /// after a short wait.
    fn settle(self) {
        let deadline = Instant::now() + EXIT_SETTLE;
        while self.process.is_running() {
            if Instant::now() >= deadline {
                debug!(name = %self.process.name, pid = self.process.pid, "output closed but process still running");
                return;
            }
            std::thread::sleep(EXIT_POLL);
        }
        if self.processes.remove_if_same(&self.process.name, &self.process) {
            info!(name = %self.process.name, pid = self.process.pid, "process exited");
        }
    }
}

fn spawn_log_reader(
    name: &str,
    stream: &'static str,
    pipe: impl Read + Send + 'static,
    watch: Option<ExitWatch>,
) {
    let owner = name.to_string();
    let spawned = std::thread::Builder::new()
        .name(format!("{name}-{stream}"))
        .spawn(move || {
            for line in BufReader::new(pipe).lines() {
                match line {
                    Ok(line) if stream == "stderr" => warn!(name = %owner, "{line}"),
                    Ok(line) => info!(name = %owner, "{line}"),
                    Err(err) => {
                        debug!(name = %owner, stream, error = %err, "output stream closed");
                        break;
                    }
                }
            }
            if let Some(watch) = watch {
                watch.settle();
            }
        });
    if let Err(err) = spawned {
        warn!(name = %name, stream, error = %err, "failed to start output reader");
    }
}

fn read_metrics(owner: &str, pipe: impl Read, sink: &dyn MetricsSink, cancel: &CancelToken) {
    for line in BufReader::new(pipe).lines() {
        if cancel.is_cancelled() {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!(name = %owner, error = %err, "metrics stream closed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(record) => sink.record(&record),
            Err(err) => warn!(name = %owner, error = %err, line = %line, "dropping malformed perf line"),
        }
    }
}

/// Asks the process group to exit, waits up to `grace` for the leader and every other member,
/// then kills whatever is left. The group is signalled even when the leader has already exited,
/// since its background children keep the group alive.
fn terminate(process: &ManagedProcess, grace: Duration) {
    let mut child = process.child();
    let mut reaped = match child.try_wait() {
        Ok(Some(status)) => {
            debug!(name = %process.name, status = %status, "process leader already exited");
            true
        }
        Ok(None) => false,
        Err(err) => {
            warn!(name = %process.name, error = %err, "failed to poll process");
            false
        }
    };
    signal_group(process.pid, false);

    let start = Instant::now();
    loop {
        if !reaped {
            match child.try_wait() {
                Ok(Some(_)) => reaped = true,
                Ok(None) => {}
                Err(err) => {
                    warn!(name = %process.name, error = %err, "failed to poll process");
                    break;
                }
            }
        }
        if reaped && !group_alive(process.pid) {
            return;
        }
        if start.elapsed() >= grace {
            break;
        }
        std::thread::sleep(EXIT_POLL);
    }

    warn!(name = %process.name, pid = process.pid, "process group ignored termination, killing");
    signal_group(process.pid, true);
    if reaped {
        return;
    }
    if let Err(err) = child.kill() {
        debug!(name = %process.name, error = %err, "kill failed");
    }
    if let Err(err) = child.wait() {
        warn!(name = %process.name, error = %err, "failed to reap process");
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(err) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!(pid, signal = ?signal, error = %err, "signal delivery failed");
    }
}

/// Whether any member of the group led by `pid` can still be signalled.
#[cfg(unix)]
fn group_alive(pid: u32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _force: bool) {}

#[cfg(not(unix))]
fn group_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app::testing::RecordingChannel;

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<serde_json::Value>>,
    }

    impl MetricsSink for RecordingSink {
        fn record(&self, record: &serde_json::Value) {
            self.records.lock().unwrap().push(record.clone());
        }
    }

    fn supervisor(grace: Duration) -> ProcessSupervisor {
        ProcessSupervisor::new(
            Arc::new(ProcessRegistry::new()),
            &SupervisorSettings::default(),
            &ArtifactSettings {
                supply_binary: "echo".to_string(),
                ..ArtifactSettings::default()
            },
        )
        .with_grace(grace)
    }

    #[test]
    fn second_start_replaces_first_process() {
        let supervisor = supervisor(Duration::from_secs(2));
        let first = supervisor.start("process-ABC-sas", "sleep 30").expect("start");
        let second = supervisor.start("process-ABC-sas", "sleep 30").expect("start");

        assert!(!first.is_running());
        assert!(second.is_running());
        assert_eq!(supervisor.processes().names(), vec!["process-ABC-sas"]);
        assert_eq!(
            supervisor.processes().get_process("process-ABC-sas").map(|p| p.pid),
            Some(second.pid)
        );

        assert!(supervisor.stop("process-ABC-sas"));
        assert!(!second.is_running());
        assert!(supervisor.processes().names().is_empty());
    }

    #[cfg(target_os = "linux")]
    fn process_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stop_kills_children_left_by_exited_leader() {
        let supervisor = supervisor(Duration::from_millis(500));
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("child.pid");
        let process = supervisor
            .start(
                "orphaning",
                &format!("sleep 60 & echo $! > '{}'; exit 0", marker.display()),
            )
            .expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut background = None;
        while background.is_none() && Instant::now() < deadline {
            background = std::fs::read_to_string(&marker)
                .ok()
                .and_then(|text| text.trim().parse::<i32>().ok());
            std::thread::sleep(Duration::from_millis(20));
        }
        let background = background.expect("background pid");
        while process.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!process.is_running());
        assert!(!process_gone(background));

        assert!(supervisor.stop("orphaning"));
        let deadline = Instant::now() + Duration::from_secs(3);
        while !process_gone(background) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(process_gone(background));
        assert!(supervisor.processes().names().is_empty());
    }

    #[test]
    fn process_that_exits_on_its_own_leaves_registry() {
        let supervisor = supervisor(Duration::from_secs(1));
        supervisor.start("short-lived", "echo done").expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !supervisor.processes().names().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(supervisor.processes().names().is_empty());
        assert!(!supervisor.stop("short-lived"));
    }

    #[test]
    fn stop_without_process_is_noop() {
        let supervisor = supervisor(Duration::from_secs(1));
        assert!(!supervisor.stop("process-none-perfmon"));
        assert!(!supervisor.stop_perfmon("none"));
    }

    #[test]
    fn stubborn_process_is_killed_after_grace() {
        let supervisor = supervisor(Duration::from_millis(300));
        let process = supervisor
            .start("stubborn", "trap '' TERM; while true; do sleep 0.05; done")
            .expect("start");
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        assert!(supervisor.stop("stubborn"));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!process.is_running());
    }

    #[test]
    fn perf_lines_reach_sink_and_garbage_is_dropped() {
        let supervisor = supervisor(Duration::from_secs(2));
        let sink = Arc::new(RecordingSink::default());
        supervisor
            .start_perfmon_stream(
                "process-ABC-perfmon",
                r#"printf '%s\n' '{"cpu":1}' 'garbage' '{"mem":2}'; sleep 30"#,
                sink.clone(),
            )
            .expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.records.lock().unwrap().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(supervisor.stop("process-ABC-perfmon"));
        assert_eq!(
            *sink.records.lock().unwrap(),
            vec![serde_json::json!({"cpu": 1}), serde_json::json!({"mem": 2})]
        );
    }

    #[test]
    fn viewer_sink_wraps_records() {
        let channel = Arc::new(RecordingChannel::default());
        let sink = ViewerMetricsSink::new(channel.clone());
        sink.record(&serde_json::json!({"fps": 60}));
        assert_eq!(
            channel.messages(),
            vec![serde_json::json!({"msg": "perfDetail", "detail": {"fps": 60}})]
        );
    }

    #[test]
    fn share_announces_port() {
        let supervisor = supervisor(Duration::from_secs(1));
        let channel = RecordingChannel::default();
        assert_eq!(supervisor.start_share("ABC", 7100, Some(&channel)), 7100);
        assert_eq!(
            channel.messages(),
            vec![serde_json::json!({"msg": "sas", "isEnable": true, "port": 7100})]
        );
        supervisor.stop_share("ABC");
        assert!(supervisor.processes().names().is_empty());
    }

    #[test]
    fn perfmon_command_adds_process_flags_for_package() {
        assert_eq!(
            perfmon_command("sas", "ABC", "", 1000),
            "sas perfmon -s ABC -r 1000 -j --sys-cpu --sys-mem --sys-network"
        );
        assert_eq!(
            perfmon_command("sas", "ABC", "com.example", 500),
            "sas perfmon -s ABC -r 500 --proc-cpu --proc-fps --proc-mem --proc-threads -p com.example -j --sys-cpu --sys-mem --sys-network"
        );
    }
}
