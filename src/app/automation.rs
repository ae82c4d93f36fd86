use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::app::adb::executor::BridgeExecutor;
use crate::app::adb::parse::{has_version_name, parse_pm_path};
use crate::app::config::{ArtifactSettings, ReadinessSettings};
use crate::app::error::AppError;
use crate::app::logging::new_trace_id;
use crate::app::models::DeviceHandle;
use crate::app::readiness::ReadySignal;
use crate::app::registry::{hold, ForwardTarget, KeyedLocks};
use crate::app::worker::{CancelToken, Liveness, WorkerHandle};

pub const SERVER_PACKAGE: &str = "io.appium.uiautomator2.server";
pub const SERVER_TEST_PACKAGE: &str = "io.appium.uiautomator2.server.test";
pub const SERVER_DEVICE_PORT: u16 = 6790;
pub const AGENT_APP_PACKAGE: &str = "org.cloud.sonic.android";
const INSTRUMENT_COMMAND: &str = "am instrument -w io.appium.uiautomator2.server.test/androidx.test.runner.AndroidJUnitRunner -e DISABLE_SUPPRESS_ACCESSIBILITY_SERVICES true -e disableAnalytics true";
const READY_MARKER: &str = "io.appium.uiautomator2.server.test.AppiumUiAutomator2Server:";

/// Watches instrumentation output for the server's start banner.
#[derive(Debug, Default)]
pub struct InstrumentationObserver {
    seen: bool,
}

impl InstrumentationObserver {
    /// `true` for the first line carrying the start banner.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.seen || !line.contains(READY_MARKER) {
            return false;
        }
        self.seen = true;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomationLaunch {
    pub local_port: u16,
    /// Whether the banner showed up within the polling budget. The server may still come up
    /// later; callers verify on their own.
    pub ready: bool,
}

pub struct AutomationBootstrap {
    executor: Arc<BridgeExecutor>,
    artifacts: ArtifactSettings,
    readiness: ReadinessSettings,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    starts: KeyedLocks,
}

impl AutomationBootstrap {
    pub fn new(executor: Arc<BridgeExecutor>, artifacts: ArtifactSettings, readiness: ReadinessSettings) -> Self {
        Self {
            executor,
            artifacts,
            readiness,
            workers: Mutex::new(HashMap::new()),
            starts: KeyedLocks::default(),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, WorkerHandle>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn worker_key(device: &DeviceHandle) -> String {
        format!("{}-uia-thread", device.serial)
    }

    /// Makes sure the automation server runs on `device`, reachable on `local_port`. Blocks until
    /// the server reports itself, the polling budget runs out, or [`AutomationBootstrap::stop_server`]
    /// interrupts it. Starts for the same device run one at a time.
    pub fn start_server(&self, device: &DeviceHandle, local_port: u16) -> Result<AutomationLaunch, AppError> {
        let start_lock = self.starts.lock_for(&device.serial);
        let _start_guard = hold(&start_lock);
        let trace_id = new_trace_id();
        self.stop_server(device);
        self.ensure_server_installed(device, &trace_id)?;

        let ready = ReadySignal::new();
        let executor = Arc::clone(&self.executor);
        let worker_device = device.clone();
        let worker_ready = ready.clone();
        let worker_trace = trace_id.clone();
        let settle = self.readiness.settle_delay();
        let worker = WorkerHandle::spawn(Self::worker_key(device), CancelToken::new(), move |cancel| {
            run_instrumentation(&executor, &worker_device, local_port, &worker_ready, settle, &cancel, &worker_trace);
        })
        .map_err(|err| AppError::system(format!("Failed to spawn automation worker: {err}"), &trace_id))?;
        let cancel = worker.cancel_token();
        let displaced = self.workers().insert(Self::worker_key(device), worker);
        if let Some(displaced) = displaced {
            displaced.interrupt();
            displaced.join();
        }

        let polled = ready.poll(self.readiness.poll_interval(), self.readiness.poll_attempts, &cancel);
        if polled {
            info!(trace_id = %trace_id, serial = %device.serial, port = local_port, "automation server ready");
        } else {
            warn!(trace_id = %trace_id, serial = %device.serial, port = local_port, "automation server not ready within budget");
        }
        Ok(AutomationLaunch {
            local_port,
            ready: polled,
        })
    }

    /// Interrupts the device's bootstrap worker, if any, and waits for its forward to be removed.
    pub fn stop_server(&self, device: &DeviceHandle) -> bool {
        let previous = self.workers().remove(&Self::worker_key(device));
        let Some(previous) = previous else {
            return false;
        };
        previous.interrupt();
        previous.join();
        true
    }

    fn ensure_server_installed(&self, device: &DeviceHandle, trace_id: &str) -> Result<(), AppError> {
        let dump = self.executor.run(device, &format!("dumpsys package {SERVER_PACKAGE}"));
        if has_version_name(&dump, &self.artifacts.automation_server_version) {
            return Ok(());
        }
        info!(
            trace_id = %trace_id,
            serial = %device.serial,
            version = %self.artifacts.automation_server_version,
            "reinstalling automation server"
        );
        self.executor.uninstall_package(device, SERVER_PACKAGE);
        self.executor.uninstall_package(device, SERVER_TEST_PACKAGE);
        self.executor.install_package(device, &self.artifacts.automation_server_apk)?;
        self.executor.install_package(device, &self.artifacts.automation_server_test_apk)?;
        for package in [SERVER_PACKAGE, SERVER_TEST_PACKAGE] {
            self.executor
                .run(device, &format!("appops set {package} RUN_IN_BACKGROUND allow"));
        }
        for package in [SERVER_PACKAGE, SERVER_TEST_PACKAGE] {
            self.executor
                .run(device, &format!("dumpsys deviceidle whitelist +{package}"));
        }
        Ok(())
    }

    /// Companion app check: reinstalls when it is missing or at the wrong version.
    pub fn ensure_agent_app(&self, device: &DeviceHandle) -> bool {
        let installed = parse_pm_path(&self.executor.run(device, &format!("pm path {AGENT_APP_PACKAGE}")));
        let dump = self.executor.run(device, &format!("dumpsys package {AGENT_APP_PACKAGE}"));
        if installed.is_some() && has_version_name(&dump, &self.artifacts.agent_app_version) {
            info!(serial = %device.serial, "companion app up to date");
            return true;
        }
        self.executor.uninstall_package(device, AGENT_APP_PACKAGE);
        if let Err(err) = self.executor.install_package(device, &self.artifacts.agent_app_apk) {
            warn!(trace_id = %err.trace_id, serial = %device.serial, error = %err, "companion app install failed");
            return false;
        }
        for permission in ["POST_NOTIFICATION", "RUN_IN_BACKGROUND"] {
            self.executor
                .run(device, &format!("appops set {AGENT_APP_PACKAGE} {permission} allow"));
        }
        self.executor
            .run(device, &format!("dumpsys deviceidle whitelist +{AGENT_APP_PACKAGE}"));
        info!(serial = %device.serial, "companion app installed");
        true
    }
}

fn run_instrumentation(
    executor: &BridgeExecutor,
    device: &DeviceHandle,
    local_port: u16,
    ready: &ReadySignal,
    settle: std::time::Duration,
    cancel: &CancelToken,
    trace_id: &str,
) {
    let Some(_forward) = executor.forward_lease(device, local_port, ForwardTarget::Tcp(SERVER_DEVICE_PORT)) else {
        warn!(trace_id = %trace_id, serial = %device.serial, "automation forward unavailable");
        return;
    };
    let mut observer = InstrumentationObserver::default();
    let mut on_line = |line: &str| {
        info!(trace_id = %trace_id, serial = %device.serial, "{line}");
        if observer.observe(line) && cancel.sleep(settle) {
            ready.set();
        }
    };
    if let Err(err) = executor
        .bridge()
        .execute_shell_streaming(&device.serial, INSTRUMENT_COMMAND, cancel, &mut on_line)
    {
        warn!(trace_id = %trace_id, serial = %device.serial, error = %err, "instrumentation ended with error");
    }
    info!(trace_id = %trace_id, serial = %device.serial, "instrumentation finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::bridge::DeviceBridge;
    use crate::app::registry::PortRegistry;
    use crate::app::scheduler::TaskScheduler;
    use crate::app::testing::{BridgeCall, FakeBridge};

    const BANNER: &str = "io.appium.uiautomator2.server.test.AppiumUiAutomator2Server:";

    fn fast_readiness() -> ReadinessSettings {
        ReadinessSettings {
            poll_interval_ms: 10,
            poll_attempts: 100,
            settle_delay_ms: 10,
        }
    }

    fn bootstrap(bridge: &Arc<FakeBridge>, readiness: ReadinessSettings) -> AutomationBootstrap {
        let dyn_bridge: Arc<dyn DeviceBridge> = Arc::clone(bridge) as Arc<dyn DeviceBridge>;
        let executor = BridgeExecutor::new(dyn_bridge, Arc::new(PortRegistry::new()), Arc::new(TaskScheduler::new(2)));
        AutomationBootstrap::new(Arc::new(executor), ArtifactSettings::default(), readiness)
    }

    fn installs(bridge: &FakeBridge) -> Vec<String> {
        bridge
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BridgeCall::Install(path, _) => Some(path),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn observer_fires_once() {
        let mut observer = InstrumentationObserver::default();
        assert!(!observer.observe("INSTRUMENTATION_STATUS: class=..."));
        assert!(observer.observe(&format!("{BANNER} started")));
        assert!(!observer.observe(BANNER));
    }

    #[test]
    fn outdated_server_is_reinstalled_then_launched() {
        let bridge = Arc::new(FakeBridge::new());
        bridge
            .respond("dumpsys package io.appium", "versionName=1.0.0")
            .stream("am instrument", &["INSTRUMENTATION_STATUS: numtests=1", BANNER], true);
        let bootstrap = bootstrap(&bridge, fast_readiness());
        let device = DeviceHandle::new("ABC");

        let launch = bootstrap.start_server(&device, 4723).expect("start");
        assert_eq!(
            launch,
            AutomationLaunch {
                local_port: 4723,
                ready: true
            }
        );
        let defaults = ArtifactSettings::default();
        assert_eq!(
            installs(&bridge),
            vec![defaults.automation_server_apk, defaults.automation_server_test_apk]
        );
        let shell = bridge.shell_commands();
        assert!(shell.contains(&format!("appops set {SERVER_TEST_PACKAGE} RUN_IN_BACKGROUND allow")));
        assert!(shell.contains(&format!("dumpsys deviceidle whitelist +{SERVER_PACKAGE}")));
        assert!(bridge
            .calls()
            .contains(&BridgeCall::Forward(4723, ForwardTarget::Tcp(SERVER_DEVICE_PORT))));

        assert!(bootstrap.stop_server(&device));
        assert_eq!(bridge.calls().last(), Some(&BridgeCall::Unforward(4723)));
    }

    #[test]
    fn current_server_skips_install() {
        let bridge = Arc::new(FakeBridge::new());
        let version = ArtifactSettings::default().automation_server_version;
        bridge
            .respond("dumpsys package io.appium", &format!("versionName={version}"))
            .stream("am instrument", &[BANNER], true);
        let bootstrap = bootstrap(&bridge, fast_readiness());
        let device = DeviceHandle::new("ABC");

        assert!(bootstrap.start_server(&device, 4724).expect("start").ready);
        assert!(installs(&bridge).is_empty());
        bootstrap.stop_server(&device);
    }

    #[test]
    fn silent_server_exhausts_budget_but_proceeds() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.stream("am instrument", &["nothing useful"], true);
        let bootstrap = bootstrap(
            &bridge,
            ReadinessSettings {
                poll_interval_ms: 10,
                poll_attempts: 3,
                settle_delay_ms: 10,
            },
        );
        let device = DeviceHandle::new("ABC");
        let launch = bootstrap.start_server(&device, 4725).expect("start");
        assert!(!launch.ready);
        bootstrap.stop_server(&device);
        assert!(bridge.calls().contains(&BridgeCall::Unforward(4725)));
    }

    #[test]
    fn restart_interrupts_previous_worker() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.stream("am instrument", &[BANNER], true);
        let bootstrap = bootstrap(&bridge, fast_readiness());
        let device = DeviceHandle::new("ABC");

        bootstrap.start_server(&device, 4726).expect("first");
        bootstrap.start_server(&device, 4727).expect("second");

        let calls = bridge.calls();
        let released = calls.iter().position(|call| *call == BridgeCall::Unforward(4726));
        let forwarded = calls
            .iter()
            .position(|call| *call == BridgeCall::Forward(4727, ForwardTarget::Tcp(SERVER_DEVICE_PORT)));
        assert!(released.is_some());
        assert!(released < forwarded);
        assert_eq!(bridge.streaming_commands().len(), 2);
        bootstrap.stop_server(&device);
    }

    #[test]
    fn concurrent_starts_keep_one_worker() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.stream("am instrument", &["nothing useful"], true);
        let bootstrap = Arc::new(bootstrap(
            &bridge,
            ReadinessSettings {
                poll_interval_ms: 10,
                poll_attempts: 20,
                settle_delay_ms: 10,
            },
        ));
        let device = DeviceHandle::new("ABC");

        let first = {
            let bootstrap = Arc::clone(&bootstrap);
            let device = device.clone();
            std::thread::spawn(move || bootstrap.start_server(&device, 5001))
        };
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while bridge.streaming_commands().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        bootstrap.start_server(&device, 5002).expect("second");
        first.join().expect("join").expect("first");

        let calls = bridge.calls();
        let released = calls.iter().position(|call| *call == BridgeCall::Unforward(5001));
        let forwarded = calls
            .iter()
            .position(|call| *call == BridgeCall::Forward(5002, ForwardTarget::Tcp(SERVER_DEVICE_PORT)));
        assert!(released.is_some());
        assert!(released < forwarded);
        assert_eq!(bridge.streaming_commands().len(), 2);

        assert!(bootstrap.stop_server(&device));
        assert_eq!(bridge.calls().last(), Some(&BridgeCall::Unforward(5002)));
        assert!(bootstrap.executor.ports().is_empty());
        assert!(!bootstrap.stop_server(&device));
    }

    #[test]
    fn stop_interrupts_pending_start() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.stream("am instrument", &["nothing useful"], true);
        let bootstrap = Arc::new(bootstrap(
            &bridge,
            ReadinessSettings {
                poll_interval_ms: 10,
                poll_attempts: 1000,
                settle_delay_ms: 10,
            },
        ));
        let device = DeviceHandle::new("ABC");

        let pending = {
            let bootstrap = Arc::clone(&bootstrap);
            let device = device.clone();
            std::thread::spawn(move || bootstrap.start_server(&device, 5003))
        };
        let started = std::time::Instant::now();
        let deadline = started + std::time::Duration::from_secs(5);
        while !bootstrap.stop_server(&device) && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let launch = pending.join().expect("join").expect("start");
        assert!(!launch.ready);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(bridge.calls().contains(&BridgeCall::Unforward(5003)));
    }

    #[test]
    fn install_failure_aborts_bootstrap() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.fail_installs(3);
        let bootstrap = bootstrap(&bridge, fast_readiness());
        let err = bootstrap
            .start_server(&DeviceHandle::new("ABC"), 4728)
            .unwrap_err();
        assert_eq!(err.code, "ERR_INSTALL");
        assert!(bridge.streaming_commands().is_empty());
    }

    #[test]
    fn agent_app_reinstalled_when_missing() {
        let bridge = Arc::new(FakeBridge::new());
        let bootstrap = bootstrap(&bridge, fast_readiness());
        let device = DeviceHandle::new("ABC");
        assert!(bootstrap.ensure_agent_app(&device));
        assert_eq!(installs(&bridge), vec![ArtifactSettings::default().agent_app_apk]);
        assert!(bridge
            .shell_commands()
            .contains(&format!("appops set {AGENT_APP_PACKAGE} POST_NOTIFICATION allow")));
    }

    #[test]
    fn agent_app_left_alone_when_current() {
        let bridge = Arc::new(FakeBridge::new());
        let version = ArtifactSettings::default().agent_app_version;
        bridge
            .respond("pm path", "package:/data/app/org.cloud.sonic.android-1/base.apk\n")
            .respond("dumpsys package org.cloud", &format!("versionName={version}\n"));
        let bootstrap = bootstrap(&bridge, fast_readiness());
        assert!(bootstrap.ensure_agent_app(&DeviceHandle::new("ABC")));
        assert!(installs(&bridge).is_empty());
    }
}
