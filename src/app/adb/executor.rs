use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::parse::{
    parse_dimensions, parse_display_cur_orientation, parse_focused_activity, parse_focused_package,
    parse_surface_orientation, parse_user_rotation, parse_window_bounds, parse_wm_size, UNKNOWN_SIZE,
};
use crate::app::error::AppError;
use crate::app::ladder::run_ladder;
use crate::app::models::{BatteryMode, DeviceHandle, DisplayBounds, Rotation};
use crate::app::registry::{forward_name, ForwardRegistration, ForwardTarget, PortRegistry};
use crate::app::scheduler::TaskScheduler;

/// Install attempts, most permissive first.
pub const INSTALL_FLAG_LADDER: [&[&str]; 3] = [&["-r", "-t", "-g"], &["-r", "-t"], &[]];

pub const PROP_SDK: &str = "ro.build.version.sdk";
pub const PROP_ABI: &str = "ro.product.cpu.abi";
pub const PROP_MANUFACTURER: &str = "ro.product.manufacturer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub flags: Vec<String>,
    /// Causes of the attempts that failed before the successful one.
    pub failures: Vec<String>,
}

fn flags_label(flags: &&[&str]) -> String {
    if flags.is_empty() {
        "no flags".to_string()
    } else {
        flags.join(" ")
    }
}

/// Synchronous facade over the device bridge. Shell commands are telemetry grade: transport faults
/// are logged and turned into empty output. Forwards go through the shared [`PortRegistry`].
pub struct BridgeExecutor {
    bridge: Arc<dyn DeviceBridge>,
    ports: Arc<PortRegistry>,
    scheduler: Arc<TaskScheduler>,
}

impl BridgeExecutor {
    pub fn new(bridge: Arc<dyn DeviceBridge>, ports: Arc<PortRegistry>, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            bridge,
            ports,
            scheduler,
        }
    }

    pub fn bridge(&self) -> &Arc<dyn DeviceBridge> {
        &self.bridge
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    pub fn run(&self, device: &DeviceHandle, command: &str) -> String {
        match self.bridge.execute_shell(&device.serial, command) {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    serial = %device.serial,
                    command = %command,
                    error = %err,
                    "shell command failed"
                );
                String::new()
            }
        }
    }

    /// Queues `command` on the shared pool. Commands for the same device run one at a time.
    pub fn run_detached(&self, device: &DeviceHandle, command: &str) -> Option<JoinHandle<()>> {
        let bridge = Arc::clone(&self.bridge);
        let serial = device.serial.clone();
        let command = command.to_string();
        self.scheduler
            .spawn_device_task(&device.serial, format!("{serial}-shell"), move || {
                if let Err(err) = bridge.execute_shell(&serial, &command) {
                    warn!(serial = %serial, command = %command, error = %err, "detached shell command failed");
                }
            })
    }

    /// Creates `local_port -> target`, first tearing down whatever forward held the same logical
    /// name. Returns `false` when the bridge refused the new forward; nothing is recorded then.
    pub fn forward(&self, device: &DeviceHandle, local_port: u16, target: ForwardTarget) -> bool {
        let registration = ForwardRegistration::new(&device.serial, local_port, target);
        self.ports.allocate(
            registration,
            |previous| {
                debug!(name = %previous.name, port = previous.local_port, "replacing forward");
                if let Err(err) = self.bridge.remove_forward(&previous.serial, previous.local_port) {
                    warn!(name = %previous.name, port = previous.local_port, error = %err, "failed to remove superseded forward");
                }
            },
            |next| match self.bridge.create_forward(&next.serial, next.local_port, &next.target) {
                Ok(()) => {
                    info!(name = %next.name, port = next.local_port, target = %next.target, "forward created");
                    true
                }
                Err(err) => {
                    warn!(name = %next.name, port = next.local_port, error = %err, "failed to create forward");
                    false
                }
            },
        )
    }

    /// [`BridgeExecutor::forward`] that hands back a lease removing the forward when dropped.
    pub fn forward_lease(
        &self,
        device: &DeviceHandle,
        local_port: u16,
        target: ForwardTarget,
    ) -> Option<ForwardLease<'_>> {
        if !self.forward(device, local_port, target.clone()) {
            return None;
        }
        Some(ForwardLease {
            executor: self,
            device: device.clone(),
            local_port,
            target,
        })
    }

    /// Removes the device forward and drops the registration if it still points at `local_port`.
    /// Safe to repeat.
    pub fn unforward(&self, device: &DeviceHandle, local_port: u16, target: &ForwardTarget) {
        if let Err(err) = self.bridge.remove_forward(&device.serial, local_port) {
            debug!(serial = %device.serial, port = local_port, error = %err, "forward removal failed");
        }
        let name = forward_name(&device.serial, target);
        if self.ports.release_if_port(&name, local_port).is_some() {
            info!(name = %name, port = local_port, "forward released");
        }
    }

    /// Installs through the flag ladder. Fails only when every rung failed, carrying each cause.
    pub fn install_package(&self, device: &DeviceHandle, path: &str) -> Result<InstallOutcome, AppError> {
        let mut failures = Vec::new();
        let result = run_ladder(&INSTALL_FLAG_LADDER, flags_label, |index, flags| {
            let outcome = self.bridge.install_package(&device.serial, path, flags);
            if let Err(err) = &outcome {
                warn!(
                    serial = %device.serial,
                    path = %path,
                    attempt = index + 1,
                    flags = %flags_label(flags),
                    error = %err,
                    "install attempt failed"
                );
                failures.push(err.error.clone());
            }
            outcome
        });
        match result {
            Ok((index, ())) => {
                let flags = INSTALL_FLAG_LADDER[index].iter().map(|flag| flag.to_string()).collect();
                info!(serial = %device.serial, path = %path, attempt = index + 1, "package installed");
                Ok(InstallOutcome { flags, failures })
            }
            Err(failure) => Err(AppError::install(
                format!("Failed to install {path}: {failure}"),
                &device.serial,
            )),
        }
    }

    pub fn uninstall_package(&self, device: &DeviceHandle, package: &str) -> String {
        match self.bridge.uninstall_package(&device.serial, package) {
            Ok(output) => output,
            Err(err) => {
                warn!(serial = %device.serial, package = %package, error = %err, "uninstall failed");
                String::new()
            }
        }
    }

    pub fn push_file(&self, device: &DeviceHandle, local: &str, remote: &str) -> bool {
        match self.bridge.push_file(&device.serial, local, remote) {
            Ok(()) => true,
            Err(err) => {
                warn!(serial = %device.serial, local = %local, remote = %remote, error = %err, "push failed");
                false
            }
        }
    }

    pub fn query_property(&self, device: &DeviceHandle, key: &str) -> Option<String> {
        match self.bridge.get_property(&device.serial, key) {
            Ok(value) => value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
            Err(err) => {
                warn!(serial = %device.serial, key = %key, error = %err, "property query failed");
                None
            }
        }
    }

    /// SDK level, `0` when unknown.
    pub fn api_level(&self, device: &DeviceHandle) -> u32 {
        self.query_property(device, PROP_SDK)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    fn focus_dump(&self, device: &DeviceHandle) -> String {
        let section = if self.api_level(device) >= 29 {
            "displays"
        } else {
            "windows"
        };
        self.run(device, &format!("dumpsys window {section}"))
    }

    pub fn current_package(&self, device: &DeviceHandle) -> String {
        parse_focused_package(&self.focus_dump(device))
    }

    pub fn current_activity(&self, device: &DeviceHandle) -> String {
        parse_focused_activity(&self.focus_dump(device))
    }

    /// `WIDTHxHEIGHT`, or `unknown`.
    pub fn screen_size(&self, device: &DeviceHandle) -> String {
        parse_wm_size(&self.run(device, "wm size"))
    }

    pub fn orientation(&self, device: &DeviceHandle) -> i32 {
        if let Some(orientation) = parse_surface_orientation(&self.run(device, "dumpsys input")) {
            return orientation;
        }
        parse_display_cur_orientation(&self.run(device, "dumpsys window displays")).unwrap_or(0)
    }

    /// Frame of the foreground app. Zero rectangle when the screen size is unknown.
    pub fn display_bounds(&self, device: &DeviceHandle) -> DisplayBounds {
        let size = self.screen_size(device);
        let Some((width, height)) = parse_dimensions(&size) else {
            debug!(serial = %device.serial, size = %UNKNOWN_SIZE, "display bounds unavailable");
            return DisplayBounds::default();
        };
        let orientation = self.orientation(device);
        let (width, height) = if orientation == 1 || orientation == 3 {
            (height as i32, width as i32)
        } else {
            (width as i32, height as i32)
        };
        let package = self.current_package(device);
        let windows = self.run(device, "dumpsys window windows");
        parse_window_bounds(&windows, &package, width, height, orientation)
    }

    pub fn reboot(&self, device: &DeviceHandle) {
        self.run(device, "reboot");
    }

    pub fn shutdown(&self, device: &DeviceHandle) {
        self.run(device, "reboot -p");
    }

    pub fn press_key(&self, device: &DeviceHandle, keycode: i32) {
        self.run(device, &format!("input keyevent {keycode}"));
    }

    pub fn force_stop(&self, device: &DeviceHandle, package: &str) {
        self.run(device, &format!("am force-stop {package}"));
    }

    pub fn activate_app(&self, device: &DeviceHandle, package: &str) {
        self.run(
            device,
            &format!("monkey -p {package} -c android.intent.category.LAUNCHER 1"),
        );
    }

    pub fn set_proxy(&self, device: &DeviceHandle, host: &str, port: u16) {
        self.run(device, &format!("settings put global http_proxy {host}:{port}"));
    }

    pub fn clear_proxy(&self, device: &DeviceHandle) {
        self.run(device, "settings put global http_proxy :0");
    }

    pub fn user_rotation(&self, device: &DeviceHandle) -> i32 {
        parse_user_rotation(&self.run(device, "settings get system user_rotation"))
    }

    pub fn rotate(&self, device: &DeviceHandle, rotation: Rotation) {
        let current = self.user_rotation(device);
        let (name, value) = match rotation {
            Rotation::Lock => ("accelerometer_rotation", 0),
            Rotation::Clockwise => ("user_rotation", (current + 1).rem_euclid(4)),
            Rotation::CounterClockwise => ("user_rotation", (current - 1).rem_euclid(4)),
        };
        self.run(
            device,
            &format!("content insert --uri content://settings/system --bind name:s:{name} --bind value:i:{value}"),
        );
    }

    pub fn control_battery(&self, device: &DeviceHandle, mode: BatteryMode) {
        let command = match mode {
            BatteryMode::Unplug => "dumpsys battery unplug && dumpsys battery set status 1",
            BatteryMode::Reset => "dumpsys battery reset",
        };
        self.run(device, command);
    }
}

pub struct ForwardLease<'a> {
    executor: &'a BridgeExecutor,
    device: DeviceHandle,
    local_port: u16,
    target: ForwardTarget,
}

impl ForwardLease<'_> {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for ForwardLease<'_> {
    fn drop(&mut self) {
        self.executor.unforward(&self.device, self.local_port, &self.target);
    }
}
