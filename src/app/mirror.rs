use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::app::adb::executor::{BridgeExecutor, PROP_ABI, PROP_MANUFACTURER, PROP_SDK};
use crate::app::adb::parse::parse_dimensions;
use crate::app::error::AppError;
use crate::app::ladder::run_ladder;
use crate::app::logging::new_trace_id;
use crate::app::models::{DeviceHandle, ViewerMessage};
use crate::app::readiness::ReadySignal;
use crate::app::registry::ForwardTarget;
use crate::app::viewer::{send_message, ViewerChannel};
use crate::app::worker::{CancelToken, Liveness, WorkerHandle};

pub const CAPTURE_SOCKET: &str = "minicap";
pub const DEVICE_TMP: &str = "/data/local/tmp";
pub const DEFAULT_PROFILE: &str = "libs";
const READY_MARKER: &str = "Server start";
const INCOMPATIBLE_MARKERS: [&str; 2] = ["Vector<> have different types", "CANNOT LINK EXECUTABLE"];
const REDUCED_BOUND: &str = "800x800";
const UNSUPPORTED_TEXT: &str = "This device is not compatible with minicap screen mirroring.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    NotStarted,
    BinaryStaged,
    Launching,
    Ready,
    Incompatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureMode {
    /// Full device resolution.
    #[default]
    High,
    /// Bounded to 800x800 at a lower quality factor.
    Reduced,
}

impl PictureMode {
    fn quality(self) -> u8 {
        match self {
            PictureMode::High => 80,
            PictureMode::Reduced => 40,
        }
    }

    fn virtual_size(self, real: &str) -> String {
        match self {
            PictureMode::High => real.to_string(),
            PictureMode::Reduced => REDUCED_BOUND.to_string(),
        }
    }
}

/// Output observer of the capture server, one per launch.
#[derive(Debug, Clone, Copy)]
pub struct CaptureOutputObserver {
    state: MirrorState,
}

impl CaptureOutputObserver {
    pub fn launching() -> Self {
        Self {
            state: MirrorState::Launching,
        }
    }

    pub fn state(&self) -> MirrorState {
        self.state
    }

    /// Advances on one output line and reports the new state if the line changed it. Only a
    /// launching server moves; `Ready` and `Incompatible` are final.
    pub fn observe(&mut self, line: &str) -> Option<MirrorState> {
        if self.state != MirrorState::Launching {
            return None;
        }
        if INCOMPATIBLE_MARKERS.iter().any(|marker| line.contains(marker)) {
            self.state = MirrorState::Incompatible;
        } else if line.contains(READY_MARKER) {
            self.state = MirrorState::Ready;
        } else {
            return None;
        }
        Some(self.state)
    }
}

/// Compatibility profiles to try, default first, then the manufacturer's vendor builds.
pub fn compat_profiles(manufacturer: Option<&str>) -> Vec<&'static str> {
    let mut profiles = vec![DEFAULT_PROFILE];
    match manufacturer {
        Some("Xiaomi") | Some("deltainno") | Some("HUAWEI") => {
            profiles.extend(["Xiaomi", "Xiaomi_NW", "Xiaomi_One"]);
        }
        Some("vivo") => profiles.push("vivo"),
        Some("LGE") => profiles.push("LGE"),
        _ => {}
    }
    profiles
}

/// Local artifacts for one ABI/SDK/profile combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePlan {
    pub binary_name: &'static str,
    pub binary: PathBuf,
    pub library: PathBuf,
}

impl CapturePlan {
    pub fn resolve(root: &Path, abi: &str, sdk: u32, profile: &str) -> Self {
        let binary_name = if sdk < 16 { "minicap-nopie" } else { "minicap" };
        Self {
            binary_name,
            binary: root.join(abi).join(binary_name),
            library: root
                .join("minicap-shared")
                .join("aosp")
                .join(profile)
                .join(format!("android-{sdk}"))
                .join(abi)
                .join("minicap.so"),
        }
    }

    pub fn missing(&self) -> Vec<&Path> {
        [self.binary.as_path(), self.library.as_path()]
            .into_iter()
            .filter(|path| !path.is_file())
            .collect()
    }

    pub fn launch_command(&self, size: &str, mode: PictureMode, rotation: u32) -> String {
        format!(
            "LD_LIBRARY_PATH={DEVICE_TMP} {DEVICE_TMP}/{} -Q {} -S -P {size}@{}/{rotation}",
            self.binary_name,
            mode.quality(),
            mode.virtual_size(size),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorFault {
    MissingArtifacts(Vec<String>),
    Incompatible,
    Transport(AppError),
    Cancelled,
}

impl fmt::Display for MirrorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorFault::MissingArtifacts(paths) => write!(f, "missing {}", paths.join(", ")),
            MirrorFault::Incompatible => write!(f, "capture binary incompatible"),
            MirrorFault::Transport(err) => write!(f, "{err}"),
            MirrorFault::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The capture server ran with this profile until it exited or was stopped.
    Served { profile: String },
    Unsupported,
    NoForward,
}

pub struct MirrorRequest {
    pub device: DeviceHandle,
    pub local_port: u16,
    pub mode: PictureMode,
    pub rotation: u32,
}

#[derive(Clone)]
struct SharedState {
    state: Arc<Mutex<MirrorState>>,
    ready: ReadySignal,
}

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set(&self, next: MirrorState) {
        *self.lock() = next;
        if next == MirrorState::Ready {
            self.ready.set();
        }
    }
}

/// Running screen mirror session.
pub struct MirrorHandle {
    worker: WorkerHandle,
    shared: SharedState,
    outcome: Arc<Mutex<Option<MirrorOutcome>>>,
}

impl MirrorHandle {
    pub fn ready(&self) -> ReadySignal {
        self.shared.ready.clone()
    }

    pub fn state(&self) -> MirrorState {
        *self.shared.lock()
    }

    pub fn stop(&self) {
        self.worker.interrupt();
    }

    /// Waits for the session to end and returns how it went.
    pub fn join(self) -> Option<MirrorOutcome> {
        self.worker.join();
        match self.outcome.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Liveness for MirrorHandle {
    fn is_alive(&self) -> bool {
        self.worker.is_alive()
    }

    fn interrupt(&self) {
        self.worker.interrupt();
    }
}

pub struct MirrorSession {
    executor: Arc<BridgeExecutor>,
    capture_root: PathBuf,
}

impl MirrorSession {
    pub fn new(executor: Arc<BridgeExecutor>, capture_root: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            capture_root: capture_root.into(),
        }
    }

    /// Forwards the capture socket and walks the profile ladder on a dedicated worker. The
    /// forward is removed when the worker ends.
    pub fn spawn(
        self: &Arc<Self>,
        request: MirrorRequest,
        channel: Option<Arc<dyn ViewerChannel>>,
    ) -> Result<MirrorHandle, AppError> {
        let trace_id = new_trace_id();
        let shared = SharedState {
            state: Arc::new(Mutex::new(MirrorState::NotStarted)),
            ready: ReadySignal::new(),
        };
        let outcome = Arc::new(Mutex::new(None));

        let session = Arc::clone(self);
        let worker_shared = shared.clone();
        let worker_outcome = Arc::clone(&outcome);
        let worker_trace = trace_id.clone();
        let name = format!("{}-minicap", request.device.serial);
        let worker = WorkerHandle::spawn(name, CancelToken::new(), move |cancel| {
            let result = session.serve(&request, channel.as_deref(), &worker_shared, &cancel, &worker_trace);
            if let Ok(mut guard) = worker_outcome.lock() {
                *guard = Some(result);
            }
        })
        .map_err(|err| AppError::system(format!("Failed to spawn mirror worker: {err}"), &trace_id))?;

        Ok(MirrorHandle {
            worker,
            shared,
            outcome,
        })
    }

    fn serve(
        &self,
        request: &MirrorRequest,
        channel: Option<&dyn ViewerChannel>,
        shared: &SharedState,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> MirrorOutcome {
        let target = ForwardTarget::Socket(CAPTURE_SOCKET.to_string());
        let Some(_forward) = self.executor.forward_lease(&request.device, request.local_port, target) else {
            warn!(trace_id = %trace_id, serial = %request.device.serial, "capture forward unavailable");
            return MirrorOutcome::NoForward;
        };

        let manufacturer = self.executor.query_property(&request.device, PROP_MANUFACTURER);
        let profiles = compat_profiles(manufacturer.as_deref());
        let result = run_ladder(
            &profiles,
            |profile| profile.to_string(),
            |_, profile| self.attempt(request, profile, shared, cancel, trace_id),
        );
        match result {
            Ok((_, profile)) => MirrorOutcome::Served { profile },
            Err(failure) => {
                warn!(trace_id = %trace_id, serial = %request.device.serial, causes = %failure, "no capture profile worked");
                let cancelled = failure
                    .causes
                    .last()
                    .is_some_and(|(_, fault)| *fault == MirrorFault::Cancelled);
                if manufacturer.is_some() && !cancelled {
                    if let Some(channel) = channel {
                        send_message(
                            channel,
                            &ViewerMessage::Support {
                                text: UNSUPPORTED_TEXT.to_string(),
                            },
                        );
                    }
                }
                MirrorOutcome::Unsupported
            }
        }
    }

    /// One launch with `profile`. Blocks while the capture server runs.
    fn attempt(
        &self,
        request: &MirrorRequest,
        profile: &str,
        shared: &SharedState,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<String, MirrorFault> {
        if cancel.is_cancelled() {
            return Err(MirrorFault::Cancelled);
        }
        let device = &request.device;
        shared.set(MirrorState::NotStarted);
        self.executor.run(device, &format!("rm -rf {DEVICE_TMP}/minicap*"));

        let abi = self.executor.query_property(device, PROP_ABI);
        let sdk = self
            .executor
            .query_property(device, PROP_SDK)
            .and_then(|value| value.parse::<u32>().ok());
        let (Some(abi), Some(sdk)) = (abi, sdk) else {
            return Err(MirrorFault::MissingArtifacts(vec![format!(
                "{PROP_ABI}/{PROP_SDK} of {}",
                device.serial
            )]));
        };
        let plan = CapturePlan::resolve(&self.capture_root, &abi, sdk, profile);
        let missing = plan.missing();
        if !missing.is_empty() {
            return Err(MirrorFault::MissingArtifacts(
                missing.iter().map(|path| path.display().to_string()).collect(),
            ));
        }

        let remote_binary = format!("{DEVICE_TMP}/{}", plan.binary_name);
        for (local, remote) in [
            (&plan.binary, remote_binary.clone()),
            (&plan.library, format!("{DEVICE_TMP}/minicap.so")),
        ] {
            self.executor
                .bridge()
                .push_file(&device.serial, &local.to_string_lossy(), &remote)
                .map_err(MirrorFault::Transport)?;
        }
        self.executor.run(device, &format!("chmod 777 {remote_binary}"));
        shared.set(MirrorState::BinaryStaged);

        let size = self.executor.screen_size(device);
        if parse_dimensions(&size).is_none() {
            return Err(MirrorFault::Transport(AppError::transport(
                format!("screen size of {} unknown", device.serial),
                trace_id,
            )));
        }
        let command = plan.launch_command(&size, request.mode, request.rotation);
        info!(trace_id = %trace_id, serial = %device.serial, profile = %profile, command = %command, "launching capture server");
        shared.set(MirrorState::Launching);

        let launch = cancel.child();
        let mut observer = CaptureOutputObserver::launching();
        let mut on_line = |line: &str| {
            info!(trace_id = %trace_id, serial = %device.serial, "{line}");
            match observer.observe(line) {
                Some(MirrorState::Ready) => shared.set(MirrorState::Ready),
                Some(MirrorState::Incompatible) => {
                    warn!(trace_id = %trace_id, serial = %device.serial, profile = %profile, "capture binary incompatible");
                    shared.set(MirrorState::Incompatible);
                    launch.cancel();
                }
                _ => {}
            }
        };
        let launched = self
            .executor
            .bridge()
            .execute_shell_streaming(&device.serial, &command, &launch, &mut on_line);
        if observer.state() == MirrorState::Incompatible {
            return Err(MirrorFault::Incompatible);
        }
        launched.map_err(MirrorFault::Transport)?;
        info!(trace_id = %trace_id, serial = %device.serial, profile = %profile, "capture server stopped");
        Ok(profile.to_string())
    }
}
