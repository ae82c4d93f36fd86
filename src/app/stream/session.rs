use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::app::adb::executor::BridgeExecutor;
use crate::app::adb::parse::parse_dimensions;
use crate::app::config::StreamingSettings;
use crate::app::error::AppError;
use crate::app::logging::new_trace_id;
use crate::app::models::{DeviceHandle, ViewerMessage};
use crate::app::registry::ForwardTarget;
use crate::app::stream::reframer::NalReframer;
use crate::app::viewer::{send_message, ViewerChannel, ViewerSessionTable};
use crate::app::worker::{CancelToken, Liveness, WorkerHandle};

pub const VIDEO_SOCKET: &str = "scrcpy";
const READ_CHUNK: usize = 5120;
const QUEUE_RETRY: Duration = Duration::from_millis(5);

pub struct StreamRequest {
    pub device: DeviceHandle,
    pub local_port: u16,
    pub viewer_session_id: String,
}

/// Frames of one streaming session in receive order. Ends once the session has shut down; dropping
/// it stops the session.
pub struct FrameStream {
    frames: Receiver<Bytes>,
    worker: Option<WorkerHandle>,
}

impl FrameStream {
    pub fn stop(&self) {
        if let Some(worker) = &self.worker {
            worker.interrupt();
        }
    }

    /// Stops the session and waits for its cleanup to finish.
    pub fn close(mut self) -> bool {
        self.stop();
        self.worker.take().map(WorkerHandle::join).unwrap_or(true)
    }
}

impl Iterator for FrameStream {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.frames.recv().ok()
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts reading the device video socket for as long as `companion` stays alive.
pub fn start_streaming(
    executor: Arc<BridgeExecutor>,
    viewers: Arc<ViewerSessionTable>,
    settings: &StreamingSettings,
    request: StreamRequest,
    channel: Arc<dyn ViewerChannel>,
    companion: Arc<dyn Liveness>,
) -> Result<FrameStream, AppError> {
    let trace_id = new_trace_id();
    let (sender, frames) = sync_channel(settings.frame_queue_capacity.max(1));
    let read_timeout = Duration::from_millis(settings.read_timeout_ms.max(1));
    viewers.register(&request.viewer_session_id, &request.device.serial);

    let guard = SessionCleanup {
        companion,
        socket: None,
        executor,
        viewers,
        device: request.device.clone(),
        local_port: request.local_port,
        viewer_session_id: request.viewer_session_id,
        trace_id: trace_id.clone(),
    };
    let name = format!("{}-scrcpy-input", request.device.serial);
    let worker = WorkerHandle::spawn(name, CancelToken::new(), move |cancel| {
        run_session(guard, channel.as_ref(), &sender, read_timeout, &cancel);
        drop(sender);
    })
    .map_err(|err| AppError::system(format!("Failed to spawn stream worker: {err}"), &trace_id))?;

    Ok(FrameStream {
        frames,
        worker: Some(worker),
    })
}

fn run_session(
    mut guard: SessionCleanup,
    channel: &dyn ViewerChannel,
    sender: &SyncSender<Bytes>,
    read_timeout: Duration,
    cancel: &CancelToken,
) {
    let target = ForwardTarget::Socket(VIDEO_SOCKET.to_string());
    if !guard.executor.forward(&guard.device, guard.local_port, target) {
        warn!(trace_id = %guard.trace_id, serial = %guard.device.serial, "video forward unavailable");
        return;
    }
    let socket = match TcpStream::connect(("127.0.0.1", guard.local_port)) {
        Ok(socket) => socket,
        Err(err) => {
            warn!(trace_id = %guard.trace_id, port = guard.local_port, error = %err, "failed to connect video socket");
            return;
        }
    };
    if let Err(err) = socket.set_read_timeout(Some(read_timeout)) {
        debug!(trace_id = %guard.trace_id, error = %err, "read timeout not applied");
    }
    let socket = guard.socket.insert(socket);

    let size = guard.executor.screen_size(&guard.device);
    let Some((width, height)) = parse_dimensions(&size) else {
        warn!(trace_id = %guard.trace_id, size = %size, "screen size unknown, closing stream");
        return;
    };
    send_message(channel, &ViewerMessage::Size { width, height });
    info!(trace_id = %guard.trace_id, serial = %guard.device.serial, width, height, "video stream started");

    let companion = Arc::clone(&guard.companion);
    let running = || companion.is_alive() && !cancel.is_cancelled();
    let mut reframer = NalReframer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut delivered = 0u64;
    while running() {
        let frames = match socket.read(&mut chunk) {
            Ok(0) => {
                debug!(trace_id = %guard.trace_id, "video socket reached end of stream");
                let tail = reframer.finish();
                for frame in tail {
                    if deliver(sender, frame, &running) {
                        delivered += 1;
                    }
                }
                break;
            }
            Ok(read) => reframer.push(&chunk[..read]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                continue;
            }
            Err(err) => {
                warn!(trace_id = %guard.trace_id, error = %err, "video socket read failed");
                break;
            }
        };
        for frame in frames {
            if !deliver(sender, frame, &running) {
                info!(trace_id = %guard.trace_id, delivered, "frame consumer gone");
                return;
            }
            delivered += 1;
        }
    }
    info!(trace_id = %guard.trace_id, delivered, "video stream finished");
}

/// Hands `frame` to the bounded queue, waiting for room while the session is still running.
fn deliver(sender: &SyncSender<Bytes>, mut frame: Bytes, running: &dyn Fn() -> bool) -> bool {
    loop {
        match sender.try_send(frame) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(returned)) => {
                if !running() {
                    return false;
                }
                frame = returned;
                std::thread::sleep(QUEUE_RETRY);
            }
        }
    }
}

/// Teardown of one streaming session. Runs on every exit path of the worker, unwinding included,
/// and performs each step regardless of how the previous one went.
struct SessionCleanup {
    companion: Arc<dyn Liveness>,
    socket: Option<TcpStream>,
    executor: Arc<BridgeExecutor>,
    viewers: Arc<ViewerSessionTable>,
    device: DeviceHandle,
    local_port: u16,
    viewer_session_id: String,
    trace_id: String,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        if self.companion.is_alive() {
            self.companion.interrupt();
            info!(trace_id = %self.trace_id, "companion interrupted");
        }
        if let Some(socket) = self.socket.take() {
            match socket.shutdown(Shutdown::Both) {
                Ok(()) => info!(trace_id = %self.trace_id, "video socket closed"),
                Err(err) => debug!(trace_id = %self.trace_id, error = %err, "video socket shutdown failed"),
            }
        }
        self.executor.unforward(
            &self.device,
            self.local_port,
            &ForwardTarget::Socket(VIDEO_SOCKET.to_string()),
        );
        self.viewers.deregister(&self.viewer_session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::bridge::DeviceBridge;
    use crate::app::registry::{forward_name, PortRegistry};
    use crate::app::scheduler::TaskScheduler;
    use crate::app::testing::{BridgeCall, FakeBridge, RecordingChannel};
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeCompanion {
        alive: AtomicBool,
        interrupted: AtomicBool,
    }

    impl FakeCompanion {
        fn alive() -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(true),
                interrupted: AtomicBool::new(false),
            })
        }
    }

    impl Liveness for FakeCompanion {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn interrupt(&self) {
            self.interrupted.store(true, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    fn fixture(bridge: &Arc<FakeBridge>) -> (Arc<BridgeExecutor>, Arc<ViewerSessionTable>) {
        let bridge: Arc<dyn DeviceBridge> = Arc::clone(bridge) as Arc<dyn DeviceBridge>;
        let executor = BridgeExecutor::new(
            bridge,
            Arc::new(PortRegistry::new()),
            Arc::new(TaskScheduler::new(2)),
        );
        (Arc::new(executor), Arc::new(ViewerSessionTable::new()))
    }

    #[test]
    fn announces_size_then_yields_frames_and_cleans_up() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            conn.write_all(&[0x48, 0x30, 0x31, 0x32, 0x33, 0, 0, 0, 1, 0xAA])
                .expect("write");
            conn.flush().expect("flush");
            std::thread::sleep(Duration::from_millis(50));
            conn.write_all(&[0, 0, 0, 1, 0xBB]).expect("write");
        });

        let bridge = Arc::new(FakeBridge::new());
        bridge.respond("wm size", "Physical size: 1080x2340\n");
        let (executor, viewers) = fixture(&bridge);
        let channel = Arc::new(RecordingChannel::default());
        let companion = FakeCompanion::alive();

        let stream = start_streaming(
            Arc::clone(&executor),
            Arc::clone(&viewers),
            &StreamingSettings::default(),
            StreamRequest {
                device: DeviceHandle::new("ABC"),
                local_port: port,
                viewer_session_id: "viewer-1".to_string(),
            },
            channel.clone(),
            companion.clone(),
        )
        .expect("start");

        let frames = stream.collect::<Vec<_>>();
        server.join().expect("server");

        assert_eq!(frames, vec![Bytes::from_static(&[0xAA]), Bytes::from_static(&[0xBB])]);
        assert_eq!(
            channel.messages(),
            vec![serde_json::json!({"msg": "size", "width": 1080, "height": 2340})]
        );
        assert!(companion.interrupted.load(Ordering::SeqCst));
        assert!(bridge.calls().contains(&BridgeCall::Unforward(port)));
        let target = ForwardTarget::Socket(VIDEO_SOCKET.to_string());
        assert!(executor.ports().lookup(&forward_name("ABC", &target)).is_none());
        assert!(viewers.serial_for("viewer-1").is_none());
    }

    #[test]
    fn connect_failure_still_releases_everything() {
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let bridge = Arc::new(FakeBridge::new());
        let (executor, viewers) = fixture(&bridge);
        let companion = FakeCompanion::alive();

        let stream = start_streaming(
            Arc::clone(&executor),
            Arc::clone(&viewers),
            &StreamingSettings::default(),
            StreamRequest {
                device: DeviceHandle::new("ABC"),
                local_port: port,
                viewer_session_id: "viewer-2".to_string(),
            },
            Arc::new(RecordingChannel::default()),
            companion.clone(),
        )
        .expect("start");

        assert!(stream.close());
        assert!(companion.interrupted.load(Ordering::SeqCst));
        assert!(bridge.calls().contains(&BridgeCall::Unforward(port)));
        assert!(executor.ports().is_empty());
        assert!(viewers.serial_for("viewer-2").is_none());
    }

    #[test]
    fn dead_companion_ends_stream_without_frames() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            std::thread::sleep(Duration::from_millis(200));
            let _ = conn.write_all(&[0, 0, 0, 1, 0xCC]);
        });

        let bridge = Arc::new(FakeBridge::new());
        bridge.respond("wm size", "Physical size: 720x1280\n");
        let (executor, viewers) = fixture(&bridge);
        let companion = FakeCompanion::alive();
        companion.alive.store(false, Ordering::SeqCst);

        let stream = start_streaming(
            executor,
            viewers,
            &StreamingSettings::default(),
            StreamRequest {
                device: DeviceHandle::new("ABC"),
                local_port: port,
                viewer_session_id: "viewer-3".to_string(),
            },
            Arc::new(RecordingChannel::default()),
            companion.clone(),
        )
        .expect("start");

        assert_eq!(stream.count(), 0);
        assert!(!companion.interrupted.load(Ordering::SeqCst));
        server.join().expect("server");
    }
}
