use std::sync::Arc;

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::executor::BridgeExecutor;
use crate::app::automation::AutomationBootstrap;
use crate::app::config::AgentConfig;
use crate::app::mirror::MirrorSession;
use crate::app::registry::{PortRegistry, ProcessRegistry};
use crate::app::scheduler::TaskScheduler;
use crate::app::supervisor::ProcessSupervisor;
use crate::app::viewer::ViewerSessionTable;

/// Owner of the registries and of every session component built on them. One per agent process;
/// tests build their own.
pub struct AgentState {
    pub config: AgentConfig,
    pub ports: Arc<PortRegistry>,
    pub processes: Arc<ProcessRegistry>,
    pub viewers: Arc<ViewerSessionTable>,
    pub executor: Arc<BridgeExecutor>,
    pub mirror: Arc<MirrorSession>,
    pub supervisor: ProcessSupervisor,
    pub automation: AutomationBootstrap,
}

impl AgentState {
    pub fn new(config: AgentConfig, bridge: Arc<dyn DeviceBridge>) -> Self {
        let ports = Arc::new(PortRegistry::new());
        let processes = Arc::new(ProcessRegistry::new());
        let scheduler = Arc::new(TaskScheduler::new(config.scheduler.worker_limit));
        let executor = Arc::new(BridgeExecutor::new(bridge, Arc::clone(&ports), scheduler));
        let mirror = Arc::new(MirrorSession::new(
            Arc::clone(&executor),
            &config.artifacts.capture_root,
        ));
        let supervisor = ProcessSupervisor::new(Arc::clone(&processes), &config.supervisor, &config.artifacts);
        let automation = AutomationBootstrap::new(
            Arc::clone(&executor),
            config.artifacts.clone(),
            config.readiness.clone(),
        );
        Self {
            config,
            ports,
            processes,
            viewers: Arc::new(ViewerSessionTable::new()),
            executor,
            mirror,
            supervisor,
            automation,
        }
    }
}
