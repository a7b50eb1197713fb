//! Shared fixtures: a scripted runtime, an in-memory transport and the
//! executor wired to both.

#![allow(dead_code)]

use std::sync::Arc;

use cancelable_worker::channel::{ChannelRouter, InMemoryTransport};
use cancelable_worker::runtime::{ScriptedRuntime, ScriptedWorkload};
use cancelable_worker::TaskExecutor;

pub struct Harness {
    pub runtime: Arc<ScriptedRuntime>,
    pub transport: Arc<InMemoryTransport>,
    pub router: Arc<ChannelRouter>,
    pub executor: Arc<TaskExecutor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_default(ScriptedWorkload::default())
    }

    pub fn with_default(workload: ScriptedWorkload) -> Self {
        let (transport, inbound) = InMemoryTransport::new();
        let transport = Arc::new(transport);
        let router = ChannelRouter::spawn(transport.clone(), inbound);
        let runtime = Arc::new(ScriptedRuntime::with_default(workload));
        let executor = Arc::new(TaskExecutor::new(runtime.clone(), router.clone()));
        Self {
            runtime,
            transport,
            router,
            executor,
        }
    }

    pub fn script(&self, task_id: &str, workload: ScriptedWorkload) {
        self.runtime.script(task_id, workload);
    }
}
