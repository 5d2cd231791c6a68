//! Wires the tasks of a running integration together.
//!
//! ```text
//! host WebSocket ─► ws_server ─► EntityAdapter ─► dispatcher ─► DeviceLink
//!                       ▲             ▲   │                         ▲
//!                       └─ outbound ──┘   └─ control ─► Supervisor ─┘
//!                                              events ◄─┘
//! ```
//!
//! [`start`] binds the host listener and spawns the supervisor, the command
//! dispatcher, the entity adapter and the accept loop.  The returned
//! [`BridgeHandle`] stops them again.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::application::adapter::{ConfigSink, EntityAdapter};
use crate::application::dispatcher::run_dispatcher;
use crate::application::supervisor::{Supervisor, SupervisorControl, SupervisorSettings};
use crate::domain::config::BridgeConfig;
use crate::infrastructure::device_session::TcpConnector;
use crate::infrastructure::ws_server::run_server;

const COMMAND_QUEUE_CAPACITY: usize = 32;
const ADAPTER_QUEUE_CAPACITY: usize = 256;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Handle to the running tasks.
pub struct BridgeHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    control: mpsc::Sender<SupervisorControl>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Binds `config.ws_bind_addr` and starts every task.
///
/// # Errors
///
/// Returns an error if the WebSocket listener cannot be bound.
pub async fn start(config: BridgeConfig, sink: Box<dyn ConfigSink>) -> anyhow::Result<BridgeHandle> {
    let listener = TcpListener::bind(config.ws_bind_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind WebSocket listener on {}",
                config.ws_bind_addr
            )
        })?;
    let local_addr = listener
        .local_addr()
        .context("failed to read the bound WebSocket address")?;

    let connector = Arc::new(TcpConnector::new(
        config.connect_timeout,
        config.command_timeout,
    ));
    let (supervisor, channels) = Supervisor::new(
        connector,
        config.device.as_ref().map(|d| d.address()),
        SupervisorSettings::from(&config),
    );

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (requests_tx, requests_rx) = mpsc::channel(ADAPTER_QUEUE_CAPACITY);
    let adapter = EntityAdapter::new(
        config.device.clone(),
        config.grace_period,
        commands_tx,
        channels.control.clone(),
        sink,
    );
    let running = Arc::new(AtomicBool::new(true));

    let tasks = vec![
        ("supervisor", tokio::spawn(supervisor.run())),
        (
            "dispatcher",
            tokio::spawn(run_dispatcher(commands_rx, channels.link)),
        ),
        (
            "adapter",
            tokio::spawn(adapter.run(requests_rx, channels.events)),
        ),
        (
            "ws_server",
            tokio::spawn(run_server(
                listener,
                requests_tx,
                config.host_queue_capacity,
                Arc::clone(&running),
            )),
        ),
    ];

    info!("integration started on ws://{local_addr}");
    Ok(BridgeHandle {
        local_addr,
        running,
        control: channels.control,
        tasks,
    })
}

impl BridgeHandle {
    /// The address the WebSocket server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared shutdown flag, cleared by [`shutdown`](Self::shutdown).
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Stops accepting hosts, closes the device session and waits for the
    /// tasks to finish.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::Relaxed);
        // The supervisor is gone already if it failed; nothing to stop then.
        let _ = self.control.send(SupervisorControl::Shutdown).await;
        drop(self.control);

        for (name, task) in self.tasks {
            match timeout(SHUTDOWN_WAIT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{name} task failed: {e}"),
                Err(_) => warn!("{name} task did not stop within {SHUTDOWN_WAIT:?}"),
            }
        }
        info!("integration stopped");
    }
}
