// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wires the broker's components together and owns the long-lived threads:
//! the resource-manager worker and the response sink. The command source
//! (client accept loop) is driven separately by whatever connection factory
//! the caller supplies, per spec.md's "treated as opaque" framing; `run` is
//! the one place that picks a concrete factory, gated behind
//! `reference-io`.

use std::sync::Arc;
#[cfg(feature = "reference-io")]
use std::thread;

use anyhow::anyhow;
#[cfg(feature = "reference-io")]
use anyhow::Context;
#[cfg(feature = "reference-io")]
use crossbeam_channel::bounded;
use tracing::{info, instrument};

#[cfg(feature = "reference-io")]
use crate::command::{ResponseItem, WorkItem};
use crate::config::Config;
use crate::connection_manager::ConnectionManager;
use crate::consts;
use crate::device::DeviceProxy;
use crate::resource_manager::ResourceManager;
use crate::session_registry::SessionRegistry;
use crate::transport::Transport;

pub struct Server {
    pub connections: Arc<ConnectionManager>,
    pub resource_manager: Arc<ResourceManager>,
}

impl Server {
    /// Bring up the device, query its one-time command-attrs table, and
    /// construct the process-wide connection manager, session registry,
    /// and resource manager. Does not spawn any threads yet; call `spawn`
    /// to start the worker and sink.
    #[instrument(skip_all)]
    pub fn new(transport: Box<dyn Transport + Send>, config: &Config) -> anyhow::Result<Server> {
        let device = Arc::new(DeviceProxy::new(transport));
        device.startup().map_err(|e| anyhow!("device startup failed: {:?}", e))?;

        if config.flush_all_on_start() {
            info!("flush_all_on_start set, sweeping transient handle range before serving");
            device
                .flush_range(
                    consts::TRANSIENT_VIRTUAL_BASE,
                    consts::TRANSIENT_VIRTUAL_BASE + consts::STARTUP_FLUSH_SPAN,
                )
                .map_err(|e| anyhow!("startup flush sweep failed: {:?}", e))?;
        }

        let attrs = device.get_command_attrs().map_err(|e| anyhow!("querying command attrs: {:?}", e))?;

        let device_transient_capacity = device
            .get_property_u32(consts::TPM2_PT_HR_TRANSIENT_AVAIL)
            .unwrap_or_else(|e| {
                info!(
                    error = ?e,
                    "device did not report TPM2_PT_HR_TRANSIENT_AVAIL, falling back to a conservative default"
                );
                consts::STARTUP_FLUSH_SPAN
            }) as usize;

        let connections = Arc::new(ConnectionManager::new(config.max_connections()));
        let sessions =
            Arc::new(SessionRegistry::new(config.max_active_sessions(), config.max_abandoned_sessions()));

        let resource_manager = Arc::new(ResourceManager::new(
            device,
            attrs,
            connections.clone(),
            sessions,
            device_transient_capacity,
            config.fail_on_loaded_transients(),
        ));

        Ok(Server { connections, resource_manager })
    }

    /// Spawn the resource-manager worker and response-sink threads, wired
    /// together by the two bounded queues spec.md §5 describes. Returns the
    /// sender the command source should push `WorkItem`s onto and the join
    /// handles for both threads.
    #[cfg(feature = "reference-io")]
    pub fn spawn(&self) -> (crossbeam_channel::Sender<WorkItem>, Vec<thread::JoinHandle<()>>) {
        let (work_tx, work_rx) = bounded::<WorkItem>(consts::COMMAND_QUEUE_DEPTH);
        let (resp_tx, resp_rx) = bounded::<ResponseItem>(consts::RESPONSE_QUEUE_DEPTH);

        let rm = self.resource_manager.clone();
        let worker = thread::spawn(move || rm.run(work_rx, resp_tx));

        let sink = thread::spawn(move || crate::reference_io::sink(resp_rx));

        (work_tx, vec![worker, sink])
    }
}

/// Bring up a `Server` against the reference TCP transport and serve
/// client connections on a Unix domain socket forever. The one concrete
/// wiring of both sides of the broker's "opaque collaborator" contract,
/// gated behind `reference-io` so the core broker crate stays agnostic to
/// either.
#[cfg(feature = "reference-io")]
#[instrument(skip_all)]
pub fn run(config: Config) -> anyhow::Result<()> {
    let device_address = config
        .device_address()
        .ok_or_else(|| anyhow!("device_address must be set in config when built with reference-io"))?;
    let socket_path = config
        .socket_path()
        .ok_or_else(|| anyhow!("socket_path must be set in config when built with reference-io"))?;

    info!(device_address, socket_path, "starting tabrmd");

    let transport = Box::new(
        crate::reference_io::TcpTransport::connect(&device_address)
            .map_err(|e| anyhow!("connecting to device simulator at {}: {:?}", device_address, e))?,
    );

    let server = Server::new(transport, &config)?;
    let (work_tx, workers) = server.spawn();

    let (cleanup_socket, listener) = match super::systemd::activation_socket() {
        Ok(l) => {
            info!("using systemd activation socket");
            (None, l)
        }
        Err(e) => {
            info!(error = ?e, "no systemd activation socket, binding directly");
            if std::path::Path::new(&socket_path).exists() {
                std::fs::remove_file(&socket_path).context("removing stale socket")?;
            }
            let listener =
                std::os::unix::net::UnixListener::bind(&socket_path).context("binding client socket")?;
            (Some(socket_path.clone()), listener)
        }
    };

    super::signals::Handler::new(cleanup_socket.clone().map(Into::into), work_tx.clone()).spawn()?;

    crate::reference_io::serve(
        listener,
        server.connections.clone(),
        config.max_transient_per_connection(),
        consts::TRANSIENT_VIRTUAL_BASE,
        work_tx,
    )?;

    for worker in workers {
        let _ = worker.join();
    }

    if let Some(sock) = cleanup_socket {
        std::fs::remove_file(sock).context("cleaning up socket on exit")?;
    } else {
        info!("systemd manages the socket, so not cleaning it up");
    }

    Ok(())
}
