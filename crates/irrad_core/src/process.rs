//! The generic process skeleton every node runs.
//!
//! [`ProcessCore::bind`] claims the four channel ports, handles a possible
//! orphaned previous instance and writes the discovery descriptor.
//! [`ProcessCore::run`] then spawns the channel workers around a
//! [`RoleHandler`] and supervises them until the stop token fires, removing
//! the descriptor on the way out.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use irrad_types::{ChannelKind, ProcessDescriptor};

use crate::config::{CoreConfig, OrphanPolicy};
use crate::descriptor::{self, DescriptorFile};
use crate::dispatch;
use crate::error::{CoreError, CoreResult};
use crate::fanout::{fanout_channel, FanoutEndpoint, Publisher};
use crate::net::bind_in_range;
use crate::role::RoleHandler;
use crate::signals;
use crate::stream;

pub struct ProcessCore {
    config: CoreConfig,
    token: CancellationToken,
    busy: Arc<AtomicBool>,
    descriptor: DescriptorFile,
    ports: BTreeMap<ChannelKind, u16>,
    cmd_listener: TcpListener,
    log: (Publisher, FanoutEndpoint),
    data: (Publisher, FanoutEndpoint),
    event: (Publisher, FanoutEndpoint),
}

impl ProcessCore {
    /// Bind all four channels and announce the process on this host.
    pub async fn bind(config: CoreConfig) -> CoreResult<Self> {
        let token = CancellationToken::new();
        signals::spawn_signal_listener(token.clone())?;

        let descriptor = DescriptorFile::new(config.descriptor_path());
        if let Some(pid) = descriptor.check_orphan() {
            match config.orphan_policy {
                OrphanPolicy::Refuse => {
                    return Err(CoreError::OrphanAlive {
                        name: config.name.clone(),
                        pid,
                    });
                }
                OrphanPolicy::Kill => {
                    warn!(pid, "terminating orphaned previous instance");
                    descriptor::terminate_process(pid)?;
                }
                OrphanPolicy::Ignore => {
                    warn!(pid, "previous instance still alive, starting anyway");
                }
            }
        }

        let mut ports = BTreeMap::new();
        let mut bind = |kind: ChannelKind, listener_port: (TcpListener, u16)| {
            ports.insert(kind, listener_port.1);
            (listener_port.0, listener_port.1)
        };
        let (cmd_listener, _) = bind(
            ChannelKind::Cmd,
            bind_in_range(config.min_port, config.max_port, config.max_bind_tries).await?,
        );
        let (log_listener, log_port) = bind(
            ChannelKind::Log,
            bind_in_range(config.min_port, config.max_port, config.max_bind_tries).await?,
        );
        let (data_listener, data_port) = bind(
            ChannelKind::Data,
            bind_in_range(config.min_port, config.max_port, config.max_bind_tries).await?,
        );
        let (event_listener, event_port) = bind(
            ChannelKind::Event,
            bind_in_range(config.min_port, config.max_port, config.max_bind_tries).await?,
        );

        descriptor.write(&ProcessDescriptor {
            pid: std::process::id(),
            name: config.name.clone(),
            ports: ports.clone(),
        })?;
        info!(name = %config.name, ?ports, "process channels bound");

        let hwm = config.hwm;
        Ok(Self {
            log: fanout_channel(ChannelKind::Log, log_listener, log_port, hwm),
            data: fanout_channel(ChannelKind::Data, data_listener, data_port, hwm),
            event: fanout_channel(ChannelKind::Event, event_listener, event_port, hwm),
            busy: Arc::new(AtomicBool::new(false)),
            token,
            descriptor,
            ports,
            cmd_listener,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn ports(&self) -> &BTreeMap<ChannelKind, u16> {
        &self.ports
    }

    pub fn port(&self, kind: ChannelKind) -> Option<u16> {
        self.ports.get(&kind).copied()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Shared flag that is set while a command is being handled. Role
    /// handlers running autonomous operations can consult it.
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }

    pub fn log_publisher(&self) -> Publisher {
        self.log.0.clone()
    }

    pub fn data_publisher(&self) -> Publisher {
        self.data.0.clone()
    }

    pub fn event_publisher(&self) -> Publisher {
        self.event.0.clone()
    }

    /// Run the process to completion.
    ///
    /// Spawns the command dispatcher, the three publish bridges and the
    /// configured upstream receivers, then acts as the watcher: workers are
    /// reaped as they finish and everything is joined once the stop token
    /// fires. The descriptor is removed and [`RoleHandler::clean_up`] runs
    /// exactly once before returning.
    pub async fn run(self, role: Arc<dyn RoleHandler>) -> CoreResult<()> {
        let Self {
            config,
            token,
            busy,
            descriptor,
            ports: _,
            cmd_listener,
            log: (_log_pub, log_endpoint),
            data: (data_pub, data_endpoint),
            event: (_event_pub, event_endpoint),
        } = self;

        let mut workers: Vec<(&'static str, JoinHandle<CoreResult<()>>)> = vec![
            (
                "command dispatch",
                tokio::spawn(dispatch::serve_commands(
                    cmd_listener,
                    config.name.clone(),
                    busy,
                    role.clone(),
                    token.clone(),
                )),
            ),
            ("log bridge", tokio::spawn(log_endpoint.run(token.clone()))),
            ("data bridge", tokio::spawn(data_endpoint.run(token.clone()))),
            ("event bridge", tokio::spawn(event_endpoint.run(token.clone()))),
        ];

        if !config.upstream_data.is_empty() {
            workers.push((
                "data receiver",
                tokio::spawn(stream::receive_data(
                    config.upstream_data.clone(),
                    role.clone(),
                    data_pub.clone(),
                    config.hwm,
                    token.clone(),
                )),
            ));
        }
        if !config.upstream_events.is_empty() {
            workers.push((
                "event receiver",
                tokio::spawn(stream::receive_events(
                    config.upstream_events.clone(),
                    role.clone(),
                    config.hwm,
                    token.clone(),
                )),
            ));
        }

        info!(name = %config.name, "process running");

        // Watcher loop: reap finished workers until shutdown is requested.
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(config.watch_interval) => {
                    let mut finished = Vec::new();
                    for (i, (_, handle)) in workers.iter().enumerate() {
                        if handle.is_finished() {
                            finished.push(i);
                        }
                    }
                    for i in finished.into_iter().rev() {
                        let (purpose, handle) = workers.remove(i);
                        reap(purpose, handle).await;
                    }
                }
            }
        }

        info!(name = %config.name, "shutting down");
        for (purpose, handle) in workers {
            reap(purpose, handle).await;
        }

        if let Err(e) = descriptor.remove() {
            warn!(error = %e, "could not remove process descriptor");
        }
        role.clean_up().await;
        info!(name = %config.name, "process stopped");
        Ok(())
    }
}

async fn reap(purpose: &str, handle: JoinHandle<CoreResult<()>>) {
    match handle.await {
        Ok(Ok(())) => info!(worker = purpose, "worker finished"),
        Ok(Err(e)) => error!(worker = purpose, error = %e, "worker failed"),
        Err(e) => error!(worker = purpose, error = %e, "worker panicked"),
    }
}
