//! Shared daemon state
//!
//! One [`DaemonContext`] is built at startup and handed, behind an `Arc`, to
//! every task: device readers, the scheduler loop, the control loop and the
//! IPC server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use nostromo_config::Config;
use tokio::sync::{mpsc, watch};

use crate::control::ControlCommand;
use crate::device::{self, DeviceInfo};
use crate::dispatcher::Dispatcher;
use crate::injector::{Injector, LedIndicator};
use crate::ipc::{DaemonStatus, DeviceStatus};
use crate::mode::ModeController;
use crate::remote::RemoteLink;
use crate::resolver::{KeyMapResolver, ModifierCodes};
use crate::scheduler::Scheduler;

/// Depth of the control command queue.
const COMMAND_QUEUE: usize = 32;

pub struct DaemonContext {
    pub config_path: PathBuf,
    pub scheduler: Arc<Scheduler>,
    pub resolver: Arc<KeyMapResolver>,
    pub dispatcher: Arc<Dispatcher>,
    pub link: Arc<RemoteLink>,
    pub leds: Arc<LedIndicator>,
    pub commands: mpsc::Sender<ControlCommand>,
    pub shutdown: watch::Sender<bool>,
    /// Devices with a running reader, by node path.
    readers: Mutex<HashMap<PathBuf, DeviceInfo>>,
}

impl DaemonContext {
    /// Wire up the core around a loaded configuration.
    ///
    /// Returns the context and the receiving end of its command channel,
    /// which belongs to the control loop.
    pub fn new(
        config_path: PathBuf,
        config: Config,
        injector: Arc<dyn Injector>,
        leds: Arc<LedIndicator>,
    ) -> (Arc<Self>, mpsc::Receiver<ControlCommand>) {
        let scheduler = Arc::new(Scheduler::new());
        let modes = ModeController::new(config.global.start_mode, leds.clone());
        let resolver = Arc::new(KeyMapResolver::new(
            config,
            modes,
            scheduler.clone(),
            ModifierCodes::from_injector(injector.as_ref()),
        ));
        let link = Arc::new(RemoteLink::new());
        let dispatcher = Arc::new(Dispatcher::new(injector, link.clone(), resolver.clone()));
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);
        let (shutdown, _) = watch::channel(false);

        let ctx = Arc::new(Self {
            config_path,
            scheduler,
            resolver,
            dispatcher,
            link,
            leds,
            commands,
            shutdown,
            readers: Mutex::new(HashMap::new()),
        });

        (ctx, receiver)
    }

    fn readers(&self) -> MutexGuard<'_, HashMap<PathBuf, DeviceInfo>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Ask every task to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run_scheduler(self: Arc<Self>) {
        let dispatcher = self.dispatcher.clone();
        self.scheduler
            .run(
                |action| {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.dispatch(action).await }
                },
                self.shutdown.subscribe(),
            )
            .await;
    }

    /// Re-read the keymap file and swap it in.
    ///
    /// Returns whether the network settings changed.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse. The current
    /// keymap stays active.
    pub fn reload_config(&self) -> Result<bool> {
        let config = nostromo_config::parse_config(&self.config_path).with_context(|| {
            format!("Failed to reload keymap from {}", self.config_path.display())
        })?;
        let previous = self.resolver.swap_config(config);
        Ok(self.resolver.with_config(|current| current.network_changed(&previous)))
    }

    /// Open and start readers for any Nostromo nodes not already being read.
    ///
    /// Returns how many new readers were started.
    ///
    /// # Errors
    ///
    /// Fails only if `/dev/input` cannot be listed. Nodes that fail to open
    /// or grab are logged and skipped.
    pub fn rescan_devices(self: &Arc<Self>) -> Result<usize> {
        let found = device::enumerate_devices()?;
        let mut started = 0;

        for info in found {
            if self.readers().contains_key(&info.path) {
                continue;
            }

            if info.has_leds && !self.leds.is_attached() {
                match self.leds.attach(&info.path) {
                    Ok(()) => self.resolver.sync_indicator(),
                    Err(e) => tracing::warn!("{:#}", e),
                }
            }

            let device = match device::open_and_grab(&info) {
                Ok(device) => device,
                Err(e) => {
                    tracing::warn!("{:#}", e);
                    continue;
                }
            };

            self.readers().insert(info.path.clone(), info.clone());
            self.spawn_reader(device, info);
            started += 1;
        }

        if self.readers().is_empty() {
            tracing::warn!("No Nostromo devices found");
        }

        Ok(started)
    }

    fn spawn_reader(self: &Arc<Self>, device: evdev::Device, info: DeviceInfo) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let path = info.path.clone();
            let result = device::run_reader(
                device,
                info,
                ctx.resolver.clone(),
                ctx.shutdown.subscribe(),
            )
            .await;

            if let Err(e) = result {
                tracing::warn!("Device reader stopped: {:#}", e);
            }
            ctx.readers().remove(&path);
            ctx.leds.detach(&path);
        });
    }

    /// Snapshot for `status` requests.
    pub fn status(&self) -> DaemonStatus {
        let modes = self.resolver.mode_status();
        let (config, model) = self.resolver.with_config(|c| {
            c.active()
                .map(|m| (m.name.clone(), m.model.to_string()))
                .unwrap_or_default()
        });

        let mut devices: Vec<DeviceStatus> = self
            .readers()
            .values()
            .map(|info| DeviceStatus {
                name: info.name.clone(),
                path: info.path.clone(),
                model: info.model.to_string(),
                leds: info.has_leds,
            })
            .collect();
        devices.sort_by(|a, b| a.path.cmp(&b.path));

        DaemonStatus {
            mode: modes.current,
            previous_mode: modes.previous,
            remote_connected: self.link.is_connected(),
            pending_actions: self.scheduler.len(),
            config,
            model,
            devices,
        }
    }
}
