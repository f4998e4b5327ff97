/// Seam to the management protocol layer
///
/// The bootstrap core never interprets application payloads; it hands them to
/// a host and writes back whatever the host answers.
use crate::config::loader::DaemonConfig;
use crate::config::types::{RestartPolicy, Result};
use crate::core::control_loop::{run_protocol, ServeContext, ServeExit};
use log::{debug, info};
use std::path::PathBuf;

pub trait ManagementHost {
    fn initialize_network(&mut self) -> Result<()> {
        Ok(())
    }

    /// Establish the external (WS-Management) listener.
    fn listen_wsman(&mut self) -> Result<()> {
        Ok(())
    }

    /// Application payload received on `slot`; the return value is sent back.
    fn handle_message(&mut self, slot: usize, payload: &[u8]) -> Option<Vec<u8>> {
        let _ = (slot, payload);
        None
    }

    fn reload_config(&mut self) -> Result<()> {
        Ok(())
    }

    /// Reload protocol dispatch while keeping providers loaded.
    fn reload_dispatcher(&mut self) -> Result<()> {
        Ok(())
    }

    /// Restart policy picked up by the last reload; applied from the next
    /// restart on.
    fn restart_policy(&self) -> Option<RestartPolicy> {
        None
    }

    /// Serve until terminated or a restart is needed.
    fn run_protocol(&mut self, ctx: &mut ServeContext<'_>) -> Result<ServeExit> {
        run_protocol(self, ctx)
    }
}

/// Host used by the shipped binaries: logs payloads, answers nothing, and
/// re-reads the config file on SIGHUP.
#[derive(Debug, Default)]
pub struct LoggingHost {
    config_file: Option<PathBuf>,
    restart: Option<RestartPolicy>,
    pub reloads: u32,
    pub dispatcher_reloads: u32,
}

impl LoggingHost {
    pub fn with_config_file(path: impl Into<PathBuf>) -> Self {
        Self {
            config_file: Some(path.into()),
            ..Self::default()
        }
    }
}

impl ManagementHost for LoggingHost {
    fn handle_message(&mut self, slot: usize, payload: &[u8]) -> Option<Vec<u8>> {
        debug!("Slot {}: {} byte payload", slot, payload.len());
        None
    }

    fn reload_config(&mut self) -> Result<()> {
        self.reloads += 1;
        let path = match &self.config_file {
            Some(path) => path,
            None => {
                info!("Configuration reload requested; no config file to re-read");
                return Ok(());
            }
        };

        let config = DaemonConfig::load(path)?;
        if self.restart.as_ref() != Some(&config.restart) {
            info!("Restart policy now {:?}", config.restart);
        }
        self.restart = Some(config.restart);
        info!("Configuration reloaded from {}", path.display());
        Ok(())
    }

    fn reload_dispatcher(&mut self) -> Result<()> {
        self.dispatcher_reloads += 1;
        info!("Dispatcher reload requested ({})", self.dispatcher_reloads);
        Ok(())
    }

    fn restart_policy(&self) -> Option<RestartPolicy> {
        self.restart.clone()
    }
}
