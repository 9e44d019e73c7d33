//! platform.rs - what the device runs, and the OS update it can be asked to do

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tokio::process::Command;

/// Static runtime/platform descriptors for the reported state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub runtime_version: String,
    pub platform_version: String,
}

impl PlatformInfo {
    pub fn detect() -> Self {
        let name = System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
        let kernel = System::kernel_version().unwrap_or_else(|| "unknown".to_string());
        let mut platform_version = format!("{}-{}-{}", name, kernel, std::env::consts::ARCH);
        if let Some(os) = System::os_version() {
            platform_version.push_str("-with-");
            platform_version.push_str(&os);
        }
        Self {
            runtime_version: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            platform_version,
        }
    }
}

/// Runs the configured OS update commands in the background, one run at a time.
#[derive(Clone)]
pub struct Updater {
    commands: Arc<Vec<Vec<String>>>,
    running: Arc<AtomicBool>,
}

impl Updater {
    pub fn new(commands: Vec<Vec<String>>) -> Self {
        Self {
            commands: Arc::new(commands),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start an update unless one is already in progress. Returns whether
    /// a new run was started. Never waits for the commands.
    pub fn trigger(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("update already running, request ignored");
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.run_all().await;
            this.running.store(false, Ordering::SeqCst);
        });
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run_all(&self) {
        tracing::info!("Updating device operating system");
        for argv in self.commands.iter() {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            match Command::new(program).args(args).status().await {
                Ok(status) if status.success() => {
                    tracing::info!(command = %argv.join(" "), "update step finished");
                }
                Ok(status) => {
                    // apt keeps going after a failed update, so do we
                    tracing::warn!(command = %argv.join(" "), %status, "update step failed");
                }
                Err(e) => {
                    tracing::error!(command = %argv.join(" "), "update step could not start: {}", e);
                }
            }
        }
        tracing::info!("device update finished");
    }
}
