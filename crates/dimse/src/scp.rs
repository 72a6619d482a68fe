//! C-STORE listener (Service Class Provider) receiving C-MOVE pushes
//!
//! The listener runs DCMTK `storescp` on the configured port. Only one
//! listener may be running per `{aet}@{bind_addr}:{port}` in this process;
//! a second start is rejected instead of queued.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::DimseConfig;
use crate::{DimseError, Result};

/// Registry of started listeners to prevent duplicate binds
/// Key format: "{local_aet}@{bind_addr}:{port}"
static STARTED_SCP: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// A local listener accepting C-STORE sub-operations
#[async_trait]
pub trait StoreListener: Send + Sync {
    /// Whether the listener currently accepts associations
    fn is_running(&self) -> bool;

    /// Directory receiving stored instances
    fn storage_dir(&self) -> &Path;

    /// Start listening; fails with [`DimseError::AlreadyRunning`] when running
    async fn start(&self) -> Result<()>;

    /// Stop listening; stopping a stopped listener is a no-op
    async fn stop(&self) -> Result<()>;
}

/// `storescp`-backed listener
pub struct StoreScp {
    config: DimseConfig,
    storage_dir: PathBuf,
    running: AtomicBool,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl StoreScp {
    /// Create a listener storing into `storage_dir`
    pub fn new(config: DimseConfig, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            storage_dir: storage_dir.into(),
            running: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(None),
        }
    }

    fn registry_key(&self) -> String {
        format!(
            "{}@{}:{}",
            self.config.local_aet, self.config.bind_addr, self.config.port
        )
    }

    fn register_scp(key: String) -> bool {
        let mut guard = match STARTED_SCP.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(key)
    }

    fn unregister_scp(key: &str) {
        let mut guard = match STARTED_SCP.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(key);
    }

    /// Address probed to learn that the listener accepts connections
    fn probe_addr(&self) -> SocketAddr {
        let ip = if self.config.bind_addr.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.config.bind_addr
        };
        SocketAddr::new(ip, self.config.port)
    }

    async fn wait_until_accepting(&self, child: &mut Child) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.accept_timeout();
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(DimseError::operation_failed(format!(
                    "storescp exited during startup: {:?}",
                    status.code()
                )));
            }
            if tokio::net::TcpStream::connect(self.probe_addr()).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DimseError::Timeout(format!(
                    "listener on port {} not accepting after {:?}",
                    self.config.port,
                    self.config.accept_timeout()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl StoreListener for StoreScp {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    async fn start(&self) -> Result<()> {
        let key = self.registry_key();
        if self.is_running() || !Self::register_scp(key.clone()) {
            return Err(DimseError::AlreadyRunning(key));
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.storage_dir).await {
            Self::unregister_scp(&key);
            return Err(e.into());
        }

        let mut cmd = Command::new("storescp");
        cmd.arg("-aet")
            .arg(&self.config.local_aet)
            .arg("-od")
            .arg(&self.storage_dir)
            .arg("-ta")
            .arg(self.config.accept_timeout().as_secs().max(1).to_string())
            .arg("-td")
            .arg(self.config.dimse_timeout().as_secs().max(1).to_string())
            .arg(self.config.port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        debug!(
            "Running: storescp -aet {} -od {:?} {}",
            self.config.local_aet, self.storage_dir, self.config.port
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                Self::unregister_scp(&key);
                return Err(DimseError::operation_failed(format!(
                    "Failed to spawn storescp: {}",
                    e
                )));
            }
        };

        if let Err(e) = self.wait_until_accepting(&mut child).await {
            let _ = child.kill().await;
            Self::unregister_scp(&key);
            return Err(e);
        }

        *self.child.lock().await = Some(child);
        self.running.store(true, Ordering::SeqCst);
        info!("C-STORE listener started ({})", key);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let key = self.registry_key();
        let child = self.child.lock().await.take();
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop storescp ({}): {}", key, e);
            }
            Self::unregister_scp(&key);
            info!("C-STORE listener stopped ({})", key);
        }
        Ok(())
    }
}

impl Drop for StoreScp {
    fn drop(&mut self) {
        // the child itself is killed on drop
        if self.running.load(Ordering::SeqCst) {
            Self::unregister_scp(&self.registry_key());
        }
    }
}
