//! D-Bus surface of the daemon.
//!
//! A thin binding over [`Manager`]: every method is a one-line delegate,
//! and zbus serialises calls so the manager never sees concurrent access.

use crate::manager::Manager;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use zbus::interface;

pub const BUS_NAME: &str = "evremapper.Manager";
pub const OBJECT_PATH: &str = "/evremapper/Manager";

/// Exit code when another instance already owns the bus name.
pub const EXIT_NAME_TAKEN: i32 = 1;

/// Exit code of `ping` when the service cannot be reached.
pub const EXIT_UNREACHABLE: i32 = 8;

struct ManagerService {
    manager: Manager,
}

#[interface(name = "evremapper.Manager")]
impl ManagerService {
    fn hello(&self, out: String) -> String {
        self.manager.hello(&out)
    }

    fn set_config_dir(&mut self, dir: String) {
        self.manager.set_config_dir(Path::new(&dir));
    }

    // inject and autoload sleep for device settling and reap a replaced
    // injector's child; block_in_place keeps that off the runtime's
    // async workers.
    fn inject_device(&mut self, device_key: String, preset_name: String) -> bool {
        tokio::task::block_in_place(|| self.manager.inject(&device_key, &preset_name))
    }

    fn stop_inject_device(&mut self, device_key: String) {
        self.manager.stop_inject(&device_key);
    }

    fn autoload(&mut self) -> bool {
        tokio::task::block_in_place(|| self.manager.autoload())
    }

    fn autoload_single(&mut self, device_key: String) {
        tokio::task::block_in_place(|| self.manager.autoload_single(&device_key));
    }

    fn stop_all(&mut self) {
        self.manager.stop_all();
    }

    fn get_state(&mut self, device_key: String) -> i32 {
        self.manager.get_state(&device_key)
    }
}

/// Publish the manager on the system bus and serve until SIGINT/SIGTERM.
/// Returns the process exit code.
pub async fn run(config_dir: Option<PathBuf>) -> Result<i32> {
    let mut manager = Manager::new();
    if let Some(dir) = config_dir {
        manager.set_config_dir(&dir);
    }

    let builder = zbus::connection::Builder::system()
        .context("failed to connect to the system bus")?
        .name(BUS_NAME)
        .context("invalid bus name")?
        .serve_at(OBJECT_PATH, ManagerService { manager })
        .context("invalid object path")?;

    let connection = match builder.build().await {
        Ok(connection) => connection,
        Err(zbus::Error::NameTaken) => {
            error!("service already running?");
            return Ok(EXIT_NAME_TAKEN);
        }
        Err(err) => return Err(err).context("failed to publish on the system bus"),
    };
    info!("published \"{BUS_NAME}\" on the system bus");

    wait_for_shutdown().await?;

    // Close every injection before the bus connection goes away.
    let iface = connection
        .object_server()
        .interface::<_, ManagerService>(OBJECT_PATH)
        .await
        .context("service interface disappeared")?;
    iface.get_mut().await.manager.stop_all();

    Ok(0)
}

async fn wait_for_shutdown() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = term.recv() => info!("received SIGTERM, shutting down"),
    }
    Ok(())
}

/// Call `hello` on a running service. Returns the process exit code.
pub async fn ping() -> Result<i32> {
    match try_hello().await {
        Ok(reply) => {
            info!("service responded: {reply}");
            Ok(0)
        }
        Err(err) => {
            error!("cannot reach the service: {err:#}");
            Ok(EXIT_UNREACHABLE)
        }
    }
}

async fn try_hello() -> Result<String> {
    let connection = zbus::Connection::system()
        .await
        .context("failed to connect to the system bus")?;
    let proxy = zbus::Proxy::new(&connection, BUS_NAME, OBJECT_PATH, BUS_NAME)
        .await
        .context("failed to create proxy")?;
    let reply: String = proxy
        .call("Hello", &("ping",))
        .await
        .context("hello call failed")?;
    Ok(reply)
}
