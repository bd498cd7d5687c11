//! Wi-Fi setup for the Guacamayo appliance console, driving ConnMan over D-Bus.
//!
//! The entry point is [`setup_wifi`], which registers a ConnMan agent, lists the wireless services
//! ConnMan knows about, lets the operator pick one and connects to it, prompting for credentials
//! when ConnMan asks for them.

pub mod agent;
pub mod config;
pub mod connect;
pub mod console;
pub mod directory;
pub mod driver;
mod error;
mod manager;

pub use config::Config;
pub use driver::{setup_wifi, Interrupter, Outcome, Workflow};
pub use error::{Error, Result};
pub use manager::{Manager, ServiceEntry};

use std::{future::Future, pin::pin, time::Duration};

use async_io::Timer;
use futures_util::future::{select, Either};
use zbus::Connection;

/// Object path the agent is served at.
pub const AGENT_PATH: &str = "/org/GuacamayoProject/ConnmanAgent";

/// Well-known bus name owned while the agent is registered.
pub const AGENT_NAME: &str = "org.guacamayo-project.ConnmanAgent";

/// A cloneable handle to a D-Bus connection.
///
/// This type is used to construct various objects in this library.
#[derive(Clone)]
pub struct Session {
    conn: Connection,
}

impl Session {
    /// Connects to the system bus.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            conn: Connection::system().await.map_err(Error::from)?,
        })
    }

    /// Tries to become the primary owner of the well-known bus `name`.
    ///
    /// This is best-effort: failure is logged and reported as `false`, since anything that
    /// actually depends on the name will fail on its own later.
    pub async fn own_name(&self, name: &str) -> bool {
        match self.conn.request_name(name).await {
            Ok(()) => {
                log::debug!("acquired bus name {}", name);
                true
            }
            Err(e) => {
                log::warn!("failed to acquire bus name {}: {}", name, e);
                false
            }
        }
    }

    /// Gives up ownership of `name`.
    pub async fn release_name(&self, name: &str) {
        match self.conn.release_name(name).await {
            Ok(true) => log::debug!("released bus name {}", name),
            Ok(false) => log::debug!("bus name {} was not owned", name),
            Err(e) => log::warn!("failed to release bus name {}: {}", name, e),
        }
    }
}

/// Awaits a D-Bus call, failing it if it doesn't complete within `timeout`.
pub(crate) async fn with_timeout<T, E, F>(call: F, timeout: Duration) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<error::ErrorKind>,
{
    let call = pin!(call);
    match select(call, Timer::after(timeout)).await {
        Either::Left((res, _)) => res.map_err(Error::from),
        Either::Right(_) => Err(Error::from(format!(
            "call timed out after {}s",
            timeout.as_secs()
        ))),
    }
}
