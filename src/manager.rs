use std::{collections::HashMap, time::Duration};

use zbus::{
    dbus_proxy,
    zvariant::{ObjectPath, OwnedObjectPath, OwnedValue},
};

use crate::{with_timeout, Error, Result, Session};

#[dbus_proxy(
    interface = "net.connman.Manager",
    default_service = "net.connman",
    default_path = "/",
    assume_defaults = false
)]
trait Manager {
    fn register_agent(&self, path: &ObjectPath<'_>) -> zbus::Result<()>;
    fn unregister_agent(&self, path: &ObjectPath<'_>) -> zbus::Result<()>;
    fn get_services(&self) -> zbus::Result<Vec<(OwnedObjectPath, HashMap<String, OwnedValue>)>>;
}

/// A ConnMan service object path together with its properties, as returned by `GetServices`.
pub type ServiceEntry = (OwnedObjectPath, HashMap<String, OwnedValue>);

/// The ConnMan manager object.
pub struct Manager {
    proxy: ManagerProxy<'static>,
    timeout: Duration,
}

impl Manager {
    /// Connects to ConnMan's manager object.
    ///
    /// Every call made through the returned [`Manager`] fails if it doesn't complete within
    /// `timeout`.
    pub async fn new(session: &Session, timeout: Duration) -> Result<Self> {
        let proxy = ManagerProxy::new(&session.conn)
            .await
            .map_err(Error::from)?;
        Ok(Self { proxy, timeout })
    }

    /// Registers the agent object at `path` with ConnMan.
    pub async fn register_agent(&self, path: &str) -> Result<()> {
        let path = ObjectPath::try_from(path).map_err(|e| Error::from(zbus::Error::from(e)))?;
        log::debug!("registering agent {}", path);
        with_timeout(self.proxy.register_agent(&path), self.timeout).await
    }

    /// Unregisters the agent object at `path`.
    pub async fn unregister_agent(&self, path: &str) -> Result<()> {
        let path = ObjectPath::try_from(path).map_err(|e| Error::from(zbus::Error::from(e)))?;
        log::debug!("unregistering agent {}", path);
        with_timeout(self.proxy.unregister_agent(&path), self.timeout).await
    }

    /// Returns every service ConnMan knows about, regardless of technology.
    pub async fn services(&self) -> Result<Vec<ServiceEntry>> {
        let services = with_timeout(self.proxy.get_services(), self.timeout).await?;
        log::debug!("ConnMan reported {} services", services.len());
        Ok(services)
    }
}
