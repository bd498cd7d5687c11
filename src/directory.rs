//! The directory of wireless services available for selection.

use std::collections::{BTreeMap, HashMap};

use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use crate::manager::ServiceEntry;

/// A wireless ConnMan service, as seen during discovery.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    name: String,
    path: OwnedObjectPath,
    properties: HashMap<String, OwnedValue>,
}

impl ServiceRecord {
    /// Builds a record from a service's object path and properties.
    ///
    /// Returns [`None`] unless the service is a Wi-Fi service (`Type` is `"wifi"`) with a
    /// non-empty `Name`; hidden networks and other technologies can't be selected by name.
    pub fn classify(path: OwnedObjectPath, properties: HashMap<String, OwnedValue>) -> Option<Self> {
        let mut is_wireless = false;
        let mut name = None;
        for (key, value) in &properties {
            match key.as_str() {
                "Type" => is_wireless = string(value) == Some("wifi"),
                "Name" => name = string(value).filter(|n| !n.is_empty()),
                _ => {}
            }
        }

        if !is_wireless {
            return None;
        }
        let name = name?.to_string();
        Some(Self {
            name,
            path,
            properties,
        })
    }

    /// Returns the network name the service is listed under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the D-Bus object path of the ConnMan service.
    pub fn path(&self) -> &ObjectPath<'static> {
        &self.path
    }

    /// Returns the value of the property `name` as reported during discovery.
    pub fn property(&self, name: &str) -> Option<&Value<'static>> {
        self.properties.get(name).map(|v| &**v)
    }

    /// Returns whether this is a Wi-Fi service. Always `true` for records in a [`ServiceDirectory`].
    pub fn is_wireless(&self) -> bool {
        self.properties.get("Type").and_then(string) == Some("wifi")
    }
}

fn string(value: &OwnedValue) -> Option<&str> {
    match &**value {
        Value::Str(s) => Some(s.as_str()),
        _ => None,
    }
}

/// The selectable wireless services, keyed by network name.
///
/// Iteration order (and thus the numbering shown to the operator) is sorted by name, and stable
/// for the lifetime of the directory.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: BTreeMap<String, ServiceRecord>,
}

impl ServiceDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from the result of `GetServices`, keeping only wireless services.
    pub fn from_services<I: IntoIterator<Item = ServiceEntry>>(services: I) -> Self {
        let mut directory = Self::new();
        for (path, properties) in services {
            match ServiceRecord::classify(path, properties) {
                Some(record) => directory.insert(record),
                None => log::trace!("skipping non-wifi or unnamed service"),
            }
        }
        directory
    }

    /// Adds `record`, replacing any service previously listed under the same name.
    pub fn insert(&mut self, record: ServiceRecord) {
        log::debug!("found wifi service {} at {}", record.name, record.path.as_str());
        if let Some(old) = self.services.insert(record.name.clone(), record) {
            log::debug!(
                "service {} at {} shadowed by a later service with the same name",
                old.name,
                old.path.as_str()
            );
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Looks up a service by network name.
    pub fn get(&self, name: &str) -> Option<&ServiceRecord> {
        self.services.get(name)
    }

    /// Returns the `index`th service (0-based) in listing order.
    pub fn nth(&self, index: usize) -> Option<&ServiceRecord> {
        self.services.values().nth(index)
    }

    /// Returns an iterator over all services in listing order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values()
    }
}
