//! The ConnMan agent answering credential requests on behalf of the operator.
//!
//! ConnMan calls back into a registered agent object whenever it needs user interaction, most
//! importantly to obtain the passphrase of a protected network while a `Connect` call is in flight.

use std::{collections::HashMap, fmt, pin::Pin, sync::Arc};

use futures_channel::mpsc::UnboundedSender;
use futures_util::{FutureExt, StreamExt};
use zbus::{
    fdo,
    zvariant::{ObjectPath, OwnedValue, Value},
    Connection, DBusError, Message, MessageStream, MessageType,
};

use crate::{console::Console, driver::Wakeup, AGENT_PATH};

/// The D-Bus interface ConnMan calls agents through.
pub const AGENT_INTERFACE: &str = "net.connman.Agent";

bitflags::bitflags! {
    /// The set of credential fields requested by a `RequestInput` call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Fields: u8 {
        const IDENTITY = 1 << 0;
        const USERNAME = 1 << 1;
        const PASSWORD = 1 << 2;
        const PASSPHRASE = 1 << 3;

        /// Fields answered with the name the operator enters.
        const NAME_CLASS = Self::IDENTITY.bits() | Self::USERNAME.bits();
        /// Fields answered with the secret the operator enters.
        const SECRET_CLASS = Self::PASSWORD.bits() | Self::PASSPHRASE.bits();
    }
}

impl Fields {
    /// Maps a ConnMan field name (eg. `"Passphrase"`) to its flag.
    pub fn from_field(name: &str) -> Option<Self> {
        Some(match name {
            "Identity" => Self::IDENTITY,
            "Username" => Self::USERNAME,
            "Password" => Self::PASSWORD,
            "Passphrase" => Self::PASSPHRASE,
            _ => return None,
        })
    }

    /// Computes the requested fields from the field names of a `RequestInput` call.
    ///
    /// Unrecognized names are logged and otherwise ignored.
    pub fn from_request<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Self {
        let mut fields = Self::empty();
        for name in names {
            log::debug!("got field '{}'", name);
            match Self::from_field(name) {
                Some(flag) => fields |= flag,
                None => log::warn!("unhandled field '{}'", name),
            }
        }
        fields
    }
}

/// What the operator typed in response to a credential prompt.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: Option<String>,
    pub secret: Option<String>,
}

/// Builds the `RequestInput` reply for `fields`.
///
/// ConnMan expects a single credential per reply. When several fields were requested, the first
/// one in the order Password, Passphrase, Username, Identity wins.
pub fn build_reply(fields: Fields, credentials: &Credentials) -> HashMap<String, OwnedValue> {
    let priority = [
        (Fields::PASSWORD, "Password", &credentials.secret),
        (Fields::PASSPHRASE, "Passphrase", &credentials.secret),
        (Fields::USERNAME, "Username", &credentials.name),
        (Fields::IDENTITY, "Identity", &credentials.name),
    ];

    let mut reply = HashMap::new();
    let chosen = priority
        .into_iter()
        .find(|(flag, _, _)| fields.contains(*flag));
    if let Some((_, key, Some(value))) = chosen {
        reply.insert(key.to_string(), Value::from(value.as_str()).into());
    }
    reply
}

/// Errors returned to ConnMan from agent methods.
#[derive(Debug, DBusError)]
#[dbus_error(prefix = "net.connman.Agent.Error")]
pub enum AgentError {
    #[dbus_error(zbus_error)]
    ZBus(zbus::Error),
    /// The operator declined to provide a required credential.
    Canceled(String),
}

struct PendingInput {
    service: String,
    fields: Fields,
}

/// The operator's side of `net.connman.Agent`.
///
/// Served at [`AGENT_PATH`] for the lifetime of a [`Workflow`][crate::driver::Workflow].
pub struct CredentialAgent {
    console: Arc<dyn Console>,
    wakeups: UnboundedSender<Wakeup>,
    pending: Option<PendingInput>,
}

impl CredentialAgent {
    pub(crate) fn new(console: Arc<dyn Console>, wakeups: UnboundedSender<Wakeup>) -> Self {
        Self {
            console,
            wakeups,
            pending: None,
        }
    }

    /// Returns whether a `RequestInput` call is currently being answered.
    pub fn has_pending_request(&self) -> bool {
        self.pending.is_some()
    }

    fn handle_report_error(&self, service: &str, message: &str) {
        log::debug!("ConnMan reported an error for {}: {}", service, message);
        self.console.say(&format!("Error: '{}'", message));
    }

    fn handle_request_input(
        &mut self,
        service: &str,
        fields: &HashMap<String, OwnedValue>,
    ) -> Result<HashMap<String, OwnedValue>, AgentError> {
        let requested = Fields::from_request(fields.keys().map(String::as_str));
        log::debug!("input requested for {}: {:?}", service, requested);

        let request = PendingInput {
            service: service.to_string(),
            fields: requested,
        };
        // Calls are answered one at a time, so a request can only be left over if a previous
        // handler returned without clearing it.
        if let Some(stale) = self.pending.replace(request) {
            log::warn!(
                "RequestInput for {} ({:?}) still pending, replacing it",
                stale.service,
                stale.fields
            );
            self.console.say("Warning: RequestInput already in progress!");
        }

        let result = self.collect(requested);
        self.pending = None;

        match result {
            Ok(credentials) => Ok(build_reply(requested, &credentials)),
            Err(e) => {
                if self.wakeups.unbounded_send(Wakeup::InputCanceled).is_err() {
                    log::debug!("workflow already gone, not forwarding cancellation");
                }
                Err(e)
            }
        }
    }

    fn collect(&self, fields: Fields) -> Result<Credentials, AgentError> {
        let mut credentials = Credentials::default();

        if fields.intersects(Fields::NAME_CLASS) {
            match self.console.ask("Enter username: ").filter(|s| !s.is_empty()) {
                Some(name) => credentials.name = Some(name),
                None => {
                    self.console.say("User name is required!");
                    return Err(AgentError::Canceled("No username".into()));
                }
            }
        }

        if fields.intersects(Fields::SECRET_CLASS) {
            match self.console.ask("Enter passphrase: ").filter(|s| !s.is_empty()) {
                Some(secret) => credentials.secret = Some(secret),
                None => {
                    self.console.say("Passphrase is required!");
                    return Err(AgentError::Canceled("No passphrase".into()));
                }
            }
        }

        Ok(credentials)
    }
}

impl fmt::Debug for CredentialAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialAgent")
            .field("pending", &self.pending.as_ref().map(|p| p.fields))
            .finish()
    }
}

/// Serves a [`CredentialAgent`] at [`AGENT_PATH`] on a bus connection.
///
/// Method calls are taken off the connection's message stream and answered in arrival order.
/// Every call gets exactly one reply: members of `net.connman.Agent` the agent doesn't implement
/// are acknowledged with an empty reply, so newer ConnMan versions don't see errors.
pub(crate) struct AgentEndpoint {
    conn: Connection,
    calls: Pin<Box<MessageStream>>,
    agent: CredentialAgent,
}

impl AgentEndpoint {
    /// Starts receiving calls for `agent`. Calls arriving before [`serve`](Self::serve) runs are
    /// queued.
    pub(crate) fn new(conn: &Connection, agent: CredentialAgent) -> Self {
        Self {
            conn: conn.clone(),
            calls: Box::pin(MessageStream::from(conn)),
            agent,
        }
    }

    /// Answers agent calls until the connection closes.
    pub(crate) async fn serve(&mut self) {
        while let Some(msg) = self.calls.next().await {
            match msg {
                Ok(msg) => {
                    if let Err(e) = self.answer(&msg).await {
                        log::warn!("failed to answer agent call: {}", e);
                    }
                }
                Err(e) => log::warn!("dropping unreadable message: {}", e),
            }
        }
        log::debug!("agent message stream ended");
    }

    /// Stops serving, answering calls that are already queued without prompting the operator.
    pub(crate) async fn shutdown(mut self) {
        loop {
            match self.calls.next().now_or_never() {
                Some(Some(Ok(msg))) => {
                    if let Err(e) = self.decline(&msg).await {
                        log::warn!("failed to answer agent call: {}", e);
                    }
                }
                Some(Some(Err(e))) => log::warn!("dropping unreadable message: {}", e),
                Some(None) | None => break,
            }
        }
        log::debug!("agent at {} no longer served", AGENT_PATH);
    }

    async fn answer(&mut self, msg: &Message) -> zbus::Result<()> {
        let Some(member) = agent_call(msg) else {
            return Ok(());
        };
        let header = msg.header()?;

        match member.as_str() {
            "ReportError" => {
                let (service, error): (ObjectPath<'_>, String) = match msg.body() {
                    Ok(body) => body,
                    Err(e) => return self.invalid_args(&header, e).await,
                };
                self.agent.handle_report_error(service.as_str(), &error);
                self.conn.reply(msg, &()).await?;
            }
            "RequestInput" => {
                let (service, fields): (ObjectPath<'_>, HashMap<String, OwnedValue>) =
                    match msg.body() {
                        Ok(body) => body,
                        Err(e) => return self.invalid_args(&header, e).await,
                    };
                match self.agent.handle_request_input(service.as_str(), &fields) {
                    Ok(reply) => self.conn.reply(msg, &reply).await?,
                    Err(e) => self.conn.reply_dbus_error(&header, e).await?,
                };
            }
            other => {
                log::warn!("agent method '{}' not implemented", other);
                self.agent
                    .console
                    .say(&format!("Warning method '{}' not implemented", other));
                self.conn.reply(msg, &()).await?;
            }
        }
        Ok(())
    }

    async fn decline(&self, msg: &Message) -> zbus::Result<()> {
        let Some(member) = agent_call(msg) else {
            return Ok(());
        };
        log::debug!("declining queued {} call", member);

        if member == "RequestInput" {
            let err = AgentError::Canceled("Agent unregistered".into());
            self.conn.reply_dbus_error(&msg.header()?, err).await?;
        } else {
            self.conn.reply(msg, &()).await?;
        }
        Ok(())
    }

    async fn invalid_args(
        &self,
        header: &zbus::MessageHeader<'_>,
        e: zbus::Error,
    ) -> zbus::Result<()> {
        log::warn!("malformed agent call: {}", e);
        let err = fdo::Error::InvalidArgs(e.to_string());
        self.conn.reply_dbus_error(header, err).await?;
        Ok(())
    }
}

/// Returns the member name if `msg` is a method call on the agent object.
fn agent_call(msg: &Message) -> Option<String> {
    if msg.message_type() != MessageType::MethodCall {
        return None;
    }
    let path = msg.path()?;
    if path.as_str() != AGENT_PATH {
        log::debug!("ignoring call to {}", path);
        return None;
    }
    let member = msg.member()?;
    match msg.interface() {
        Some(iface) if iface.as_str() != AGENT_INTERFACE => Some(format!("{}.{}", iface, member)),
        _ => Some(member.to_string()),
    }
}
