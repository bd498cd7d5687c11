//! Connecting to a ConnMan service and following it to a terminal state.

use std::{
    future::{ready, Future},
    pin::pin,
    sync::Arc,
    time::Duration,
};

use futures_util::{
    select_biased,
    stream::{Fuse, FusedStream},
    FutureExt, StreamExt,
};
use zbus::zvariant::Value;

use crate::{
    console::Console,
    directory::ServiceRecord,
    driver::{Outcome, Wakeup},
    with_timeout, Error, Result, Session,
};

mod private {
    use zbus::{dbus_proxy, zvariant::Value};

    #[dbus_proxy(
        interface = "net.connman.Service",
        default_service = "net.connman",
        assume_defaults = false
    )]
    trait Service {
        fn connect(&self) -> zbus::Result<()>;

        #[dbus_proxy(signal)]
        fn property_changed(&self, name: &str, value: Value<'_>) -> zbus::Result<()>;
    }
}

use private::{PropertyChangedStream, ServiceProxy};

/// Prefix of the error names ConnMan's manager and service objects reply with.
const CONNMAN_ERROR_PREFIX: &str = "net.connman.Error.";

/// Where a connection attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing selected yet, or the last attempt was abandoned before connecting.
    Idle,
    /// Obtaining a proxy for the selected service.
    ServiceResolving,
    /// `Connect` issued, waiting for the service to settle.
    ServiceConnecting,
    Online,
    Ready,
    Failed,
    Disconnected,
}

impl AttemptState {
    /// Returns whether the attempt is over.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Online | Self::Ready | Self::Failed | Self::Disconnected
        )
    }
}

/// A value of a service's `State` property that ends a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Online,
    Ready,
    Failure,
    Disconnect,
}

impl ServiceState {
    /// Parses a `State` value. Returns [`None`] for intermediate states like `association`.
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "online" => Self::Online,
            "ready" => Self::Ready,
            "failure" => Self::Failure,
            "disconnect" => Self::Disconnect,
            _ => return None,
        })
    }

    fn message(&self) -> &'static str {
        match self {
            Self::Online => "Online.",
            Self::Ready => "Connected.",
            Self::Failure => "Connection failed.",
            Self::Disconnect => "Disconnected.",
        }
    }

    fn attempt_state(&self) -> AttemptState {
        match self {
            Self::Online => AttemptState::Online,
            Self::Ready => AttemptState::Ready,
            Self::Failure => AttemptState::Failed,
            Self::Disconnect => AttemptState::Disconnected,
        }
    }

    fn outcome(&self) -> Outcome {
        match self {
            Self::Online => Outcome::Online,
            Self::Ready => Outcome::Ready,
            Self::Failure => Outcome::Failed,
            Self::Disconnect => Outcome::Disconnected,
        }
    }
}

/// A failed `Connect` call, classified by the error ConnMan replied with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The service is already connected. Not a failure.
    AlreadyConnected,
    /// A connection to the service is already being established. Not a failure.
    InProgress,
    /// ConnMan rejected the request, typically because the agent didn't supply credentials.
    InvalidArguments(String),
    /// Any other remote or transport error, with its message.
    Other(String),
}

impl ConnectError {
    /// Classifies the error a `Connect` call failed with.
    pub fn classify(error: &Error) -> Self {
        Self::from_remote(error.remote_name(), error.message())
    }

    /// Classifies an error by its D-Bus error name (if it was a remote error) and message.
    pub fn from_remote(name: Option<&str>, message: String) -> Self {
        let suffix = name.and_then(|name| name.strip_prefix(CONNMAN_ERROR_PREFIX));
        match suffix {
            Some("AlreadyConnected") => Self::AlreadyConnected,
            Some("InProgress") => Self::InProgress,
            Some("InvalidArguments") => Self::InvalidArguments(message),
            _ => Self::Other(message),
        }
    }

    /// Returns the line to show the operator, if any.
    ///
    /// `InvalidArguments` is the downstream effect of the operator cancelling a credential prompt,
    /// so it is not shown again when `canceled` is set.
    pub fn report(&self, canceled: bool) -> Option<String> {
        match self {
            Self::AlreadyConnected => Some("Already connected.".into()),
            Self::InProgress => Some("Connection in progress.".into()),
            Self::InvalidArguments(_) if canceled => None,
            Self::InvalidArguments(msg) | Self::Other(msg) => {
                Some(format!("Connection failed: {}.", msg))
            }
        }
    }
}

/// Something that happened while a connection attempt was in flight.
#[derive(Debug)]
pub(crate) enum Event {
    Wakeup(Wakeup),
    ConnectFinished(std::result::Result<(), ConnectError>),
    StateChanged(String),
}

/// The state machine of a single connection attempt.
#[derive(Debug)]
pub(crate) struct Attempt {
    state: AttemptState,
    canceled: bool,
}

impl Attempt {
    pub(crate) fn new() -> Self {
        Self {
            state: AttemptState::Idle,
            canceled: false,
        }
    }

    /// Applies `event`, returning the outcome if it ended the attempt.
    ///
    /// Only state changes and operator-side wakeups end an attempt. The `Connect` reply is merely
    /// reported, since ConnMan's state notifications are authoritative.
    pub(crate) fn handle(&mut self, event: Event, console: &dyn Console) -> Option<Outcome> {
        match event {
            Event::Wakeup(wakeup) => {
                log::debug!("connection attempt ended by {:?}", wakeup);
                if wakeup == Wakeup::InputCanceled {
                    self.canceled = true;
                }
                Some(wakeup.outcome())
            }
            Event::ConnectFinished(Ok(())) => {
                log::debug!("Connect call completed");
                None
            }
            Event::ConnectFinished(Err(e)) => {
                log::debug!("Connect call failed: {:?}", e);
                if let Some(line) = e.report(self.canceled) {
                    console.say(&line);
                }
                None
            }
            Event::StateChanged(value) => match ServiceState::from_str(&value) {
                Some(state) => {
                    console.say(state.message());
                    self.state = state.attempt_state();
                    Some(state.outcome())
                }
                None => {
                    log::debug!("service state now '{}'", value);
                    None
                }
            },
        }
    }
}

struct ServiceHandle {
    proxy: ServiceProxy<'static>,
    changes: Fuse<PropertyChangedStream<'static>>,
}

/// Drives the connection to the service the operator selected.
pub struct Controller {
    session: Session,
    console: Arc<dyn Console>,
    timeout: Duration,
    attempt: Attempt,
    current: Option<ServiceHandle>,
}

impl Controller {
    pub(crate) fn new(session: Session, console: Arc<dyn Console>, timeout: Duration) -> Self {
        Self {
            session,
            console,
            timeout,
            attempt: Attempt::new(),
            current: None,
        }
    }

    /// Returns the state of the current connection attempt.
    pub fn state(&self) -> AttemptState {
        self.attempt.state
    }

    /// Returns whether the operator canceled a credential prompt during this session.
    pub fn was_canceled(&self) -> bool {
        self.attempt.canceled
    }

    /// Resolves the service behind `record` and subscribes to its state changes.
    ///
    /// Any previously selected service is released first. On error, the attempt goes back to
    /// [`AttemptState::Idle`].
    pub async fn select(&mut self, record: &ServiceRecord) -> Result<()> {
        self.release();
        self.attempt.state = AttemptState::ServiceResolving;
        log::debug!("resolving service {} at {}", record.name(), record.path());

        match self.subscribe(record).await {
            Ok(handle) => {
                self.current = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.attempt.state = AttemptState::Idle;
                Err(e)
            }
        }
    }

    async fn subscribe(&self, record: &ServiceRecord) -> Result<ServiceHandle> {
        let proxy = with_timeout(
            ServiceProxy::new(&self.session.conn, record.path().clone()),
            self.timeout,
        )
        .await?;
        let changes = with_timeout(proxy.receive_property_changed(), self.timeout).await?;
        Ok(ServiceHandle {
            proxy,
            changes: changes.fuse(),
        })
    }

    /// Issues `Connect` on the selected service and waits until the attempt ends.
    ///
    /// Returns [`Outcome::Aborted`] if no service was selected.
    pub(crate) async fn connect<W>(&mut self, wakeups: &mut W) -> Outcome
    where
        W: FusedStream<Item = Wakeup> + Unpin,
    {
        let Some(handle) = self.current.as_mut() else {
            log::warn!("connect requested without a selected service");
            return Outcome::Aborted;
        };

        let proxy = handle.proxy.clone();
        let timeout = self.timeout;
        let call = async move {
            with_timeout(proxy.connect(), timeout)
                .await
                .map_err(|e| ConnectError::classify(&e))
        };
        let mut states = (&mut handle.changes).filter_map(|signal| ready(state_change(&signal)));

        self.attempt.state = AttemptState::ServiceConnecting;
        self.console.say("Connecting ...");
        drive(&mut self.attempt, &*self.console, wakeups, call, &mut states).await
    }

    /// Drops the selected service's proxy and state subscription, if any.
    pub fn release(&mut self) {
        if let Some(handle) = self.current.take() {
            log::debug!("releasing service {}", handle.proxy.path());
        }
    }
}

/// Feeds the events of a connection attempt into `attempt` until it ends.
///
/// Sources are polled in order: operator wakeups, then the `Connect` reply, then `State` values.
/// A cancellation is therefore seen before the `Connect` error it caused.
pub(crate) async fn drive<W, C, S>(
    attempt: &mut Attempt,
    console: &dyn Console,
    wakeups: &mut W,
    connect: C,
    states: &mut S,
) -> Outcome
where
    W: FusedStream<Item = Wakeup> + Unpin,
    C: Future<Output = std::result::Result<(), ConnectError>>,
    S: FusedStream<Item = String> + Unpin,
{
    let mut connect = pin!(connect.fuse());

    loop {
        let event = select_biased! {
            wakeup = wakeups.next() => match wakeup {
                Some(wakeup) => Event::Wakeup(wakeup),
                None => {
                    log::error!("wakeup channel closed");
                    return Outcome::Interrupted;
                }
            },
            res = connect => Event::ConnectFinished(res),
            value = states.next() => match value {
                Some(value) => Event::StateChanged(value),
                None => {
                    log::warn!("service state changes ended");
                    continue;
                }
            },
            complete => {
                log::error!("no more events for connection attempt");
                return Outcome::Failed;
            }
        };

        if let Some(outcome) = attempt.handle(event, console) {
            return outcome;
        }
    }
}

/// Extracts the new value from a `PropertyChanged` signal about `State`.
fn state_change(signal: &private::PropertyChanged) -> Option<String> {
    match signal.args() {
        Ok(args) => state_value(args.name, &args.value),
        Err(e) => {
            log::warn!("malformed PropertyChanged signal: {}", e);
            None
        }
    }
}

fn state_value(name: &str, value: &Value<'_>) -> Option<String> {
    if name != "State" {
        return None;
    }
    match value {
        Value::Str(s) => Some(s.as_str().to_string()),
        other => {
            log::warn!("unexpected State value {:?}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::pending;

    use futures_channel::mpsc::unbounded;
    use futures_util::stream;

    use super::*;
    use crate::console::script::Script;

    #[test]
    fn terminal_states() {
        for (value, line, outcome, state) in [
            ("online", "Online.", Outcome::Online, AttemptState::Online),
            ("ready", "Connected.", Outcome::Ready, AttemptState::Ready),
            ("failure", "Connection failed.", Outcome::Failed, AttemptState::Failed),
            (
                "disconnect",
                "Disconnected.",
                Outcome::Disconnected,
                AttemptState::Disconnected,
            ),
        ] {
            let script = Script::silent();
            let mut attempt = Attempt::new();
            let res = attempt.handle(Event::StateChanged(value.into()), &script);
            assert_eq!(res, Some(outcome));
            assert_eq!(attempt.state, state);
            assert!(attempt.state.is_terminal());
            assert_eq!(script.transcript(), [line]);
        }
    }

    #[test]
    fn intermediate_states_are_ignored() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        attempt.state = AttemptState::ServiceConnecting;
        for value in ["idle", "association", "configuration", "Ready", ""] {
            assert_eq!(attempt.handle(Event::StateChanged(value.into()), &script), None);
        }
        assert_eq!(attempt.state, AttemptState::ServiceConnecting);
        assert!(script.transcript().is_empty());
    }

    #[test]
    fn classification() {
        let classify = |name: &str| ConnectError::from_remote(Some(name), "msg".into());
        assert_eq!(
            classify("net.connman.Error.AlreadyConnected"),
            ConnectError::AlreadyConnected
        );
        assert_eq!(classify("net.connman.Error.InProgress"), ConnectError::InProgress);
        assert_eq!(
            classify("net.connman.Error.InvalidArguments"),
            ConnectError::InvalidArguments("msg".into())
        );
        assert_eq!(
            classify("net.connman.Error.OperationTimeout"),
            ConnectError::Other("msg".into())
        );
        assert_eq!(
            classify("org.freedesktop.DBus.Error.InProgress"),
            ConnectError::Other("msg".into())
        );
        assert_eq!(
            ConnectError::classify(&Error::from("call timed out after 120s")),
            ConnectError::Other("call timed out after 120s".into())
        );
    }

    #[test]
    fn informational_errors() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        let res = attempt.handle(
            Event::ConnectFinished(Err(ConnectError::AlreadyConnected)),
            &script,
        );
        assert_eq!(res, None);
        let res = attempt.handle(Event::ConnectFinished(Err(ConnectError::InProgress)), &script);
        assert_eq!(res, None);
        assert_eq!(
            script.transcript(),
            ["Already connected.", "Connection in progress."]
        );
    }

    #[test]
    fn invalid_arguments_shown_without_cancellation() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        let err = ConnectError::InvalidArguments("Invalid arguments".into());
        assert_eq!(attempt.handle(Event::ConnectFinished(Err(err)), &script), None);
        assert_eq!(script.transcript(), ["Connection failed: Invalid arguments."]);
    }

    #[test]
    fn invalid_arguments_suppressed_after_cancellation() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        assert_eq!(
            attempt.handle(Event::Wakeup(Wakeup::InputCanceled), &script),
            Some(Outcome::Canceled)
        );
        assert!(attempt.canceled);

        let err = ConnectError::InvalidArguments("Invalid arguments".into());
        assert_eq!(attempt.handle(Event::ConnectFinished(Err(err)), &script), None);
        let err = ConnectError::Other("Operation aborted".into());
        attempt.handle(Event::ConnectFinished(Err(err)), &script);
        assert_eq!(script.transcript(), ["Connection failed: Operation aborted."]);
    }

    #[test]
    fn successful_connect_reply_does_not_end_attempt() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        assert_eq!(attempt.handle(Event::ConnectFinished(Ok(())), &script), None);
        assert_eq!(
            attempt.handle(Event::StateChanged("ready".into()), &script),
            Some(Outcome::Ready)
        );
    }

    #[test]
    fn interrupt_ends_attempt() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        assert_eq!(
            attempt.handle(Event::Wakeup(Wakeup::Interrupted), &script),
            Some(Outcome::Interrupted)
        );
        assert!(!attempt.canceled);
    }

    #[test]
    fn state_values() {
        assert_eq!(
            state_value("State", &Value::from("ready")).as_deref(),
            Some("ready")
        );
        assert_eq!(
            state_value("State", &Value::from("association")).as_deref(),
            Some("association")
        );
        assert_eq!(state_value("Strength", &Value::from("ready")), None);
        assert_eq!(state_value("state", &Value::from("ready")), None);
        assert_eq!(state_value("State", &Value::from(42u8)), None);
        assert_eq!(state_value("State", &Value::from(true)), None);
    }

    #[test]
    fn cancellation_wins_over_connect_reply() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        let (tx, mut wakeups) = unbounded();
        tx.unbounded_send(Wakeup::InputCanceled).unwrap();
        let reply = ready(Err(ConnectError::InvalidArguments("Invalid arguments".into())));
        let mut states = stream::iter(["ready".to_string()]).fuse();

        let outcome = pollster::block_on(drive(
            &mut attempt,
            &script,
            &mut wakeups,
            reply,
            &mut states,
        ));
        assert_eq!(outcome, Outcome::Canceled);
        assert!(attempt.canceled);
        assert!(script.transcript().is_empty());
        assert_eq!(pollster::block_on(states.next()).as_deref(), Some("ready"));
    }

    #[test]
    fn first_terminal_state_ends_attempt() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        let (_tx, mut wakeups) = unbounded();
        let mut states = stream::iter(
            ["association", "configuration", "ready", "online", "failure"].map(String::from),
        )
        .fuse();

        let outcome = pollster::block_on(drive(
            &mut attempt,
            &script,
            &mut wakeups,
            ready(Ok(())),
            &mut states,
        ));
        assert_eq!(outcome, Outcome::Ready);
        assert_eq!(attempt.state, AttemptState::Ready);
        assert_eq!(script.transcript(), ["Connected."]);
        assert_eq!(pollster::block_on(states.next()).as_deref(), Some("online"));
    }

    #[test]
    fn connect_error_is_reported_before_state() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        let (_tx, mut wakeups) = unbounded();
        let reply = ready(Err(ConnectError::Other("Operation timeout".into())));
        let mut states = stream::iter(["failure".to_string()]).fuse();

        let outcome = pollster::block_on(drive(
            &mut attempt,
            &script,
            &mut wakeups,
            reply,
            &mut states,
        ));
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(
            script.transcript(),
            ["Connection failed: Operation timeout.", "Connection failed."]
        );
    }

    #[test]
    fn interrupt_ends_stalled_attempt() {
        let script = Script::silent();
        let console = script.clone();
        let mut attempt = Attempt::new();
        let (tx, mut wakeups) = unbounded();
        let (_state_tx, mut states) = unbounded::<String>();

        // `AlreadyConnected` is followed by no state change, only the interrupt ends the wait.
        let attempt_ref = &mut attempt;
        let stalled = async move {
            drive(
                attempt_ref,
                &console,
                &mut wakeups,
                ready(Err(ConnectError::AlreadyConnected)),
                &mut states,
            )
            .await
        };
        let interrupt = async move {
            tx.unbounded_send(Wakeup::Interrupted).unwrap();
        };
        let (outcome, ()) = pollster::block_on(futures_util::future::join(stalled, interrupt));
        assert_eq!(outcome, Outcome::Interrupted);
        assert!(!attempt.canceled);
        assert_eq!(script.transcript(), ["Already connected."]);
    }

    #[test]
    fn pending_connect_does_not_block_states() {
        let script = Script::silent();
        let mut attempt = Attempt::new();
        let (_tx, mut wakeups) = unbounded();
        let mut states = stream::iter(["disconnect".to_string()]).fuse();

        let outcome = pollster::block_on(drive(
            &mut attempt,
            &script,
            &mut wakeups,
            pending(),
            &mut states,
        ));
        assert_eq!(outcome, Outcome::Disconnected);
        assert_eq!(script.transcript(), ["Disconnected."]);
    }
}
