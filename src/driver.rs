//! The Wi-Fi setup workflow, from bus connection to teardown.

use std::{pin::pin, sync::Arc};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::future::{select, Either};

use crate::{
    agent::{AgentEndpoint, CredentialAgent},
    connect::Controller,
    console::{Console, Selection},
    directory::{ServiceDirectory, ServiceRecord},
    with_timeout, Config, Manager, Session, AGENT_NAME, AGENT_PATH,
};

/// Notifications that end a connection attempt from the operator's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    /// The operator declined a credential prompt.
    InputCanceled,
    /// The host shell asked the workflow to stop (eg. on `SIGINT`).
    Interrupted,
}

impl Wakeup {
    pub(crate) fn outcome(self) -> Outcome {
        match self {
            Self::InputCanceled => Outcome::Canceled,
            Self::Interrupted => Outcome::Interrupted,
        }
    }
}

/// How a [`Workflow`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The service reached the `online` state.
    Online,
    /// The service reached the `ready` state.
    Ready,
    /// The service reached the `failure` state, or could not be resolved.
    Failed,
    /// The service reached the `disconnect` state.
    Disconnected,
    /// The operator declined to provide credentials.
    Canceled,
    /// The operator declined to select a network, or there was none to select.
    Aborted,
    /// The workflow was stopped through its [`Interrupter`].
    Interrupted,
    /// The bus or ConnMan could not be reached, or refused the agent.
    TransportFailed,
}

impl Outcome {
    /// Returns whether the shell should consider the command successful.
    ///
    /// Decisions made by the operator count as success, everything else as failure.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Online | Self::Ready | Self::Canceled | Self::Aborted
        )
    }
}

/// A handle that stops a running [`Workflow`].
///
/// Intended to be called from the host's interrupt handling. Interrupting a workflow that already
/// finished has no effect.
#[derive(Debug, Clone)]
pub struct Interrupter {
    tx: UnboundedSender<Wakeup>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        if self.tx.unbounded_send(Wakeup::Interrupted).is_err() {
            log::debug!("workflow already finished, ignoring interrupt");
        }
    }
}

/// One invocation of the Wi-Fi setup command.
///
/// Owns everything acquired along the way (bus connection, bus name, agent object, ConnMan
/// proxies) and releases it in [`Workflow::teardown`].
pub struct Workflow {
    config: Config,
    console: Arc<dyn Console>,
    wakeup_tx: UnboundedSender<Wakeup>,
    wakeups: UnboundedReceiver<Wakeup>,

    session: Option<Session>,
    manager: Option<Manager>,
    controller: Option<Controller>,
    directory: Option<ServiceDirectory>,
    agent: Option<AgentEndpoint>,

    owns_name: bool,
    agent_registered: bool,
}

impl Workflow {
    pub fn new(config: Config, console: Arc<dyn Console>) -> Self {
        let (wakeup_tx, wakeups) = unbounded();
        Self {
            config,
            console,
            wakeup_tx,
            wakeups,
            session: None,
            manager: None,
            controller: None,
            directory: None,
            agent: None,
            owns_name: false,
            agent_registered: false,
        }
    }

    /// Returns a handle that can stop this workflow while it runs.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            tx: self.wakeup_tx.clone(),
        }
    }

    /// Runs the workflow to completion and tears it down.
    pub async fn run(mut self) -> Outcome {
        let outcome = self.execute().await;
        log::debug!("workflow finished: {:?}", outcome);
        self.teardown().await;
        outcome
    }

    async fn execute(&mut self) -> Outcome {
        let timeout = self.config.call_timeout;
        let console = self.console.clone();

        console.say("Connecting to DBus ...");
        let session = match with_timeout(Session::new(), timeout).await {
            Ok(session) => self.session.insert(session),
            Err(e) => {
                log::error!("failed to connect to the system bus: {}", e);
                console.say(&format!("error: {}", e));
                return Outcome::TransportFailed;
            }
        };

        let manager = match Manager::new(session, timeout).await {
            Ok(manager) => self.manager.insert(manager),
            Err(e) => {
                log::error!("failed to create ConnMan proxy: {}", e);
                console.say(&format!("Connman proxy: {}", e));
                return Outcome::TransportFailed;
            }
        };

        self.owns_name = session.own_name(AGENT_NAME).await;

        console.say("Registering agent ...");
        let agent = CredentialAgent::new(console.clone(), self.wakeup_tx.clone());
        let endpoint = self.agent.insert(AgentEndpoint::new(&session.conn, agent));

        if let Err(e) = manager.register_agent(AGENT_PATH).await {
            log::error!("RegisterAgent failed: {}", e);
            console.say(&format!("error: {}.", e));
            return Outcome::TransportFailed;
        }
        self.agent_registered = true;
        console.say("done.");

        let services = match manager.services().await {
            Ok(services) => services,
            Err(e) => {
                log::error!("GetServices failed: {}", e);
                console.say(&format!("error: {}.", e));
                return Outcome::TransportFailed;
            }
        };
        let directory = self
            .directory
            .insert(ServiceDirectory::from_services(services));

        if let Some(outcome) = queued_outcome(&mut self.wakeups) {
            return outcome;
        }

        let record = match choose(directory, &*console) {
            Ok(record) => record,
            Err(outcome) => return outcome,
        };

        let controller = self.controller.insert(Controller::new(
            session.clone(),
            console.clone(),
            timeout,
        ));
        if let Err(e) = controller.select(record).await {
            log::error!("failed to resolve service {}: {}", record.name(), e);
            console.say(&format!("Failed to connect: {}", e));
            return Outcome::Failed;
        }

        let attempt = pin!(controller.connect(&mut self.wakeups));
        match select(attempt, pin!(endpoint.serve())).await {
            Either::Left((outcome, _)) => outcome,
            Either::Right(((), attempt)) => {
                log::warn!("agent stopped receiving calls");
                attempt.await
            }
        }
    }

    /// Releases everything the workflow acquired, in reverse dependency order.
    ///
    /// Safe to call more than once, and on a workflow that failed (or never started) before
    /// acquiring everything.
    pub async fn teardown(&mut self) {
        if self.agent_registered {
            self.agent_registered = false;
            if let Some(manager) = &self.manager {
                if let Err(e) = manager.unregister_agent(AGENT_PATH).await {
                    log::warn!("UnregisterAgent failed: {}", e);
                }
            }
        }

        if let Some(endpoint) = self.agent.take() {
            endpoint.shutdown().await;
        }

        if self.owns_name {
            self.owns_name = false;
            if let Some(session) = &self.session {
                session.release_name(AGENT_NAME).await;
            }
        }

        self.manager = None;
        if let Some(mut controller) = self.controller.take() {
            controller.release();
        }
        self.directory = None;

        while let Ok(wakeup) = self.wakeups.try_recv() {
            log::debug!("discarding {:?}", wakeup);
        }
        self.session = None;
    }
}

/// Returns how the workflow ends if a wakeup is already queued.
fn queued_outcome(wakeups: &mut UnboundedReceiver<Wakeup>) -> Option<Outcome> {
    let wakeup = wakeups.try_recv().ok()?;
    log::debug!("stopping before selection: {:?}", wakeup);
    Some(wakeup.outcome())
}

/// Lists the services in `directory` and asks the operator to pick one.
fn choose<'d>(
    directory: &'d ServiceDirectory,
    console: &dyn Console,
) -> Result<&'d ServiceRecord, Outcome> {
    if directory.is_empty() {
        console.say("No wireless networks found.");
        return Err(Outcome::Aborted);
    }

    console.say("Available networks:");
    console.say("");
    for (i, record) in directory.iter().enumerate() {
        console.say(&format!("    {}: {}", i + 1, record.name()));
    }
    console.say("");
    console.say(&format!("Select wifi [1-{}]:", directory.len()));

    let answer = console.ask("? ");
    match Selection::parse(answer.as_deref(), directory.len()) {
        Selection::Index(i) => directory.nth(i).ok_or(Outcome::Aborted),
        Selection::Unknown(n) => {
            log::warn!("unknown service #{}", n);
            Err(Outcome::Aborted)
        }
        Selection::Abort => Err(Outcome::Aborted),
    }
}

/// Runs the Wi-Fi setup command on the calling thread.
///
/// `arm` receives the workflow's [`Interrupter`] before it starts, so the host can stop it (eg.
/// from a `SIGINT` handler). Returns whether the command succeeded, for the shell's benefit.
pub fn setup_wifi<F>(config: Config, console: Arc<dyn Console>, arm: F) -> bool
where
    F: FnOnce(Interrupter),
{
    let workflow = Workflow::new(config, console);
    arm(workflow.interrupter());
    pollster::block_on(workflow.run()).is_success()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use zbus::zvariant::{ObjectPath, Value};

    use super::*;
    use crate::console::script::Script;

    fn directory(names: &[&str]) -> ServiceDirectory {
        ServiceDirectory::from_services(names.iter().enumerate().map(|(i, name)| {
            let path = format!("/net/connman/service/wifi_{}", i);
            let mut props = HashMap::new();
            props.insert("Type".to_string(), Value::from("wifi").into());
            props.insert("Name".to_string(), Value::from(*name).into());
            (ObjectPath::try_from(path).unwrap().into(), props)
        }))
    }

    #[test]
    fn choose_service() {
        let directory = directory(&["HomeNet", "Cafe"]);
        let script = Script::new([Some("2")]);

        let record = choose(&directory, &script).unwrap();
        assert_eq!(record.name(), "HomeNet");
        assert_eq!(
            script.transcript(),
            [
                "Available networks:",
                "",
                "    1: Cafe",
                "    2: HomeNet",
                "",
                "Select wifi [1-2]:",
                "? ",
            ]
        );
    }

    #[test]
    fn choose_declined() {
        let directory = directory(&["HomeNet"]);
        for answer in [None, Some(""), Some("0"), Some("-3"), Some("q")] {
            let script = Script::new([answer]);
            assert_eq!(choose(&directory, &script).unwrap_err(), Outcome::Aborted);
        }
    }

    #[test]
    fn choose_out_of_range() {
        let directory = directory(&["HomeNet"]);
        let script = Script::new([Some("2")]);
        assert_eq!(choose(&directory, &script).unwrap_err(), Outcome::Aborted);
    }

    #[test]
    fn choose_from_nothing() {
        let script = Script::silent();
        let err = choose(&ServiceDirectory::new(), &script).unwrap_err();
        assert_eq!(err, Outcome::Aborted);
        assert_eq!(script.transcript(), ["No wireless networks found."]);
        assert_eq!(script.remaining_answers(), 0);
    }

    #[test]
    fn success_mapping() {
        assert!(Outcome::Online.is_success());
        assert!(Outcome::Ready.is_success());
        assert!(Outcome::Canceled.is_success());
        assert!(Outcome::Aborted.is_success());
        assert!(!Outcome::Failed.is_success());
        assert!(!Outcome::Disconnected.is_success());
        assert!(!Outcome::Interrupted.is_success());
        assert!(!Outcome::TransportFailed.is_success());
    }

    #[test]
    fn teardown_is_idempotent() {
        let script = Script::silent();
        let mut workflow = Workflow::new(Config::default(), Arc::new(script.clone()));
        workflow.interrupter().interrupt();
        workflow.interrupter().interrupt();

        pollster::block_on(workflow.teardown());
        assert!(workflow.wakeups.try_recv().is_err(), "wakeups not drained");
        assert!(workflow.session.is_none());
        assert!(workflow.manager.is_none());

        pollster::block_on(workflow.teardown());
        assert!(!workflow.agent_registered);
        assert!(workflow.agent.is_none());
        assert!(!workflow.owns_name);
        assert!(script.transcript().is_empty());
    }

    #[test]
    fn interrupt_after_finish_is_harmless() {
        let workflow = Workflow::new(Config::default(), Arc::new(Script::silent()));
        let interrupter = workflow.interrupter();
        drop(workflow);
        interrupter.interrupt();
    }

    #[test]
    fn queued_wakeups_keep_their_meaning() {
        let workflow = Workflow::new(Config::default(), Arc::new(Script::silent()));
        let (tx, mut wakeups) = (workflow.wakeup_tx.clone(), workflow.wakeups);

        assert_eq!(queued_outcome(&mut wakeups), None);

        tx.unbounded_send(Wakeup::InputCanceled).unwrap();
        let outcome = queued_outcome(&mut wakeups).unwrap();
        assert_eq!(outcome, Outcome::Canceled);
        assert!(outcome.is_success());

        tx.unbounded_send(Wakeup::Interrupted).unwrap();
        assert_eq!(queued_outcome(&mut wakeups), Some(Outcome::Interrupted));
    }

    #[test]
    fn interrupt_is_seen_before_selection() {
        let mut workflow = Workflow::new(Config::default(), Arc::new(Script::silent()));
        let interrupter = workflow.interrupter();
        std::thread::spawn(move || interrupter.interrupt())
            .join()
            .unwrap();

        assert_eq!(
            queued_outcome(&mut workflow.wakeups),
            Some(Outcome::Interrupted)
        );
        assert_eq!(queued_outcome(&mut workflow.wakeups), None);
    }
}
