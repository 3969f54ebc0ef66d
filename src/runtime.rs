//! Tokio event loop for one agent.
//!
//! [`AgentRuntime`] is the only consumer of an agency: it interleaves inbound
//! messages, commands from agent code and the next timer deadline on a
//! single task, so sessions never race each other. Agent code talks to it
//! through cloneable [`AgentHandle`]s; the loop ends when the last handle is
//! dropped and hands the agency back.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agency::{Agency, SessionHandle};
use crate::clock::TokioClock;
use crate::error::{FleetError, Result};
use crate::message::{Grant, Message, Recipient, SessionId};
use crate::protocol::{Manager, Requester, RetryingProtocol, SessionInfo};

type Command = Box<dyn FnOnce(&mut Agency) + Send>;

/// Drives one [`Agency`] on a tokio task
pub struct AgentRuntime {
    agency: Agency,
    inbox: mpsc::UnboundedReceiver<Message>,
    commands: mpsc::UnboundedReceiver<Command>,
    clock: TokioClock,
}

impl AgentRuntime {
    /// `clock` must be the one the agency was built with.
    pub fn new(
        agency: Agency,
        inbox: mpsc::UnboundedReceiver<Message>,
        clock: TokioClock,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = AgentHandle {
            address: Arc::new(agency.address().clone()),
            commands: tx,
        };
        let runtime = Self {
            agency,
            inbox,
            commands: rx,
            clock,
        };
        (runtime, handle)
    }

    /// Run on a new task
    pub fn spawn(self) -> JoinHandle<Agency> {
        tokio::spawn(self.run())
    }

    /// Run until every handle is dropped; returns the agency.
    pub async fn run(mut self) -> Agency {
        let mut inbox_open = true;
        tracing::info!(agent = %self.agency.address(), "Agent running");
        loop {
            let wake = self
                .agency
                .next_deadline()
                .map(|deadline| self.clock.instant_at(deadline));

            tokio::select! {
                message = self.inbox.recv(), if inbox_open => match message {
                    Some(message) => self.agency.on_message(message),
                    None => {
                        tracing::debug!(agent = %self.agency.address(), "Inbox closed");
                        inbox_open = false;
                    },
                },
                command = self.commands.recv() => match command {
                    Some(command) => command(&mut self.agency),
                    None => break,
                },
                () = sleep_until(wake) => {
                    let fired = self.agency.advance();
                    tracing::trace!(agent = %self.agency.address(), fired, "Timers fired");
                },
            }
        }
        tracing::info!(
            agent = %self.agency.address(),
            live_sessions = self.agency.sessions().len(),
            "Agent stopped"
        );
        self.agency
    }
}

async fn sleep_until(wake: Option<Instant>) {
    match wake {
        Some(wake) => tokio::time::sleep_until(wake).await,
        None => std::future::pending().await,
    }
}

/// Cloneable access to a running agent
#[derive(Clone)]
pub struct AgentHandle {
    address: Arc<Recipient>,
    commands: mpsc::UnboundedSender<Command>,
}

impl AgentHandle {
    /// Address of the agent
    pub fn address(&self) -> &Recipient {
        &self.address
    }

    /// Run `f` on the agent's task and return its result.
    pub async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Agency) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let command: Command = Box::new(move |agency| {
            // the caller may have given up waiting
            let _ = tx.send(f(agency));
        });
        self.commands.send(command).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Start a contract
    pub async fn initiate_manager<M>(
        &self,
        protocol_id: impl Into<String>,
        manager: M,
        recipients: Vec<Recipient>,
    ) -> Result<SessionHandle>
    where
        M: Manager + 'static,
    {
        let protocol_id = protocol_id.into();
        self.execute(move |agency| agency.initiate_manager(protocol_id, manager, recipients))
            .await
    }

    /// Send a request
    pub async fn initiate_request<R>(
        &self,
        protocol_id: impl Into<String>,
        requester: R,
        recipients: Vec<Recipient>,
        timeout: Option<Duration>,
    ) -> Result<SessionHandle>
    where
        R: Requester + 'static,
    {
        let protocol_id = protocol_id.into();
        self.execute(move |agency| {
            agency.initiate_request(protocol_id, requester, recipients, timeout)
        })
        .await
    }

    /// Run a protocol with retries
    pub async fn initiate_retrying(&self, protocol: RetryingProtocol) -> Result<SessionHandle> {
        self.execute(move |agency| agency.initiate_retrying(protocol)).await
    }

    /// Send a notification
    pub async fn notify(
        &self,
        protocol_id: impl Into<String>,
        recipients: Vec<Recipient>,
        payload: Value,
    ) -> Result<usize> {
        let protocol_id = protocol_id.into();
        self.execute(move |agency| agency.notify(protocol_id, &recipients, payload))
            .await?
    }

    /// Cancel a session
    pub async fn cancel(&self, session_id: SessionId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.execute(move |agency| agency.cancel(&session_id, &reason))
            .await?
    }

    /// Grant collected bids of a closed manager session
    pub async fn grant(&self, session_id: SessionId, grants: Vec<(Recipient, Grant)>) -> Result<()> {
        self.execute(move |agency| agency.grant(&session_id, grants))
            .await?
    }

    /// Report progress on a granted job
    pub async fn update_report(&self, session_id: SessionId, payload: Value) -> Result<()> {
        self.execute(move |agency| agency.update_report(&session_id, payload))
            .await?
    }

    /// Deliver the result of a granted job
    pub async fn final_report(&self, session_id: SessionId, payload: Value) -> Result<()> {
        self.execute(move |agency| agency.final_report(&session_id, payload))
            .await?
    }

    /// Give up a granted job
    pub async fn defect(&self, session_id: SessionId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.execute(move |agency| agency.defect(&session_id, &reason))
            .await?
    }

    /// Answer a pending request
    pub async fn reply(&self, session_id: SessionId, payload: Value) -> Result<()> {
        self.execute(move |agency| agency.reply(&session_id, payload))
            .await?
    }

    /// Snapshot of live sessions
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        self.execute(|agency| agency.sessions()).await
    }

    /// Whether the agent has nothing in flight
    pub async fn is_idle(&self) -> Result<bool> {
        self.execute(|agency| agency.is_idle()).await
    }
}

fn stopped() -> FleetError {
    FleetError::Channel("agent runtime stopped".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryBus;
    use crate::protocol::{RequestContext, Requester};

    struct Ping;

    impl Requester for Ping {
        fn initiate(&mut self, ctx: &mut RequestContext) -> anyhow::Result<()> {
            ctx.request(Value::String("ping".into()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_on_tokio_time() {
        let bus = MemoryBus::new();
        let clock = TokioClock::new();
        let me = Recipient::agent("eu", "me");
        let silent = Recipient::agent("eu", "silent");
        let inbox = bus.connect(me.clone());
        let _silent_inbox = bus.connect(silent.clone());

        let agency = Agency::builder(me)
            .channel(Arc::new(bus.clone()))
            .clock(Arc::new(clock))
            .build()
            .unwrap();
        let (runtime, handle) = AgentRuntime::new(agency, inbox, clock);
        let task = runtime.spawn();

        let session = handle
            .initiate_request("ping", Ping, vec![silent], Some(Duration::seconds(10)))
            .await
            .unwrap();
        let started = Instant::now();
        let outcome = session.notify_finish().await;
        assert_eq!(outcome, Err(crate::error::ProtocolFailure::Expired));
        assert!(started.elapsed() >= std::time::Duration::from_secs(10));
        assert!(handle.is_idle().await.unwrap());

        drop(handle);
        let agency = task.await.unwrap();
        assert!(agency.is_idle());
    }
}
