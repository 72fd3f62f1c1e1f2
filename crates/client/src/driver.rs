//! Reconnection state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                    ^  |           |
//!                    |  v (fail)    v (close)
//!                  Reconnecting <---+
//! ```
//!
//! One background task owns the state, the session and the single backoff
//! timer. The [`ReconnectingClient`] handle talks to it over a command queue.

use std::time::Duration;

use deskrelay_shared::{close_codes, ClientEvent, ServerEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backoff::BackoffPolicy;
use crate::error::{ClientError, ConnectError};
use crate::token::TokenSource;
use crate::transport::{Connector, Session, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Notifications emitted by the driver, in order
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    StateChanged(ConnectionState),
    /// A reconnection attempt will start after `delay`
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Frame received from the relay
    Frame(ServerEvent),
    /// Terminal: no further attempts will be made
    GaveUp { attempts: u32 },
}

enum Command {
    Send(ClientEvent, oneshot::Sender<Result<(), ClientError>>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a self-reconnecting relay connection
///
/// Dropping the handle tears the connection down like [`disconnect`](Self::disconnect).
pub struct ReconnectingClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl ReconnectingClient {
    /// Start connecting immediately
    ///
    /// Returns the handle and the stream of [`DriverEvent`]s.
    pub fn spawn<C, T>(
        connector: C,
        tokens: T,
        policy: BackoffPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<DriverEvent>)
    where
        C: Connector + 'static,
        T: TokenSource + 'static,
    {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            connector,
            tokens,
            policy,
            commands,
            events,
            state: state_tx,
        };
        let task = tokio::spawn(driver.run());

        (
            Self {
                commands: commands_tx,
                state,
                task,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send an event over the current session
    ///
    /// Fails with [`ClientError::NotConnected`] unless the state is `Connected`.
    pub async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let (reply_tx, reply) = oneshot::channel();
        self.commands
            .send(Command::Send(event, reply_tx))
            .map_err(|_| ClientError::NotConnected)?;
        reply.await.unwrap_or(Err(ClientError::NotConnected))
    }

    /// Wait until the driver reaches `target`
    pub async fn wait_for(&mut self, target: ConnectionState) -> ConnectionState {
        let reached = self.state.wait_for(|s| *s == target).await.map(|s| *s);
        // The driver stopped; report where it ended
        reached.unwrap_or_else(|_| *self.state.borrow())
    }

    /// Intentional teardown: cancel any pending reconnection and close with 1000
    pub async fn disconnect(&self) {
        let (done_tx, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect(done_tx)).is_ok() {
            let _ = done.await;
        }
    }

    /// Whether the driver task has stopped for good
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// What the driver does after leaving a state
enum Next<S> {
    Connected(S),
    Failed(ConnectError),
    Lost,
    Retry,
    Stop(Option<oneshot::Sender<()>>),
}

struct Driver<C, T> {
    connector: C,
    tokens: T,
    policy: BackoffPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<DriverEvent>,
    state: watch::Sender<ConnectionState>,
}

impl<C, T> Driver<C, T>
where
    C: Connector + 'static,
    T: TokenSource + 'static,
{
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut delays = self.policy.delays();
        let mut attempt: u32 = 0;

        let stop = loop {
            self.set_state(ConnectionState::Connecting);
            let next = match self.connecting().await {
                Next::Connected(session) => {
                    failures = 0;
                    attempt = 0;
                    delays = self.policy.delays();
                    self.set_state(ConnectionState::Connected);
                    self.connected(session).await
                }
                other => other,
            };

            match next {
                Next::Failed(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "Relay connection attempt failed");
                    if failures >= self.policy.max_attempts {
                        self.emit(DriverEvent::GaveUp { attempts: failures });
                        break None;
                    }
                }
                Next::Lost => {
                    tracing::info!("Relay connection lost");
                }
                Next::Stop(done) => break done,
                Next::Connected(_) | Next::Retry => {}
            }

            attempt += 1;
            let delay = delays.next().unwrap_or(self.policy.max_delay);
            self.set_state(ConnectionState::Reconnecting);
            self.emit(DriverEvent::ReconnectScheduled { attempt, delay });

            match self.reconnecting(delay).await {
                Next::Stop(done) => break done,
                _ => continue,
            }
        };

        self.set_state(ConnectionState::Disconnected);
        if let Some(done) = stop {
            let _ = done.send(());
        }
    }

    /// Fetch a fresh token and connect, answering commands meanwhile
    async fn connecting(&mut self) -> Next<C::Session> {
        let attempt = connect_with_fresh_token(&self.connector, &self.tokens);
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(session) => Next::Connected(session),
                        Err(e) => Next::Failed(e),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send(_, reply)) => {
                        let _ = reply.send(Err(ClientError::NotConnected));
                    }
                    Some(Command::Disconnect(done)) => return Next::Stop(Some(done)),
                    None => return Next::Stop(None),
                },
            }
        }
    }

    async fn connected(&mut self, mut session: C::Session) -> Next<C::Session> {
        loop {
            tokio::select! {
                event = session.next_event() => match event {
                    SessionEvent::Frame(frame) => self.emit(DriverEvent::Frame(frame)),
                    SessionEvent::Closed { code } => {
                        tracing::debug!(?code, "Relay closed the session");
                        return Next::Lost;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send(event, reply)) => {
                        let result = session.send(&event).await.map_err(ClientError::Send);
                        let _ = reply.send(result);
                    }
                    Some(Command::Disconnect(done)) => {
                        session.close(close_codes::NORMAL).await;
                        return Next::Stop(Some(done));
                    }
                    None => {
                        session.close(close_codes::NORMAL).await;
                        return Next::Stop(None);
                    }
                },
            }
        }
    }

    /// The only timer: wait out the backoff unless torn down first
    async fn reconnecting(&mut self, delay: Duration) -> Next<C::Session> {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return Next::Retry,
                command = self.commands.recv() => match command {
                    Some(Command::Send(_, reply)) => {
                        let _ = reply.send(Err(ClientError::NotConnected));
                    }
                    Some(Command::Disconnect(done)) => return Next::Stop(Some(done)),
                    None => return Next::Stop(None),
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.emit(DriverEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: DriverEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

async fn connect_with_fresh_token<C: Connector, T: TokenSource>(
    connector: &C,
    tokens: &T,
) -> Result<C::Session, ConnectError> {
    let token = tokens.fetch_token().await?;
    connector.connect(&token).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::TokenSourceError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Issues "token-1", "token-2", ...
    #[derive(Default)]
    struct CountingTokens {
        issued: Mutex<u32>,
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn fetch_token(&self) -> Result<String, TokenSourceError> {
            let mut issued = self.issued.lock().unwrap();
            *issued += 1;
            Ok(format!("token-{}", issued))
        }
    }

    /// Shared view into what the fake connector saw
    #[derive(Default)]
    struct Record {
        tokens: Vec<String>,
        sent: Vec<ClientEvent>,
        closed_with: Vec<u16>,
        remotes: Vec<mpsc::UnboundedSender<SessionEvent>>,
    }

    struct FakeSession {
        incoming: mpsc::UnboundedReceiver<SessionEvent>,
        record: Arc<Mutex<Record>>,
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn send(&mut self, event: &ClientEvent) -> Result<(), ConnectError> {
            self.record.lock().unwrap().sent.push(event.clone());
            Ok(())
        }

        async fn next_event(&mut self) -> SessionEvent {
            match self.incoming.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self, code: u16) {
            self.record.lock().unwrap().closed_with.push(code);
        }
    }

    /// Rejects attempts according to a script, then accepts
    struct ScriptedConnector {
        rejections: Mutex<VecDeque<u16>>,
        record: Arc<Mutex<Record>>,
    }

    impl ScriptedConnector {
        fn new(rejections: &[u16]) -> (Self, Arc<Mutex<Record>>) {
            let record = Arc::new(Mutex::new(Record::default()));
            (
                Self {
                    rejections: Mutex::new(rejections.iter().copied().collect()),
                    record: Arc::clone(&record),
                },
                record,
            )
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Session = FakeSession;

        async fn connect(&self, token: &str) -> Result<FakeSession, ConnectError> {
            self.record.lock().unwrap().tokens.push(token.to_string());
            if let Some(code) = self.rejections.lock().unwrap().pop_front() {
                return Err(ConnectError::Rejected {
                    code,
                    reason: "rejected".to_string(),
                });
            }
            let (remote, incoming) = mpsc::unbounded_channel();
            self.record.lock().unwrap().remotes.push(remote);
            Ok(FakeSession {
                incoming,
                record: Arc::clone(&self.record),
            })
        }
    }

    fn policy(initial_ms: u64, max_ms: u64, max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            max_attempts,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<DriverEvent>) -> DriverEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a driver event")
            .expect("driver stopped")
    }

    /// Collect events up to and including the first one matching `until`
    async fn collect_until(
        events: &mut mpsc::UnboundedReceiver<DriverEvent>,
        until: impl Fn(&DriverEvent) -> bool,
    ) -> Vec<DriverEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(events).await;
            let done = until(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn scheduled_delays(events: &[DriverEvent]) -> Vec<Duration> {
        events
            .iter()
            .filter_map(|e| match e {
                DriverEvent::ReconnectScheduled { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_two_rejections_then_connected() {
        let (connector, record) = ScriptedConnector::new(&[4003, 4002]);
        let (client, mut events) =
            ReconnectingClient::spawn(connector, CountingTokens::default(), policy(10, 25, 5));

        let seen = collect_until(&mut events, |e| {
            *e == DriverEvent::StateChanged(ConnectionState::Connected)
        })
        .await;

        let delays = scheduled_delays(&seen);
        assert_eq!(delays.len(), 2);
        assert!(delays[0] < delays[1]);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(25)));
        assert_eq!(client.state(), ConnectionState::Connected);

        // A fresh token for every attempt
        assert_eq!(
            record.lock().unwrap().tokens,
            vec!["token-1", "token-2", "token-3"]
        );
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (connector, record) = ScriptedConnector::new(&[4003; 10]);
        let (mut client, mut events) =
            ReconnectingClient::spawn(connector, CountingTokens::default(), policy(5, 10, 3));

        let seen = collect_until(&mut events, |e| matches!(e, DriverEvent::GaveUp { .. })).await;
        assert_eq!(seen.last(), Some(&DriverEvent::GaveUp { attempts: 3 }));
        assert_eq!(scheduled_delays(&seen).len(), 2);

        assert_eq!(
            client.wait_for(ConnectionState::Disconnected).await,
            ConnectionState::Disconnected
        );
        assert_eq!(record.lock().unwrap().tokens.len(), 3);
        assert!(matches!(
            client.send(ClientEvent::Ping).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (connector, record) = ScriptedConnector::new(&[4003]);
        let (mut client, mut events) = ReconnectingClient::spawn(
            connector,
            CountingTokens::default(),
            policy(60_000, 60_000, 5),
        );

        collect_until(&mut events, |e| {
            matches!(e, DriverEvent::ReconnectScheduled { .. })
        })
        .await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        tokio::time::timeout(Duration::from_secs(1), client.disconnect())
            .await
            .expect("disconnect waited for the backoff timer");
        assert_eq!(
            client.wait_for(ConnectionState::Disconnected).await,
            ConnectionState::Disconnected
        );
        assert!(record.lock().unwrap().tokens.len() == 1);
    }

    #[tokio::test]
    async fn test_intentional_teardown_closes_normally() {
        let (connector, record) = ScriptedConnector::new(&[]);
        let (mut client, _events) =
            ReconnectingClient::spawn(connector, CountingTokens::default(), policy(10, 20, 3));
        client.wait_for(ConnectionState::Connected).await;

        client.disconnect().await;
        assert_eq!(record.lock().unwrap().closed_with, vec![close_codes::NORMAL]);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.is_finished());
    }

    #[tokio::test]
    async fn test_send_requires_connected_state() {
        let (connector, record) = ScriptedConnector::new(&[4001]);
        let (mut client, _events) = ReconnectingClient::spawn(
            connector,
            CountingTokens::default(),
            policy(50, 100, 3),
        );

        assert!(matches!(
            client.send(ClientEvent::Ping).await,
            Err(ClientError::NotConnected)
        ));

        client.wait_for(ConnectionState::Connected).await;
        client
            .send(ClientEvent::Typing { is_typing: true })
            .await
            .unwrap();
        assert_eq!(
            record.lock().unwrap().sent,
            vec![ClientEvent::Typing { is_typing: true }]
        );
    }

    #[tokio::test]
    async fn test_lost_session_reconnects_with_new_token() {
        let (connector, record) = ScriptedConnector::new(&[]);
        let (mut client, mut events) =
            ReconnectingClient::spawn(connector, CountingTokens::default(), policy(10, 20, 3));
        client.wait_for(ConnectionState::Connected).await;

        let remote = record.lock().unwrap().remotes[0].clone();
        remote.send(SessionEvent::Frame(ServerEvent::Pong)).unwrap();
        remote.send(SessionEvent::Closed { code: Some(1006) }).unwrap();

        let seen = collect_until(&mut events, |e| {
            matches!(e, DriverEvent::ReconnectScheduled { .. })
        })
        .await;
        assert!(seen.contains(&DriverEvent::Frame(ServerEvent::Pong)));
        assert!(seen.contains(&DriverEvent::StateChanged(ConnectionState::Reconnecting)));

        collect_until(&mut events, |e| {
            *e == DriverEvent::StateChanged(ConnectionState::Connected)
        })
        .await;
        assert_eq!(record.lock().unwrap().tokens, vec!["token-1", "token-2"]);
    }
}
