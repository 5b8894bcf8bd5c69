//! The listen loop.
//!
//! One call to [`Broadcast::listen`] runs one session through these states:
//!
//! ```text
//! Idle → Connecting → Subscribed → Listening → StopRequested → Unsubscribing → Terminated
//! ```
//!
//! A session terminates on a clean stop, on an idle timeout, or on the first
//! receive-side error. Errors are never retried or skipped per message.

use std::time::Duration;
use sysbroadcast_transport::{Subscription, SubscriptionEvent, TransportError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcast;
use crate::error::BroadcastError;
use crate::handler::Flow;

/// Slack allowed between the configured timeout and the elapsed session time
/// for a connectivity error to count as the idle timeout.
pub const TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// States of a listening session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Idle,
    Connecting,
    Subscribed,
    Listening,
    StopRequested,
    Unsubscribing,
    Terminated,
}

/// How a listening session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenEnd {
    /// [`Broadcast::stop`] was called and the unsubscription completed.
    Stopped,
    /// A handler returned [`Flow::Stop`].
    HandlerStopped,
    /// The configured idle timeout elapsed.
    TimedOut,
    /// The transport stopped yielding events.
    Closed,
}

/// Outcome of handling one received message.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Continue,
    StopRequested,
    Fatal(BroadcastError),
}

impl From<Result<Flow, BroadcastError>> for Dispatch {
    fn from(result: Result<Flow, BroadcastError>) -> Self {
        match result {
            Ok(Flow::Continue) => Dispatch::Continue,
            Ok(Flow::Stop) => Dispatch::StopRequested,
            Err(e) => Dispatch::Fatal(e),
        }
    }
}

/// Whether a connectivity error after `elapsed` is the expected end of a
/// session with idle timeout `timeout`.
///
/// A zero timeout waits indefinitely, so no error is ever expected.
#[must_use]
pub fn is_expected_timeout(timeout: Duration, elapsed: Duration) -> bool {
    !timeout.is_zero() && elapsed >= timeout.saturating_sub(TIMEOUT_SLACK)
}

pub(crate) struct ListenSession<'a> {
    client: &'a Broadcast,
    timeout: Duration,
    started: Instant,
    state: ListenState,
}

impl<'a> ListenSession<'a> {
    pub(crate) fn new(client: &'a Broadcast, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            started: Instant::now(),
            state: ListenState::Idle,
        }
    }

    fn transition(&mut self, next: ListenState) {
        debug!(
            channel = %self.client.channel(),
            from = ?self.state,
            to = ?next,
            "Listen state change"
        );
        self.state = next;
    }

    fn finish(&mut self, end: ListenEnd) -> Result<ListenEnd, BroadcastError> {
        self.transition(ListenState::Terminated);
        info!(
            channel = %self.client.channel(),
            end = ?end,
            elapsed = ?self.started.elapsed(),
            "Stopped listening"
        );
        Ok(end)
    }

    fn fail(&mut self, error: BroadcastError) -> Result<ListenEnd, BroadcastError> {
        self.transition(ListenState::Terminated);
        warn!(channel = %self.client.channel(), error = %error, "Listening failed");
        Err(error)
    }

    /// Classify a transport error as the idle timeout or a real failure.
    fn transport_error(&mut self, error: TransportError) -> Result<ListenEnd, BroadcastError> {
        if error.is_connectivity() && is_expected_timeout(self.timeout, self.started.elapsed()) {
            debug!(channel = %self.client.channel(), error = %error, "Idle timeout reached");
            return self.finish(ListenEnd::TimedOut);
        }
        self.fail(error.into())
    }

    pub(crate) async fn run(mut self) -> Result<ListenEnd, BroadcastError> {
        let client = self.client;
        client.reset_stop();

        info!(
            channel = %client.channel(),
            transport = client.transport_name(),
            timeout_secs = self.timeout.as_secs(),
            "Listening for broadcasts"
        );

        self.transition(ListenState::Connecting);
        let options = client
            .connection_options()
            .clone()
            .with_read_write_timeout(self.timeout)
            .with_connect_timeout(Duration::ZERO);

        let mut subscription = match client.transport().subscribe(&options, client.channel()).await
        {
            Ok(subscription) => subscription,
            Err(e) => return self.transport_error(e),
        };

        loop {
            let event = match subscription.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) if self.state == ListenState::Unsubscribing => {
                    return self.finish(ListenEnd::Stopped)
                }
                Ok(None) => return self.finish(ListenEnd::Closed),
                Err(e) => return self.transport_error(e),
            };

            match event {
                SubscriptionEvent::Subscribe { .. } => {
                    self.transition(ListenState::Subscribed);
                    let sequence = match client.sequence().await {
                        Ok(sequence) => sequence,
                        Err(e) => return self.fail(e),
                    };
                    client.notify_listen(sequence);
                    self.transition(ListenState::Listening);
                }
                SubscriptionEvent::Message { payload, .. } => {
                    match client.receive(&payload).await {
                        Dispatch::Continue => {}
                        Dispatch::StopRequested => return self.finish(ListenEnd::HandlerStopped),
                        Dispatch::Fatal(e) => return self.fail(e),
                    }
                }
                SubscriptionEvent::Unsubscribe { .. } => {
                    if self.state == ListenState::Unsubscribing {
                        return self.finish(ListenEnd::Stopped);
                    }
                }
            }

            if client.is_stopped() && self.state != ListenState::Unsubscribing {
                if let Err(e) = self.request_unsubscribe(subscription.as_mut()).await {
                    return self.transport_error(e);
                }
            }
        }
    }

    async fn request_unsubscribe(
        &mut self,
        subscription: &mut dyn Subscription,
    ) -> Result<(), TransportError> {
        self.transition(ListenState::StopRequested);
        subscription.unsubscribe().await?;
        self.transition(ListenState::Unsubscribing);
        Ok(())
    }
}
