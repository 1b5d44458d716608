//! Async session runner
//!
//! One tokio task per session. Link reads, tunnel reads, timer ticks, and
//! owner commands are all multiplexed onto this task, so the session state
//! machine itself never needs a lock; I/O completions that land after a
//! stop are simply dropped with the task.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::SessionEvent;
use crate::io::{LinkInterface, TunnelInterface};
use crate::session::Session;

/// Timer granularity for retransmission, keepalive, and deadlines.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Owner-issued commands.
pub enum SessionCommand {
    /// Stop for good.
    Shutdown,
    /// Stop and ask the owner to re-establish.
    Reconnect,
    /// Swap the link in place (OpenVPN session mobility). Ignored unless
    /// the server pushed a peer id.
    RebindLink(Box<dyn LinkInterface>),
}

/// Handle to a running session task.
pub struct SessionRunner {
    task: JoinHandle<()>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionRunner {
    /// Start the session over the given link and tunnel.
    pub fn spawn(
        mut session: Session,
        mut link: Box<dyn LinkInterface>,
        mut tunnel: Box<dyn TunnelInterface>,
    ) -> Self {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SessionCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SessionEvent>();

        let task = tokio::spawn(async move {
            session.start(link.properties(), Instant::now());
            let mut ticker = tokio::time::interval(TICK_INTERVAL);

            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(SessionCommand::Shutdown) | None => session.shutdown(None),
                        Some(SessionCommand::Reconnect) => session.reconnect(None),
                        Some(SessionCommand::RebindLink(new_link)) => {
                            if session.rebind_link(new_link.properties()) {
                                link = new_link;
                            } else {
                                warn!("link rebind refused: no peer id from server");
                            }
                        }
                    },
                    result = link.read_packets() => match result {
                        Ok(packets) => {
                            let now = Instant::now();
                            for packet in packets {
                                session.handle_link_packet(&packet, now);
                            }
                        }
                        Err(e) => session.report_link_write_failure(e.to_string()),
                    },
                    result = tunnel.read_packets() => match result {
                        Ok(packets) => {
                            let now = Instant::now();
                            for packet in packets {
                                session.handle_tunnel_packet(&packet, now);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "tunnel read failed; shutting down");
                            session.shutdown(None);
                        }
                    },
                    _ = ticker.tick() => {
                        session.handle_tick(Instant::now());
                    }
                }

                pump_outputs(&mut session, link.as_mut(), tunnel.as_mut(), &event_tx).await;

                if session.is_stopped() {
                    // Deliver whatever events the stop produced, then end.
                    while let Some(event) = session.poll_event() {
                        let _ = event_tx.send(event);
                    }
                    debug!("session task exiting");
                    break;
                }
            }
        });

        Self {
            task,
            commands: command_tx,
            events: event_rx,
        }
    }

    /// Send a command to the session task.
    pub fn command(&self, command: SessionCommand) {
        let _ = self.commands.send(command);
    }

    /// Receive the next session event; `None` when the task has finished
    /// and the channel drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait for the session task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Drain the session's output queues onto the real interfaces.
async fn pump_outputs(
    session: &mut Session,
    link: &mut dyn LinkInterface,
    tunnel: &mut dyn TunnelInterface,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    let mut link_batch = Vec::new();
    while let Some(frame) = session.next_link_packet() {
        link_batch.push(frame);
    }
    if !link_batch.is_empty() {
        if let Err(e) = link.write_packets(link_batch).await {
            session.report_link_write_failure(e.to_string());
        }
    }

    let mut tunnel_batch = Vec::new();
    while let Some(packet) = session.next_tunnel_packet() {
        tunnel_batch.push(packet);
    }
    if !tunnel_batch.is_empty() {
        // Decrypted packets land on the tunnel as one batch, in order.
        if let Err(e) = tunnel.write_packets(tunnel_batch).await {
            warn!(error = %e, "tunnel write failed");
        }
    }

    while let Some(event) = session.poll_event() {
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryLink, MemoryTunnel};
    use nimbusvpn_core::{Credentials, SessionConfig, SessionError, SessionStatus};

    fn test_session() -> Session {
        // The CA is only touched once a server hard reset arrives; these
        // tests stop before that.
        Session::new(SessionConfig::new("stub ca"), Credentials::empty()).unwrap()
    }

    async fn wait_for_stop(runner: &mut SessionRunner) -> (bool, Option<SessionError>) {
        loop {
            match runner.next_event().await {
                Some(SessionEvent::Stopped {
                    should_reconnect,
                    reason,
                }) => return (should_reconnect, reason),
                Some(_) => continue,
                None => panic!("runner ended without a Stopped event"),
            }
        }
    }

    #[tokio::test]
    async fn test_runner_reports_dead_link() {
        let (client_link, server_link) = MemoryLink::pair("203.0.113.5", 1400, false);
        let (device, _tunnel_side) = MemoryTunnel::pair();
        let mut runner = SessionRunner::spawn(
            test_session(),
            Box::new(client_link),
            Box::new(device),
        );
        drop(server_link);

        let (should_reconnect, reason) = wait_for_stop(&mut runner).await;
        assert!(should_reconnect);
        assert!(matches!(reason, Some(SessionError::FailedLinkWrite(_))));
        runner.join().await;
    }

    #[tokio::test]
    async fn test_runner_shutdown_command() {
        let (client_link, _server_link) = MemoryLink::pair("203.0.113.5", 1400, false);
        let (device, _tunnel_side) = MemoryTunnel::pair();
        let mut runner = SessionRunner::spawn(
            test_session(),
            Box::new(client_link),
            Box::new(device),
        );

        // The hard reset goes out first; the owner then gives up.
        runner.command(SessionCommand::Shutdown);

        let mut saw_connecting = false;
        loop {
            match runner.next_event().await {
                Some(SessionEvent::StatusChanged(SessionStatus::Connecting)) => {
                    saw_connecting = true;
                }
                Some(SessionEvent::Stopped {
                    should_reconnect,
                    reason,
                }) => {
                    assert!(!should_reconnect);
                    assert!(reason.is_none());
                    break;
                }
                Some(_) => continue,
                None => panic!("runner ended without a Stopped event"),
            }
        }
        assert!(saw_connecting);
        runner.join().await;
    }
}
