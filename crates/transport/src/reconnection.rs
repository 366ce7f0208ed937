//! Bounded reconnection after unsolicited disconnects.
//!
//! Policy: fixed delay between attempts, a hard attempt cap, counter reset
//! on any successful connection. A deliberate close sets the manual flag
//! and cancels the loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{open_connection, Shared};
use crate::types::{ConnectionState, TransportEvent};

/// Cancels any active reconnect loop.
pub(crate) fn cancel_reconnect(shared: &Shared) {
    if let Some(token) = shared.reconnect_cancel.lock().unwrap().take() {
        token.cancel();
    }
}

/// Watches the read pump; when it exits the connection is dead.
pub(crate) fn spawn_disconnect_monitor(shared: Arc<Shared>, read_handle: JoinHandle<()>) {
    tokio::spawn(async move {
        let _ = read_handle.await;
        handle_disconnect(shared);
    });
}

/// Tears down the dead connection and, unless the disconnect was
/// deliberate, schedules the reconnect loop.
fn handle_disconnect(shared: Arc<Shared>) {
    if let Some(token) = shared.session_cancel.lock().unwrap().take() {
        token.cancel();
    }
    *shared.write_tx.write().unwrap() = None;
    *shared.state.write().unwrap() = ConnectionState::Disconnected;
    let _ = shared.events_tx.send(TransportEvent::Disconnected);

    if shared.manual_disconnect.load(Ordering::Relaxed) {
        debug!("deliberate disconnect, not reconnecting");
        return;
    }

    let cancel = CancellationToken::new();
    cancel_reconnect(&shared);
    *shared.reconnect_cancel.lock().unwrap() = Some(cancel.clone());
    tokio::spawn(reconnect_loop(shared, cancel));
}

/// Attempts to reconnect up to `policy.max_attempts` times, waiting
/// `policy.delay` before each attempt. Emits `ReconnectExhausted` when all
/// attempts fail.
async fn reconnect_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let url = match shared.url.read().unwrap().clone() {
        Some(url) => url,
        None => return,
    };
    let policy = shared.policy;

    for attempt in 1..=policy.max_attempts {
        *shared.state.write().unwrap() = ConnectionState::Reconnecting { attempt };
        let _ = shared
            .events_tx
            .send(TransportEvent::Reconnecting { attempt });
        info!(attempt, delay_secs = policy.delay.as_secs(), "reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(policy.delay) => {}
        }
        if cancel.is_cancelled() {
            return;
        }

        match open_connection(&shared, &url).await {
            Ok(()) => {
                // Success resets the attempt counter: the next disconnect
                // spawns a fresh loop starting at attempt 1.
                info!(attempt, "reconnected");
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }

        if cancel.is_cancelled() {
            return;
        }
    }

    warn!(
        attempts = policy.max_attempts,
        "reconnect attempts exhausted, giving up"
    );
    *shared.state.write().unwrap() = ConnectionState::Disconnected;
    let _ = shared.events_tx.send(TransportEvent::ReconnectExhausted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WsTransport;
    use crate::types::ReconnectPolicy;
    use std::time::Duration;

    fn unreachable_transport(max_attempts: u32) -> WsTransport {
        WsTransport::with_policy(ReconnectPolicy {
            delay: Duration::from_secs(5),
            max_attempts,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_loop_is_bounded() {
        let transport = unreachable_transport(5);
        let mut events = transport.take_events().unwrap();

        // Simulate an established connection that dropped: seed the URL and
        // drive the disconnect path directly.
        *transport.shared.url.write().unwrap() = Some("ws://127.0.0.1:1/ws".into());
        handle_disconnect(transport.shared.clone());

        let mut attempts = 0;
        let mut exhausted = false;
        // Generous virtual-time budget: 5 attempts x 5 s.
        for _ in 0..200 {
            tokio::time::advance(Duration::from_secs(1)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            while let Ok(event) = events.try_recv() {
                match event {
                    TransportEvent::Reconnecting { attempt } => attempts = attempt,
                    TransportEvent::ReconnectExhausted => exhausted = true,
                    _ => {}
                }
            }
            if exhausted {
                break;
            }
        }

        assert_eq!(attempts, 5, "should attempt exactly 5 reconnects");
        assert!(exhausted, "should emit ReconnectExhausted");
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_close_suppresses_reconnect() {
        let transport = unreachable_transport(5);
        let mut events = transport.take_events().unwrap();

        *transport.shared.url.write().unwrap() = Some("ws://127.0.0.1:1/ws".into());
        transport.close(); // sets the manual flag
        handle_disconnect(transport.shared.clone());

        tokio::time::advance(Duration::from_secs(30)).await;
        let mut saw_reconnecting = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransportEvent::Reconnecting { .. }) {
                saw_reconnecting = true;
            }
        }
        assert!(!saw_reconnecting, "manual close must not trigger reconnects");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pending_reconnect() {
        let transport = unreachable_transport(5);
        let mut events = transport.take_events().unwrap();

        *transport.shared.url.write().unwrap() = Some("ws://127.0.0.1:1/ws".into());
        handle_disconnect(transport.shared.clone());

        // Let the first attempt get scheduled, then cancel deliberately.
        tokio::time::advance(Duration::from_secs(1)).await;
        transport.close();
        while events.try_recv().is_ok() {}

        tokio::time::advance(Duration::from_secs(60)).await;
        let mut later_attempts = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransportEvent::Reconnecting { .. }) {
                later_attempts += 1;
            }
        }
        assert_eq!(later_attempts, 0, "close must cancel the pending reconnect");
    }
}
