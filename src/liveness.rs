use crate::prelude::*;

use std::sync::Arc;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Connected/disconnected flag driven by the transport. Subscribers are
/// only woken on an actual transition.
#[derive(Clone, Debug)]
pub struct Liveness {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn on_connect(&self) {
        self.set(ConnectionState::Connected);
    }

    pub fn on_disconnect(&self) {
        self.set(ConnectionState::Disconnected);
    }

    fn set(&self, state: ConnectionState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            info!("device link {:?}", state);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        assert!(!Liveness::new().connected());
    }

    #[test]
    fn reflects_last_call() {
        let liveness = Liveness::new();
        liveness.on_connect();
        liveness.on_connect();
        assert!(liveness.connected());
        liveness.on_disconnect();
        assert_eq!(liveness.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn notifies_on_transition_only() {
        let liveness = Liveness::new();
        let mut rx = liveness.subscribe();

        liveness.on_disconnect();
        assert!(!rx.has_changed().unwrap());

        liveness.on_connect();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }
}
