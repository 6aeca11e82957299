//! Typed notifications published whenever the mirror changes.

use solana_pubkey::Pubkey;
use tokio::sync::broadcast;

use crate::state::OracleSource;

/// Enumerated event kinds, one per `CacheEvent` variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateUpdate,
    MarketUpdate,
    VaultUpdate,
    OracleUpdate,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    StateUpdated {
        slot: u64,
    },
    MarketUpdated {
        index: u16,
        slot: u64,
    },
    VaultUpdated {
        index: u16,
        slot: u64,
    },
    OracleUpdated {
        address: Pubkey,
        source: OracleSource,
        slot: u64,
    },
    Error {
        message: String,
    },
}

impl CacheEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::StateUpdated { .. } => EventKind::StateUpdate,
            CacheEvent::MarketUpdated { .. } => EventKind::MarketUpdate,
            CacheEvent::VaultUpdated { .. } => EventKind::VaultUpdate,
            CacheEvent::OracleUpdated { .. } => EventKind::OracleUpdate,
            CacheEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Broadcast fan-out of [`CacheEvent`]s.
///
/// Publishing never blocks and never fails: with no receivers the event is
/// dropped, and slow receivers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_receivers_is_dropped() {
        let bus = EventBus::new(4);
        bus.emit(CacheEvent::StateUpdated { slot: 1 });

        let mut receiver = bus.subscribe();
        bus.emit(CacheEvent::MarketUpdated { index: 2, slot: 3 });
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::MarketUpdate);
        assert_eq!(event, CacheEvent::MarketUpdated { index: 2, slot: 3 });
    }
}
