//! Shared harness: a channel wired to in-memory transports.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use wirelink_core::{Channel, ChannelConfig, ChannelEvent, ChannelEvents};
use wirelink_transport::testing::{MockConnector, MockPeer, MockPeers};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub channel: Channel,
    pub events: ChannelEvents,
    pub connector: MockConnector,
    pub peers: MockPeers,
}

impl Harness {
    pub fn open(config: ChannelConfig) -> Self {
        Self::open_with_hint(config, false)
    }

    pub fn open_with_hint(config: ChannelConfig, prior_upgrade_succeeded: bool) -> Self {
        init_tracing();
        let (connector, peers) = MockConnector::new();
        let (channel, events) =
            Channel::open_with_hint(config, Arc::new(connector.clone()), prior_upgrade_succeeded)
                .expect("valid config");
        Self {
            channel,
            events,
            connector,
            peers,
        }
    }

    pub async fn next_peer(&mut self) -> MockPeer {
        tokio::time::timeout(Duration::from_secs(5), self.peers.next())
            .await
            .expect("timed out waiting for a transport")
            .expect("connector dropped")
    }

    pub async fn next_event(&mut self) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.next())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream ended")
    }

    /// Next event satisfying `matches`, skipping the rest.
    pub async fn expect<F>(&mut self, mut matches: F) -> ChannelEvent
    where
        F: FnMut(&ChannelEvent) -> bool,
    {
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
        }
    }

    /// Every event up to and including `Closed`.
    pub async fn until_closed(&mut self) -> Vec<ChannelEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = matches!(event, ChannelEvent::Closed(_));
            seen.push(event);
            if done {
                return seen;
            }
        }
    }
}

/// Config with upgrades off, so a single polling transport carries the channel.
pub fn polling_only() -> ChannelConfig {
    ChannelConfig {
        upgrade: false,
        ..ChannelConfig::default()
    }
}
