//! Transport selection: which transport opens the channel and which
//! upgrades are worth probing.
//!
//! # Initial transport
//!
//! The first configured transport opens the channel, normally polling for
//! maximum compatibility. When the caller reports that a previous channel
//! with the same configuration upgraded successfully and `remember_upgrade`
//! is on, the channel opens directly on the websocket instead.
//!
//! # Upgrades
//!
//! Only polling → websocket is attempted, and only when the server offers it
//! and the configuration allows it.

use wirelink_transport::TransportKind;

use crate::handshake::Handshake;

/// Transport choices for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPreferences {
    /// Allowed transports in preference order.
    pub transports: Vec<TransportKind>,
    /// Probe for a better transport after the handshake.
    pub upgrade: bool,
    /// Honor the caller's prior-upgrade hint when picking the first transport.
    pub remember_upgrade: bool,
}

impl Default for TransportPreferences {
    fn default() -> Self {
        Self {
            transports: vec![TransportKind::Polling, TransportKind::WebSocket],
            upgrade: true,
            remember_upgrade: false,
        }
    }
}

impl TransportPreferences {
    pub fn is_allowed(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Transport to open the channel with, `None` if nothing is allowed.
    pub fn initial_transport(&self, prior_upgrade_succeeded: bool) -> Option<TransportKind> {
        if self.remember_upgrade
            && prior_upgrade_succeeded
            && self.is_allowed(TransportKind::WebSocket)
        {
            return Some(TransportKind::WebSocket);
        }
        self.transports.first().copied()
    }

    /// Transport to probe from `current` given what the server offers.
    pub fn upgrade_target(&self, current: TransportKind, handshake: &Handshake) -> Option<TransportKind> {
        if !self.upgrade || current != TransportKind::Polling {
            return None;
        }
        handshake
            .known_upgrades()
            .into_iter()
            .find(|&kind| kind == TransportKind::WebSocket && self.is_allowed(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(upgrades: &[&str]) -> Handshake {
        Handshake {
            sid: "s".into(),
            upgrades: upgrades.iter().map(|s| s.to_string()).collect(),
            ping_interval: 25_000,
            ping_timeout: 5_000,
        }
    }

    #[test]
    fn test_initial_transport_is_first_configured() {
        let prefs = TransportPreferences::default();
        assert_eq!(prefs.initial_transport(false), Some(TransportKind::Polling));
        // hint ignored unless remembered upgrades are enabled
        assert_eq!(prefs.initial_transport(true), Some(TransportKind::Polling));
    }

    #[test]
    fn test_remembered_upgrade_skips_polling() {
        let prefs = TransportPreferences {
            remember_upgrade: true,
            ..Default::default()
        };
        assert_eq!(prefs.initial_transport(true), Some(TransportKind::WebSocket));
        assert_eq!(prefs.initial_transport(false), Some(TransportKind::Polling));

        let polling_only = TransportPreferences {
            transports: vec![TransportKind::Polling],
            remember_upgrade: true,
            ..Default::default()
        };
        assert_eq!(polling_only.initial_transport(true), Some(TransportKind::Polling));
    }

    #[test]
    fn test_empty_preferences() {
        let prefs = TransportPreferences {
            transports: Vec::new(),
            ..Default::default()
        };
        assert_eq!(prefs.initial_transport(false), None);
    }

    #[test]
    fn test_upgrade_filtering() {
        let prefs = TransportPreferences::default();
        assert_eq!(
            prefs.upgrade_target(TransportKind::Polling, &handshake(&["websocket"])),
            Some(TransportKind::WebSocket)
        );
        assert_eq!(prefs.upgrade_target(TransportKind::Polling, &handshake(&[])), None);
        assert_eq!(
            prefs.upgrade_target(TransportKind::WebSocket, &handshake(&["websocket"])),
            None
        );

        let no_ws = TransportPreferences {
            transports: vec![TransportKind::Polling],
            ..Default::default()
        };
        assert_eq!(no_ws.upgrade_target(TransportKind::Polling, &handshake(&["websocket"])), None);

        let disabled = TransportPreferences {
            upgrade: false,
            ..Default::default()
        };
        assert_eq!(
            disabled.upgrade_target(TransportKind::Polling, &handshake(&["websocket"])),
            None
        );
    }
}
