// src/auth.rs

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

pub const TOKEN_LIFETIME: Duration = Duration::from_secs(15);
pub const TOKEN_LENGTH: usize = 32;
pub const LOBBY_KEY_LIFETIME: Duration = Duration::from_secs(180);
/// Entropy behind a lobby key; 12 bytes encode to 16 url-safe characters.
pub const LOBBY_KEY_BYTES: usize = 12;
pub const LOBBY_KEY_LENGTH: usize = 16;
/// Longest lobby key accepted on the `/g/{key}` route.
pub const LOBBY_KEY_MAX_LENGTH: usize = 32;

/// Pair string naming the public rendezvous queue; anything else selects a
/// private room.
pub const PUBLIC_PAIR_STRING: &str = "default";

/// What the ticket registry remembers about an issued ticket.
#[derive(Debug, Clone)]
pub struct TicketClaim {
    pub issued_to: Option<IpAddr>,
    pub issued_at: DateTime<Utc>,
}

impl TicketClaim {
    pub fn new(issued_to: Option<IpAddr>) -> Self {
        Self {
            issued_to,
            issued_at: Utc::now(),
        }
    }

    /// Tickets are bound to the issuing address; the check only applies when
    /// both sides are known.
    pub fn matches_addr(&self, remote: Option<IpAddr>) -> bool {
        match (self.issued_to, remote) {
            (Some(issued), Some(presented)) => issued == presented,
            _ => true,
        }
    }
}

pub fn new_ticket_value() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn new_lobby_key() -> String {
    let mut bytes = [0u8; LOBBY_KEY_BYTES];
    rand::thread_rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn ticket_values_are_fixed_length_hex() {
        for _ in 0..16 {
            let ticket = new_ticket_value();
            assert_eq!(ticket.len(), TOKEN_LENGTH);
            assert!(ticket.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn lobby_keys_are_url_safe() {
        for _ in 0..16 {
            let key = new_lobby_key();
            assert_eq!(key.len(), LOBBY_KEY_LENGTH);
            assert!(
                key.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
            assert!(key.len() <= LOBBY_KEY_MAX_LENGTH);
        }
    }

    #[test]
    fn address_binding_applies_only_when_both_known() {
        let here = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let elsewhere = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        let bound = TicketClaim::new(Some(here));
        assert!(bound.matches_addr(Some(here)));
        assert!(!bound.matches_addr(Some(elsewhere)));
        assert!(bound.matches_addr(None));

        let unbound = TicketClaim::new(None);
        assert!(unbound.matches_addr(Some(here)));
        assert!(unbound.matches_addr(None));
    }
}
