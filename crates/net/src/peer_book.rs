//! Connected-session and ban bookkeeping.
//!
//! Both tables live under one mutex: every read that feeds a subsequent
//! write happens while holding it. Broadcast paths take a snapshot and
//! dispatch outside the lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::directory::PeerRecord;
use crate::session::PeerSession;
use crate::NetConfig;

pub(crate) const MAX_CONNECTIONS: usize = 8;
pub(crate) const BAN_SCORE_THRESHOLD: u64 = 200;
pub(crate) const BAN_SECS: u64 = 24 * 60 * 60;
pub(crate) const DIAL_COOLOFF_SECS: u64 = 5 * 60;

pub(crate) struct PeerSlot {
    pub session: Arc<PeerSession>,
    pub record: PeerRecord,
    pub inbound: bool,
}

#[derive(Default)]
pub(crate) struct PeerTables {
    pub connected: HashMap<String, PeerSlot>,
    pub banned: HashMap<String, u64>,
}

impl PeerTables {
    pub fn is_banned(&self, addr: &str, now: u64) -> bool {
        self.banned
            .get(addr)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    /// Adds `delta` to a connected peer's score; crossing the threshold bans
    /// the address for 24 hours. Unknown addresses are ignored.
    pub fn change_score(&mut self, addr: &str, delta: u64, now: u64) {
        let Some(slot) = self.connected.get_mut(addr) else {
            return;
        };
        slot.record.score = slot.record.score.saturating_add(delta);
        warn!(
            "{addr} misbehaving, increasing ban score by {delta} to {}",
            slot.record.score
        );
        if slot.record.score > BAN_SCORE_THRESHOLD {
            warn!("banning {addr} for being above the ban score threshold");
            self.banned.insert(addr.to_string(), now + BAN_SECS);
        }
    }

    /// Greatest advertised height across connected peers, or `floor`.
    pub fn best_height(&self, floor: u64) -> u64 {
        self.connected
            .values()
            .map(|slot| slot.record.height)
            .fold(floor, u64::max)
    }

    pub fn sessions(&self) -> Vec<(String, Arc<PeerSession>)> {
        self.connected
            .iter()
            .map(|(addr, slot)| (addr.clone(), Arc::clone(&slot.session)))
            .collect()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parses a gossiped or stored address into its canonical IP form.
pub(crate) fn canonical_peer_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse::<IpAddr>().ok()
}

/// Addresses we never dial or accept: ourselves (public or bound interface),
/// loopback (outside single-host test deployments), and the unspecified
/// address.
pub(crate) fn is_filtered_address(ip: &IpAddr, config: &NetConfig) -> bool {
    if ip.is_unspecified() {
        return true;
    }
    if ip.is_loopback() && !config.allow_loopback {
        return true;
    }
    if config.public_addr.as_ref() == Some(ip) {
        return true;
    }
    if !config.bind_addr.is_unspecified() && *ip == config.bind_addr {
        return true;
    }
    false
}

/// A recent failed dial cools the address off; a recent successful contact
/// (`last_attempt == last_seen`) does not.
pub(crate) fn dial_cooloff_active(record: &PeerRecord, now: u64) -> bool {
    record.last_attempt + DIAL_COOLOFF_SECS > now && record.last_attempt != record.last_seen
}

pub(crate) fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> NetConfig {
        NetConfig {
            public_addr: Some("8.8.4.4".parse().unwrap()),
            seed_file: PathBuf::from("peers.txt"),
            ..NetConfig::default()
        }
    }

    #[test]
    fn ban_expiry_tracks_the_clock() {
        let mut tables = PeerTables::default();
        tables.banned.insert("1.2.3.4".to_string(), 1_000);
        assert!(tables.is_banned("1.2.3.4", 999));
        assert!(!tables.is_banned("1.2.3.4", 1_000));
        assert!(!tables.is_banned("5.6.7.8", 0));
    }

    #[test]
    fn crossing_the_score_threshold_bans_for_a_day() {
        let mut tables = PeerTables::default();
        // change_score only touches connected peers
        tables.change_score("1.2.3.4", 250, 100);
        assert!(!tables.is_banned("1.2.3.4", 100));
    }

    #[test]
    fn cooloff_skips_recent_failures_only() {
        let now = 10_000;
        let mut record = PeerRecord {
            last_attempt: now - 60,
            last_seen: 0,
            ..PeerRecord::default()
        };
        // failed a minute ago: cooling off
        assert!(dial_cooloff_active(&record, now));
        // 301 seconds later with no success: eligible again
        assert!(!dial_cooloff_active(&record, record.last_attempt + 301));
        // a successful contact stamps last_seen == last_attempt and never cools off
        record.last_seen = record.last_attempt;
        assert!(!dial_cooloff_active(&record, now));
    }

    #[test]
    fn major_version_is_prefix_before_first_dot() {
        assert_eq!(major_version("1.7.3"), "1");
        assert_eq!(major_version("2.0.0"), "2");
        assert_eq!(major_version("3"), "3");
        assert_ne!(major_version("2.0.0"), major_version("1.7.3"));
    }

    #[test]
    fn address_filter_blocks_self_loopback_unspecified() {
        let config = test_config();
        assert!(is_filtered_address(&"127.0.0.1".parse().unwrap(), &config));
        assert!(is_filtered_address(&"0.0.0.0".parse().unwrap(), &config));
        assert!(is_filtered_address(&"8.8.4.4".parse().unwrap(), &config));
        assert!(!is_filtered_address(&"1.2.3.4".parse().unwrap(), &config));

        let mut relaxed = test_config();
        relaxed.allow_loopback = true;
        assert!(!is_filtered_address(
            &"127.0.0.1".parse().unwrap(),
            &relaxed
        ));
        // the self filter still applies on single-host deployments
        assert!(is_filtered_address(&"8.8.4.4".parse().unwrap(), &relaxed));

        let mut bound = test_config();
        bound.bind_addr = "10.0.0.5".parse().unwrap();
        assert!(is_filtered_address(&"10.0.0.5".parse().unwrap(), &bound));
    }

    #[test]
    fn canonical_ip_rejects_garbage() {
        assert!(canonical_peer_ip("not-an-ip").is_none());
        assert!(canonical_peer_ip("1.2.3.4").is_some());
        assert!(canonical_peer_ip(" 2001:db8::1 ").is_some());
    }
}
