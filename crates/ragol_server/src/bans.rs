//! Guildcard and IP ban lists.
//!
//! Both lists live at the ship level behind read-write locks; every accept
//! and several user actions consult them. Expired entries are pruned by
//! the scheduler tick.

use std::net::IpAddr;
use std::sync::RwLock;

/// A ban that never expires.
pub const BAN_PERMANENT: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone)]
pub struct BanEntry {
    pub banner_gc: u32,
    /// Unix time the ban lapses, or `BAN_PERMANENT`.
    pub until: u32,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct GcBan {
    gc: u32,
    entry: BanEntry,
}

#[derive(Debug, Clone)]
struct IpBan {
    addr: IpAddr,
    prefix_len: u8,
    entry: BanEntry,
}

#[derive(Default)]
pub struct BanList {
    gc_bans: RwLock<Vec<GcBan>>,
    ip_bans: RwLock<Vec<IpBan>>,
}

fn ip_matches(net: IpAddr, prefix_len: u8, addr: IpAddr) -> bool {
    match (net, addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            let bits = 32u32.saturating_sub(prefix_len as u32);
            let mask = if bits >= 32 { 0 } else { u32::MAX << bits };
            (u32::from(n) & mask) == (u32::from(a) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            let bits = 128u32.saturating_sub(prefix_len as u32);
            let mask = if bits >= 128 { 0 } else { u128::MAX << bits };
            (u128::from(n) & mask) == (u128::from(a) & mask)
        }
        _ => false,
    }
}

impl BanList {
    pub fn ban_guildcard(&self, gc: u32, entry: BanEntry) {
        let mut bans = self.gc_bans.write().unwrap_or_else(|e| e.into_inner());

        // Re-banning replaces the old entry.
        bans.retain(|b| b.gc != gc);
        bans.push(GcBan { gc, entry });
    }

    pub fn ban_ip(&self, addr: IpAddr, prefix_len: u8, entry: BanEntry) {
        let mut bans = self.ip_bans.write().unwrap_or_else(|e| e.into_inner());
        bans.push(IpBan {
            addr,
            prefix_len,
            entry,
        });
    }

    /// Lift a guildcard ban. Returns whether one existed.
    pub fn unban_guildcard(&self, gc: u32) -> bool {
        let mut bans = self.gc_bans.write().unwrap_or_else(|e| e.into_inner());
        let before = bans.len();
        bans.retain(|b| b.gc != gc);
        bans.len() != before
    }

    pub fn check_guildcard(&self, gc: u32, now: u32) -> Option<BanEntry> {
        let bans = self.gc_bans.read().unwrap_or_else(|e| e.into_inner());
        bans.iter()
            .find(|b| b.gc == gc && b.entry.until > now)
            .map(|b| b.entry.clone())
    }

    pub fn check_ip(&self, addr: IpAddr, now: u32) -> Option<BanEntry> {
        let bans = self.ip_bans.read().unwrap_or_else(|e| e.into_inner());
        bans.iter()
            .find(|b| ip_matches(b.addr, b.prefix_len, addr) && b.entry.until > now)
            .map(|b| b.entry.clone())
    }

    /// Drop every lapsed entry.
    pub fn prune(&self, now: u32) {
        self.gc_bans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|b| b.entry.until > now);
        self.ip_bans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|b| b.entry.until > now);
    }
}

/// Render the remaining ban length the way the disconnect message box
/// shows it.
pub fn ban_length_text(until: u32, now: u32) -> String {
    if until == BAN_PERMANENT {
        return String::from("Forever");
    }

    let secs = until.saturating_sub(now);

    if secs >= 86_400 {
        let days = secs / 86_400;
        format!("{} day{}", days, if days == 1 { "" } else { "s" })
    } else if secs >= 3_600 {
        let hours = secs / 3_600;
        format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else {
        let mins = (secs / 60).max(1);
        format!("{} minute{}", mins, if mins == 1 { "" } else { "s" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(until: u32) -> BanEntry {
        BanEntry {
            banner_gc: 1000,
            until,
            reason: "being a jerk".into(),
        }
    }

    #[test]
    fn guildcard_bans_expire() {
        let bans = BanList::default();
        bans.ban_guildcard(42, entry(100));

        assert!(bans.check_guildcard(42, 50).is_some());
        assert!(bans.check_guildcard(42, 100).is_none());
        assert!(bans.check_guildcard(43, 50).is_none());

        bans.prune(100);
        assert!(bans.check_guildcard(42, 0).is_none());
    }

    #[test]
    fn permanent_bans_survive_pruning() {
        let bans = BanList::default();
        bans.ban_guildcard(7, entry(BAN_PERMANENT));
        bans.prune(u32::MAX - 1);
        assert!(bans.check_guildcard(7, u32::MAX - 1).is_some());

        assert!(bans.unban_guildcard(7));
        assert!(bans.check_guildcard(7, 0).is_none());
    }

    #[test]
    fn ip_bans_respect_the_netmask() {
        let bans = BanList::default();
        bans.ban_ip("10.1.2.0".parse().unwrap(), 24, entry(BAN_PERMANENT));

        assert!(bans.check_ip("10.1.2.200".parse().unwrap(), 0).is_some());
        assert!(bans.check_ip("10.1.3.1".parse().unwrap(), 0).is_none());
        // A v6 address never matches a v4 rule.
        assert!(bans.check_ip("::1".parse().unwrap(), 0).is_none());
    }

    #[test]
    fn ban_lengths_render_like_the_message_box() {
        assert_eq!(ban_length_text(BAN_PERMANENT, 0), "Forever");
        assert_eq!(ban_length_text(86_400, 0), "1 day");
        assert_eq!(ban_length_text(86_400 * 3 + 10, 0), "3 days");
        assert_eq!(ban_length_text(7_200, 0), "2 hours");
        assert_eq!(ban_length_text(90, 0), "1 minute");
    }
}
