//! IPv4 allow-list for inbound world servers.
//!
//! Entries are `"all"`, `"a.b.c.d"`, `"a.b.c.d/bits"` or
//! `"a.b.c.d/e.f.g.h"`.

use std::net::Ipv4Addr;

/// An address + mask pair, both in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessControl {
    pub ip: u32,
    /// 0 matches everything.
    pub mask: u32,
}

impl AccessControl {
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.mask == 0 || (ip & self.mask) == (self.ip & self.mask)
    }
}

/// Parse one allow-list entry. `None` on malformed input.
pub fn parse_ipmask(s: &str) -> Option<AccessControl> {
    if s == "all" {
        return Some(AccessControl { ip: 0, mask: 0 });
    }

    let Some((addr, mask)) = s.split_once('/') else {
        let ip = u32::from(s.parse::<Ipv4Addr>().ok()?);
        return Some(AccessControl { ip, mask: u32::MAX });
    };
    let ip = u32::from(addr.parse::<Ipv4Addr>().ok()?);
    if mask.contains('.') {
        let mask = u32::from(mask.parse::<Ipv4Addr>().ok()?);
        return Some(AccessControl { ip, mask });
    }
    let bits: u32 = mask.parse().ok()?;
    if bits > 32 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
    Some(AccessControl { ip, mask })
}

/// An empty list admits every address.
pub fn allowed(list: &[AccessControl], ip: Ipv4Addr) -> bool {
    list.is_empty() || list.iter().any(|acl| acl.matches(ip))
}
