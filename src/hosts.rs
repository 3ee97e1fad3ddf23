use std::io::BufRead;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;

/// Host names that never participate in hijacking and are dropped while
/// parsing.
pub const LOCAL_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
    "0.0.0.0",
];

/// A parsed hosts table: lowercased bare name to its addresses.
#[derive(Debug, Clone, Default)]
pub struct Hosts {
    entries: FxHashMap<String, Vec<IpAddr>>,
}

impl Hosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[IpAddr]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn del(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Inserts or replaces the entry for `name`.
    pub fn upsert(&mut self, name: String, addrs: Vec<IpAddr>) {
        self.entries.insert(name, addrs);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn into_entries(self) -> impl Iterator<Item = (String, Vec<IpAddr>)> {
        self.entries.into_iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses a hosts-formatted stream: `<ip> <name> [name...] [# comment]` per
/// line. Lines with fewer than two fields are skipped, reserved local names
/// are dropped, and names repeated across lines accumulate addresses.
pub fn parse<R: BufRead>(reader: R) -> Result<Hosts> {
    let mut hosts = Hosts::new();
    for (i, line) in reader.lines().enumerate() {
        let n = i + 1;
        let line = line?;
        let mut fields = line.split_whitespace();
        let Some(ip_field) = fields.next() else {
            continue;
        };
        if ip_field.starts_with('#') {
            continue;
        }
        let mut names = fields.peekable();
        if names.peek().is_none() {
            continue;
        }
        let addr = parse_ip(ip_field)
            .ok_or_else(|| anyhow::anyhow!("line {}: invalid ip address: {} - {}", n, ip_field, line))?;
        for name in names {
            if name.starts_with('#') {
                break;
            }
            let name = name.to_ascii_lowercase();
            if LOCAL_NAMES.contains(&name.as_str()) {
                continue;
            }
            hosts.entries.entry(name).or_default().push(addr);
        }
    }
    Ok(hosts)
}

// Accepts a v4 or v6 literal, with an optional zone index on v6 which is
// parsed and discarded.
fn parse_ip(s: &str) -> Option<IpAddr> {
    let bare = s.split_once('%').map_or(s, |(addr, _zone)| addr);
    bare.parse().ok()
}

/// Read view over the currently installed hosts table. Lookups are lock-free;
/// the loader publishes a complete replacement table with `install`.
#[derive(Clone)]
pub struct Matcher {
    table: Arc<ArcSwap<Hosts>>,
}

impl Matcher {
    pub fn empty() -> Self {
        Self {
            table: Arc::new(ArcSwap::from_pointee(Hosts::new())),
        }
    }

    /// Addresses of the bare (non-FQDN) name, if it is hijacked.
    pub fn lookup(&self, name: &str) -> Option<Vec<IpAddr>> {
        self.table.load().get(name).map(<[IpAddr]>::to_vec)
    }

    pub fn install(&self, hosts: Hosts) {
        self.table.store(Arc::new(hosts));
    }
}

/// Folds an ordered list of (table, hijack) layers into the effective table:
/// hijack layers upsert their entries, non-hijack layers remove any name they
/// mention.
pub fn merge(layers: Vec<(Hosts, bool)>) -> Hosts {
    let mut merged = Hosts::new();
    for (hosts, hijack) in layers {
        if hijack {
            for (name, addrs) in hosts.into_entries() {
                merged.upsert(name, addrs);
            }
        } else {
            for name in hosts.names() {
                merged.del(name);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse_str(s: &str) -> Result<Hosts> {
        parse(Cursor::new(s))
    }

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_basic_entries() {
        let hosts = parse_str(
            "192.0.2.1 badhost1\n\
             192.0.2.2 badhost2 badhost3 # trailing comment\n\
             # a comment line\n\
             \n\
             192.0.2.3\n",
        )
        .unwrap();
        assert_eq!(hosts.get("badhost1"), Some(&[v4("192.0.2.1")][..]));
        assert_eq!(hosts.get("badhost2"), Some(&[v4("192.0.2.2")][..]));
        assert_eq!(hosts.get("badhost3"), Some(&[v4("192.0.2.2")][..]));
        assert_eq!(hosts.len(), 3);
    }

    #[test]
    fn parse_comment_field_ends_line() {
        let hosts = parse_str("192.0.2.1 badhost1 #badhost2 badhost3\n").unwrap();
        assert!(hosts.get("badhost1").is_some());
        assert!(hosts.get("badhost2").is_none());
        assert!(hosts.get("badhost3").is_none());
    }

    #[test]
    fn parse_accumulates_duplicates_across_lines() {
        let hosts = parse_str("192.0.2.1 badhost1\n2001:db8::1 badhost1\n").unwrap();
        assert_eq!(
            hosts.get("badhost1"),
            Some(&[v4("192.0.2.1"), "2001:db8::1".parse().unwrap()][..])
        );
    }

    #[test]
    fn parse_filters_local_names_and_lowercases() {
        let hosts = parse_str("192.0.2.1 localhost BadHost1 ip6-allnodes\n").unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(hosts.get("badhost1").is_some());
    }

    #[test]
    fn parse_accepts_zone_index() {
        let hosts = parse_str("fe80::1%eth0 router.local1\n").unwrap();
        assert_eq!(
            hosts.get("router.local1"),
            Some(&["fe80::1".parse().unwrap()][..])
        );
    }

    #[test]
    fn parse_error_names_line_number() {
        let err = parse_str("192.0.2.1 ok\nnot-an-ip badhost1\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn matcher_returns_none_when_empty() {
        let matcher = Matcher::empty();
        assert!(matcher.lookup("badhost1").is_none());
    }

    #[test]
    fn matcher_sees_installed_table_atomically() {
        let matcher = Matcher::empty();
        let hosts = parse_str("192.0.2.1 badhost1\n").unwrap();
        matcher.install(hosts);
        assert_eq!(matcher.lookup("badhost1"), Some(vec![v4("192.0.2.1")]));
        matcher.install(Hosts::new());
        assert!(matcher.lookup("badhost1").is_none());
    }

    #[test]
    fn merge_folds_layers_in_order() {
        let add1 = parse_str("192.0.2.1 badhost1 badhost2\n").unwrap();
        let add2 = parse_str("192.0.2.9 badhost2\n").unwrap();
        let del = parse_str("0.0.0.0 badhost1 unrelated\n").unwrap();
        let merged = merge(vec![(add1, true), (add2, true), (del, false)]);
        assert!(merged.get("badhost1").is_none());
        // Later hijack layer overrides the earlier entry.
        assert_eq!(merged.get("badhost2"), Some(&[v4("192.0.2.9")][..]));
        assert_eq!(merged.len(), 1);
    }
}
