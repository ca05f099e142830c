use if_addrs::{get_if_addrs, IfAddr};
use log::{debug, trace};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub type InterfaceName = String;

/// The addresses of one local network interface we advertise on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: InterfaceName,
    pub index: Option<u32>,

    // one of ipv4 or ipv6 will be present, most of the time even both
    pub ipv4: Option<Ipv4Addr>,
    pub ipv4_netmask: Option<Ipv4Addr>,
    /// link-local ipv6
    pub ipv6: Option<Ipv6Addr>,
    pub ipv6_netmask: Option<Ipv6Addr>,

    /// first routable ipv6
    pub routable_ipv6: Option<Ipv6Addr>,
    pub routable_ipv6_netmask: Option<Ipv6Addr>,
}

impl NetworkInterface {
    pub fn new<N: Into<InterfaceName>>(name: N) -> NetworkInterface {
        NetworkInterface {
            name: name.into(),
            index: None,
            ipv4: None,
            ipv4_netmask: None,
            ipv6: None,
            ipv6_netmask: None,
            routable_ipv6: None,
            routable_ipv6_netmask: None,
        }
    }

    pub fn with_ipv4(mut self, ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.ipv4 = Some(ip);
        self.ipv4_netmask = Some(netmask);
        self
    }

    pub fn with_ipv6(mut self, ip: Ipv6Addr, netmask: Ipv6Addr) -> Self {
        if is_link_local_v6(&ip) {
            self.ipv6 = Some(ip);
            self.ipv6_netmask = Some(netmask);
        } else {
            self.routable_ipv6 = Some(ip);
            self.routable_ipv6_netmask = Some(netmask);
        }
        self
    }

    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> {
        let v4 = self.ipv4.map(IpAddr::V4);
        let v6 = self.ipv6.map(IpAddr::V6);
        let routable = self.routable_ipv6.map(IpAddr::V6);
        v4.into_iter().chain(v6).chain(routable)
    }

    pub fn has_address(&self, ip: &IpAddr) -> bool {
        self.addresses().any(|own| own == *ip)
    }

    /// Whether `addr` lies in one of the subnets of this interface
    pub fn is_on_link(&self, addr: &SocketAddr) -> bool {
        match addr {
            SocketAddr::V4(addr) => match (self.ipv4, self.ipv4_netmask) {
                (Some(ip), Some(mask)) => {
                    let mask = u32::from(mask);
                    u32::from(ip) & mask == u32::from(*addr.ip()) & mask
                }
                _ => false,
            },
            SocketAddr::V6(addr) => {
                if addr.scope_id() != 0 && self.index == Some(addr.scope_id()) {
                    return true;
                }
                [
                    (self.ipv6, self.ipv6_netmask),
                    (self.routable_ipv6, self.routable_ipv6_netmask),
                ]
                .iter()
                .any(|entry| match *entry {
                    (Some(ip), Some(mask)) => {
                        let mask = u128::from(mask);
                        u128::from(ip) & mask == u128::from(*addr.ip()) & mask
                    }
                    _ => false,
                })
            }
        }
    }
}

/// An address change of an interface present before and after an update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceChange {
    pub name: InterfaceName,

    pub outdated_ipv4: Option<Ipv4Addr>,
    pub updated_ipv4: Option<Ipv4Addr>,

    pub outdated_ipv6: Option<Ipv6Addr>,
    pub updated_ipv6: Option<Ipv6Addr>,

    pub outdated_routable_ipv6: Option<Ipv6Addr>,
    pub updated_routable_ipv6: Option<Ipv6Addr>,
}

impl InterfaceChange {
    pub fn outdated(&self) -> impl Iterator<Item = IpAddr> {
        let v4 = self.outdated_ipv4.map(IpAddr::V4);
        let v6 = self.outdated_ipv6.map(IpAddr::V6);
        let routable = self.outdated_routable_ipv6.map(IpAddr::V6);
        v4.into_iter().chain(v6).chain(routable)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkUpdate {
    pub added: Vec<NetworkInterface>,
    pub removed: Vec<NetworkInterface>,
    pub changes: Vec<InterfaceChange>,
}

impl NetworkUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changes.is_empty()
    }

    /// Describes how to get from `old` to `new`
    pub fn between(
        old: &HashMap<InterfaceName, NetworkInterface>,
        new: &HashMap<InterfaceName, NetworkInterface>,
    ) -> NetworkUpdate {
        let mut update = NetworkUpdate::default();

        for (name, iface) in new {
            let current = match old.get(name) {
                Some(current) => current,
                None => {
                    update.added.push(iface.clone());
                    continue;
                }
            };

            let mut change = InterfaceChange {
                name: name.clone(),
                ..InterfaceChange::default()
            };
            let mut changed = false;
            if current.ipv4 != iface.ipv4 {
                change.outdated_ipv4 = current.ipv4;
                change.updated_ipv4 = iface.ipv4;
                changed = true;
            }
            if current.ipv6 != iface.ipv6 {
                change.outdated_ipv6 = current.ipv6;
                change.updated_ipv6 = iface.ipv6;
                changed = true;
            }
            if current.routable_ipv6 != iface.routable_ipv6 {
                change.outdated_routable_ipv6 = current.routable_ipv6;
                change.updated_routable_ipv6 = iface.routable_ipv6;
                changed = true;
            }
            if changed {
                update.changes.push(change);
            }
        }

        for (name, iface) in old {
            if !new.contains_key(name) {
                update.removed.push(iface.clone());
            }
        }

        update
    }
}

pub fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// Tracks the interfaces of this host
///
/// The current set is re-read on every `poll`, the differences are reported
/// as a `NetworkUpdate`.
pub struct NetworkManager {
    restricted: Vec<InterfaceName>,
    allowed_ips: Vec<IpAddr>,
    disable_ipv6: bool,
    current: HashMap<InterfaceName, NetworkInterface>,
}

impl NetworkManager {
    pub fn new(
        restricted: Vec<InterfaceName>,
        allowed_ips: Vec<IpAddr>,
        disable_ipv6: bool,
    ) -> io::Result<NetworkManager> {
        let mut manager = NetworkManager {
            restricted,
            allowed_ips,
            disable_ipv6,
            current: HashMap::new(),
        };
        manager.current = manager.enumerate()?;
        debug!(
            "created network manager with interfaces {:?}",
            manager.current.keys().collect::<Vec<_>>()
        );
        Ok(manager)
    }

    pub fn interfaces(&self) -> &HashMap<InterfaceName, NetworkInterface> {
        &self.current
    }

    pub fn poll(&mut self) -> io::Result<Option<NetworkUpdate>> {
        trace!("checking for network changes");
        let latest = self.enumerate()?;
        let update = NetworkUpdate::between(&self.current, &latest);
        self.current = latest;

        if update.is_empty() {
            Ok(None)
        } else {
            debug!("detected network changes: {:?}", update);
            Ok(Some(update))
        }
    }

    /// Name of the interface a packet from `addr` most likely arrived on
    pub fn interface_for(&self, addr: &SocketAddr) -> Option<InterfaceName> {
        if let Some(iface) = self.current.values().find(|iface| iface.is_on_link(addr)) {
            return Some(iface.name.clone());
        }
        if self.current.len() == 1 {
            return self.current.keys().next().cloned();
        }
        None
    }

    fn enumerate(&self) -> io::Result<HashMap<InterfaceName, NetworkInterface>> {
        let mut interfaces: HashMap<InterfaceName, NetworkInterface> = HashMap::new();

        for iface in get_if_addrs()? {
            if iface.is_loopback() {
                continue;
            }
            if !self.restricted.is_empty() && !self.restricted.contains(&iface.name) {
                continue;
            }
            if !self.allowed_ips.is_empty() && !self.allowed_ips.contains(&iface.ip()) {
                trace!("  -> address {} of {} dropped", iface.ip(), iface.name);
                continue;
            }

            let entry = interfaces
                .entry(iface.name.clone())
                .or_insert_with(|| NetworkInterface::new(iface.name.clone()));
            if entry.index.is_none() {
                entry.index = iface.index;
            }

            match iface.addr {
                IfAddr::V4(ref addr) => {
                    if entry.ipv4.is_none() {
                        entry.ipv4 = Some(addr.ip);
                        entry.ipv4_netmask = Some(addr.netmask);
                    }
                }
                IfAddr::V6(_) if self.disable_ipv6 => (),
                IfAddr::V6(ref addr) => {
                    if is_link_local_v6(&addr.ip) {
                        if entry.ipv6.is_none() {
                            entry.ipv6 = Some(addr.ip);
                            entry.ipv6_netmask = Some(addr.netmask);
                        }
                    } else if entry.routable_ipv6.is_none() {
                        entry.routable_ipv6 = Some(addr.ip);
                        entry.routable_ipv6_netmask = Some(addr.netmask);
                    }
                }
            }
        }

        interfaces.retain(|_, iface| iface.addresses().next().is_some());
        Ok(interfaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth0() -> NetworkInterface {
        NetworkInterface::new("eth0").with_ipv4(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(255, 255, 255, 0),
        )
    }

    #[test]
    fn diff_reports_added_removed_and_changed() {
        let mut old = HashMap::new();
        old.insert("eth0".to_owned(), eth0());
        old.insert(
            "wlan0".to_owned(),
            NetworkInterface::new("wlan0")
                .with_ipv4(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 0, 0, 0)),
        );

        let mut new = HashMap::new();
        new.insert(
            "eth0".to_owned(),
            eth0().with_ipv4(
                Ipv4Addr::new(192, 168, 1, 11),
                Ipv4Addr::new(255, 255, 255, 0),
            ),
        );
        new.insert(
            "eth1".to_owned(),
            NetworkInterface::new("eth1").with_ipv6(
                "fe80::2".parse().unwrap(),
                "ffff:ffff:ffff:ffff::".parse().unwrap(),
            ),
        );

        let update = NetworkUpdate::between(&old, &new);
        assert_eq!(update.added.len(), 1);
        assert_eq!(update.added[0].name, "eth1");
        assert_eq!(update.removed.len(), 1);
        assert_eq!(update.removed[0].name, "wlan0");
        assert_eq!(
            update.changes,
            vec![InterfaceChange {
                name: "eth0".to_owned(),
                outdated_ipv4: Some(Ipv4Addr::new(192, 168, 1, 10)),
                updated_ipv4: Some(Ipv4Addr::new(192, 168, 1, 11)),
                ..InterfaceChange::default()
            }]
        );
    }

    #[test]
    fn unchanged_network_has_empty_diff() {
        let mut map = HashMap::new();
        map.insert("eth0".to_owned(), eth0());
        assert!(NetworkUpdate::between(&map, &map.clone()).is_empty());
    }

    #[test]
    fn on_link_matches_subnet() {
        let iface = eth0();
        assert!(iface.is_on_link(&"192.168.1.77:5353".parse().unwrap()));
        assert!(!iface.is_on_link(&"192.168.2.77:5353".parse().unwrap()));
    }

    #[test]
    fn ipv6_is_sorted_by_scope() {
        let iface = NetworkInterface::new("eth0")
            .with_ipv6("fe80::1".parse().unwrap(), "ffff:ffff:ffff:ffff::".parse().unwrap())
            .with_ipv6("2001:db8::1".parse().unwrap(), "ffff:ffff:ffff:ffff::".parse().unwrap());
        assert_eq!(iface.ipv6, Some("fe80::1".parse().unwrap()));
        assert_eq!(iface.routable_ipv6, Some("2001:db8::1".parse().unwrap()));
        assert_eq!(iface.addresses().count(), 2);
    }
}
