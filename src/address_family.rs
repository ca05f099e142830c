use crate::network::NetworkInterface;
use crate::responder::MDNS_PORT;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};

pub enum Inet {}

pub enum Inet6 {}

pub trait AddressFamily {
    type Addr: Into<IpAddr> + Copy;

    const ANY_ADDR: Self::Addr;
    const MDNS_GROUP: Self::Addr;

    const DOMAIN: Domain;

    /// Whether `iface` has an address of this family to send from
    fn is_configured(iface: &NetworkInterface) -> bool;

    fn join_multicast(socket: &Socket, iface: &NetworkInterface) -> io::Result<()>;

    fn leave_multicast(socket: &Socket, iface: &NetworkInterface) -> io::Result<()>;

    /// Selects the interface outgoing multicast packets leave through
    fn set_multicast_interface(socket: &Socket, iface: &NetworkInterface) -> io::Result<()>;

    /// Unicast destination, with the scope of `iface` where one is needed
    fn unicast_addr(ip: IpAddr, port: u16, iface: Option<&NetworkInterface>) -> SocketAddr;

    fn configure(_socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    fn group_addr() -> SocketAddr {
        SocketAddr::new(Self::MDNS_GROUP.into(), MDNS_PORT)
    }

    fn udp_socket() -> io::Result<Socket> {
        Socket::new(Self::DOMAIN, Type::DGRAM, Some(Protocol::UDP))
    }

    /// Binds the mDNS port, groups are joined per interface afterwards
    fn bind() -> io::Result<UdpSocket> {
        let addr: SockAddr = SocketAddr::new(Self::ANY_ADDR.into(), MDNS_PORT).into();
        let socket = Self::udp_socket()?;
        Self::configure(&socket)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;

        socket.bind(&addr)?;
        Ok(socket.into())
    }
}

impl AddressFamily for Inet {
    type Addr = Ipv4Addr;

    const ANY_ADDR: Self::Addr = Ipv4Addr::UNSPECIFIED;
    const MDNS_GROUP: Self::Addr = Ipv4Addr::new(224, 0, 0, 251);

    const DOMAIN: Domain = Domain::IPV4;

    fn is_configured(iface: &NetworkInterface) -> bool {
        iface.ipv4.is_some()
    }

    fn join_multicast(socket: &Socket, iface: &NetworkInterface) -> io::Result<()> {
        socket.join_multicast_v4(&Self::MDNS_GROUP, &ipv4_of(iface)?)
    }

    fn leave_multicast(socket: &Socket, iface: &NetworkInterface) -> io::Result<()> {
        socket.leave_multicast_v4(&Self::MDNS_GROUP, &ipv4_of(iface)?)
    }

    fn set_multicast_interface(socket: &Socket, iface: &NetworkInterface) -> io::Result<()> {
        socket.set_multicast_if_v4(&ipv4_of(iface)?)
    }

    fn unicast_addr(ip: IpAddr, port: u16, _iface: Option<&NetworkInterface>) -> SocketAddr {
        SocketAddr::new(ip, port)
    }
}

impl AddressFamily for Inet6 {
    type Addr = Ipv6Addr;

    const ANY_ADDR: Self::Addr = Ipv6Addr::UNSPECIFIED;
    const MDNS_GROUP: Self::Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

    const DOMAIN: Domain = Domain::IPV6;

    fn is_configured(iface: &NetworkInterface) -> bool {
        iface.index.is_some() && (iface.ipv6.is_some() || iface.routable_ipv6.is_some())
    }

    fn configure(socket: &Socket) -> io::Result<()> {
        socket.set_only_v6(true)
    }

    fn join_multicast(socket: &Socket, iface: &NetworkInterface) -> io::Result<()> {
        socket.join_multicast_v6(&Self::MDNS_GROUP, index_of(iface)?)
    }

    fn leave_multicast(socket: &Socket, iface: &NetworkInterface) -> io::Result<()> {
        socket.leave_multicast_v6(&Self::MDNS_GROUP, index_of(iface)?)
    }

    fn set_multicast_interface(socket: &Socket, iface: &NetworkInterface) -> io::Result<()> {
        socket.set_multicast_if_v6(index_of(iface)?)
    }

    fn unicast_addr(ip: IpAddr, port: u16, iface: Option<&NetworkInterface>) -> SocketAddr {
        match ip {
            IpAddr::V6(ip) => {
                let scope_id = iface.and_then(|iface| iface.index).unwrap_or(0);
                SocketAddrV6::new(ip, port, 0, scope_id).into()
            }
            ip => SocketAddr::new(ip, port),
        }
    }
}

fn ipv4_of(iface: &NetworkInterface) -> io::Result<Ipv4Addr> {
    iface.ipv4.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} has no IPv4 address", iface.name),
        )
    })
}

fn index_of(iface: &NetworkInterface) -> io::Result<u32> {
    iface.index.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} has no interface index", iface.name),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_families() {
        let v4 = NetworkInterface::new("eth0").with_ipv4(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert!(Inet::is_configured(&v4));
        assert!(!Inet6::is_configured(&v4));

        let mut v6 = NetworkInterface::new("eth1").with_ipv6(
            Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1),
            Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0),
        );
        assert!(!Inet6::is_configured(&v6));
        v6.index = Some(3);
        assert!(Inet6::is_configured(&v6));
        assert!(index_of(&v6).is_ok());
        assert!(ipv4_of(&v6).is_err());
    }

    #[test]
    fn link_local_unicast_carries_scope() {
        let mut iface = NetworkInterface::new("eth1");
        iface.index = Some(7);
        let ip: IpAddr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2).into();
        match Inet6::unicast_addr(ip, 5353, Some(&iface)) {
            SocketAddr::V6(addr) => assert_eq!(addr.scope_id(), 7),
            other => panic!("unexpected address {}", other),
        }
        assert_eq!(
            Inet::unicast_addr("10.0.0.1".parse().unwrap(), 53, None),
            "10.0.0.1:53".parse().unwrap()
        );
    }

    #[test]
    fn group_addresses() {
        assert_eq!(Inet::group_addr(), "224.0.0.251:5353".parse().unwrap());
        assert_eq!(Inet6::group_addr(), "[ff02::fb]:5353".parse().unwrap());
    }
}
