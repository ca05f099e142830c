use crate::address_family::{AddressFamily, Inet, Inet6};
use crate::network::{InterfaceName, NetworkInterface, NetworkManager};
use crate::responder::{
    Completion, Destination, EndpointInfo, Outgoing, PublishCompletion, ResponderCore, ServiceId,
    UnpublishCompletion,
};
use crate::services::ServiceData;
use log::{debug, error, trace, warn};
use socket2::SockRef;
use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::io;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, MissedTickBehavior};

/// Large enough for any mDNS packet, jumbo frames included
const RECV_BUFFER_SIZE: usize = 9000;

#[derive(Debug)]
pub enum Command {
    Register {
        id: ServiceId,
        data: ServiceData,
    },
    Publish {
        id: ServiceId,
        done: PublishCompletion,
    },
    Unpublish {
        id: ServiceId,
        done: UnpublishCompletion,
    },
    Republish {
        id: ServiceId,
        done: PublishCompletion,
    },
    UpdateTxt {
        id: ServiceId,
        txt: Vec<Vec<u8>>,
        done: Completion<()>,
    },
    Unregister {
        id: ServiceId,
    },
    Shutdown,
}

/// The mDNS socket of one address family
struct Transport<AF: AddressFamily> {
    socket: UdpSocket,
    joined: HashSet<InterfaceName>,
    _af: PhantomData<AF>,
}

impl<AF: AddressFamily> Transport<AF> {
    // Will panic if called from outside the context of a runtime
    fn bind() -> io::Result<Transport<AF>> {
        let std_socket = AF::bind()?;
        let socket = UdpSocket::from_std(std_socket)?;
        Ok(Transport {
            socket,
            joined: HashSet::new(),
            _af: PhantomData,
        })
    }

    /// Joins the mDNS group on new interfaces and leaves it on vanished ones
    fn update_membership(&mut self, interfaces: &HashMap<InterfaceName, NetworkInterface>) {
        let socket = SockRef::from(&self.socket);

        self.joined.retain(|name| {
            if interfaces.get(name).map_or(false, AF::is_configured) {
                return true;
            }
            debug!("leaving mDNS group on {}", name);
            if let Some(iface) = interfaces.get(name) {
                if let Err(err) = AF::leave_multicast(&socket, iface) {
                    trace!("leaving group on {} failed: {}", name, err);
                }
            }
            false
        });

        for iface in interfaces.values().filter(|iface| AF::is_configured(iface)) {
            if self.joined.contains(&iface.name) {
                continue;
            }
            match AF::join_multicast(&socket, iface) {
                Ok(()) => {
                    debug!("joined mDNS group {:?} on {}", AF::group_addr(), iface.name);
                    self.joined.insert(iface.name.clone());
                }
                Err(err) => warn!("failed to join mDNS group on {}: {}", iface.name, err),
            }
        }
    }

    async fn send_multicast(&self, iface: &NetworkInterface, data: &[u8]) -> io::Result<()> {
        AF::set_multicast_interface(&SockRef::from(&self.socket), iface)?;
        self.send_to(data, AF::group_addr()).await
    }

    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        trace!("sending packet to {:?}", addr);
        let sent = self.socket.send_to(data, addr).await?;
        if sent != data.len() {
            warn!("failed to send entire packet to {:?}", addr);
        }
        Ok(())
    }
}

async fn recv<AF: AddressFamily>(
    transport: &Option<Transport<AF>>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match transport {
        Some(transport) => transport.socket.recv_from(buf).await,
        None => pending().await,
    }
}

/// Runs a `ResponderCore` against real sockets, timers and interfaces
pub struct FSM {
    core: ResponderCore,
    network: NetworkManager,
    v4: Option<Transport<Inet>>,
    v6: Option<Transport<Inet6>>,
    commands: mpsc::UnboundedReceiver<Command>,
    network_poll_interval: Duration,
}

impl FSM {
    // Will panic if called from outside the context of a runtime
    pub fn new(
        network: NetworkManager,
        disable_ipv6: bool,
        network_poll_interval: Duration,
    ) -> io::Result<(FSM, mpsc::UnboundedSender<Command>)> {
        let v4 = match Transport::<Inet>::bind() {
            Ok(transport) => Some(transport),
            Err(err) => {
                warn!("failed to bind IPv4 mDNS socket: {}", err);
                None
            }
        };
        let v6 = if disable_ipv6 {
            None
        } else {
            match Transport::<Inet6>::bind() {
                Ok(transport) => Some(transport),
                Err(err) => {
                    warn!("failed to bind IPv6 mDNS socket: {}", err);
                    None
                }
            }
        };
        if v4.is_none() && v6.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "could not bind any mDNS socket",
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut fsm = FSM {
            core: ResponderCore::new(network.interfaces().clone()),
            network,
            v4,
            v6,
            commands: rx,
            network_poll_interval,
        };
        fsm.update_membership();

        Ok((fsm, tx))
    }

    pub async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.network_poll_interval;
        let mut network_poll = interval_at(start, self.network_poll_interval);
        network_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf4 = vec![0u8; RECV_BUFFER_SIZE];
        let mut buf6 = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            self.flush().await;
            if let Some(err) = self.core.take_fatal() {
                error!("unrecoverable mDNS conflict, exiting: {}", err);
                std::process::exit(1);
            }

            let deadline = self.core.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at.into()).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        warn!("responder disconnected without shutdown");
                        break;
                    }
                },
                res = recv(&self.v4, &mut buf4) => self.handle_recv(res, &buf4),
                res = recv(&self.v6, &mut buf6) => self.handle_recv(res, &buf6),
                _ = timer => (),
                _ = network_poll.tick() => self.poll_network(),
            }

            self.core.handle_timeout(Instant::now());
        }

        self.core.shutdown(Instant::now());
        self.flush().await;
        debug!("responder stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Register { id, data } => self.core.create_service(id, data),
            Command::Publish { id, done } => self.core.publish(id, now, Some(done)),
            Command::Unpublish { id, done } => self.core.unpublish(id, now, Some(done)),
            Command::Republish { id, done } => self.core.republish(id, now, Some(done)),
            Command::UpdateTxt { id, txt, done } => {
                let _ = done.send(self.core.update_txt(id, txt));
            }
            Command::Unregister { id } => self.core.remove_service(id, now),
            Command::Shutdown => self.core.shutdown(now),
        }
    }

    fn handle_recv(&mut self, res: io::Result<(usize, SocketAddr)>, buf: &[u8]) {
        let (len, addr) = match res {
            Ok(received) => received,
            Err(err) => {
                warn!("failed to receive packet: {}", err);
                return;
            }
        };

        let interface = match self.network.interface_for(&addr) {
            Some(interface) => interface,
            None => {
                trace!("dropping packet from {:?}, not on any interface", addr);
                return;
            }
        };
        let endpoint = EndpointInfo {
            address: addr.ip(),
            port: addr.port(),
            interface,
        };
        self.core.handle_packet(&buf[..len], endpoint, Instant::now());
    }

    fn poll_network(&mut self) {
        match self.network.poll() {
            Ok(Some(update)) => {
                self.update_membership();
                let interfaces = self.network.interfaces().clone();
                self.core
                    .handle_network_update(&update, interfaces, Instant::now());
            }
            Ok(None) => (),
            Err(err) => warn!("failed to read network interfaces: {}", err),
        }
    }

    fn update_membership(&mut self) {
        let interfaces = self.network.interfaces();
        if let Some(ref mut v4) = self.v4 {
            v4.update_membership(interfaces);
        }
        if let Some(ref mut v6) = self.v6 {
            v6.update_membership(interfaces);
        }
    }

    async fn flush(&mut self) {
        while let Some(outgoing) = self.core.poll_outgoing() {
            if let Err(err) = self.send(&outgoing).await {
                warn!("error sending packet to {:?}: {}", outgoing.destination, err);
                if let Some(id) = outgoing.service {
                    self.core.handle_send_error(id, &err, Instant::now());
                }
            }
        }
    }

    async fn send(&mut self, outgoing: &Outgoing) -> io::Result<()> {
        match outgoing.destination {
            Destination::Multicast(ref name) => {
                let iface = match self.core.interfaces().get(name) {
                    Some(iface) => iface,
                    None => return Ok(()),
                };
                if let Some(ref v4) = self.v4 {
                    if Inet::is_configured(iface) {
                        v4.send_multicast(iface, &outgoing.data).await?;
                    }
                }
                if let Some(ref v6) = self.v6 {
                    if Inet6::is_configured(iface) {
                        v6.send_multicast(iface, &outgoing.data).await?;
                    }
                }
                Ok(())
            }
            Destination::Unicast(ref endpoint) => {
                let iface = self.core.interfaces().get(&endpoint.interface);
                match (endpoint.address, &self.v4, &self.v6) {
                    (IpAddr::V4(_), Some(v4), _) => {
                        let addr = Inet::unicast_addr(endpoint.address, endpoint.port, iface);
                        v4.send_to(&outgoing.data, addr).await
                    }
                    (IpAddr::V6(_), _, Some(v6)) => {
                        let addr = Inet6::unicast_addr(endpoint.address, endpoint.port, iface);
                        v6.send_to(&outgoing.data, addr).await
                    }
                    _ => Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "no socket for the address family",
                    )),
                }
            }
        }
    }
}
