//! The protocol engine
//!
//! `ResponderCore` holds every service, the pointer table and all timers.
//! It does no I/O: packets are fed in with `handle_packet`, time advances
//! through `handle_timeout` and the packets to send are taken out with
//! `poll_outgoing`.

mod announcer;
mod prober;
mod query_response;
mod truncated_query;


pub use self::announcer::{Announcer, AnnouncerPoll, AnnouncerState};
pub use self::prober::{ProbeOutcome, Prober, ProberPoll, ProberState};
pub use self::query_response::QueryResponse;
pub use self::truncated_query::{TruncatedQuery, TruncatedQueryResult};

use crate::dns_parser::{
    name_equals, Class, Opcode, Packet, QueryType, Question, RRData, ResourceRecord, Type,
};
use crate::error::Error;
use crate::network::{InterfaceName, NetworkInterface, NetworkUpdate};
use crate::services::{
    ServiceData, ServicePointers, ServiceState, DEFAULT_TTL, SERVICE_TYPE_ENUMERATION_NAME,
};
use log::{debug, error, info, trace, warn};
use rand::{thread_rng, Rng};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub const MDNS_PORT: u16 = 5353;
/// 1500 byte ethernet MTU minus IPv4 and UDP header
pub const DEFAULT_UDP_PAYLOAD_SIZE: usize = 1472;
const MIN_UDP_PAYLOAD_SIZE: usize = 512;
const MAX_UDP_PAYLOAD_SIZE: usize = 9000;

pub type ServiceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Announced,
    /// the service was unpublished before the announcement completed
    Cancelled,
}

pub type Completion<T> = oneshot::Sender<Result<T, Error>>;
pub type PublishCompletion = Completion<PublishOutcome>;
pub type UnpublishCompletion = Completion<()>;

/// Where a packet came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointInfo {
    pub address: IpAddr,
    pub port: u16,
    pub interface: InterfaceName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// the mDNS group of every address family configured on the interface
    Multicast(InterfaceName),
    Unicast(EndpointInfo),
}

#[derive(Debug, Clone)]
pub struct Outgoing {
    pub destination: Destination,
    pub data: Vec<u8>,
    /// the service whose probe or announcement this is
    pub service: Option<ServiceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictKind {
    /// the service instance name is used by someone else
    Name,
    Hostname,
}

struct ServiceEntry {
    data: ServiceData,
    state: ServiceState,
    announcer: Option<Announcer>,
    publish_waiters: Vec<PublishCompletion>,
    unpublish_waiters: Vec<UnpublishCompletion>,
    /// waiting in the probe queue
    queued: bool,
    publish_after_goodbye: bool,
    remove_after_goodbye: bool,
    /// set while republishing after a conflict, failing that is fatal
    conflict_republish: bool,
}

impl ServiceEntry {
    fn new(data: ServiceData) -> ServiceEntry {
        ServiceEntry {
            data,
            state: ServiceState::Unannounced,
            announcer: None,
            publish_waiters: Vec::new(),
            unpublish_waiters: Vec::new(),
            queued: false,
            publish_after_goodbye: false,
            remove_after_goodbye: false,
            conflict_republish: false,
        }
    }

    fn sending_goodbye(&self) -> bool {
        self.announcer
            .as_ref()
            .map_or(false, Announcer::is_sending_goodbye)
    }

    /// Whether queries for this service are answered
    fn is_answering(&self) -> bool {
        match self.state {
            ServiceState::Announcing | ServiceState::Announced => !self.sending_goodbye(),
            _ => false,
        }
    }

    fn resolve_publish(&mut self, outcome: PublishOutcome) {
        for waiter in self.publish_waiters.drain(..) {
            let _ = waiter.send(Ok(outcome));
        }
    }
}

fn reply<T>(done: Option<oneshot::Sender<T>>, value: T) {
    if let Some(done) = done {
        let _ = done.send(value);
    }
}

fn send_error(err: &io::Error) -> Error {
    Error::Io(io::Error::new(err.kind(), err.to_string()))
}

fn unknown_service(id: ServiceId) -> Error {
    Error::StateViolation(format!("unknown service {}", id))
}

fn conflict_error(record: &ResourceRecord) -> Error {
    Error::Conflict {
        name: record.name.clone(),
        record: format!("{:?}", record.data),
    }
}

/// Queries for reverse mappings are never answered, some resolvers
/// misbehave when an mDNS responder claims them
fn is_reverse_lookup(name: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    name.ends_with(".in-addr.arpa") || name.ends_with(".ip6.arpa")
}

fn udp_payload_size(packet: &Packet) -> usize {
    packet
        .additional
        .iter()
        .find_map(|record| match record.data {
            RRData::OPT {
                udp_payload_size, ..
            } => Some(usize::from(udp_payload_size)),
            _ => None,
        })
        .map(|size| size.max(MIN_UDP_PAYLOAD_SIZE).min(MAX_UDP_PAYLOAD_SIZE))
        .unwrap_or(DEFAULT_UDP_PAYLOAD_SIZE)
}

fn aggregation_delay() -> Duration {
    Duration::from_millis(thread_rng().gen_range(20..=120))
}

/// Classifies `record` received from another host against our service
fn conflict_kind(
    svc: &ServiceData,
    interfaces: &HashMap<InterfaceName, NetworkInterface>,
    record: &ResourceRecord,
) -> Option<ConflictKind> {
    if record.ttl == 0 {
        return None;
    }

    if name_equals(&record.name, &svc.fqdn()) {
        let conflict = match record.data {
            RRData::SRV {
                port, ref target, ..
            } => port != svc.port || !name_equals(target, &svc.hostname),
            RRData::TXT(ref txt) => *txt != svc.txt,
            _ => false,
        };
        return if conflict { Some(ConflictKind::Name) } else { None };
    }

    if name_equals(&record.name, &svc.hostname) {
        let ip = match record.data {
            RRData::A(ip) => IpAddr::V4(ip),
            RRData::AAAA(ip) => IpAddr::V6(ip),
            _ => return None,
        };
        if !svc.has_address(&ip, interfaces.values()) {
            return Some(ConflictKind::Hostname);
        }
    }

    None
}

pub struct ResponderCore {
    interfaces: HashMap<InterfaceName, NetworkInterface>,
    services: HashMap<ServiceId, ServiceEntry>,
    pointers: ServicePointers,
    probe_queue: VecDeque<ServiceId>,
    /// at most one service is probed at a time
    prober: Option<(ServiceId, Prober)>,
    /// announcements on interfaces that appeared after a service was announced
    background: Vec<(ServiceId, Announcer)>,
    truncated: HashMap<EndpointInfo, TruncatedQuery>,
    delayed: Vec<(Instant, Outgoing)>,
    outgoing: VecDeque<Outgoing>,
    fatal: Option<Error>,
    #[cfg(test)]
    transitions: Vec<(ServiceId, ServiceState)>,
}

impl ResponderCore {
    pub fn new(interfaces: HashMap<InterfaceName, NetworkInterface>) -> ResponderCore {
        ResponderCore {
            interfaces,
            services: HashMap::new(),
            pointers: ServicePointers::new(),
            probe_queue: VecDeque::new(),
            prober: None,
            background: Vec::new(),
            truncated: HashMap::new(),
            delayed: Vec::new(),
            outgoing: VecDeque::new(),
            fatal: None,
            #[cfg(test)]
            transitions: Vec::new(),
        }
    }

    pub fn interfaces(&self) -> &HashMap<InterfaceName, NetworkInterface> {
        &self.interfaces
    }

    pub fn create_service(&mut self, id: ServiceId, data: ServiceData) {
        debug!("registering service {} as {}", data.fqdn(), id);
        self.services.insert(id, ServiceEntry::new(data));
    }

    pub fn service_state(&self, id: ServiceId) -> Option<ServiceState> {
        self.services.get(&id).map(|entry| entry.state)
    }

    pub fn service(&self, id: ServiceId) -> Option<&ServiceData> {
        self.services.get(&id).map(|entry| &entry.data)
    }

    /// An error the responder can not recover from
    pub fn take_fatal(&mut self) -> Option<Error> {
        self.fatal.take()
    }

    pub fn poll_outgoing(&mut self) -> Option<Outgoing> {
        self.outgoing.pop_front()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let truncated = self.truncated.values().map(TruncatedQuery::timeout_at);
        let prober = self.prober.as_ref().and_then(|(_, prober)| prober.deadline());
        let announcers = self
            .services
            .values()
            .filter_map(|entry| entry.announcer.as_ref().and_then(Announcer::deadline));
        let background = self
            .background
            .iter()
            .filter_map(|(_, announcer)| announcer.deadline());

        delayed
            .chain(truncated)
            .chain(prober)
            .chain(announcers)
            .chain(background)
            .min()
    }

    fn set_state(&mut self, id: ServiceId, state: ServiceState) {
        if let Some(entry) = self.services.get_mut(&id) {
            if entry.state != state {
                debug!(
                    "service {} changed state {:?} -> {:?}",
                    entry.data.fqdn(),
                    entry.state,
                    state
                );
                entry.state = state;
                #[cfg(test)]
                self.transitions.push((id, state));
            }
        }
    }

    pub fn publish(&mut self, id: ServiceId, now: Instant, done: Option<PublishCompletion>) {
        let (state, goodbye) = match self.services.get(&id) {
            Some(entry) => (entry.state, entry.sending_goodbye()),
            None => return reply(done, Err(unknown_service(id))),
        };

        match state {
            ServiceState::Announced => {
                let fqdn = self.services[&id].data.fqdn();
                reply(
                    done,
                    Err(Error::StateViolation(format!("{} is already announced", fqdn))),
                );
            }
            ServiceState::Announcing if goodbye => {
                if let Some(entry) = self.services.get_mut(&id) {
                    entry.publish_waiters.extend(done);
                    entry.publish_after_goodbye = true;
                }
            }
            ServiceState::Announcing => {
                self.stop_announcing(id);
                self.enqueue_probe(id, now, done);
            }
            ServiceState::Probing | ServiceState::Probed => {
                if let Some(entry) = self.services.get_mut(&id) {
                    entry.publish_waiters.extend(done);
                }
            }
            ServiceState::Unannounced => self.enqueue_probe(id, now, done),
        }
    }

    pub fn unpublish(&mut self, id: ServiceId, now: Instant, done: Option<UnpublishCompletion>) {
        let (state, goodbye) = match self.services.get(&id) {
            Some(entry) => (entry.state, entry.sending_goodbye()),
            None => return reply(done, Err(unknown_service(id))),
        };

        match state {
            ServiceState::Unannounced => {
                if let Some(entry) = self.services.get_mut(&id) {
                    if entry.queued {
                        entry.queued = false;
                        entry.resolve_publish(PublishOutcome::Cancelled);
                        self.probe_queue.retain(|queued| *queued != id);
                    }
                }
                reply(done, Ok(()));
            }
            ServiceState::Probing | ServiceState::Probed => {
                if let Some((probing, mut prober)) = self.prober.take() {
                    if probing == id {
                        prober.cancel();
                    } else {
                        self.prober = Some((probing, prober));
                    }
                }
                if let Some(entry) = self.services.get_mut(&id) {
                    entry.resolve_publish(PublishOutcome::Cancelled);
                    entry.conflict_republish = false;
                }
                self.set_state(id, ServiceState::Unannounced);
                reply(done, Ok(()));
                self.start_next_probe(now);
            }
            ServiceState::Announcing if goodbye => {
                if let Some(entry) = self.services.get_mut(&id) {
                    entry.publish_after_goodbye = false;
                    entry.resolve_publish(PublishOutcome::Cancelled);
                    entry.unpublish_waiters.extend(done);
                }
            }
            ServiceState::Announcing | ServiceState::Announced => {
                if let Some(entry) = self.services.get_mut(&id) {
                    if let Some(mut announcer) = entry.announcer.take() {
                        announcer.cancel();
                    }
                    entry.resolve_publish(PublishOutcome::Cancelled);
                    entry.conflict_republish = false;
                    entry.unpublish_waiters.extend(done);
                }
                self.start_goodbye(id, now);
            }
        }
    }

    pub fn republish(&mut self, id: ServiceId, now: Instant, done: Option<PublishCompletion>) {
        let (state, goodbye) = match self.services.get(&id) {
            Some(entry) => (entry.state, entry.sending_goodbye()),
            None => return reply(done, Err(unknown_service(id))),
        };

        match state {
            ServiceState::Announcing if goodbye => {
                if let Some(entry) = self.services.get_mut(&id) {
                    entry.publish_waiters.extend(done);
                    entry.publish_after_goodbye = true;
                }
            }
            ServiceState::Announcing | ServiceState::Announced => {
                self.stop_announcing(id);
                self.enqueue_probe(id, now, done);
            }
            _ => reply(
                done,
                Err(Error::StateViolation(format!(
                    "can't republish service in state {:?}",
                    state
                ))),
            ),
        }
    }

    /// Forgets a service, sending a goodbye first if it was announced
    pub fn remove_service(&mut self, id: ServiceId, now: Instant) {
        self.unpublish(id, now, None);
        let goodbye = match self.services.get(&id) {
            Some(entry) => entry.sending_goodbye(),
            None => return,
        };
        if goodbye {
            if let Some(entry) = self.services.get_mut(&id) {
                entry.remove_after_goodbye = true;
            }
        } else {
            debug!("removing service {}", id);
            self.services.remove(&id);
        }
    }

    /// Replaces the TXT data, an announced service sends the new record once
    pub fn update_txt(&mut self, id: ServiceId, txt: Vec<Vec<u8>>) -> Result<(), Error> {
        let entry = self.services.get_mut(&id).ok_or_else(|| unknown_service(id))?;
        entry.data.set_txt(txt);
        if entry.state != ServiceState::Announced {
            return Ok(());
        }

        let mut packet = Packet::new_response(0);
        packet.answers.push(entry.data.txt_record());
        let packets = self
            .interfaces
            .keys()
            .map(|name| (name.clone(), packet.clone()))
            .collect();
        self.send_packets(Some(id), packets);
        Ok(())
    }

    /// Unpublishes every service
    pub fn shutdown(&mut self, now: Instant) {
        debug!("shutting down responder");
        let ids: Vec<ServiceId> = self.services.keys().copied().collect();
        for id in ids {
            self.unpublish(id, now, None);
        }
        self.handle_timeout(now);
    }

    fn stop_announcing(&mut self, id: ServiceId) {
        self.stop_background(id);
        if let Some(entry) = self.services.get_mut(&id) {
            if let Some(mut announcer) = entry.announcer.take() {
                announcer.cancel();
            }
            self.pointers.remove(&entry.data);
        }
        self.set_state(id, ServiceState::Unannounced);
    }

    fn enqueue_probe(&mut self, id: ServiceId, now: Instant, done: Option<PublishCompletion>) {
        if let Some(entry) = self.services.get_mut(&id) {
            entry.publish_waiters.extend(done);
            if !entry.queued {
                entry.queued = true;
                self.probe_queue.push_back(id);
            }
        }
        self.start_next_probe(now);
    }

    fn start_next_probe(&mut self, now: Instant) {
        if self.prober.is_some() {
            return;
        }

        while let Some(id) = self.probe_queue.pop_front() {
            let prober = match self.services.get_mut(&id) {
                Some(entry) if entry.queued => {
                    entry.queued = false;
                    let mut prober = Prober::new(&entry.data, &self.interfaces);
                    prober.start(now);
                    prober
                }
                _ => continue,
            };
            self.prober = Some((id, prober));
            self.set_state(id, ServiceState::Probing);
            return;
        }
    }

    fn start_announcing(&mut self, id: ServiceId, now: Instant) {
        if let Some(entry) = self.services.get_mut(&id) {
            self.pointers.add(&entry.data);
            let mut announcer = Announcer::announce(&entry.data, &self.interfaces);
            announcer.start(now);
            entry.announcer = Some(announcer);
        }
        self.set_state(id, ServiceState::Announcing);
    }

    fn stop_background(&mut self, id: ServiceId) {
        self.background.retain(|(owner, _)| *owner != id);
    }

    fn start_goodbye(&mut self, id: ServiceId, now: Instant) {
        self.stop_background(id);
        if let Some(entry) = self.services.get_mut(&id) {
            self.pointers.remove(&entry.data);
            let mut announcer = Announcer::goodbye(&entry.data, &self.interfaces);
            announcer.start(now);
            entry.announcer = Some(announcer);
        }
        self.set_state(id, ServiceState::Announcing);
    }

    fn probe_finished(&mut self, id: ServiceId, conflict: Option<ResourceRecord>, now: Instant) {
        match conflict {
            None => {
                self.set_state(id, ServiceState::Probed);
                self.start_announcing(id, now);
            }
            Some(record) => {
                self.set_state(id, ServiceState::Unannounced);
                if let Some(entry) = self.services.get_mut(&id) {
                    for waiter in entry.publish_waiters.drain(..) {
                        let _ = waiter.send(Err(conflict_error(&record)));
                    }
                    if entry.conflict_republish {
                        error!(
                            "failed to republish {} after a conflict: {:?}",
                            entry.data.fqdn(),
                            record
                        );
                        self.fatal = Some(conflict_error(&record));
                    } else {
                        warn!("{} is already in use: {:?}", entry.data.fqdn(), record);
                    }
                }
            }
        }
        self.start_next_probe(now);
    }

    fn announcement_finished(&mut self, id: ServiceId, now: Instant) {
        let goodbye = match self.services.get_mut(&id) {
            Some(entry) => match entry.announcer.take() {
                Some(announcer) => announcer.is_sending_goodbye(),
                None => return,
            },
            None => return,
        };

        if !goodbye {
            self.set_state(id, ServiceState::Announced);
            if let Some(entry) = self.services.get_mut(&id) {
                entry.conflict_republish = false;
                entry.resolve_publish(PublishOutcome::Announced);
            }
            return;
        }

        self.set_state(id, ServiceState::Unannounced);
        let (remove, publish) = match self.services.get_mut(&id) {
            Some(entry) => {
                for waiter in entry.unpublish_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                let publish = entry.publish_after_goodbye;
                entry.publish_after_goodbye = false;
                (entry.remove_after_goodbye, publish)
            }
            None => return,
        };

        if remove {
            debug!("removing service {}", id);
            if let Some(mut entry) = self.services.remove(&id) {
                entry.resolve_publish(PublishOutcome::Cancelled);
            }
        } else if publish {
            self.enqueue_probe(id, now, None);
        }
    }

    /// Fires every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = later;
        self.outgoing.extend(due.into_iter().map(|(_, outgoing)| outgoing));

        self.truncated.retain(|endpoint, query| {
            if query.timeout_at() <= now {
                trace!("discarding incomplete query from {}", endpoint.address);
                false
            } else {
                true
            }
        });

        self.poll_prober(now);
        self.poll_announcers(now);
        // an announcement can end in a new probe
        self.poll_prober(now);
    }

    fn poll_prober(&mut self, now: Instant) {
        loop {
            let (id, poll) = match self.prober.as_mut() {
                Some((id, prober)) => (*id, prober.poll(now)),
                None => return,
            };
            match poll {
                ProberPoll::Send(packets) => {
                    if let Some(entry) = self.services.get(&id) {
                        trace!("probing for {}", entry.data.fqdn());
                    }
                    self.send_packets(Some(id), packets)
                }
                ProberPoll::Finished(_) => {
                    self.prober = None;
                    self.probe_finished(id, None, now);
                }
                ProberPoll::Pending => return,
            }
        }
    }

    fn poll_announcers(&mut self, now: Instant) {
        let ids: Vec<ServiceId> = self.services.keys().copied().collect();
        for id in ids {
            loop {
                let poll = match self
                    .services
                    .get_mut(&id)
                    .and_then(|entry| entry.announcer.as_mut())
                {
                    Some(announcer) => announcer.poll(now),
                    None => break,
                };
                match poll {
                    AnnouncerPoll::Send(packets) => self.send_packets(Some(id), packets),
                    AnnouncerPoll::Finished => {
                        self.announcement_finished(id, now);
                        break;
                    }
                    AnnouncerPoll::Pending => break,
                }
            }
        }

        let mut background = std::mem::take(&mut self.background);
        for (id, announcer) in &mut background {
            while let AnnouncerPoll::Send(packets) = announcer.poll(now) {
                self.send_packets(Some(*id), packets);
            }
        }
        background.retain(|(_, announcer)| announcer.state() == AnnouncerState::Announcing);
        self.background = background;
    }

    fn send_packets(
        &mut self,
        service: Option<ServiceId>,
        packets: Vec<(InterfaceName, Packet)>,
    ) {
        for (interface, packet) in packets {
            match packet.encode() {
                Ok(data) => self.outgoing.push_back(Outgoing {
                    destination: Destination::Multicast(interface),
                    data,
                    service,
                }),
                Err(err) => warn!("failed to encode packet for {}: {}", interface, err),
            }
        }
    }

    fn send_responses(
        &mut self,
        responses: Vec<QueryResponse>,
        destination: Destination,
        max_size: usize,
        at: Option<Instant>,
    ) {
        if responses.is_empty() {
            return;
        }
        let responses = match QueryResponse::combine_responses(responses, max_size) {
            Ok(responses) => responses,
            Err(err) => {
                warn!("failed to assemble response: {}", err);
                return;
            }
        };

        for response in responses {
            let data = match response.encode() {
                Ok(data) => data,
                Err(err) => {
                    warn!("failed to encode response: {}", err);
                    continue;
                }
            };
            let outgoing = Outgoing {
                destination: destination.clone(),
                data,
                service: None,
            };
            match at {
                Some(at) => self.delayed.push((at, outgoing)),
                None => self.outgoing.push_back(outgoing),
            }
        }
    }

    /// Reports that a packet of service `id` could not be sent
    ///
    /// A failed probe, announcement or goodbye fails the pending publish or
    /// unpublish and leaves the service unannounced.
    pub fn handle_send_error(&mut self, id: ServiceId, err: &io::Error, now: Instant) {
        let (state, goodbye) = match self.services.get(&id) {
            Some(entry) => (entry.state, entry.sending_goodbye()),
            None => return,
        };

        match state {
            ServiceState::Probing | ServiceState::Probed => {
                if let Some((probing, mut prober)) = self.prober.take() {
                    if probing == id {
                        prober.cancel();
                    } else {
                        self.prober = Some((probing, prober));
                    }
                }
            }
            ServiceState::Announcing if goodbye => (),
            ServiceState::Announcing => {
                self.stop_background(id);
                if let Some(entry) = self.services.get_mut(&id) {
                    if let Some(mut announcer) = entry.announcer.take() {
                        announcer.cancel();
                    }
                    self.pointers.remove(&entry.data);
                }
            }
            ServiceState::Announced | ServiceState::Unannounced => {
                debug!("ignoring send error for service {}: {}", id, err);
                return;
            }
        }

        warn!("failed to send packets for service {}: {}", id, err);
        self.outgoing.retain(|outgoing| outgoing.service != Some(id));
        self.delayed.retain(|(_, outgoing)| outgoing.service != Some(id));
        self.set_state(id, ServiceState::Unannounced);

        let remove = match self.services.get_mut(&id) {
            Some(entry) => {
                entry.announcer = None;
                entry.conflict_republish = false;
                entry.publish_after_goodbye = false;
                for waiter in entry.publish_waiters.drain(..) {
                    let _ = waiter.send(Err(send_error(err)));
                }
                for waiter in entry.unpublish_waiters.drain(..) {
                    let _ = waiter.send(Err(send_error(err)));
                }
                entry.remove_after_goodbye
            }
            None => false,
        };
        if remove {
            debug!("removing service {}", id);
            self.services.remove(&id);
        }
        self.start_next_probe(now);
    }

    /// Adopts a new set of interfaces and advertises the address changes
    pub fn handle_network_update(
        &mut self,
        update: &NetworkUpdate,
        interfaces: HashMap<InterfaceName, NetworkInterface>,
        now: Instant,
    ) {
        self.interfaces = interfaces;
        for iface in &update.removed {
            debug!("interface {} is gone", iface.name);
        }

        let announced: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|(_, entry)| entry.state == ServiceState::Announced)
            .map(|(id, _)| *id)
            .collect();

        let mut packets = Vec::new();
        for change in &update.changes {
            let iface = match self.interfaces.get(&change.name) {
                Some(iface) => iface,
                None => continue,
            };
            for id in &announced {
                let svc = &self.services[id].data;
                let mut packet = Packet::new_response(0);
                for ip in change.outdated() {
                    packet.answers.push(svc.address_record(ip, 0));
                }
                packet.answers.extend(svc.address_records(iface));
                packet.additional.push(svc.nsec_record(iface));
                packets.push((change.name.clone(), packet));
            }
        }
        self.send_packets(None, packets);

        for iface in &update.added {
            for id in &announced {
                debug!("announcing {} on new interface {}", id, iface.name);
                let mut announcer = Announcer::announce_on(&self.services[id].data, iface);
                announcer.start(now);
                self.background.push((*id, announcer));
            }
        }
    }

    pub fn handle_packet(&mut self, data: &[u8], endpoint: EndpointInfo, now: Instant) {
        trace!(
            "received packet from {}:{} on {}",
            endpoint.address,
            endpoint.port,
            endpoint.interface
        );
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("couldn't parse packet from {}: {}", endpoint.address, err);
                return;
            }
        };

        if packet.flags.opcode != Opcode::StandardQuery {
            trace!("ignoring packet with opcode {:?}", packet.flags.opcode);
            return;
        }

        if packet.flags.response {
            self.handle_response(&packet, now);
        } else {
            self.handle_query(packet, endpoint, now);
        }
    }

    fn handle_response(&mut self, packet: &Packet, now: Instant) {
        let probe_conflict = match self.prober.as_mut() {
            Some((id, prober)) => {
                if prober.handle_response(packet) {
                    prober.conflict().cloned().map(|record| (*id, record))
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some((id, record)) = probe_conflict {
            self.prober = None;
            self.probe_finished(id, Some(record), now);
        }

        let mut conflicts: Vec<(ServiceId, ConflictKind, ResourceRecord)> = Vec::new();
        for record in packet.answers.iter().chain(packet.additional.iter()) {
            for (id, entry) in &self.services {
                if !entry.is_answering() || conflicts.iter().any(|(c, _, _)| c == id) {
                    continue;
                }
                if let Some(kind) = conflict_kind(&entry.data, &self.interfaces, record) {
                    conflicts.push((*id, kind, record.clone()));
                }
            }
        }

        for (id, kind, record) in conflicts {
            self.resolve_conflict(id, kind, &record, now);
        }
    }

    /// Picks a new name for the service and probes again
    fn resolve_conflict(
        &mut self,
        id: ServiceId,
        kind: ConflictKind,
        record: &ResourceRecord,
        now: Instant,
    ) {
        self.stop_announcing(id);
        if let Some(entry) = self.services.get_mut(&id) {
            let old = entry.data.fqdn();
            match kind {
                ConflictKind::Name => entry.data.increment_name(),
                ConflictKind::Hostname => entry.data.increment_hostname(),
            }
            info!(
                "conflict for {} with {:?}, republishing as {} on {}",
                old,
                record.data,
                entry.data.fqdn(),
                entry.data.hostname
            );
            entry.conflict_republish = true;
        }
        self.enqueue_probe(id, now, None);
    }

    fn handle_query(&mut self, packet: Packet, endpoint: EndpointInfo, now: Instant) {
        let packet = match self.truncated.remove(&endpoint) {
            Some(mut query) => match query.append(packet, now) {
                TruncatedQueryResult::Abort => {
                    warn!(
                        "too many truncated packets from {}, dropping query",
                        endpoint.address
                    );
                    return;
                }
                TruncatedQueryResult::AgainTruncated => {
                    self.truncated.insert(endpoint, query);
                    return;
                }
                TruncatedQueryResult::Finished => query.into_packet(),
            },
            None if packet.flags.truncated => {
                trace!("waiting for the rest of the query from {}", endpoint.address);
                self.truncated
                    .insert(endpoint, TruncatedQuery::new(packet, now));
                return;
            }
            None => packet,
        };

        let probe_query = !packet.nameservers.is_empty();
        if probe_query {
            if let Some((_, prober)) = self.prober.as_mut() {
                prober.handle_query(&packet, &endpoint.interface, now);
            }
        }

        if packet.questions.is_empty() {
            return;
        }
        let iface = match self.interfaces.get(&endpoint.interface) {
            Some(iface) => iface.clone(),
            None => {
                trace!("query on unknown interface {}", endpoint.interface);
                return;
            }
        };

        let legacy = endpoint.port != MDNS_PORT;
        let max_size = udp_payload_size(&packet);
        let known_answers: Arc<[ResourceRecord]> = packet.answers.clone().into();

        if legacy {
            let mut response = QueryResponse::new();
            response.define_known_answers(known_answers);
            for question in &packet.questions {
                self.answer_question(question, &iface, &mut response);
            }
            if response.has_answers() {
                self.send_legacy_response(response, &packet, endpoint, max_size);
            }
            return;
        }

        let mut multicast = Vec::new();
        let mut unicast = Vec::new();
        for question in &packet.questions {
            let mut response = QueryResponse::new();
            response.define_known_answers(known_answers.clone());
            self.answer_question(question, &iface, &mut response);
            if !response.has_answers() {
                continue;
            }
            if question.qu {
                unicast.push(response);
            } else {
                multicast.push(response);
            }
        }

        self.send_responses(unicast, Destination::Unicast(endpoint.clone()), max_size, None);

        // a unique answer to a single question is sent right away (RFC 6762 6)
        let delay = !probe_query
            && (packet.questions.len() > 1
                || multicast.iter().any(QueryResponse::contains_shared_answer));
        let at = if delay {
            Some(now + aggregation_delay())
        } else {
            None
        };
        self.send_responses(
            multicast,
            Destination::Multicast(endpoint.interface),
            max_size,
            at,
        );
    }

    fn send_legacy_response(
        &mut self,
        mut response: QueryResponse,
        query: &Packet,
        endpoint: EndpointInfo,
        max_size: usize,
    ) {
        response.mark_legacy_unicast_response(query.id, Some(query.questions.clone()));
        let fragments = match QueryResponse::combine_responses(vec![response], max_size) {
            Ok(fragments) => fragments,
            Err(err) => {
                warn!("failed to assemble legacy response: {}", err);
                return;
            }
        };
        if fragments.len() > 1 {
            debug!(
                "legacy response to {} doesn't fit in {} bytes, sending it truncated",
                endpoint.address, max_size
            );
        }

        // the querier has to retry over TCP for the rest
        let first = match fragments.into_iter().next() {
            Some(first) => first,
            None => return,
        };
        match first.encode() {
            Ok(data) => self.outgoing.push_back(Outgoing {
                destination: Destination::Unicast(endpoint),
                data,
                service: None,
            }),
            Err(err) => warn!("failed to encode legacy response: {}", err),
        }
    }

    fn answering_services(&self) -> impl Iterator<Item = &ServiceData> {
        self.services
            .values()
            .filter(|entry| entry.is_answering())
            .map(|entry| &entry.data)
    }

    fn add_service_additionals(
        svc: &ServiceData,
        iface: &NetworkInterface,
        response: &mut QueryResponse,
    ) {
        response.add_additional(svc.srv_record());
        response.add_additional(svc.txt_record());
        for record in svc.address_records(iface) {
            response.add_additional(record);
        }
        response.add_additional(svc.nsec_record(iface));
    }

    fn answer_question(
        &self,
        question: &Question,
        iface: &NetworkInterface,
        response: &mut QueryResponse,
    ) {
        if question.qclass != Class::IN && question.qclass != Class::Any {
            return;
        }
        let name = &question.qname;
        if is_reverse_lookup(name) {
            trace!("not answering reverse lookup for {}", name);
            return;
        }

        let pointer_query = match question.qtype {
            QueryType::PTR | QueryType::All | QueryType::CNAME => true,
            _ => false,
        };
        if pointer_query {
            if ServicePointers::is_enumeration(name) {
                for typ in self.pointers.get(name) {
                    response.add_answer(ResourceRecord::new(
                        SERVICE_TYPE_ENUMERATION_NAME,
                        DEFAULT_TTL,
                        false,
                        RRData::PTR(typ.clone()),
                    ));
                }
                return;
            }

            for fqdn in self.pointers.get(name) {
                let svc = match self
                    .answering_services()
                    .find(|svc| name_equals(&svc.fqdn(), fqdn))
                {
                    Some(svc) => svc,
                    None => continue,
                };
                let pointer = svc
                    .pointer_names()
                    .into_iter()
                    .find(|pointer| name_equals(pointer, name))
                    .unwrap_or_else(|| name.clone());
                let record = ResourceRecord::new(pointer, DEFAULT_TTL, false, RRData::PTR(svc.fqdn()));
                if response.add_answer(record) {
                    Self::add_service_additionals(svc, iface, response);
                }
            }
        }

        for svc in self.answering_services() {
            if name_equals(name, &svc.fqdn()) {
                if question.qtype.matches(Type::SRV) && response.add_answer(svc.srv_record()) {
                    for record in svc.address_records(iface) {
                        response.add_additional(record);
                    }
                    response.add_additional(svc.nsec_record(iface));
                }
                if question.qtype.matches(Type::TXT) {
                    response.add_answer(svc.txt_record());
                }
            }

            if name_equals(name, &svc.hostname) {
                let mut matched = false;
                for record in svc.address_records(iface) {
                    if question.qtype.matches(record.typ()) {
                        matched = true;
                        response.add_answer(record);
                    } else {
                        response.add_additional(record);
                    }
                }

                // negative response, the address type asked for doesn't exist
                let address_query = match question.qtype {
                    QueryType::A | QueryType::AAAA => true,
                    _ => false,
                };
                if address_query && !matched {
                    response.add_answer(svc.nsec_record(iface));
                } else {
                    response.add_additional(svc.nsec_record(iface));
                }
            }
        }
    }
}
