use crate::dns_parser::{name_equals, Packet, QueryType, Question, RRData, ResourceRecord, Type};
use crate::network::{InterfaceName, NetworkInterface};
use crate::services::ServiceData;
use log::{debug, trace};
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const PROBE_COUNT: u8 = 3;
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
/// Wait time after losing a simultaneous probe tiebreak (RFC 6762 8.2)
const TIEBREAK_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Succeeded,
    Conflict,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProberState {
    Idle,
    Probing,
    Succeeded,
    Conflicted,
    Cancelled,
}

#[derive(Debug)]
pub enum ProberPoll {
    Send(Vec<(InterfaceName, Packet)>),
    Finished(ProbeOutcome),
    Pending,
}

/// Verifies that nobody else on the link uses the names of a service
/// (RFC 6762 8.1)
#[derive(Debug)]
pub struct Prober {
    fqdn: String,
    hostname: String,
    /// probe packet per interface
    packets: Vec<(InterfaceName, Packet)>,
    state: ProberState,
    sent: u8,
    next_at: Option<Instant>,
    conflict: Option<ResourceRecord>,
}

impl Prober {
    pub fn new(svc: &ServiceData, interfaces: &HashMap<InterfaceName, NetworkInterface>) -> Prober {
        let fqdn = svc.fqdn();
        let packets = interfaces
            .values()
            .map(|iface| {
                let mut packet = Packet::new_query(0);
                packet
                    .questions
                    .push(Question::new(fqdn.clone(), QueryType::All, false));
                packet
                    .questions
                    .push(Question::new(svc.hostname.clone(), QueryType::All, false));
                packet.nameservers = svc.probe_records(iface);
                (iface.name.clone(), packet)
            })
            .collect();

        Prober {
            fqdn,
            hostname: svc.hostname.clone(),
            packets,
            state: ProberState::Idle,
            sent: 0,
            next_at: None,
            conflict: None,
        }
    }

    pub fn state(&self) -> ProberState {
        self.state
    }

    /// The record that made probing fail
    pub fn conflict(&self) -> Option<&ResourceRecord> {
        self.conflict.as_ref()
    }

    pub fn start(&mut self, now: Instant) {
        debug!("starting to probe for {}", self.fqdn);
        let initial_delay = Duration::from_millis(thread_rng().gen_range(0..=250));
        self.state = ProberState::Probing;
        self.sent = 0;
        self.next_at = Some(now + initial_delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            ProberState::Probing => self.next_at,
            _ => None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> ProberPoll {
        match (self.state, self.next_at) {
            (ProberState::Probing, Some(at)) if at <= now => (),
            _ => return ProberPoll::Pending,
        }

        if self.sent == PROBE_COUNT {
            debug!("probing for {} succeeded", self.fqdn);
            self.state = ProberState::Succeeded;
            self.next_at = None;
            return ProberPoll::Finished(ProbeOutcome::Succeeded);
        }

        // only the first probe asks for unicast responses (RFC 6762 8.1)
        let first = self.sent == 0;
        let packets = self
            .packets
            .iter()
            .map(|(iface, packet)| {
                let mut packet = packet.clone();
                for question in &mut packet.questions {
                    question.qu = first;
                }
                (iface.clone(), packet)
            })
            .collect();

        self.sent += 1;
        self.next_at = Some(now + PROBE_INTERVAL);
        trace!("sending probe {} for {}", self.sent, self.fqdn);
        ProberPoll::Send(packets)
    }

    fn owns(&self, name: &str) -> bool {
        name_equals(name, &self.fqdn) || name_equals(name, &self.hostname)
    }

    fn is_probed(&self, record: &ResourceRecord) -> bool {
        self.packets
            .iter()
            .flat_map(|(_, packet)| packet.nameservers.iter())
            .any(|probed| probed.about_equal(record))
    }

    /// Checks a response received while probing, returns true on conflict
    pub fn handle_response(&mut self, packet: &Packet) -> bool {
        if self.state != ProberState::Probing {
            return false;
        }

        let conflict = packet
            .answers
            .iter()
            .chain(packet.nameservers.iter())
            .chain(packet.additional.iter())
            .filter(|record| record.ttl > 0 && self.owns(&record.name))
            .filter(|record| match record.typ() {
                Type::SRV | Type::TXT | Type::A | Type::AAAA => true,
                _ => false,
            })
            .find(|record| !self.is_probed(record))
            .cloned();

        match conflict {
            Some(record) => {
                debug!(
                    "probing for {} failed, conflicting record {:?}",
                    self.fqdn, record
                );
                self.state = ProberState::Conflicted;
                self.next_at = None;
                self.conflict = Some(record);
                true
            }
            None => false,
        }
    }

    /// Simultaneous probe tiebreaking (RFC 6762 8.2)
    ///
    /// Returns true if the other host won, probing restarts after a second.
    pub fn handle_query(&mut self, packet: &Packet, interface: &str, now: Instant) -> bool {
        if self.state != ProberState::Probing || packet.nameservers.is_empty() {
            return false;
        }
        let ours = match self.packets.iter().find(|(name, _)| name == interface) {
            Some((_, packet)) => &packet.nameservers,
            None => return false,
        };

        let mut lost = false;
        for name in [&self.fqdn, &self.hostname].iter() {
            let theirs = sorted_records(packet.nameservers.iter(), name);
            if theirs.is_empty() {
                continue;
            }
            let ours = sorted_records(ours.iter(), name);
            if ours < theirs {
                lost = true;
            }
        }

        if lost {
            debug!(
                "lost simultaneous probe tiebreak for {}, probing again",
                self.fqdn
            );
            self.sent = 0;
            self.next_at = Some(now + TIEBREAK_BACKOFF);
        }
        lost
    }

    pub fn cancel(&mut self) {
        if self.state == ProberState::Idle || self.state == ProberState::Probing {
            debug!("probing for {} cancelled", self.fqdn);
            self.state = ProberState::Cancelled;
            self.next_at = None;
        }
    }
}

/// Records of `name` in the canonical order used for tiebreaking
fn sorted_records<'a, I>(records: I, name: &str) -> Vec<(u16, u16, Vec<u8>)>
where
    I: Iterator<Item = &'a ResourceRecord>,
{
    let mut sorted: Vec<_> = records
        .filter(|record| name_equals(&record.name, name))
        .map(|record| {
            let rdata = match record.data {
                RRData::OPT { .. } => Vec::new(),
                ref data => data.canonical_bytes().unwrap_or_default(),
            };
            (u16::from(record.cls), u16::from(record.typ()), rdata)
        })
        .collect();
    sorted.sort();
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn setup() -> (ServiceData, HashMap<InterfaceName, NetworkInterface>) {
        let svc = ServiceData::new("Printer", "_http._tcp", "local", &[], "host", 631, vec![]);
        let mut interfaces = HashMap::new();
        interfaces.insert(
            "eth0".to_owned(),
            NetworkInterface::new("eth0").with_ipv4(
                Ipv4Addr::new(192, 168, 1, 10),
                Ipv4Addr::new(255, 255, 255, 0),
            ),
        );
        (svc, interfaces)
    }

    fn sends(prober: &mut Prober, now: Instant) -> Vec<(InterfaceName, Packet)> {
        match prober.poll(now) {
            ProberPoll::Send(packets) => packets,
            other => panic!("expected probe, got {:?}", other),
        }
    }

    #[test]
    fn three_probes_then_success() {
        let (svc, interfaces) = setup();
        let mut prober = Prober::new(&svc, &interfaces);
        let start = Instant::now();
        prober.start(start);

        let mut now = start + Duration::from_millis(250);
        let first = sends(&mut prober, now);
        assert_eq!(first.len(), 1);
        assert!(first[0].1.questions.iter().all(|q| q.qu));
        assert_eq!(first[0].1.nameservers.len(), 3);

        now += PROBE_INTERVAL;
        let second = sends(&mut prober, now);
        assert!(second[0].1.questions.iter().all(|q| !q.qu));
        assert!(matches!(prober.poll(now), ProberPoll::Pending));

        now += PROBE_INTERVAL;
        sends(&mut prober, now);
        now += PROBE_INTERVAL;
        assert!(matches!(
            prober.poll(now),
            ProberPoll::Finished(ProbeOutcome::Succeeded)
        ));
        assert_eq!(prober.state(), ProberState::Succeeded);
    }

    #[test]
    fn conflicting_srv_is_detected() {
        let (svc, interfaces) = setup();
        let mut prober = Prober::new(&svc, &interfaces);
        prober.start(Instant::now());

        let mut response = Packet::new_response(0);
        response.answers.push(svc.srv_record());
        assert!(!prober.handle_response(&response));

        let mut foreign = svc.srv_record();
        foreign.data = RRData::SRV {
            priority: 0,
            weight: 0,
            port: 632,
            target: "host.local".into(),
        };
        response.answers.push(foreign);
        assert!(prober.handle_response(&response));
        assert_eq!(prober.state(), ProberState::Conflicted);
        assert!(prober.conflict().is_some());
    }

    #[test]
    fn conflicting_authority_record_is_detected() {
        let (svc, interfaces) = setup();
        let mut prober = Prober::new(&svc, &interfaces);
        prober.start(Instant::now());

        let mut response = Packet::new_response(0);
        response
            .nameservers
            .push(svc.address_record(Ipv4Addr::new(192, 168, 1, 77).into(), 120));
        assert!(prober.handle_response(&response));
        assert_eq!(
            prober.conflict().map(|record| record.data.clone()),
            Some(RRData::A(Ipv4Addr::new(192, 168, 1, 77)))
        );
    }

    #[test]
    fn losing_tiebreak_restarts() {
        let (svc, interfaces) = setup();
        let mut prober = Prober::new(&svc, &interfaces);
        let now = Instant::now();
        prober.start(now);

        // our own probe looped back is a tie
        let own = prober.packets[0].1.clone();
        assert!(!prober.handle_query(&own, "eth0", now));

        let mut theirs = own.clone();
        for record in &mut theirs.nameservers {
            if let RRData::A(_) = record.data {
                record.data = RRData::A(Ipv4Addr::new(192, 168, 1, 200));
            }
        }
        assert!(prober.handle_query(&theirs, "eth0", now));
        assert_eq!(prober.deadline(), Some(now + TIEBREAK_BACKOFF));

        let mut lower = own;
        for record in &mut lower.nameservers {
            if let RRData::A(_) = record.data {
                record.data = RRData::A(Ipv4Addr::new(192, 168, 1, 1));
            }
        }
        assert!(!prober.handle_query(&lower, "eth0", now));
    }

    #[test]
    fn cancel() {
        let (svc, interfaces) = setup();
        let mut prober = Prober::new(&svc, &interfaces);
        prober.start(Instant::now());
        prober.cancel();
        assert_eq!(prober.state(), ProberState::Cancelled);
        assert_eq!(prober.deadline(), None);
    }
}
