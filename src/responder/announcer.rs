use crate::dns_parser::Packet;
use crate::network::{InterfaceName, NetworkInterface};
use crate::services::ServiceData;
use log::{debug, trace};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const ANNOUNCE_REPETITIONS: u32 = 3;
const GOODBYE_REPETITIONS: u32 = 1;
const MAX_REPETITIONS: u32 = 8;
const INITIAL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncerState {
    Idle,
    Announcing,
    Done,
    Cancelled,
}

#[derive(Debug)]
pub enum AnnouncerPoll {
    Send(Vec<(InterfaceName, Packet)>),
    Finished,
    Pending,
}

/// Sends unsolicited responses for a service (RFC 6762 8.3, 10.1)
#[derive(Debug)]
pub struct Announcer {
    fqdn: String,
    packets: Vec<(InterfaceName, Packet)>,
    goodbye: bool,
    repetitions: u32,
    sent: u32,
    delay: Duration,
    state: AnnouncerState,
    next_at: Option<Instant>,
}

fn announcement(svc: &ServiceData, iface: &NetworkInterface) -> Packet {
    let mut packet = Packet::new_response(0);
    packet.answers = svc.announce_records(iface);
    packet.additional.push(svc.nsec_record(iface));
    packet
}

impl Announcer {
    /// Announces the full record set of `svc` on every interface
    pub fn announce(
        svc: &ServiceData,
        interfaces: &HashMap<InterfaceName, NetworkInterface>,
    ) -> Announcer {
        let packets = interfaces
            .values()
            .map(|iface| (iface.name.clone(), announcement(svc, iface)))
            .collect();
        Announcer::with_packets(svc, packets, false, ANNOUNCE_REPETITIONS)
    }

    /// Announces `svc` on a single, newly appeared interface
    pub fn announce_on(svc: &ServiceData, iface: &NetworkInterface) -> Announcer {
        let packets = vec![(iface.name.clone(), announcement(svc, iface))];
        Announcer::with_packets(svc, packets, false, ANNOUNCE_REPETITIONS)
    }

    /// Tells caches to flush the records of `svc`
    pub fn goodbye(
        svc: &ServiceData,
        interfaces: &HashMap<InterfaceName, NetworkInterface>,
    ) -> Announcer {
        let mut packet = Packet::new_response(0);
        packet.answers = svc.goodbye_records();
        let packets = interfaces
            .keys()
            .map(|name| (name.clone(), packet.clone()))
            .collect();
        Announcer::with_packets(svc, packets, true, GOODBYE_REPETITIONS)
    }

    fn with_packets(
        svc: &ServiceData,
        packets: Vec<(InterfaceName, Packet)>,
        goodbye: bool,
        repetitions: u32,
    ) -> Announcer {
        Announcer {
            fqdn: svc.fqdn(),
            packets,
            goodbye,
            repetitions,
            sent: 0,
            delay: INITIAL_DELAY,
            state: AnnouncerState::Idle,
            next_at: None,
        }
    }

    pub fn with_repetitions(mut self, repetitions: u32) -> Announcer {
        self.repetitions = repetitions.max(1).min(MAX_REPETITIONS);
        self
    }

    pub fn state(&self) -> AnnouncerState {
        self.state
    }

    pub fn is_sending_goodbye(&self) -> bool {
        self.goodbye
    }

    pub fn start(&mut self, now: Instant) {
        debug!(
            "starting {} for {}",
            if self.goodbye { "goodbye" } else { "announcement" },
            self.fqdn
        );
        self.state = AnnouncerState::Announcing;
        self.next_at = Some(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            AnnouncerState::Announcing => self.next_at,
            _ => None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> AnnouncerPoll {
        match (self.state, self.next_at) {
            (AnnouncerState::Announcing, Some(at)) if at <= now => (),
            _ => return AnnouncerPoll::Pending,
        }

        if self.sent == self.repetitions {
            self.state = AnnouncerState::Done;
            self.next_at = None;
            return AnnouncerPoll::Finished;
        }

        self.sent += 1;
        if self.sent == self.repetitions {
            self.next_at = Some(now);
        } else {
            self.next_at = Some(now + self.delay);
            self.delay *= 2;
        }
        trace!(
            "sending announcement {}/{} for {}",
            self.sent,
            self.repetitions,
            self.fqdn
        );
        AnnouncerPoll::Send(self.packets.clone())
    }

    /// Stops outstanding repetitions, a goodbye is always finished
    pub fn cancel(&mut self) -> bool {
        if self.goodbye {
            return false;
        }
        match self.state {
            AnnouncerState::Idle | AnnouncerState::Announcing => {
                debug!("announcement for {} cancelled", self.fqdn);
                self.state = AnnouncerState::Cancelled;
                self.next_at = None;
                true
            }
            _ => false,
        }
    }
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

    #[test]
    fn announcements_back_off() {
        let (svc, interfaces) = setup();
        let mut announcer = Announcer::announce(&svc, &interfaces);
        let start = Instant::now();
        announcer.start(start);

        assert!(matches!(announcer.poll(start), AnnouncerPoll::Send(_)));
        assert_eq!(announcer.deadline(), Some(start + Duration::from_secs(1)));
        assert!(matches!(announcer.poll(start), AnnouncerPoll::Pending));

        let second = start + Duration::from_secs(1);
        assert!(matches!(announcer.poll(second), AnnouncerPoll::Send(_)));
        assert_eq!(announcer.deadline(), Some(second + Duration::from_secs(2)));

        let third = second + Duration::from_secs(2);
        assert!(matches!(announcer.poll(third), AnnouncerPoll::Send(_)));
        assert!(matches!(announcer.poll(third), AnnouncerPoll::Finished));
        assert_eq!(announcer.state(), AnnouncerState::Done);
    }

    #[test]
    fn goodbye_uses_zero_ttl_and_ignores_cancel() {
        let (svc, interfaces) = setup();
        let mut announcer = Announcer::goodbye(&svc, &interfaces);
        let now = Instant::now();
        announcer.start(now);
        assert!(announcer.is_sending_goodbye());
        assert!(!announcer.cancel());

        match announcer.poll(now) {
            AnnouncerPoll::Send(packets) => {
                assert_eq!(packets.len(), 1);
                assert!(packets[0].1.answers.iter().all(|r| r.ttl == 0));
            }
            other => panic!("expected goodbye, got {:?}", other),
        }
        assert!(matches!(announcer.poll(now), AnnouncerPoll::Finished));
    }

    #[test]
    fn cancel_stops_announcement() {
        let (svc, interfaces) = setup();
        let mut announcer = Announcer::announce(&svc, &interfaces).with_repetitions(20);
        let now = Instant::now();
        announcer.start(now);
        assert!(matches!(announcer.poll(now), AnnouncerPoll::Send(_)));
        assert!(announcer.cancel());
        assert_eq!(announcer.deadline(), None);
        assert!(matches!(
            announcer.poll(now + Duration::from_secs(5)),
            AnnouncerPoll::Pending
        ));
        assert_eq!(announcer.repetitions, MAX_REPETITIONS);
    }
}
