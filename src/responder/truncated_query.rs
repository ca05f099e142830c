use crate::dns_parser::Packet;
use log::trace;
use rand::{thread_rng, Rng};
use std::time::{Duration, Instant};

/// More continuation packets than this make us drop the whole query
const MAX_CONTINUATIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncatedQueryResult {
    Abort,
    AgainTruncated,
    Finished,
}

/// A query spread over multiple packets by its sender (RFC 6762 7.2)
#[derive(Debug)]
pub struct TruncatedQuery {
    packet: Packet,
    continuations: usize,
    timeout_at: Instant,
}

fn inactivity_timeout() -> Duration {
    Duration::from_millis(thread_rng().gen_range(400..=500))
}

impl TruncatedQuery {
    pub fn new(packet: Packet, now: Instant) -> TruncatedQuery {
        TruncatedQuery {
            packet,
            continuations: 0,
            timeout_at: now + inactivity_timeout(),
        }
    }

    /// After this the partial query is discarded
    pub fn timeout_at(&self) -> Instant {
        self.timeout_at
    }

    pub fn append(&mut self, packet: Packet, now: Instant) -> TruncatedQueryResult {
        self.continuations += 1;
        let truncated = packet.flags.truncated;
        self.packet.combine_with(packet);

        if !truncated {
            trace!(
                "truncated query complete after {} continuations",
                self.continuations
            );
            return TruncatedQueryResult::Finished;
        }
        if self.continuations > MAX_CONTINUATIONS {
            return TruncatedQueryResult::Abort;
        }

        self.timeout_at = now + inactivity_timeout();
        TruncatedQueryResult::AgainTruncated
    }

    /// The reassembled query
    pub fn into_packet(self) -> Packet {
        let mut packet = self.packet;
        packet.flags.truncated = false;
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_parser::{QueryType, Question, RRData, ResourceRecord};

    fn part(truncated: bool, known: &str) -> Packet {
        let mut packet = Packet::new_query(0);
        packet.flags.truncated = truncated;
        packet
            .questions
            .push(Question::new("_http._tcp.local", QueryType::PTR, false));
        packet.answers.push(ResourceRecord::new(
            "_http._tcp.local",
            4500,
            false,
            RRData::PTR(known.into()),
        ));
        packet
    }

    #[test]
    fn reassembles_known_answers() {
        let now = Instant::now();
        let mut query = TruncatedQuery::new(part(true, "A._http._tcp.local"), now);
        assert!(query.timeout_at() >= now + Duration::from_millis(400));
        assert!(query.timeout_at() <= now + Duration::from_millis(500));

        assert_eq!(
            query.append(part(true, "B._http._tcp.local"), now),
            TruncatedQueryResult::AgainTruncated
        );
        assert_eq!(
            query.append(part(false, "C._http._tcp.local"), now),
            TruncatedQueryResult::Finished
        );

        let packet = query.into_packet();
        assert!(!packet.flags.truncated);
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.answers.len(), 3);
    }

    #[test]
    fn aborts_endless_continuations() {
        let now = Instant::now();
        let mut query = TruncatedQuery::new(part(true, "A._http._tcp.local"), now);
        for _ in 0..MAX_CONTINUATIONS {
            assert_eq!(
                query.append(part(true, "A._http._tcp.local"), now),
                TruncatedQueryResult::AgainTruncated
            );
        }
        assert_eq!(
            query.append(part(true, "A._http._tcp.local"), now),
            TruncatedQueryResult::Abort
        );
    }
}
