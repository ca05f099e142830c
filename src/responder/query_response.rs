use crate::dns_parser::{Error, NameCoder, Packet, Question, ResourceRecord};
use std::sync::Arc;

/// Legacy unicast responses must not carry a TTL above this (RFC 6762 6.7)
const LEGACY_UNICAST_TTL: u32 = 10;

/// Answers and additionals collected for one outgoing response
#[derive(Debug, Clone)]
pub struct QueryResponse {
    packet: Packet,
    known_answers: Option<Arc<[ResourceRecord]>>,
    legacy_unicast: bool,
    shared_answer: bool,
}

impl Default for QueryResponse {
    fn default() -> Self {
        QueryResponse::new()
    }
}

impl QueryResponse {
    pub fn new() -> QueryResponse {
        QueryResponse {
            packet: Packet::new_response(0),
            known_answers: None,
            legacy_unicast: false,
            shared_answer: false,
        }
    }

    /// Records the querier told us it already has
    pub fn define_known_answers(&mut self, known_answers: Arc<[ResourceRecord]>) {
        self.known_answers = Some(known_answers);
    }

    fn is_known(&self, record: &ResourceRecord) -> bool {
        match self.known_answers {
            Some(ref known) => known.iter().any(|answer| {
                answer.about_equal(record) && u64::from(answer.ttl) * 2 >= u64::from(record.ttl)
            }),
            None => false,
        }
    }

    /// Returns false if the record was suppressed or is already an answer
    pub fn add_answer(&mut self, record: ResourceRecord) -> bool {
        if self.is_known(&record) {
            return false;
        }
        if self.packet.answers.iter().any(|r| r.about_equal(&record)) {
            return false;
        }

        self.packet.additional.retain(|r| !r.about_equal(&record));
        if !record.flush {
            self.shared_answer = true;
        }
        self.packet.answers.push(record);
        true
    }

    pub fn add_additional(&mut self, record: ResourceRecord) -> bool {
        if self.is_known(&record) {
            return false;
        }
        let present = self
            .packet
            .answers
            .iter()
            .chain(self.packet.additional.iter())
            .any(|r| r.about_equal(&record));
        if present {
            return false;
        }

        self.packet.additional.push(record);
        true
    }

    pub fn has_answers(&self) -> bool {
        !self.packet.answers.is_empty()
    }

    pub fn answers(&self) -> &[ResourceRecord] {
        &self.packet.answers
    }

    pub fn additionals(&self) -> &[ResourceRecord] {
        &self.packet.additional
    }

    /// Whether a record not marked unique was answered, other responders
    /// may answer the same question
    pub fn contains_shared_answer(&self) -> bool {
        self.shared_answer
    }

    pub fn is_legacy_unicast(&self) -> bool {
        self.legacy_unicast
    }

    /// Turns this into a conventional unicast DNS response (RFC 6762 6.7)
    pub fn mark_legacy_unicast_response(&mut self, id: u16, questions: Option<Vec<Question>>) {
        self.legacy_unicast = true;
        self.packet.id = id;
        if let Some(questions) = questions {
            self.packet.questions = questions;
        }
        for record in self
            .packet
            .answers
            .iter_mut()
            .chain(self.packet.additional.iter_mut())
        {
            record.flush = false;
            record.ttl = record.ttl.min(LEGACY_UNICAST_TTL);
        }
    }

    pub fn mark_truncated(&mut self) {
        self.packet.flags.truncated = true;
    }

    pub fn is_truncated(&self) -> bool {
        self.packet.flags.truncated
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    fn coder(&self) -> NameCoder {
        name_coder(self.legacy_unicast)
    }

    pub fn encoding_length(&self) -> Result<usize, Error> {
        self.packet.encoding_length_with(self.coder())
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        self.packet.encode_with(self.coder())
    }

    fn combine_with(&mut self, other: QueryResponse) {
        self.shared_answer |= other.shared_answer;
        self.packet.combine_with(other.packet);
    }

    /// Splits into packets of at most `max_size` bytes
    ///
    /// A record exceeding the size on its own still gets a packet. Legacy
    /// responses repeat the questions only in the first fragment and flag
    /// all but the last as truncated.
    fn split(self, max_size: usize) -> Result<Vec<QueryResponse>, Error> {
        if self.encoding_length()? <= max_size {
            return Ok(vec![self]);
        }

        let QueryResponse {
            packet,
            legacy_unicast,
            shared_answer,
            ..
        } = self;
        let Packet {
            id,
            flags,
            questions,
            answers,
            nameservers,
            additional,
        } = packet;

        let mut fragments = Vec::new();
        let mut current = Packet {
            id,
            flags,
            questions,
            answers: Vec::new(),
            nameservers,
            additional: Vec::new(),
        };

        let records = answers
            .into_iter()
            .map(|record| (true, record))
            .chain(additional.into_iter().map(|record| (false, record)));
        for (is_answer, record) in records {
            section(&mut current, is_answer).push(record);

            let count = current.answers.len() + current.additional.len();
            if count > 1 && current.encoding_length_with(name_coder(legacy_unicast))? > max_size {
                if let Some(record) = section(&mut current, is_answer).pop() {
                    let mut next = Packet::new_response(id);
                    next.flags = flags;
                    section(&mut next, is_answer).push(record);
                    fragments.push(std::mem::replace(&mut current, next));
                }
            }
        }
        fragments.push(current);

        let last = fragments.len() - 1;
        Ok(fragments
            .into_iter()
            .enumerate()
            .map(|(index, mut packet)| {
                if legacy_unicast && index < last {
                    packet.flags.truncated = true;
                }
                QueryResponse {
                    packet,
                    known_answers: None,
                    legacy_unicast,
                    shared_answer,
                }
            })
            .collect())
    }

    /// Splits oversized responses and greedily merges the rest while each
    /// packet stays within `max_size`
    pub fn combine_responses(
        responses: Vec<QueryResponse>,
        max_size: usize,
    ) -> Result<Vec<QueryResponse>, Error> {
        let mut fragments = Vec::with_capacity(responses.len());
        for response in responses {
            fragments.extend(response.split(max_size)?);
        }

        let mut combined: Vec<QueryResponse> = Vec::with_capacity(fragments.len());
        'fragments: for response in fragments {
            if !response.legacy_unicast {
                for existing in combined.iter_mut().filter(|r| !r.legacy_unicast) {
                    if existing
                        .packet
                        .can_be_combined_with(&response.packet, max_size)?
                    {
                        existing.combine_with(response);
                        continue 'fragments;
                    }
                }
            }
            combined.push(response);
        }

        Ok(combined)
    }
}

fn name_coder(legacy_unicast: bool) -> NameCoder {
    if legacy_unicast {
        NameCoder::without_compression()
    } else {
        NameCoder::new()
    }
}

fn section(packet: &mut Packet, answers: bool) -> &mut Vec<ResourceRecord> {
    if answers {
        &mut packet.answers
    } else {
        &mut packet.additional
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_parser::{QueryType, RRData};
    use std::net::Ipv4Addr;

    fn ptr(target: &str, ttl: u32) -> ResourceRecord {
        ResourceRecord::new("_http._tcp.local", ttl, false, RRData::PTR(target.into()))
    }

    fn a(host: &str, last: u8) -> ResourceRecord {
        ResourceRecord::new(host, 120, true, RRData::A(Ipv4Addr::new(192, 168, 1, last)))
    }

    #[test]
    fn known_answer_suppression() {
        let mut response = QueryResponse::new();
        response.define_known_answers(vec![ptr("A._http._tcp.local", 2250)].into());

        assert!(!response.add_answer(ptr("A._http._tcp.local", 4500)));
        assert!(!response.has_answers());

        let mut response = QueryResponse::new();
        response.define_known_answers(vec![ptr("A._http._tcp.local", 2249)].into());
        assert!(response.add_answer(ptr("A._http._tcp.local", 4500)));
        assert!(response.contains_shared_answer());
    }

    #[test]
    fn additionals_are_deduplicated() {
        let mut response = QueryResponse::new();
        assert!(response.add_answer(a("host.local", 1)));
        assert!(!response.add_additional(a("HOST.local", 1)));
        assert!(response.add_additional(a("host.local", 2)));
        assert!(!response.add_additional(a("host.local", 2)));

        // promoting an additional to an answer moves it
        assert!(response.add_answer(a("host.local", 2)));
        assert!(response.additionals().is_empty());
        assert_eq!(response.answers().len(), 2);
        assert!(!response.contains_shared_answer());
    }

    #[test]
    fn legacy_unicast_marking() {
        let mut response = QueryResponse::new();
        response.add_answer(a("host.local", 1));
        let question = Question::new("host.local", QueryType::A, false);
        response.mark_legacy_unicast_response(0x1234, Some(vec![question.clone()]));

        let packet = Packet::parse(&response.encode().unwrap()).unwrap();
        assert_eq!(packet.id, 0x1234);
        assert_eq!(packet.questions, vec![question]);
        assert_eq!(packet.answers[0].ttl, 10);
        assert!(!packet.answers[0].flush);
    }

    #[test]
    fn small_responses_are_merged() {
        let mut first = QueryResponse::new();
        first.add_answer(a("one.local", 1));
        let mut second = QueryResponse::new();
        second.add_answer(a("two.local", 2));

        let combined = QueryResponse::combine_responses(vec![first, second], 1472).unwrap();
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].answers().len(), 2);
    }

    #[test]
    fn oversized_response_is_split() {
        let mut response = QueryResponse::new();
        for i in 0..40 {
            response.add_answer(ptr(&format!("Service number {:02}._http._tcp.local", i), 4500));
        }
        assert!(response.encoding_length().unwrap() > 512);

        let fragments = QueryResponse::combine_responses(vec![response], 512).unwrap();
        assert!(fragments.len() >= 2);
        let total: usize = fragments.iter().map(|f| f.answers().len()).sum();
        assert_eq!(total, 40);
        for fragment in &fragments {
            assert!(fragment.encoding_length().unwrap() <= 512);
            assert!(!fragment.is_truncated());
        }
    }

    #[test]
    fn legacy_fragments_are_truncated_except_last() {
        let mut response = QueryResponse::new();
        for i in 0..40 {
            response.add_answer(ptr(&format!("Service number {:02}._http._tcp.local", i), 4500));
        }
        let question = Question::new("_http._tcp.local", QueryType::PTR, false);
        response.mark_legacy_unicast_response(7, Some(vec![question]));

        let fragments = QueryResponse::combine_responses(vec![response], 512).unwrap();
        assert!(fragments.len() >= 2);
        assert_eq!(fragments[0].packet().questions.len(), 1);
        assert!(fragments[1].packet().questions.is_empty());
        let (last, rest) = fragments.split_last().unwrap();
        assert!(rest.iter().all(QueryResponse::is_truncated));
        assert!(!last.is_truncated());
        assert!(fragments.iter().all(|f| f.packet().id == 7));
    }
}
