use super::{Error, Flags, Header, NameCoder, Packet, Question, ResourceRecord};

impl Packet {
    pub fn new_query(id: u16) -> Packet {
        Packet::with_flags(id, Flags::query())
    }

    pub fn new_response(id: u16) -> Packet {
        Packet::with_flags(id, Flags::response())
    }

    fn with_flags(id: u16, flags: Flags) -> Packet {
        Packet {
            id,
            flags,
            questions: Vec::new(),
            answers: Vec::new(),
            nameservers: Vec::new(),
            additional: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.nameservers.is_empty()
            && self.additional.is_empty()
    }

    fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.answers
            .iter()
            .chain(self.nameservers.iter())
            .chain(self.additional.iter())
    }

    fn header(&self) -> Result<Header, Error> {
        Ok(Header {
            id: self.id,
            flags: self.flags,
            questions: section_count(self.questions.len())?,
            answers: section_count(self.answers.len())?,
            nameservers: section_count(self.nameservers.len())?,
            additional: section_count(self.additional.len())?,
        })
    }

    fn prepare(&self, coder: &mut NameCoder) -> Result<(), Error> {
        for question in &self.questions {
            question.track_names(coder);
        }
        for record in self.records() {
            record.track_names(coder);
        }
        coder.compute_compression_paths()
    }

    fn replay_length(&self, coder: &mut NameCoder) -> usize {
        coder.rewind();
        let mut length = Header::SIZE;
        for question in &self.questions {
            length += question.encoding_length(coder);
        }
        for record in self.records() {
            length += record.encoding_length(coder);
        }
        length
    }

    /// Exact size of the packet as `encode` would produce it
    pub fn encoding_length(&self) -> Result<usize, Error> {
        self.encoding_length_with(NameCoder::new())
    }

    pub fn encoding_length_with(&self, mut coder: NameCoder) -> Result<usize, Error> {
        self.prepare(&mut coder)?;
        Ok(self.replay_length(&mut coder))
    }

    /// Upper bound of the encoded size, as if no name was compressed
    pub fn estimated_length(&self) -> usize {
        let questions: usize = self
            .questions
            .iter()
            .map(|q| {
                let name = q.qname.strip_suffix('.').unwrap_or(&q.qname);
                if name.is_empty() {
                    5
                } else {
                    name.len() + 6
                }
            })
            .sum();
        let records: usize = self.records().map(ResourceRecord::estimated_length).sum();
        Header::SIZE + questions + records
    }

    /// Serializes the packet, compressing names across all sections
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        self.encode_with(NameCoder::new())
    }

    pub fn encode_with(&self, mut coder: NameCoder) -> Result<Vec<u8>, Error> {
        let header = self.header()?;
        self.prepare(&mut coder)?;
        let length = self.replay_length(&mut coder);
        coder.rewind();

        let mut buf = Vec::with_capacity(length);
        header.write(&mut buf);
        for question in &self.questions {
            question.write_to(&mut coder, &mut buf)?;
        }
        for record in self.records() {
            record.write_to(&mut coder, &mut buf)?;
        }
        debug_assert_eq!(buf.len(), length);

        Ok(buf)
    }

    pub fn parse(data: &[u8]) -> Result<Packet, Error> {
        let header = Header::parse(data)?;
        let mut offset = Header::SIZE;

        let mut questions = Vec::with_capacity(usize::from(header.questions).min(32));
        for _ in 0..header.questions {
            let (question, read) = Question::parse(data, offset)?;
            questions.push(question);
            offset += read;
        }

        let mut sections = [
            (header.answers, Vec::new()),
            (header.nameservers, Vec::new()),
            (header.additional, Vec::new()),
        ];
        for (count, records) in sections.iter_mut() {
            for _ in 0..*count {
                let (record, read) = ResourceRecord::parse(data, offset)?;
                records.push(record);
                offset += read;
            }
        }
        let [(_, answers), (_, nameservers), (_, additional)] = sections;

        Ok(Packet {
            id: header.id,
            flags: header.flags,
            questions,
            answers,
            nameservers,
            additional,
        })
    }

    /// Whether merging `other` into this packet stays within `max_size`
    pub fn can_be_combined_with(&self, other: &Packet, max_size: usize) -> Result<bool, Error> {
        if self.id != other.id || self.flags != other.flags {
            return Ok(false);
        }
        let mut combined = self.clone();
        combined.combine_with(other.clone());
        Ok(combined.encoding_length()? <= max_size)
    }

    /// Appends all entries of `other`, skipping records already present
    pub fn combine_with(&mut self, other: Packet) {
        for question in other.questions {
            if !self.questions.contains(&question) {
                self.questions.push(question);
            }
        }
        for record in other.answers {
            if !self.answers.iter().any(|r| r.about_equal(&record)) {
                self.additional.retain(|r| !r.about_equal(&record));
                self.answers.push(record);
            }
        }
        for record in other.nameservers {
            if !self.nameservers.iter().any(|r| r.about_equal(&record)) {
                self.nameservers.push(record);
            }
        }
        for record in other.additional {
            let present = self
                .answers
                .iter()
                .chain(self.additional.iter())
                .any(|r| r.about_equal(&record));
            if !present {
                self.additional.push(record);
            }
        }
    }
}

fn section_count(len: usize) -> Result<u16, Error> {
    if len > usize::from(u16::MAX) {
        Err(Error::TooManyRecords)
    } else {
        Ok(len as u16)
    }
}

#[cfg(test)]
mod test {
    use super::super::{QueryType, RRData, Type};
    use super::*;
    use std::net::Ipv4Addr;

    fn service_packet() -> Packet {
        let mut packet = Packet::new_response(0);
        packet.questions.push(Question::new(
            "_http._tcp.local",
            QueryType::PTR,
            false,
        ));
        packet.answers.push(ResourceRecord::new(
            "_http._tcp.local",
            4500,
            false,
            RRData::PTR("Printer._http._tcp.local".into()),
        ));
        packet.additional.push(ResourceRecord::new(
            "Printer._http._tcp.local",
            120,
            true,
            RRData::SRV {
                priority: 0,
                weight: 0,
                port: 631,
                target: "printer-host.local".into(),
            },
        ));
        packet.additional.push(ResourceRecord::new(
            "Printer._http._tcp.local",
            4500,
            true,
            RRData::TXT(vec![b"rp=queue".to_vec()]),
        ));
        packet.additional.push(ResourceRecord::new(
            "printer-host.local",
            120,
            true,
            RRData::A(Ipv4Addr::new(192, 168, 1, 10)),
        ));
        packet.additional.push(ResourceRecord::new(
            "printer-host.local",
            120,
            true,
            RRData::NSEC {
                next_domain: "printer-host.local".into(),
                types: vec![Type::A],
            },
        ));
        packet.additional.push(ResourceRecord::opt(1440));
        packet
    }

    #[test]
    fn packet_double_round_trip() {
        let packet = service_packet();
        let buf = packet.encode().unwrap();
        assert_eq!(buf.len(), packet.encoding_length().unwrap());

        let decoded = Packet::parse(&buf).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.encode().unwrap(), buf);
    }

    #[test]
    fn compression_shrinks_packet() {
        let packet = service_packet();
        let compressed = packet.encode().unwrap();
        let plain = packet.encode_with(NameCoder::without_compression()).unwrap();
        assert!(compressed.len() < plain.len());
        assert_eq!(plain.len(), packet.estimated_length());
        assert_eq!(Packet::parse(&plain).unwrap(), packet);
    }

    #[test]
    fn header_counts_match_sections() {
        let buf = service_packet().encode().unwrap();
        let header = Header::parse(&buf).unwrap();
        assert_eq!(header.questions, 1);
        assert_eq!(header.answers, 1);
        assert_eq!(header.nameservers, 0);
        assert_eq!(header.additional, 5);
    }

    #[test]
    fn overrunning_counts_are_rejected() {
        let mut buf = service_packet().encode().unwrap();
        // claim one more additional record than present
        buf[11] += 1;
        assert_eq!(Packet::parse(&buf), Err(Error::UnexpectedEOF));

        assert_eq!(Packet::parse(&buf[..11]), Err(Error::HeaderTooShort));
    }

    #[test]
    fn combine_skips_duplicates() {
        let mut a = service_packet();
        let b = service_packet();
        a.combine_with(b);
        assert_eq!(a, service_packet());
        assert!(a.can_be_combined_with(&service_packet(), 1472).unwrap());
        assert!(!a.can_be_combined_with(&service_packet(), 20).unwrap());
    }

    #[test]
    fn answer_moves_out_of_additionals() {
        let mut a = service_packet();
        let mut b = Packet::new_response(0);
        b.answers.push(a.additional[0].clone());
        a.combine_with(b);
        assert_eq!(a.answers.len(), 2);
        assert_eq!(a.additional.len(), 4);
    }
}
