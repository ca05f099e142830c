use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use super::name::{name_equals, read_name};
use super::{Class, Error, NameCoder, Opcode, QueryType, RRData, ResponseCode, Type};

const TOP_BIT: u16 = 0b1000_0000_0000_0000;

/// Flag bits of the second header word (RFC 1035 4.1.1)
///
/// mDNS ignores most of them but they are kept intact for legacy unicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub response: bool,
    pub opcode: Opcode,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub response_code: ResponseCode,
}

impl Flags {
    pub fn query() -> Flags {
        Flags {
            response: false,
            opcode: Opcode::StandardQuery,
            authoritative: false,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            response_code: ResponseCode::NoError,
        }
    }

    /// Flags of a multicast DNS response (RFC 6762 18.4)
    pub fn response() -> Flags {
        Flags {
            response: true,
            authoritative: true,
            ..Flags::query()
        }
    }

    pub fn parse(word: u16) -> Flags {
        Flags {
            response: word & 0x8000 != 0,
            opcode: Opcode::from(((word >> 11) & 0b1111) as u8),
            authoritative: word & 0x0400 != 0,
            truncated: word & 0x0200 != 0,
            recursion_desired: word & 0x0100 != 0,
            recursion_available: word & 0x0080 != 0,
            response_code: ResponseCode::from((word & 0b1111) as u8),
        }
    }

    pub fn to_word(&self) -> u16 {
        let mut word = (u16::from(u8::from(self.opcode)) & 0b1111) << 11;
        word |= u16::from(u8::from(self.response_code)) & 0b1111;
        if self.response {
            word |= 0x8000;
        }
        if self.authoritative {
            word |= 0x0400;
        }
        if self.truncated {
            word |= 0x0200;
        }
        if self.recursion_desired {
            word |= 0x0100;
        }
        if self.recursion_available {
            word |= 0x0080;
        }
        word
    }
}

/// The 12 byte packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: Flags,
    pub questions: u16,
    pub answers: u16,
    pub nameservers: u16,
    pub additional: u16,
}

impl Header {
    pub const SIZE: usize = 12;

    pub fn parse(data: &[u8]) -> Result<Header, Error> {
        if data.len() < Header::SIZE {
            return Err(Error::HeaderTooShort);
        }
        Ok(Header {
            id: BigEndian::read_u16(&data[..2]),
            flags: Flags::parse(BigEndian::read_u16(&data[2..4])),
            questions: BigEndian::read_u16(&data[4..6]),
            answers: BigEndian::read_u16(&data[6..8]),
            nameservers: BigEndian::read_u16(&data[8..10]),
            additional: BigEndian::read_u16(&data[10..12]),
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        for word in [
            self.id,
            self.flags.to_word(),
            self.questions,
            self.answers,
            self.nameservers,
            self.additional,
        ]
        .iter()
        {
            buf.write_u16::<BigEndian>(*word).expect("writing to a vec");
        }
    }
}

/// An entry of the question section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: String,
    pub qtype: QueryType,
    pub qclass: Class,
    /// The QU bit, stored in the top bit of the class field
    pub qu: bool,
}

impl Question {
    pub fn new<N: Into<String>>(qname: N, qtype: QueryType, qu: bool) -> Question {
        Question {
            qname: qname.into(),
            qtype,
            qclass: Class::IN,
            qu,
        }
    }

    pub fn track_names(&self, coder: &mut NameCoder) {
        coder.track(&self.qname);
    }

    pub fn encoding_length(&self, coder: &mut NameCoder) -> usize {
        coder.next_name_length() + 4
    }

    pub fn write_to(&self, coder: &mut NameCoder, buf: &mut Vec<u8>) -> Result<usize, Error> {
        let start = buf.len();
        coder.write_name(&self.qname, buf)?;
        let mut class = u16::from(self.qclass) & !TOP_BIT;
        if self.qu {
            class |= TOP_BIT;
        }
        buf.write_u16::<BigEndian>(self.qtype.into()).expect("writing to a vec");
        buf.write_u16::<BigEndian>(class).expect("writing to a vec");
        Ok(buf.len() - start)
    }

    /// Decodes the question at `offset`, returning it with the bytes read
    pub fn parse(original: &[u8], offset: usize) -> Result<(Question, usize), Error> {
        let (qname, read) = read_name(original, offset)?;
        let pos = offset + read;
        if original.len() < pos + 4 {
            return Err(Error::UnexpectedEOF);
        }
        let qtype = BigEndian::read_u16(&original[pos..pos + 2]);
        let class = BigEndian::read_u16(&original[pos + 2..pos + 4]);
        Ok((
            Question {
                qname,
                qtype: QueryType::from(qtype),
                qclass: Class::from(class & !TOP_BIT),
                qu: class & TOP_BIT != 0,
            },
            read + 4,
        ))
    }
}

/// A single DNS record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub cls: Class,
    /// The cache flush bit, stored in the top bit of the class field
    pub flush: bool,
    /// Seconds, 0 tells caches to drop the record
    pub ttl: u32,
    pub data: RRData,
}

impl ResourceRecord {
    pub fn new<N: Into<String>>(name: N, ttl: u32, flush: bool, data: RRData) -> ResourceRecord {
        ResourceRecord {
            name: name.into(),
            cls: Class::IN,
            flush,
            ttl,
            data,
        }
    }

    /// EDNS0 pseudo record advertising our UDP payload size
    pub fn opt(udp_payload_size: u16) -> ResourceRecord {
        ResourceRecord::new(
            "",
            0,
            false,
            RRData::OPT {
                udp_payload_size,
                options: Vec::new(),
            },
        )
    }

    pub fn typ(&self) -> Type {
        self.data.typ()
    }

    pub fn data_equals(&self, other: &ResourceRecord) -> bool {
        self.data.data_equals(&other.data)
    }

    /// Same name, type, class and rdata; TTL and cache flush bit are ignored
    pub fn about_equal(&self, other: &ResourceRecord) -> bool {
        self.typ() == other.typ()
            && self.cls == other.cls
            && name_equals(&self.name, &other.name)
            && self.data_equals(other)
    }

    /// Same name, type and class, the record set this record belongs to
    pub fn same_rrset(&self, other: &ResourceRecord) -> bool {
        self.typ() == other.typ() && self.cls == other.cls && name_equals(&self.name, &other.name)
    }

    pub fn track_names(&self, coder: &mut NameCoder) {
        coder.track(&self.name);
        self.data.track_names(coder);
    }

    /// Upper bound of the encoded length without any compression
    pub fn estimated_length(&self) -> usize {
        let name = self.name.strip_suffix('.').unwrap_or(&self.name);
        let name = if name.is_empty() { 1 } else { name.len() + 2 };
        name + 10 + self.data.estimated_length()
    }

    pub fn encoding_length(&self, coder: &mut NameCoder) -> usize {
        let name = coder.next_name_length();
        name + 10 + self.data.encoding_length(coder)
    }

    pub fn write_to(&self, coder: &mut NameCoder, buf: &mut Vec<u8>) -> Result<usize, Error> {
        let start = buf.len();
        coder.write_name(&self.name, buf)?;

        let class = match self.data {
            RRData::OPT {
                udp_payload_size, ..
            } => udp_payload_size,
            _ if self.flush => u16::from(self.cls) | TOP_BIT,
            _ => u16::from(self.cls) & !TOP_BIT,
        };
        buf.write_u16::<BigEndian>(self.typ().into()).expect("writing to a vec");
        buf.write_u16::<BigEndian>(class).expect("writing to a vec");
        buf.write_u32::<BigEndian>(self.ttl).expect("writing to a vec");

        let size_offset = buf.len();
        buf.write_u16::<BigEndian>(0).expect("writing to a vec");
        let data_size = self.data.write_to(coder, buf)?;
        BigEndian::write_u16(&mut buf[size_offset..size_offset + 2], data_size as u16);

        Ok(buf.len() - start)
    }

    /// Decodes the record at `offset`, returning it with the bytes read
    pub fn parse(original: &[u8], offset: usize) -> Result<(ResourceRecord, usize), Error> {
        let (name, read) = read_name(original, offset)?;
        let pos = offset + read;
        if original.len() < pos + 10 {
            return Err(Error::UnexpectedEOF);
        }
        let typ = Type::from(BigEndian::read_u16(&original[pos..pos + 2]));
        let class = BigEndian::read_u16(&original[pos + 2..pos + 4]);
        let ttl = BigEndian::read_u32(&original[pos + 4..pos + 8]);
        let length = BigEndian::read_u16(&original[pos + 8..pos + 10]) as usize;

        let (cls, flush, data) = if typ == Type::OPT {
            let end = pos + 10 + length;
            if end > original.len() {
                return Err(Error::UnexpectedEOF);
            }
            let options = original[pos + 10..end].to_vec();
            let data = RRData::OPT {
                udp_payload_size: class,
                options,
            };
            (Class::IN, false, data)
        } else {
            let data = RRData::parse(typ, original, pos + 10, length)?;
            (Class::from(class & !TOP_BIT), class & TOP_BIT != 0, data)
        };

        Ok((
            ResourceRecord {
                name,
                cls,
                flush,
                ttl,
                data,
            },
            read + 10 + length,
        ))
    }
}

/// A whole DNS message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u16,
    pub flags: Flags,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub nameservers: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let flags = Flags {
            response: true,
            opcode: Opcode::Reserved(5),
            authoritative: true,
            truncated: true,
            recursion_desired: false,
            recursion_available: true,
            response_code: ResponseCode::Refused,
        };
        assert_eq!(Flags::parse(flags.to_word()), flags);
        assert_eq!(Flags::response().to_word(), 0x8400);
    }

    #[test]
    fn question_qu_bit() {
        let question = Question::new("_http._tcp.local", QueryType::PTR, true);
        let mut coder = NameCoder::new();
        question.track_names(&mut coder);
        coder.compute_compression_paths().unwrap();
        let mut buf = Vec::new();
        question.write_to(&mut coder, &mut buf).unwrap();
        assert_eq!(&buf[buf.len() - 4..], &[0x00, 0x0c, 0x80, 0x01][..]);

        let (decoded, read) = Question::parse(&buf, 0).unwrap();
        assert_eq!(read, buf.len());
        assert_eq!(decoded, question);
    }

    #[test]
    fn about_equal_ignores_ttl_and_flush() {
        let a = ResourceRecord::new("Host.local", 120, true, RRData::A([10, 0, 0, 1].into()));
        let mut b = ResourceRecord::new("host.local", 60, false, RRData::A([10, 0, 0, 1].into()));
        assert!(a.about_equal(&b));
        b.data = RRData::A([10, 0, 0, 2].into());
        assert!(!a.about_equal(&b));
        assert!(a.same_rrset(&b));
    }

    #[test]
    fn opt_record_keeps_payload_size_in_class() {
        let record = ResourceRecord::opt(1440);
        let mut coder = NameCoder::new();
        record.track_names(&mut coder);
        coder.compute_compression_paths().unwrap();
        let mut buf = Vec::new();
        record.write_to(&mut coder, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0x00, 0x29, 0x05, 0xa0, 0, 0, 0, 0, 0, 0][..]);

        let (decoded, _) = ResourceRecord::parse(&buf, 0).unwrap();
        assert_eq!(decoded, record);
    }
}
