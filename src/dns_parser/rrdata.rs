use std::net::{Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use super::name::{name_equals, read_name};
use super::{Error, NameCoder, Type};

/// The enumeration that represents known types of DNS resource records data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RRData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    PTR(String),
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// Sequence of character-strings, each at most 255 bytes
    TXT(Vec<Vec<u8>>),
    /// Only the next domain name and the type bitmap, as used by mDNS
    /// (RFC 6762 6.1)
    NSEC {
        next_domain: String,
        types: Vec<Type>,
    },
    /// EDNS0 pseudo record; the class field of the record carries the
    /// advertised UDP payload size
    OPT {
        udp_payload_size: u16,
        options: Vec<u8>,
    },
    // Anything that can't be parsed yet
    Unknown {
        typ: Type,
        data: Vec<u8>,
    },
}

impl RRData {
    pub fn typ(&self) -> Type {
        match *self {
            RRData::A(..) => Type::A,
            RRData::AAAA(..) => Type::AAAA,
            RRData::PTR(..) => Type::PTR,
            RRData::SRV { .. } => Type::SRV,
            RRData::TXT(..) => Type::TXT,
            RRData::NSEC { .. } => Type::NSEC,
            RRData::OPT { .. } => Type::OPT,
            RRData::Unknown { typ, .. } => typ,
        }
    }

    /// Compares the payload only, names are compared case-insensitively
    pub fn data_equals(&self, other: &RRData) -> bool {
        match (self, other) {
            (RRData::PTR(a), RRData::PTR(b)) => name_equals(a, b),
            (
                RRData::SRV {
                    priority,
                    weight,
                    port,
                    target,
                },
                RRData::SRV {
                    priority: other_priority,
                    weight: other_weight,
                    port: other_port,
                    target: other_target,
                },
            ) => {
                priority == other_priority
                    && weight == other_weight
                    && port == other_port
                    && name_equals(target, other_target)
            }
            (
                RRData::NSEC { next_domain, types },
                RRData::NSEC {
                    next_domain: other_domain,
                    types: other_types,
                },
            ) => name_equals(next_domain, other_domain) && types == other_types,
            (a, b) => a == b,
        }
    }

    pub fn track_names(&self, coder: &mut NameCoder) {
        match *self {
            RRData::PTR(ref name) => coder.track(name),
            RRData::SRV { ref target, .. } => coder.track(target),
            RRData::NSEC {
                ref next_domain, ..
            } => coder.track(next_domain),
            _ => (),
        }
    }

    /// Upper bound of the rdata length, as if no name was compressed
    pub fn estimated_length(&self) -> usize {
        match *self {
            RRData::A(..) => 4,
            RRData::AAAA(..) => 16,
            RRData::PTR(ref name) => uncompressed_name_length(name),
            RRData::SRV { ref target, .. } => 6 + uncompressed_name_length(target),
            RRData::TXT(ref strings) => txt_length(strings),
            RRData::NSEC {
                ref next_domain,
                ref types,
            } => uncompressed_name_length(next_domain) + type_bitmap_length(types),
            RRData::OPT { ref options, .. } => options.len(),
            RRData::Unknown { ref data, .. } => data.len(),
        }
    }

    /// Exact rdata length once compression paths are computed
    pub fn encoding_length(&self, coder: &mut NameCoder) -> usize {
        match *self {
            RRData::PTR(..) => coder.next_name_length(),
            RRData::SRV { .. } => 6 + coder.next_name_length(),
            RRData::NSEC { ref types, .. } => coder.next_name_length() + type_bitmap_length(types),
            _ => self.estimated_length(),
        }
    }

    /// Appends the rdata to `buf`, returning the number of bytes written
    pub fn write_to(&self, coder: &mut NameCoder, buf: &mut Vec<u8>) -> Result<usize, Error> {
        let start = buf.len();
        match *self {
            RRData::A(ip) => buf.extend_from_slice(&ip.octets()),
            RRData::AAAA(ip) => buf.extend_from_slice(&ip.octets()),
            RRData::PTR(ref name) => {
                coder.write_name(name, buf)?;
            }
            RRData::SRV {
                priority,
                weight,
                port,
                ref target,
            } => {
                buf.write_u16::<BigEndian>(priority).expect("writing to a vec");
                buf.write_u16::<BigEndian>(weight).expect("writing to a vec");
                buf.write_u16::<BigEndian>(port).expect("writing to a vec");
                coder.write_name(target, buf)?;
            }
            RRData::TXT(ref strings) => {
                for string in strings {
                    assert!(
                        string.len() <= 255,
                        "{:?} is too long for a TXT record",
                        string
                    );
                    buf.push(string.len() as u8);
                    buf.extend_from_slice(string);
                }
            }
            RRData::NSEC {
                ref next_domain,
                ref types,
            } => {
                coder.write_name(next_domain, buf)?;
                write_type_bitmap(types, buf);
            }
            RRData::OPT { ref options, .. } => buf.extend_from_slice(options),
            RRData::Unknown { ref data, .. } => buf.extend_from_slice(data),
        }
        Ok(buf.len() - start)
    }

    /// Decodes `length` bytes of rdata at `offset` of the packet `original`
    pub fn parse(typ: Type, original: &[u8], offset: usize, length: usize) -> Result<RRData, Error> {
        let end = offset + length;
        if end > original.len() {
            return Err(Error::UnexpectedEOF);
        }
        let rdata = &original[offset..end];

        match typ {
            Type::A => {
                if rdata.len() != 4 {
                    return Err(Error::WrongRdataLength);
                }
                Ok(RRData::A(Ipv4Addr::from(BigEndian::read_u32(rdata))))
            }
            Type::AAAA => {
                if rdata.len() != 16 {
                    return Err(Error::WrongRdataLength);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Ok(RRData::AAAA(Ipv6Addr::from(octets)))
            }
            Type::PTR => {
                let (name, read) = read_name(original, offset)?;
                if read != length {
                    return Err(Error::WrongRdataLength);
                }
                Ok(RRData::PTR(name))
            }
            Type::SRV => {
                if rdata.len() < 7 {
                    return Err(Error::WrongRdataLength);
                }
                let (target, read) = read_name(original, offset + 6)?;
                if 6 + read != length {
                    return Err(Error::WrongRdataLength);
                }
                Ok(RRData::SRV {
                    priority: BigEndian::read_u16(&rdata[..2]),
                    weight: BigEndian::read_u16(&rdata[2..4]),
                    port: BigEndian::read_u16(&rdata[4..6]),
                    target,
                })
            }
            Type::TXT => {
                let mut strings = Vec::new();
                let mut pos = 0;
                while pos < rdata.len() {
                    let len = rdata[pos] as usize;
                    let string_end = pos + 1 + len;
                    if string_end > rdata.len() {
                        return Err(Error::WrongRdataLength);
                    }
                    strings.push(rdata[pos + 1..string_end].to_vec());
                    pos = string_end;
                }
                Ok(RRData::TXT(strings))
            }
            Type::NSEC => {
                let (next_domain, read) = read_name(original, offset)?;
                if read > length {
                    return Err(Error::WrongRdataLength);
                }
                let types = parse_type_bitmap(&rdata[read..])?;
                Ok(RRData::NSEC { next_domain, types })
            }
            typ => Ok(RRData::Unknown {
                typ,
                data: rdata.to_vec(),
            }),
        }
    }

    /// The rdata as written without any name compression
    ///
    /// Used for the lexicographical comparison of simultaneous probes
    /// (RFC 6762 8.2).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut coder = NameCoder::without_compression();
        self.track_names(&mut coder);
        coder.compute_compression_paths()?;
        let mut buf = Vec::with_capacity(self.estimated_length());
        self.write_to(&mut coder, &mut buf)?;
        Ok(buf)
    }
}

fn uncompressed_name_length(name: &str) -> usize {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        1
    } else {
        name.len() + 2
    }
}

fn txt_length(strings: &[Vec<u8>]) -> usize {
    strings
        .iter()
        .map(|string| {
            assert!(
                string.len() <= 255,
                "{:?} is too long for a TXT record",
                string
            );
            1 + string.len()
        })
        .sum()
}

fn windows(types: &[Type]) -> Vec<(u8, Vec<u8>)> {
    let mut codes: Vec<u16> = types.iter().map(|&typ| u16::from(typ)).collect();
    codes.sort_unstable();
    codes.dedup();

    let mut windows: Vec<(u8, Vec<u8>)> = Vec::new();
    for code in codes {
        let window = (code >> 8) as u8;
        let low = (code & 0xff) as usize;
        if windows.last().map(|w| w.0) != Some(window) {
            windows.push((window, Vec::new()));
        }
        let bitmap = &mut windows.last_mut().expect("window was just pushed").1;
        if bitmap.len() <= low / 8 {
            bitmap.resize(low / 8 + 1, 0);
        }
        bitmap[low / 8] |= 0x80 >> (low % 8);
    }
    windows
}

fn type_bitmap_length(types: &[Type]) -> usize {
    windows(types)
        .iter()
        .map(|(_, bitmap)| 2 + bitmap.len())
        .sum()
}

fn write_type_bitmap(types: &[Type], buf: &mut Vec<u8>) {
    for (window, bitmap) in windows(types) {
        buf.push(window);
        buf.push(bitmap.len() as u8);
        buf.extend_from_slice(&bitmap);
    }
}

fn parse_type_bitmap(mut data: &[u8]) -> Result<Vec<Type>, Error> {
    let mut types = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return Err(Error::WrongRdataLength);
        }
        let window = data[0] as u16;
        let len = data[1] as usize;
        if len == 0 || len > 32 || data.len() < 2 + len {
            return Err(Error::WrongRdataLength);
        }
        for (index, byte) in data[2..2 + len].iter().enumerate() {
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    types.push(Type::from(window << 8 | (index * 8 + bit) as u16));
                }
            }
        }
        data = &data[2 + len..];
    }
    Ok(types)
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(data: &RRData) -> Vec<u8> {
        let mut coder = NameCoder::new();
        data.track_names(&mut coder);
        coder.compute_compression_paths().unwrap();
        let len = data.encoding_length(&mut coder);
        coder.rewind();
        let mut buf = Vec::new();
        assert_eq!(data.write_to(&mut coder, &mut buf).unwrap(), len);
        assert!(len <= data.estimated_length());
        buf
    }

    fn round_trip(data: RRData) {
        let buf = encode(&data);
        let decoded = RRData::parse(data.typ(), &buf, 0, buf.len()).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(encode(&decoded), buf);
    }

    #[test]
    fn round_trips() {
        round_trip(RRData::A(Ipv4Addr::new(192, 168, 1, 10)));
        round_trip(RRData::AAAA("fe80::1".parse().unwrap()));
        round_trip(RRData::PTR("Printer._http._tcp.local".into()));
        round_trip(RRData::SRV {
            priority: 1,
            weight: 2,
            port: 631,
            target: "host.local".into(),
        });
        round_trip(RRData::TXT(vec![b"path=/".to_vec(), Vec::new()]));
        round_trip(RRData::NSEC {
            next_domain: "host.local".into(),
            types: vec![Type::A, Type::AAAA],
        });
    }

    #[test]
    fn nsec_bitmap_layout() {
        let data = RRData::NSEC {
            next_domain: "h.local".into(),
            types: vec![Type::AAAA, Type::A],
        };
        let buf = encode(&data);
        // window 0, 4 bytes: A is bit 1, AAAA (28) is bit 28
        assert_eq!(&buf[9..], &[0x00, 0x04, 0x40, 0x00, 0x00, 0x08][..]);
    }

    #[test]
    fn txt_overrunning_string_is_rejected() {
        let buf = b"\x05ab";
        assert_eq!(
            RRData::parse(Type::TXT, buf, 0, buf.len()),
            Err(Error::WrongRdataLength)
        );
    }

    #[test]
    #[should_panic(expected = "too long for a TXT record")]
    fn oversized_txt_string_panics() {
        RRData::TXT(vec![vec![b'x'; 256]]).estimated_length();
    }

    #[test]
    fn wrong_address_length_is_rejected() {
        assert_eq!(
            RRData::parse(Type::A, &[1, 2, 3], 0, 3),
            Err(Error::WrongRdataLength)
        );
    }

    #[test]
    fn srv_data_equality_ignores_target_case() {
        let a = RRData::SRV {
            priority: 0,
            weight: 0,
            port: 80,
            target: "Host.local".into(),
        };
        let b = RRData::SRV {
            priority: 0,
            weight: 0,
            port: 80,
            target: "host.LOCAL".into(),
        };
        assert!(a.data_equals(&b));
        assert_ne!(a, b);
    }
}
