/// The TYPE value according to RFC 1035
///
/// All "EXPERIMENTAL" markers here are from the RFC
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum Type {
    /// a host addresss
    A,
    /// a canonical name for an alias
    CNAME,
    /// a domain name pointer
    PTR,
    /// text strings
    TXT,
    /// IPv6 host address (RFC 2782)
    AAAA,
    /// service record (RFC 2782)
    SRV,
    /// EDNS0 options (RFC 6891)
    OPT,
    /// next secure record (RFC 4034, RFC 3755)
    NSEC,
    /// Anything we don't interpret, kept verbatim
    Unknown(u16),
}

/// The QTYPE value according to RFC 1035
///
/// All "EXPERIMENTAL" markers here are from the RFC
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum QueryType {
    A,
    CNAME,
    PTR,
    TXT,
    AAAA,
    SRV,
    NSEC,
    /// A request for all records
    All,
    Unknown(u16),
}

/// The CLASS value according to RFC 1035
///
/// The top bit (cache flush or unicast response) is never part of this value.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum Class {
    /// the Internet
    IN,
    /// Any class, only valid in questions
    Any,
    Unknown(u16),
}

/// The OPCODE value according to RFC 1035
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Opcode {
    StandardQuery,
    InverseQuery,
    ServerStatusRequest,
    Reserved(u8),
}

/// The RCODE value according to RFC 1035
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ResponseCode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Reserved(u8),
}

impl From<u16> for Type {
    fn from(code: u16) -> Type {
        match code {
            1 => Type::A,
            5 => Type::CNAME,
            12 => Type::PTR,
            16 => Type::TXT,
            28 => Type::AAAA,
            33 => Type::SRV,
            41 => Type::OPT,
            47 => Type::NSEC,
            x => Type::Unknown(x),
        }
    }
}

impl From<Type> for u16 {
    fn from(typ: Type) -> u16 {
        match typ {
            Type::A => 1,
            Type::CNAME => 5,
            Type::PTR => 12,
            Type::TXT => 16,
            Type::AAAA => 28,
            Type::SRV => 33,
            Type::OPT => 41,
            Type::NSEC => 47,
            Type::Unknown(x) => x,
        }
    }
}

impl From<u16> for QueryType {
    fn from(code: u16) -> QueryType {
        match code {
            1 => QueryType::A,
            5 => QueryType::CNAME,
            12 => QueryType::PTR,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            33 => QueryType::SRV,
            47 => QueryType::NSEC,
            255 => QueryType::All,
            x => QueryType::Unknown(x),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(typ: QueryType) -> u16 {
        match typ {
            QueryType::A => 1,
            QueryType::CNAME => 5,
            QueryType::PTR => 12,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
            QueryType::SRV => 33,
            QueryType::NSEC => 47,
            QueryType::All => 255,
            QueryType::Unknown(x) => x,
        }
    }
}

impl From<u16> for Class {
    fn from(code: u16) -> Class {
        match code {
            1 => Class::IN,
            255 => Class::Any,
            x => Class::Unknown(x),
        }
    }
}

impl From<Class> for u16 {
    fn from(cls: Class) -> u16 {
        match cls {
            Class::IN => 1,
            Class::Any => 255,
            Class::Unknown(x) => x,
        }
    }
}

impl From<u8> for Opcode {
    fn from(code: u8) -> Opcode {
        match code {
            0 => Opcode::StandardQuery,
            1 => Opcode::InverseQuery,
            2 => Opcode::ServerStatusRequest,
            x => Opcode::Reserved(x),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(code: Opcode) -> u8 {
        match code {
            Opcode::StandardQuery => 0,
            Opcode::InverseQuery => 1,
            Opcode::ServerStatusRequest => 2,
            Opcode::Reserved(x) => x,
        }
    }
}

impl From<u8> for ResponseCode {
    fn from(code: u8) -> ResponseCode {
        match code {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NameError,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            x => ResponseCode::Reserved(x),
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(code: ResponseCode) -> u8 {
        match code {
            ResponseCode::NoError => 0,
            ResponseCode::FormatError => 1,
            ResponseCode::ServerFailure => 2,
            ResponseCode::NameError => 3,
            ResponseCode::NotImplemented => 4,
            ResponseCode::Refused => 5,
            ResponseCode::Reserved(x) => x,
        }
    }
}

impl QueryType {
    /// Whether a record of type `typ` answers a question of this type
    ///
    /// RFC 6762 6: the record rrtype must match the question qtype unless
    /// the qtype is "ANY" (255) or the rrtype is "CNAME" (5). We own no
    /// aliases, so a CNAME question is answered like "ANY".
    pub fn matches(self, typ: Type) -> bool {
        match self {
            QueryType::All | QueryType::CNAME => true,
            _ => typ == Type::CNAME || u16::from(self) == u16::from(typ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_values_survive_conversion() {
        assert_eq!(u16::from(Type::from(13)), 13);
        assert_eq!(u16::from(QueryType::from(99)), 99);
        assert_eq!(Class::from(3), Class::Unknown(3));
        assert_eq!(u8::from(Opcode::from(9)), 9);
    }

    #[test]
    fn any_query_matches_every_type() {
        assert!(QueryType::All.matches(Type::SRV));
        assert!(QueryType::SRV.matches(Type::SRV));
        assert!(QueryType::A.matches(Type::CNAME));
        assert!(!QueryType::A.matches(Type::AAAA));
        assert!(QueryType::CNAME.matches(Type::TXT));
    }
}
