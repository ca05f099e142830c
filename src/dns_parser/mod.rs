//! Wire format of DNS messages as used by Multicast DNS (RFC 1035, RFC 6762)

mod enums;
mod error;
pub mod name;
mod packet;
mod rrdata;
mod structs;

pub use self::enums::{Class, Opcode, QueryType, ResponseCode, Type};
pub use self::error::Error;
pub use self::name::{dns_lower_case, escape_label, name_equals, NameCoder};
pub use self::rrdata::RRData;
pub use self::structs::{Flags, Header, Packet, Question, ResourceRecord};
