use thiserror::Error;

/// Error encoding or decoding a DNS packet
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("packet is smaller than header size")]
    HeaderTooShort,
    #[error("packet is has incomplete data")]
    UnexpectedEOF,
    #[error("wrong (too short or too long) size of RDATA")]
    WrongRdataLength,
    #[error("label in domain name has unknown label format")]
    UnknownLabelFormat,
    #[error("invalid characters encountered while reading label")]
    LabelIsNotUtf8,
    #[error("compression pointer to {pointer} at position {position} does not point backwards")]
    InvalidPointer { pointer: usize, position: usize },
    #[error("name suffix at offset {0} is out of reach for a compression pointer")]
    PointerOutOfRange(usize),
    #[error("label exceeds 63 bytes")]
    LabelTooLong,
    #[error("domain name exceeds 255 bytes")]
    NameTooLong,
    #[error("section holds more than 65535 entries")]
    TooManyRecords,
}
