use crate::dns_parser;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed packet: {0}")]
    Malformed(#[from] dns_parser::Error),
    #[error("invalid state transition: {0}")]
    StateViolation(String),
    #[error("conflicting record for {name}: {record}")]
    Conflict { name: String, record: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("responder was shut down")]
    Shutdown,
}
