// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Crate-level error taxonomy (§7). These are internal/diagnostic errors --
//! most are translated into an outbound `CaStatus` rather than propagated to
//! the caller, but connection-fatal ones unwind the client's frame loop.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    Transport(std::io::Error),
    Protocol(ca_protocol::ProtocolError),
    BadResourceId(u32),
    AccessDenied,
    TypeMismatch,
    TooManyAsyncIo,
    AdapterException(String),
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Protocol(e) => write!(f, "protocol error: {e}"),
            Error::BadResourceId(id) => write!(f, "unknown resource id {id}"),
            Error::AccessDenied => write!(f, "access denied"),
            Error::TypeMismatch => write!(f, "requested type does not match channel's native type"),
            Error::TooManyAsyncIo => write!(f, "client has too many async i/o operations in progress"),
            Error::AdapterException(msg) => write!(f, "adapter raised an exception: {msg}"),
            Error::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<ca_protocol::ProtocolError> for Error {
    fn from(e: ca_protocol::ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl Error {
    /// Does this error require tearing down the client connection, or can
    /// it be reported back as a status code on the offending request?
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_) | Error::Fatal(_))
    }

    pub fn to_ca_status(&self) -> ca_protocol::CaStatus {
        use ca_protocol::CaStatus;
        match self {
            Error::Transport(_) => CaStatus::Disconnect,
            Error::Protocol(_) => CaStatus::Internal,
            Error::BadResourceId(_) => CaStatus::BadResourceId,
            Error::AccessDenied => CaStatus::NoWriteAccess,
            Error::TypeMismatch => CaStatus::BadType,
            Error::TooManyAsyncIo => CaStatus::AllocMem,
            Error::AdapterException(_) => CaStatus::Internal,
            Error::Fatal(_) => CaStatus::Internal,
        }
    }
}
