// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

/// Severity occupies the low 3 bits of a wire status word; the remainder of
/// the word is the status code, per §6.
const SEVERITY_BITS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// The subset of the CA error namespace this core needs to report back over
/// the wire. Named after their real `ECA_*` counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaStatus {
    Normal,
    BadResourceId,
    NoWriteAccess,
    BadType,
    BadCount,
    AllocMem,
    Disconnect,
    Internal,
    Defer,
}

impl CaStatus {
    pub fn severity(self) -> Severity {
        match self {
            CaStatus::Normal | CaStatus::Defer => Severity::Success,
            CaStatus::Disconnect => Severity::Warning,
            CaStatus::BadResourceId
            | CaStatus::NoWriteAccess
            | CaStatus::BadType
            | CaStatus::BadCount
            | CaStatus::AllocMem => Severity::Error,
            CaStatus::Internal => Severity::Severe,
        }
    }

    /// The code portion (everything above the severity bits) of the status
    /// word. Values are this implementation's own numbering; the distilled
    /// spec does not hand down a literal `ECA_*` numeric table, so these
    /// only need to be internally consistent (see DESIGN.md).
    fn code(self) -> u32 {
        match self {
            CaStatus::Normal => 0,
            CaStatus::BadResourceId => 1,
            CaStatus::NoWriteAccess => 2,
            CaStatus::BadType => 3,
            CaStatus::BadCount => 4,
            CaStatus::AllocMem => 5,
            CaStatus::Disconnect => 6,
            CaStatus::Internal => 7,
            CaStatus::Defer => 8,
        }
    }

    /// Encode as the 32-bit wire status word: severity in the low 3 bits,
    /// code above.
    pub fn to_wire(self) -> u32 {
        (self.code() << SEVERITY_BITS) | (self.severity() as u32)
    }

    pub fn is_success(self) -> bool {
        matches!(self.severity(), Severity::Success)
    }
}
