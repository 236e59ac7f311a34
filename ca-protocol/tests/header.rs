// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use ca_protocol::{Command, DbrType, Hdr};

#[test]
fn header_roundtrip_short_form() {
    let hdr = Hdr::new(Command::ReadNotify.to_wire(), 8, DbrType::Double.to_wire(), 1, 5, 0);

    let mut bytes = Vec::new();
    hdr.encode(&mut bytes);
    assert_eq!(bytes.len(), 16);

    let (decoded, consumed) = Hdr::decode(&bytes).unwrap();
    assert_eq!(consumed, 16);
    assert_eq!(decoded, hdr);
}

#[test]
fn header_roundtrip_extended_form_waveform() {
    // Boundary scenario 1 from the spec: READ_NOTIFY with count = 65_536 on a
    // waveform PV.
    let hdr = Hdr::new(
        Command::ReadNotify.to_wire(),
        DbrType::Double.value_size(65_536) as u32,
        DbrType::Double.to_wire(),
        65_536,
        1,
        0,
    );

    assert!(!hdr.fits_short_form());

    let mut bytes = Vec::new();
    hdr.encode(&mut bytes);
    assert_eq!(bytes.len(), 24);

    let (decoded, consumed) = Hdr::decode(&bytes).unwrap();
    assert_eq!(consumed, 24);
    assert_eq!(decoded, hdr);
    assert_eq!(decoded.count, 65_536);
}

#[test]
fn responses_preserve_client_cid_field() {
    let request = Hdr::new(Command::Read.to_wire(), 0, 0, 1, 0xDEAD_BEEF, 0);
    let response = Hdr::new(Command::ReadNotify.to_wire(), 8, 6, 1, request.cid, 0);
    assert_eq!(response.cid, 0xDEAD_BEEF);
}
