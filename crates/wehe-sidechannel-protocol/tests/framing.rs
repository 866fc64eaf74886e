use wehe_sidechannel_protocol::{
    decode_legacy_length, decode_request_header, decode_response_header, encode_legacy,
    encode_request, encode_response, is_legacy_preamble, split_response_body, Error, Opcode,
    ResponseCode, LEGACY_LENGTH_DIGITS, MAX_REQUEST_BODY_LEN, REQUEST_HEADER_LEN,
    RESPONSE_HEADER_LEN,
};

#[test]
fn request_frame_layout_matches_the_wire_contract() {
    let frame = encode_request(Opcode::ReceiveId, b"U1234567890;0;Zoom_04282020;retries=1;42;false")
        .expect("encode");

    assert_eq!(frame[0], 0x02);
    // 24-bit big-endian body length.
    assert_eq!(&frame[1..4], &[0x00, 0x00, 46]);
    assert_eq!(&frame[4..], b"U1234567890;0;Zoom_04282020;retries=1;42;false");

    let header = decode_request_header(frame[..REQUEST_HEADER_LEN].try_into().unwrap());
    assert_eq!(Opcode::from_byte(header.opcode_byte), Some(Opcode::ReceiveId));
    assert_eq!(header.body_len, 46);
}

#[test]
fn request_body_length_is_capped_at_24_bits() {
    let body = vec![b'x'; MAX_REQUEST_BODY_LEN + 1];
    assert!(matches!(
        encode_request(Opcode::Throughputs, &body),
        Err(Error::BodyTooLarge { .. })
    ));

    let body = vec![b'x'; MAX_REQUEST_BODY_LEN];
    let frame = encode_request(Opcode::Throughputs, &body).expect("max-size body must encode");
    let header = decode_request_header(frame[..REQUEST_HEADER_LEN].try_into().unwrap());
    assert_eq!(header.body_len, MAX_REQUEST_BODY_LEN);
}

#[test]
fn response_frame_carries_status_byte_inside_the_length() {
    let frame = encode_response(ResponseCode::Ok, b"0;100").expect("encode");
    assert_eq!(decode_response_header(frame[..RESPONSE_HEADER_LEN].try_into().unwrap()), 6);

    let (code, payload) = split_response_body(&frame[RESPONSE_HEADER_LEN..]).expect("split");
    assert_eq!(code, ResponseCode::Ok);
    assert_eq!(payload, b"0;100");

    let frame = encode_response(ResponseCode::Error, b"").expect("encode empty error");
    assert_eq!(decode_response_header(frame[..RESPONSE_HEADER_LEN].try_into().unwrap()), 1);
    let (code, payload) = split_response_body(&frame[RESPONSE_HEADER_LEN..]).expect("split");
    assert_eq!(code, ResponseCode::Error);
    assert!(payload.is_empty());
}

#[test]
fn empty_response_body_is_rejected_on_split() {
    assert!(matches!(
        split_response_body(&[]),
        Err(Error::ResponseTooShort { .. })
    ));
    assert!(matches!(
        split_response_body(&[7]),
        Err(Error::UnknownResponseCode { byte: 7 })
    ));
}

#[test]
fn legacy_frame_uses_zero_padded_ascii_length() {
    let frame = encode_legacy(b"DONE;12.5").expect("encode");
    assert_eq!(&frame[..LEGACY_LENGTH_DIGITS], b"0000000009");
    assert_eq!(&frame[LEGACY_LENGTH_DIGITS..], b"DONE;12.5");

    let len = decode_legacy_length(frame[..LEGACY_LENGTH_DIGITS].try_into().unwrap());
    assert_eq!(len, Ok(9));
}

#[test]
fn legacy_length_rejects_non_decimal_bytes() {
    let err = decode_legacy_length(*b"00000001x0").unwrap_err();
    assert!(matches!(
        err,
        Error::LegacyLengthNotDecimal { byte: b'x', position: 8 }
    ));
}

#[test]
fn legacy_preamble_never_collides_with_assigned_opcodes() {
    // The first byte of every legacy frame is '0' because no body fits ten
    // full digits; the demux rule depends on it.
    let frame = encode_legacy(b"anything").unwrap();
    assert!(is_legacy_preamble(frame[0]));
    for opcode in Opcode::ALL {
        assert!(!is_legacy_preamble(opcode.wire()));
    }
}
