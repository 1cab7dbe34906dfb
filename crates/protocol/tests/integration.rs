//! Wire-level scenarios exercised directly against the codec, independent
//! of any session/registry logic (those live in the server/client crates).

use protocol::header::Command;
use protocol::messages::{decode_payload, encode_payload, UrbCompleteHeader, UrbSubmitHeader};
use protocol::types::{DeviceInfo, DeviceSpeed};
use protocol::{codec, FrameHeader, Message, ProtocolError, StatusCode};

fn sample_device_info() -> DeviceInfo {
    DeviceInfo {
        vendor_id: 0x1234,
        product_id: 0x5678,
        device_class: 0xFF,
        device_subclass: 0x00,
        device_protocol: 0x00,
        speed: DeviceSpeed::High,
        num_configurations: 1,
        num_interfaces: 1,
        manufacturer: String::new(),
        product: String::new(),
        serial_number: String::new(),
    }
}

#[test]
fn scenario_attach_and_list() {
    let connect = Message::Connect {
        client_version: 0x0001_0000,
        caps: 0,
        client_name: "t".to_string(),
    };
    let frame = codec::encode_message(&connect, 1).unwrap();
    let (header, decoded) = codec::decode_message(&mut &frame[..], false).unwrap();
    assert_eq!(header.sequence, 1);
    assert!(matches!(decoded, Message::Connect { .. }));

    let resp = Message::ConnectResp {
        status: StatusCode::Success,
        server_version: 0x0001_0000,
        caps: 0,
        session_id: 1,
    };
    let frame = codec::encode_message(&resp, 1).unwrap();
    let (_header, decoded) = codec::decode_message(&mut &frame[..], true).unwrap();
    match decoded {
        Message::ConnectResp { session_id, status, .. } => {
            assert_eq!(session_id, 1);
            assert!(status.is_success());
        }
        _ => panic!("expected ConnectResp"),
    }

    let descriptors = vec![
        0x12, 0x01, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x40, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0x01,
        0x02, 0x03, 0x01,
    ];
    let attach = Message::DeviceAttach {
        info: sample_device_info(),
        descriptors: descriptors.clone(),
    };
    let frame = codec::encode_message(&attach, 2).unwrap();
    let (_header, decoded) = codec::decode_message(&mut &frame[..], false).unwrap();
    match decoded {
        Message::DeviceAttach { info, descriptors: d } => {
            assert_eq!(info.vendor_id, 0x1234);
            assert_eq!(info.product_id, 0x5678);
            assert_eq!(d, descriptors);
        }
        _ => panic!("expected DeviceAttach"),
    }

    let attach_resp = Message::DeviceAttachResp {
        status: StatusCode::Success,
        local_device_id: 1,
    };
    let frame = codec::encode_message(&attach_resp, 2).unwrap();
    let (_header, decoded) = codec::decode_message(&mut &frame[..], true).unwrap();
    match decoded {
        Message::DeviceAttachResp { status, local_device_id } => {
            assert!(status.is_success());
            assert_eq!(local_device_id, 1);
        }
        _ => panic!("expected DeviceAttachResp"),
    }

    let list_resp = Message::DeviceListResp {
        status: StatusCode::Success,
        devices: vec![(1, sample_device_info())],
    };
    let frame = codec::encode_message(&list_resp, 3).unwrap();
    let (_header, decoded) = codec::decode_message(&mut &frame[..], true).unwrap();
    match decoded {
        Message::DeviceListResp { devices, .. } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].1.vendor_id, 0x1234);
            assert_eq!(devices[0].1.product_id, 0x5678);
        }
        _ => panic!("expected DeviceListResp"),
    }
}

#[test]
fn scenario_urb_in_round_trip() {
    let header = UrbSubmitHeader {
        device_id: 1,
        urb_id: 7,
        endpoint_address: 0x81,
        transfer_type: 2,
        direction: 1,
        reserved: 0,
        transfer_flags: 0,
        buf_len: 64,
        interval: 0,
        setup_packet: [0; 8],
    };
    let submit = Message::SubmitUrb {
        header: header.clone(),
        data_out: None,
    };
    let frame = codec::encode_message(&submit, 10).unwrap();
    let (_header, decoded) = codec::decode_message(&mut &frame[..], false).unwrap();
    match decoded {
        Message::SubmitUrb { header: h, data_out } => {
            assert_eq!(h.urb_id, 7);
            assert_eq!(h.endpoint_address, 0x81);
            assert_eq!(h.buf_len, 64);
            assert!(data_out.is_none());
        }
        _ => panic!("expected SubmitUrb"),
    }

    let complete_header = UrbCompleteHeader {
        device_id: 1,
        urb_id: 7,
        status: StatusCode::Success as u32,
        actual_length: 8,
        error_count: 0,
    };
    let payload = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0x03];
    let complete = Message::UrbComplete {
        header: complete_header,
        data_in: Some(payload.clone()),
    };
    let frame = codec::encode_message(&complete, 10).unwrap();
    let (_header, decoded) = codec::decode_message(&mut &frame[..], false).unwrap();
    match decoded {
        Message::UrbComplete { header: h, data_in } => {
            assert_eq!(h.urb_id, 7);
            assert_eq!(h.actual_length, 8);
            assert_eq!(data_in, Some(payload));
        }
        _ => panic!("expected UrbComplete"),
    }
}

#[test]
fn scenario_framing_errors_are_fatal() {
    let mut buf = vec![0u8; FrameHeader::SIZE];
    buf[0..4].copy_from_slice(&0u32.to_le_bytes());
    let err = codec::decode_message(&mut &buf[..], false).unwrap_err();
    assert!(matches!(err, ProtocolError::BadMagic(0)));

    let header = FrameHeader::new(Command::SubmitUrb, 1_000_000, 1);
    let mut buf = Vec::new();
    header.write_to(&mut buf).unwrap();
    let err = codec::decode_message(&mut &buf[..], false).unwrap_err();
    assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
}

#[test]
fn unknown_payload_cannot_round_trip_through_decode_payload() {
    let encoded = encode_payload(&Message::Ping).unwrap();
    assert!(encoded.is_empty());
    let decoded = decode_payload(Command::Ping, false, &encoded).unwrap();
    assert!(matches!(decoded, Message::Ping));
}
