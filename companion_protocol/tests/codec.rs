use companion_protocol::{
    decode, encode, AddressingMode, ButtonAddress, ButtonTarget, DecodeError, InboundEnvelope,
    InboundMessage, OutboundCommand, IMAGE_BUFFER_LEN,
};
use serde_json::json;

fn fill_image_text(arguments: serde_json::Value) -> String {
    json!({ "command": "fillImage", "arguments": arguments }).to_string()
}

#[test]
fn keydown_survives_encode_then_decode() {
    let cmd = OutboundCommand::keydown(ButtonTarget::Dynamic { key_index: 4 });
    let text = encode(&cmd).expect("encode");

    let envelope = decode(&text).expect("decode");
    assert_eq!(
        envelope,
        InboundEnvelope::Command {
            command: "keydown".to_string(),
            arguments: json!({ "keyIndex": 4 }),
        }
    );
}

#[test]
fn handshake_commands_have_expected_wire_shape() {
    let version = encode(&OutboundCommand::version(2)).expect("encode");
    assert_eq!(version, r#"{"command":"version","arguments":{"version":2}}"#);

    let device = encode(&OutboundCommand::new_device("2E1F407206FF4353B33D724CD1429550"))
        .expect("encode");
    assert_eq!(
        device,
        r#"{"command":"new_device","arguments":"2E1F407206FF4353B33D724CD1429550"}"#
    );
}

#[test]
fn paged_targets_carry_page_and_bank() {
    let cmd = OutboundCommand::keyup(ButtonAddress::new(3, 7).target());
    assert_eq!(cmd.arguments, json!({ "page": 3, "bank": 7 }));

    let cmd = OutboundCommand::keyup(ButtonAddress::dynamic(12).target());
    assert_eq!(cmd.arguments, json!({ "keyIndex": 12 }));

    let req = OutboundCommand::request_button(ButtonAddress::new(9, 31));
    assert_eq!(req.command, "request_button");
    assert_eq!(req.arguments, json!({ "page": 9, "bank": 31 }));
}

#[test]
fn button_target_parses_both_argument_shapes() {
    let paged: ButtonTarget = serde_json::from_value(json!({ "page": 2, "bank": 5 })).unwrap();
    assert_eq!(paged, ButtonTarget::Paged { page: 2, bank: 5 });

    let dynamic: ButtonTarget = serde_json::from_value(json!({ "keyIndex": 8 })).unwrap();
    assert_eq!(dynamic, ButtonTarget::Dynamic { key_index: 8 });
}

#[test]
fn decode_rejects_garbage_and_untagged_frames() {
    assert!(matches!(decode("not json"), Err(DecodeError::Json(_))));
    assert!(matches!(
        decode(r#"{"arguments":{}}"#),
        Err(DecodeError::MissingTag)
    ));
    assert!(matches!(
        decode(r#"{"command":"fillImage"}"#),
        Err(DecodeError::MissingArguments(tag)) if tag == "fillImage"
    ));
    assert!(matches!(
        decode(r#"{"command":"fillImage","arguments":null}"#),
        Err(DecodeError::MissingArguments(_))
    ));
}

#[test]
fn response_tag_wins_over_command_tag() {
    let envelope = decode(r#"{"response":"version","command":"fillImage","arguments":{}}"#)
        .expect("decode");
    assert!(matches!(envelope, InboundEnvelope::Response { ref response, .. } if response == "version"));
}

#[test]
fn replies_and_unknown_tags_are_typed() {
    let version = decode(r#"{"response":"version","arguments":{"serverVersion":"2.4.0"}}"#)
        .unwrap()
        .into_message()
        .unwrap();
    match version {
        InboundMessage::Version(v) => assert_eq!(v.server_version, Some(json!("2.4.0"))),
        other => panic!("expected version, got {other:?}"),
    }

    let device = decode(r#"{"response":"new_device","arguments":{"ok":true}}"#)
        .unwrap()
        .into_message()
        .unwrap();
    assert!(matches!(device, InboundMessage::NewDevice(_)));

    let unknown = decode(r#"{"command":"fillColor","arguments":{}}"#)
        .unwrap()
        .into_message()
        .unwrap();
    assert_eq!(
        unknown,
        InboundMessage::Unknown {
            tag: "fillColor".to_string()
        }
    );
}

#[test]
fn fill_image_payload_decodes_with_optional_page_and_bank() {
    let pixels = vec![7u8; IMAGE_BUFFER_LEN];
    let text = fill_image_text(json!({
        "keyIndex": 2,
        "page": 3,
        "bank": 7,
        "data": { "type": "Buffer", "data": pixels },
    }));

    let msg = decode(&text).unwrap().into_message().unwrap();
    let InboundMessage::FillImage(fill) = msg else {
        panic!("expected fillImage");
    };
    assert_eq!(fill.page, Some(3));
    assert_eq!(fill.bank, Some(7));
    assert_eq!(fill.slot_index(), 7);
    assert_eq!(fill.addressing(), AddressingMode::Paged);
    assert_eq!(fill.pixels().unwrap().len(), IMAGE_BUFFER_LEN);

    let text = fill_image_text(json!({
        "keyIndex": 10,
        "data": { "type": "Buffer", "data": [1, 2, 3] },
    }));
    let InboundMessage::FillImage(fill) = decode(&text).unwrap().into_message().unwrap() else {
        panic!("expected fillImage");
    };
    assert_eq!(fill.addressing(), AddressingMode::Flat);
    assert_eq!(fill.slot_index(), 10);
    assert!(matches!(
        fill.pixels(),
        Err(DecodeError::BufferLength {
            expected: IMAGE_BUFFER_LEN,
            actual: 3
        })
    ));
}

#[test]
fn button_address_formats_and_parses() {
    let addr: ButtonAddress = "3|7".parse().expect("parse");
    assert_eq!(addr, ButtonAddress::new(3, 7));
    assert_eq!(addr.to_string(), "3|7");
    assert!(!addr.is_dynamic());
    assert!(ButtonAddress::dynamic(4).is_dynamic());

    assert!("3".parse::<ButtonAddress>().is_err());
    assert!("a|1".parse::<ButtonAddress>().is_err());
    assert!("1|-1".parse::<ButtonAddress>().is_err());
    assert!(!ButtonAddress::new(100, 0).in_grid());
    assert!(!ButtonAddress::new(1, 32).in_grid());
}
