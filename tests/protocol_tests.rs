//! Wire-protocol serialization tests

#[cfg(test)]
mod tests {
    use quarry_world::protocol::{
        BlockEvent, ClientFrame, ErrorCode, RejectReason, ServerFrame, INPUT_FORWARD, INPUT_JUMP,
        INPUT_SNEAK, PROTOCOL_VERSION,
    };
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    #[test]
    fn hello_parses_from_client_json() {
        let raw = json!({
            "type": "HELLO",
            "protocol_version": 1,
            "registry_version": 1,
            "generator_version": 1,
            "jwt": "token",
            "world_id": "w1",
        });
        let frame: ClientFrame = serde_json::from_value(raw).unwrap();
        match frame {
            ClientFrame::Hello(hello) => {
                assert_eq!(hello.world_id, "w1");
                assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected HELLO, got {other:?}"),
        }
    }

    #[test]
    fn input_bitfield_defaults_to_zero() {
        let raw = json!({
            "type": "INPUT",
            "protocol_version": 1,
            "seq": 9,
            "x": 1.0, "y": 2.0, "z": 3.0,
            "vx": 0.0, "vy": 0.0, "vz": 0.0,
            "yaw": 0.0, "pitch": 0.0,
        });
        let frame: ClientFrame = serde_json::from_value(raw).unwrap();
        match frame {
            ClientFrame::Input(input) => assert_eq!(input.inputs, 0),
            other => panic!("expected INPUT, got {other:?}"),
        }
    }

    #[test]
    fn input_bits_are_the_documented_ones() {
        assert_eq!(INPUT_FORWARD, 1);
        assert_eq!(INPUT_JUMP, 16);
        assert_eq!(INPUT_SNEAK, 32);
    }

    #[test]
    fn unknown_frame_type_fails_to_parse() {
        let raw = json!({"type": "TELEPORT", "protocol_version": 1});
        assert!(serde_json::from_value::<ClientFrame>(raw).is_err());
    }

    // -----------------------------------------------------------------------
    // Outbound frames
    // -----------------------------------------------------------------------

    #[test]
    fn error_frame_uses_snake_case_codes() {
        let frame = ServerFrame::error(ErrorCode::RegistryMismatch, "nope", true);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["code"], "registry_mismatch");
        assert_eq!(value["fatal"], true);
    }

    #[test]
    fn reject_reasons_serialize_as_phrases() {
        for (reason, phrase) in [
            (RejectReason::RateLimited, "rate limited"),
            (RejectReason::OutOfBounds, "out of bounds"),
            (RejectReason::TooFar, "too far"),
            (RejectReason::NothingToBreak, "nothing to break"),
            (RejectReason::BlockOccupied, "block occupied"),
            (RejectReason::CannotPlaceInsideSelf, "cannot place inside self"),
            (RejectReason::FailedToApply, "failed to apply edit"),
        ] {
            assert_eq!(serde_json::to_value(reason).unwrap(), phrase);
        }
    }

    #[test]
    fn accepted_block_event_omits_reject_fields() {
        let event = BlockEvent {
            protocol_version: PROTOCOL_VERSION,
            request_id: "r1".into(),
            accepted: true,
            x: 0,
            y: 5,
            z: 0,
            block_id: 1,
            section_id: Some("0:0:0".into()),
            previous_block_id: Some(0),
            section_version: Some(1),
            reject_reason: None,
        };
        let value = serde_json::to_value(ServerFrame::BlockEvent(event)).unwrap();
        assert_eq!(value["type"], "BLOCK_EVENT");
        assert_eq!(value["previous_block_id"], 0);
        assert_eq!(value["section_version"], 1);
        assert!(value.get("reject_reason").is_none());
    }
}
