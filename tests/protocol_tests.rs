// WFMS - Water Flow Monitoring System
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Integration tests for the wire codec and the command path
//!
//! These walk a bus command through validation, admission, encoding and ack
//! translation without any transport.

use serde_json::json;
use std::time::{Duration, Instant};
use wfms::rules::{REASON_COOLDOWN_USER, REASON_DUPLICATE_CID};
use wfms::*;

/// Lines the controller firmware actually emits
const CONTROLLER_LINES: &[&str] = &[
    r#"@DATA {"flow":150,"battery":85,"valve":"open","mode":"auto","valve_path":"auto","valve_known":true,"tx_pending":false}"#,
    r#"@INFO {"node_id":"0x0000","eui64":"00124B0012345678","pan_id":"0xBEEF","ch":11,"tx_power":8,"net_state":2,"uart_gateway":1,"mode":"auto","uptime":3600}"#,
    r#"@LOG {"tag":"NET","event":"formed","pan_id":"0xBEEF"}"#,
    r#"@ACK {"id":1,"ok":true,"msg":"valve set","valve":"open"}"#,
];

#[test]
fn test_controller_lines_parse() {
    let kinds: Vec<FrameKind> = CONTROLLER_LINES
        .iter()
        .map(|line| parse_line(line).kind)
        .collect();
    assert_eq!(
        kinds,
        vec![FrameKind::Data, FrameKind::Info, FrameKind::Log, FrameKind::Ack]
    );
}

#[test]
fn test_malformed_lines_never_panic() {
    let junk = [
        "",
        "\r",
        "@",
        "@@DATA {}",
        "DATA {\"flow\":1}",
        "@DATA null",
        "@DATA \"text\"",
        "@DATA {\"flow\":",
        "@ACK 42",
        "\u{0}\u{1}\u{2}",
        "@DATA {\"a\":\"\u{1F4A7}\"",
        "}}}}",
    ];
    for line in junk {
        let frame = parse_line(line);
        assert_eq!(frame.kind, FrameKind::Err, "line {:?}", line);
        assert!(frame.error_reason().is_some());
    }
}

#[test]
fn test_full_command_path() {
    let rules = RulesEngine::new(RulesConfig::default());
    let ids = CorrelationMap::new(Duration::from_secs(60));
    let now = Instant::now();

    let payload = json!({"correlationId": "dash-42", "value": "OFF", "actor": "op1", "timestamp": 1});
    let command = Command::from_bus(CommandSource::Valve, &payload).unwrap();
    assert!(rules
        .check_and_mark_at(&command.correlation_id, &command.actor, now)
        .is_admitted());

    let (id, line) = encode_command(&command, &ids, now).unwrap();
    assert!(!line.ends_with('\n'));
    let cmd = parse_line(&line);
    assert_eq!(cmd.payload["value"], "closed");

    let controller_ack = parse_line(&format!(
        r#"@ACK {{"id":{},"ok":true,"msg":"valve set","valve":"closed"}}"#,
        id
    ));
    let ack = translate_ack(&controller_ack.payload, &ids).unwrap();
    assert_eq!(ack.correlation_id, "dash-42");
    assert!(ack.ok);

    let state = StateCache::new();
    let updated = state.apply_ack(&command.operation, 10).unwrap();
    assert_eq!(updated.valve, ValveState::Off);
}

#[test]
fn test_rules_scenarios() {
    let rules = RulesEngine::new(RulesConfig::default());
    let t0 = Instant::now();

    // Same actor, distinct ids, 5 seconds apart
    assert!(rules.check_and_mark_at("a", "alice", t0).is_admitted());
    assert_eq!(
        rules
            .check_and_mark_at("b", "alice", t0 + Duration::from_secs(2))
            .reason(),
        Some(REASON_COOLDOWN_USER)
    );
    assert!(rules
        .check_and_mark_at("c", "alice", t0 + Duration::from_secs(5))
        .is_admitted());

    // Reused id inside the dedupe window
    assert_eq!(
        rules
            .check_and_mark_at("a", "bob", t0 + Duration::from_secs(10))
            .reason(),
        Some(REASON_DUPLICATE_CID)
    );
}

#[test]
fn test_threshold_rejected_locally() {
    let payload = json!({"cid": "t1", "op": "threshold_set", "close_th": 20, "open_th": 80});
    let rejection = Command::from_bus(CommandSource::Operation, &payload).unwrap_err();
    assert_eq!(rejection.reason, "open_th must be < close_th");
}

#[test]
fn test_every_operation_encodes() {
    let ids = CorrelationMap::new(Duration::from_secs(60));
    let ops = [
        json!({"op": "info"}),
        json!({"op": "mode_set", "value": "manual"}),
        json!({"op": "threshold_set", "close_th": 80, "open_th": 20}),
        json!({"op": "valve_set", "value": "ON"}),
        json!({"op": "valve_path_set", "value": "binding"}),
        json!({"op": "valve_target_set", "node_id": "0x1234", "dst_ep": 1}),
        json!({"op": "valve_pair", "eui64": "00124B0012345678", "node_id": "0x1234", "bind_index": 0, "dst_ep": 1}),
        json!({"op": "net_form", "pan_id": "0xBEEF", "ch": 15, "tx_power": 4, "force": 0}),
        json!({"op": "uart_gateway_set", "enable": 1}),
    ];

    for (i, mut payload) in ops.into_iter().enumerate() {
        let op = payload["op"].as_str().unwrap().to_string();
        payload["cid"] = json!(format!("op-{}", i));

        let command = Command::from_bus(CommandSource::Operation, &payload).unwrap();
        let (id, line) = encode_command(&command, &ids, Instant::now()).unwrap();
        let frame = parse_line(&line);

        assert_eq!(frame.kind, FrameKind::Cmd);
        assert_eq!(frame.payload["op"], op.as_str());
        assert_eq!(frame.payload["id"], id);
    }
}
