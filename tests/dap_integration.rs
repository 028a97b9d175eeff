//! End-to-end DAP protocol tests: a live adapter served over a loopback
//! socket, driven with raw Content-Length framed JSON requests.


use dap_client::{fixture, DapSession};
use serde_json::{json, Value};
use serial_test::serial;

fn assert_response(response: &Value, command: &str, request_seq: i64, success: bool) {
    assert_eq!(
        response.get("type").and_then(Value::as_str),
        Some("response")
    );
    assert_eq!(
        response.get("command").and_then(Value::as_str),
        Some(command)
    );
    assert_eq!(
        response.get("request_seq").and_then(Value::as_i64),
        Some(request_seq)
    );
    assert_eq!(
        response.get("success").and_then(Value::as_bool),
        Some(success),
        "response: {response}"
    );
}

fn request(session: &mut DapSession, command: &str, arguments: Value) -> Value {
    let seq = session
        .client
        .send_request(command, arguments)
        .expect("send request");
    let response = session.client.read_response(seq).expect("read response");
    assert_response(&response, command, seq, true);
    response
}

/// initialize + launch(stopOnEntry) + configurationDone, consuming the
/// `initialized` and first `stopped` events.
fn start_stopped_on_entry(session: &mut DapSession) {
    let init = request(session, "initialize", json!({ "adapterID": "avmdbg" }));
    assert_eq!(init["body"]["supportsStepBack"], json!(true));

    request(session, "launch", json!({ "stopOnEntry": true }));
    session.client.wait_for_event("initialized").unwrap();
    request(session, "configurationDone", json!({}));

    let stopped = session.client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], json!("entry"));
    assert_eq!(stopped["body"]["threadId"], json!(1));
}

fn top_frame(session: &mut DapSession) -> Value {
    let stack = request(session, "stackTrace", json!({ "threadId": 1 }));
    stack["body"]["stackFrames"][0].clone()
}

#[test]
#[serial]
fn test_initialize_advertises_replay_capabilities() {
    let mut session = DapSession::start("stepping").unwrap();

    let response = request(&mut session, "initialize", json!({ "adapterID": "avmdbg" }));
    let capabilities = &response["body"];
    assert_eq!(capabilities["supportsStepBack"], json!(true));
    assert_eq!(capabilities["supportsBreakpointLocationsRequest"], json!(true));
    assert_eq!(capabilities["supportsEvaluateForHovers"], json!(true));
    assert_eq!(capabilities["supportsDelayedStackTraceLoading"], json!(true));
    assert_eq!(
        capabilities["supportsSingleThreadExecutionRequests"],
        json!(false)
    );

    session.shutdown();
}

#[test]
#[serial]
fn test_launch_stops_on_entry_in_group_document() {
    let mut session = DapSession::start("stepping").unwrap();
    start_stopped_on_entry(&mut session);

    let threads = request(&mut session, "threads", json!({}));
    assert_eq!(threads["body"]["threads"][0]["id"], json!(1));

    let frame = top_frame(&mut session);
    assert_eq!(frame["source"]["name"], json!("transaction-group-0.json"));
    assert_eq!(frame["line"], json!(2));

    // The pseudo document is fetched through its source reference.
    let reference = frame["source"]["sourceReference"].as_i64().unwrap();
    let source = request(&mut session, "source", json!({ "sourceReference": reference }));
    let content: Value =
        serde_json::from_str(source["body"]["content"].as_str().unwrap()).unwrap();
    assert_eq!(content.as_array().map(Vec::len), Some(3));

    session.shutdown();
}

#[test]
#[serial]
fn test_next_skips_program_traces() {
    let mut session = DapSession::start("stepping").unwrap();
    start_stopped_on_entry(&mut session);

    for expected_line in [9, 21, 25, 30, 32] {
        request(&mut session, "next", json!({ "threadId": 1 }));
        let stopped = session.client.wait_for_event("stopped").unwrap();
        assert_eq!(stopped["body"]["reason"], json!("step"));

        let frame = top_frame(&mut session);
        assert_eq!(
            frame["source"]["name"],
            json!("transaction-group-0.json"),
            "next must not descend into program traces"
        );
        assert_eq!(frame["line"], json!(expected_line));
    }

    request(&mut session, "next", json!({ "threadId": 1 }));
    session.client.wait_for_event("terminated").unwrap();

    session.shutdown();
}

#[test]
#[serial]
fn test_breakpoint_hit_variables_and_evaluate() {
    let mut session = DapSession::start("app-state").unwrap();

    request(&mut session, "initialize", json!({ "adapterID": "avmdbg" }));
    request(&mut session, "launch", json!({}));
    session.client.wait_for_event("initialized").unwrap();

    let teal = fixture("app-state", "state-writes.teal");
    let set = request(
        &mut session,
        "setBreakpoints",
        json!({
            "source": { "path": teal },
            "breakpoints": [{ "line": 4 }, { "line": 5 }],
        }),
    );
    let breakpoints = set["body"]["breakpoints"].as_array().unwrap();
    assert!(breakpoints.iter().all(|bp| bp["verified"] == json!(true)));
    let first_id = breakpoints[0]["id"].as_i64().unwrap();

    request(&mut session, "configurationDone", json!({}));

    let stopped = session.client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], json!("breakpoint"));
    assert_eq!(stopped["body"]["hitBreakpointIds"], json!([first_id]));

    let frame = top_frame(&mut session);
    assert_eq!(frame["source"]["name"], json!("state-writes.teal"));
    assert_eq!(frame["line"], json!(4));

    // Scopes and the execution state under them.
    let scopes = request(&mut session, "scopes", json!({ "frameId": 0 }));
    let scopes = scopes["body"]["scopes"].as_array().unwrap().clone();
    assert_eq!(scopes[0]["name"], json!("Execution State"));
    assert_eq!(scopes[1]["name"], json!("On-chain State"));

    let exec_ref = scopes[0]["variablesReference"].as_i64().unwrap();
    let exec = request(
        &mut session,
        "variables",
        json!({ "variablesReference": exec_ref }),
    );
    let exec_vars = exec["body"]["variables"].as_array().unwrap().clone();
    assert_eq!(exec_vars[0]["name"], json!("stack"));
    assert_eq!(exec_vars[1]["name"], json!("scratch"));
    assert_eq!(exec_vars[1]["value"], json!("0 slots"));

    let stack_ref = exec_vars[0]["variablesReference"].as_i64().unwrap();
    let stack = request(
        &mut session,
        "variables",
        json!({ "variablesReference": stack_ref }),
    );
    let stack_vars = stack["body"]["variables"].as_array().unwrap().clone();
    assert_eq!(stack_vars[0]["value"], json!("0x676c6f62616c2d696e742d6b6579"));
    assert_eq!(stack_vars[0]["type"], json!("bytes"));
    assert_eq!(stack_vars[1]["value"], json!("3735928559"));
    assert_eq!(stack_vars[1]["type"], json!("uint64"));

    // Byte value expansion: simultaneous renderings plus indexed bytes.
    let bytes_ref = stack_vars[0]["variablesReference"].as_i64().unwrap();
    assert_ne!(bytes_ref, 0);
    let expanded = request(
        &mut session,
        "variables",
        json!({ "variablesReference": bytes_ref }),
    );
    let children: Vec<(String, String)> = expanded["body"]["variables"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| {
            (
                v["name"].as_str().unwrap().to_string(),
                v["value"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    let child = |name: &str| {
        children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(child("hex"), Some("0x676c6f62616c2d696e742d6b6579".into()));
    assert_eq!(child("base64"), Some("Z2xvYmFsLWludC1rZXk=".into()));
    assert_eq!(child("ascii"), Some("global-int-key".into()));
    assert_eq!(child("length"), Some("14".into()));
    assert_eq!(child("0"), Some("103".into()));
    assert_eq!(child("address"), None, "14 bytes is not an address");

    // Hover evaluation.
    let eval = request(
        &mut session,
        "evaluate",
        json!({ "expression": "stack[-1]", "frameId": 0, "context": "hover" }),
    );
    assert_eq!(eval["body"]["result"], json!("3735928559"));

    let eval = request(
        &mut session,
        "evaluate",
        json!({ "expression": "stack[1000]", "frameId": 0, "context": "hover" }),
    );
    assert_eq!(eval["body"]["result"], json!("stack[1000] out of range"));

    let eval = request(
        &mut session,
        "evaluate",
        json!({ "expression": "scratch[7]", "frameId": 0, "context": "hover" }),
    );
    assert_eq!(eval["body"]["result"], json!("0"));

    let seq = session
        .client
        .send_request("evaluate", json!({ "expression": "frobnicate", "frameId": 0 }))
        .unwrap();
    let response = session.client.read_response(seq).unwrap();
    assert_response(&response, "evaluate", seq, false);

    // Second breakpoint: the global write has landed.
    request(&mut session, "continue", json!({ "threadId": 1 }));
    let stopped = session.client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], json!("breakpoint"));
    let frame = top_frame(&mut session);
    assert_eq!(frame["line"], json!(5));

    let scopes = request(&mut session, "scopes", json!({ "frameId": 0 }));
    let chain_ref = scopes["body"]["scopes"][1]["variablesReference"]
        .as_i64()
        .unwrap();
    let apps = request(
        &mut session,
        "variables",
        json!({ "variablesReference": chain_ref }),
    );
    let app_var = apps["body"]["variables"][0].clone();
    assert_eq!(app_var["name"], json!("app 1054"));

    let app_ref = app_var["variablesReference"].as_i64().unwrap();
    let sections = request(
        &mut session,
        "variables",
        json!({ "variablesReference": app_ref }),
    );
    let global = sections["body"]["variables"]
        .as_array()
        .unwrap()
        .iter()
        .find(|v| v["name"] == json!("globalState"))
        .cloned()
        .unwrap();
    assert_eq!(global["value"], json!("1 entries"));

    let global_ref = global["variablesReference"].as_i64().unwrap();
    let entries = request(
        &mut session,
        "variables",
        json!({ "variablesReference": global_ref }),
    );
    assert_eq!(
        entries["body"]["variables"][0]["name"],
        json!("global-int-key")
    );
    assert_eq!(entries["body"]["variables"][0]["value"], json!("3735928559"));

    // No further breakpoints: run to the end of the trace.
    request(&mut session, "continue", json!({ "threadId": 1 }));
    session.client.wait_for_event("terminated").unwrap();

    session.shutdown();
}

#[test]
#[serial]
fn test_breakpoint_verification_and_locations() {
    let mut session = DapSession::start("stepping").unwrap();
    start_stopped_on_entry(&mut session);

    let teal = fixture("stepping", "lsig.teal");
    let set = request(
        &mut session,
        "setBreakpoints",
        json!({
            "source": { "path": teal },
            "breakpoints": [{ "line": 2 }, { "line": 1000 }, { "line": 0, "column": 0 }],
        }),
    );
    let breakpoints = set["body"]["breakpoints"].as_array().unwrap();
    assert_eq!(breakpoints[0]["verified"], json!(true));
    assert_eq!(breakpoints[1]["verified"], json!(false));
    assert_eq!(
        breakpoints[2]["verified"],
        json!(false),
        "line 0 / column 0 never verifies"
    );

    let locations = request(
        &mut session,
        "breakpointLocations",
        json!({ "source": { "path": teal }, "line": 1, "endLine": 7 }),
    );
    let locations = locations["body"]["breakpoints"].as_array().unwrap().clone();
    assert_eq!(locations.len(), 7);
    assert_eq!(locations[0], json!({ "line": 1, "column": 1 }));
    assert_eq!(locations[6], json!({ "line": 7, "column": 1 }));

    session.shutdown();
}

#[test]
#[serial]
fn test_step_back_over_dap() {
    let mut session = DapSession::start("stack-scratch").unwrap();
    start_stopped_on_entry(&mut session);

    for _ in 0..2 {
        request(&mut session, "stepIn", json!({ "threadId": 1 }));
        session.client.wait_for_event("stopped").unwrap();
    }
    let frame = top_frame(&mut session);
    assert_eq!(frame["source"]["name"], json!("stack-scratch.teal"));
    assert_eq!(frame["line"], json!(2));

    request(&mut session, "stepBack", json!({ "threadId": 1 }));
    let stopped = session.client.wait_for_event("stopped").unwrap();
    assert_eq!(stopped["body"]["reason"], json!("step"));

    let frame = top_frame(&mut session);
    assert_eq!(frame["source"]["name"], json!("transaction-group-0.json"));
    assert_eq!(frame["line"], json!(5));

    session.shutdown();
}

#[test]
#[serial]
fn test_requests_before_initialize_fail_cleanly() {
    let mut session = DapSession::start("stepping").unwrap();

    let seq = session
        .client
        .send_request("threads", json!({}))
        .unwrap();
    let response = session.client.read_response(seq).unwrap();
    assert_response(&response, "threads", seq, false);

    session.shutdown();
}
