// Verify the wire format matches what deployed clients expect.
// These tests ensure protocol compatibility is never broken.

use maestro_protocol::client::{parse_command, ClientCommand};
use maestro_protocol::server::{QueueItem, ServerEvent};

#[test]
fn chat_full_round() {
    let json = r#"{
        "type":"chat","tabId":"tab-1","sessionId":"s-9","text":"fix the tests",
        "attachments":[{"name":"log.txt","data":"aGVsbG8="}],
        "skills":["rust"],"mcpServers":["ask_user"],
        "mode":"code","agentMode":"auto","model":"sonnet","maxTurns":20,
        "workdir":"/repo","reply_to":7,"retry":false,"autoSkill":true
    }"#;
    let ClientCommand::Chat {
        tab_id,
        session_id,
        text,
        attachments,
        skills,
        mcp_servers,
        max_turns,
        workdir,
        reply_to,
        auto_skill,
        ..
    } = parse_command(json).unwrap()
    else {
        panic!("expected chat");
    };
    assert_eq!(tab_id.as_deref(), Some("tab-1"));
    assert_eq!(session_id.as_deref(), Some("s-9"));
    assert_eq!(text, "fix the tests");
    assert_eq!(attachments[0].name, "log.txt");
    assert_eq!(skills, vec!["rust"]);
    assert_eq!(mcp_servers, vec!["ask_user"]);
    assert_eq!(max_turns, Some(20));
    assert_eq!(workdir.as_deref(), Some("/repo"));
    assert_eq!(reply_to, Some(7));
    assert!(auto_skill);
}

#[test]
fn stop_without_tab() {
    let cmd = parse_command(r#"{"type":"stop"}"#).unwrap();
    assert!(matches!(
        cmd,
        ClientCommand::Stop {
            tab_id: None,
            session_id: None
        }
    ));
}

#[test]
fn queue_edit_round() {
    let cmd = parse_command(r#"{"type":"queue_edit","queueId":"q1","text":"later"}"#).unwrap();
    let ClientCommand::QueueEdit { queue_id, text } = cmd else {
        panic!("expected queue_edit");
    };
    assert_eq!(queue_id, "q1");
    assert_eq!(text, "later");
}

#[test]
fn ask_user_event_shape() {
    let ev = ServerEvent::AskUser {
        request_id: "r1".into(),
        question: "A or B?".into(),
        questions: serde_json::json!([
            {"question":"A or B?","options":["A","B"],"multiSelect":false}
        ]),
        tab_id: None,
    };
    let json = ev.to_json();
    assert!(json.contains(r#""type":"ask_user""#));
    assert!(json.contains(r#""requestId":"r1""#));
    assert!(json.contains(r#""multiSelect":false"#));
}

#[test]
fn task_interrupted_event_shape() {
    let ev = ServerEvent::TaskInterrupted {
        session_id: "s-1".into(),
        last_user_msg: "do it".into(),
        retry_count: 2,
        tab_id: None,
    };
    let json = ev.to_json();
    assert!(json.contains(r#""type":"task_interrupted""#));
    assert!(json.contains(r#""lastUserMsg":"do it""#));
    assert!(json.contains(r#""retryCount":2"#));
}

#[test]
fn queue_update_items() {
    let ev = ServerEvent::QueueUpdate {
        tab_id: Some("t".into()),
        pending: 1,
        items: vec![QueueItem {
            queue_id: "q1".into(),
            text: "next".into(),
        }],
    };
    let json = ev.to_json();
    assert!(json.contains(r#""pending":1"#));
    assert!(json.contains(r#""queueId":"q1""#));
}

#[test]
fn done_event_duration() {
    let json = ServerEvent::Done {
        tab_id: None,
        duration: 1234,
    }
    .to_json();
    assert!(json.contains(r#""duration":1234"#));
}

#[test]
fn server_events_round_trip() {
    let ev = ServerEvent::SessionStarted {
        session_id: "s-1".into(),
        tab_id: Some("t-1".into()),
    };
    let back: ServerEvent = serde_json::from_str(&ev.to_json()).unwrap();
    match back {
        ServerEvent::SessionStarted { session_id, tab_id } => {
            assert_eq!(session_id, "s-1");
            assert_eq!(tab_id.as_deref(), Some("t-1"));
        }
        other => panic!("wrong variant: {other:?}"),
    }
}
