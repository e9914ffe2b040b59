use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::json;

use super::*;

fn recorder() -> (Handler, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = handler(move |payload| {
        sink.lock().push(payload.clone());
        Ok(())
    });
    (handler, seen)
}

#[test]
fn decodes_nested_payload_with_message_body() {
    let frame = decode_frame(
        r#"{"type":"message:new","payload":{"message":{"id":"m1","content":"hi"}}}"#,
    )
    .expect("frame");

    assert_eq!(
        frame,
        InboundFrame::Typed {
            event: "message:new".into(),
            body: json!({ "id": "m1", "content": "hi" }),
        }
    );
}

#[test]
fn decodes_uppercase_keys_and_inner_type() {
    let frame =
        decode_frame(r#"{"Payload":{"Type":"message:ack","Message":{"id":"m2"}}}"#).expect("frame");

    assert_eq!(frame.event_name(), "message:ack");
    assert_eq!(frame.body(), &json!({ "id": "m2" }));
}

#[test]
fn decodes_double_encoded_frame() {
    let inner = r#"{"type":"message:new","payload":{"message":{"id":"m3"}}}"#;
    let raw = serde_json::to_string(inner).expect("encode string");

    let frame = decode_frame(&raw).expect("frame");

    assert_eq!(frame.event_name(), "message:new");
    assert_eq!(frame.body(), &json!({ "id": "m3" }));
}

#[test]
fn accepts_event_and_data_aliases() {
    let frame = decode_frame(r#"{"event":"presence","data":{"user":"u1"}}"#).expect("frame");

    assert_eq!(frame.event_name(), "presence");
    assert_eq!(frame.body(), &json!({ "user": "u1" }));
}

#[test]
fn flat_frame_without_message_uses_whole_object() {
    let frame = decode_frame(r#"{"type":"typing","conversation_id":"c1"}"#).expect("frame");

    assert_eq!(
        frame.body(),
        &json!({ "type": "typing", "conversation_id": "c1" })
    );
}

#[test]
fn sender_message_shape_is_a_server_message() {
    let frame = decode_frame(r#"{"sender":"system","message":"maintenance"}"#).expect("frame");

    assert_eq!(frame.event_name(), "server:message");
    assert_eq!(
        frame,
        InboundFrame::ServerMessage(json!({ "sender": "system", "message": "maintenance" }))
    );
}

#[test]
fn unknown_shapes_fall_back_to_generic_message() {
    assert_eq!(
        decode_frame(r#"{"hello":"world"}"#),
        Some(InboundFrame::Unrecognized(json!({ "hello": "world" })))
    );
    assert_eq!(
        decode_frame("[1,2]").map(|frame| frame.event_name().to_string()),
        Some("message".to_string())
    );
    assert_eq!(decode_frame("not json"), None);
}

#[test]
fn duplicate_registration_is_ignored() {
    let dispatcher = EventDispatcher::new();
    let (handler, seen) = recorder();

    assert!(dispatcher.on("message:new", Arc::clone(&handler)));
    assert!(!dispatcher.on("message:new", Arc::clone(&handler)));
    dispatcher.emit("message:new", &json!({ "id": "m1" }));

    assert_eq!(dispatcher.handler_count("message:new"), 1);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn off_removes_only_that_handler() {
    let dispatcher = EventDispatcher::new();
    let (first, first_seen) = recorder();
    let (second, second_seen) = recorder();
    dispatcher.on("message:new", Arc::clone(&first));
    dispatcher.on("message:new", Arc::clone(&second));

    assert!(dispatcher.off("message:new", &first));
    assert!(!dispatcher.off("message:new", &first));
    dispatcher.emit("message:new", &json!({}));

    assert!(first_seen.lock().is_empty());
    assert_eq!(second_seen.lock().len(), 1);
}

#[test]
fn failing_handler_does_not_stop_the_others() {
    let dispatcher = EventDispatcher::new();
    let ran = Arc::new(AtomicUsize::new(0));
    dispatcher.on("message:new", handler(|_| Err(anyhow::anyhow!("bad payload"))));
    dispatcher.on("message:new", handler(|_| panic!("handler bug")));
    let counter = Arc::clone(&ran);
    dispatcher.on(
        "message:new",
        handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    assert_eq!(dispatcher.emit("message:new", &json!({})), 3);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn handler_may_unregister_itself_during_dispatch() {
    let dispatcher = EventDispatcher::new();
    let slot: Arc<Mutex<Option<Handler>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));

    let weak_dispatcher = Arc::downgrade(&dispatcher);
    let own = Arc::clone(&slot);
    let counter = Arc::clone(&calls);
    let once = handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let (Some(dispatcher), Some(me)) = (weak_dispatcher.upgrade(), own.lock().clone()) {
            dispatcher.off("message:new", &me);
        }
        Ok(())
    });
    *slot.lock() = Some(Arc::clone(&once));
    dispatcher.on("message:new", once);

    dispatcher.emit("message:new", &json!({}));
    dispatcher.emit("message:new", &json!({}));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.handler_count("message:new"), 0);
}

#[test]
fn dispatch_frame_routes_by_event_and_drops_garbage() {
    let dispatcher = EventDispatcher::new();
    let (on_new, new_seen) = recorder();
    let (on_message, generic_seen) = recorder();
    dispatcher.on("message:new", on_new);
    dispatcher.on("message", on_message);

    dispatcher.dispatch_frame(r#"{"type":"message:new","payload":{"message":{"id":"m1"}}}"#);
    dispatcher.dispatch_frame(r#"{"unexpected":true}"#);
    assert!(dispatcher.dispatch_frame("{broken").is_none());

    assert_eq!(*new_seen.lock(), vec![json!({ "id": "m1" })]);
    assert_eq!(*generic_seen.lock(), vec![json!({ "unexpected": true })]);
}
