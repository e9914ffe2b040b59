use chrono::{DateTime, TimeZone, Utc};
use shared::domain::{ConversationId, DeliveryState, Message, MessageId, UserId, WireMessage};

use super::*;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("timestamp")
}

fn wire(id: &str, seconds: i64) -> WireMessage {
    WireMessage {
        id: id.to_string(),
        client_id: None,
        conversation_id: ConversationId::new("c1"),
        sender_id: UserId::new("u2"),
        message_type: "txt".to_string(),
        content: format!("content of {id}"),
        is_read: false,
        created_at: Some(at(seconds)),
    }
}

fn ack(id: &str, client_id: &str, seconds: i64) -> WireMessage {
    WireMessage {
        client_id: Some(client_id.to_string()),
        sender_id: UserId::new("me"),
        ..wire(id, seconds)
    }
}

fn pending(client_id: &str, content: &str, seconds: i64) -> Message {
    Message::pending(
        client_id,
        ConversationId::new("c1"),
        UserId::new("me"),
        content,
        at(seconds),
    )
}

fn ids(log: &MessageLog) -> Vec<String> {
    log.entries().iter().map(|m| m.id.to_string()).collect()
}

#[test]
fn pending_insert_keeps_sort_order() {
    let mut log = MessageLog::new();
    log.insert_push(wire("m1", 1));
    log.insert_push(wire("m3", 3));

    let index = log.insert_pending(pending("tmp-a", "hello", 2)).expect("inserted");

    assert_eq!(index, 1);
    assert_eq!(ids(&log), vec!["m1", "local:tmp-a", "m3"]);
    assert!(log.is_sorted());
}

#[test]
fn ack_replaces_pending_entry_in_place() {
    let mut log = MessageLog::new();
    log.insert_push(wire("m1", 1));
    log.insert_pending(pending("tmp-a", "hello", 5));
    log.insert_push(wire("m9", 9));

    let outcome = log.reconcile_ack(&ack("m_42", "tmp-a", 5));

    assert_eq!(outcome, AckOutcome::Reconciled { index: 1 });
    assert_eq!(log.len(), 3);
    let entry = &log.entries()[1];
    assert_eq!(entry.id, MessageId::Server("m_42".into()));
    assert_eq!(entry.content, "content of m_42");
    assert_eq!(entry.delivery_state, DeliveryState::Acknowledged);
    assert!(log.get(&MessageId::Local("tmp-a".into())).is_none());
}

#[test]
fn ack_with_later_server_timestamp_moves_entry_to_its_slot() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "first", 1));
    log.insert_push(wire("m2", 2));
    log.insert_push(wire("m3", 3));

    let outcome = log.reconcile_ack(&ack("m_a", "tmp-a", 4));

    assert_eq!(outcome, AckOutcome::Reconciled { index: 2 });
    assert_eq!(ids(&log), vec!["m2", "m3", "m_a"]);
    assert!(log.is_sorted());
}

#[test]
fn ack_with_earlier_server_timestamp_moves_entry_back() {
    let mut log = MessageLog::new();
    log.insert_push(wire("m1", 1));
    log.insert_push(wire("m3", 3));
    log.insert_pending(pending("tmp-a", "late clock", 9));

    let outcome = log.reconcile_ack(&ack("m_a", "tmp-a", 2));

    assert_eq!(outcome, AckOutcome::Reconciled { index: 1 });
    assert_eq!(ids(&log), vec!["m1", "m_a", "m3"]);
}

#[test]
fn unmatched_ack_is_a_no_op() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 1));

    assert_eq!(log.reconcile_ack(&ack("m_1", "tmp-zzz", 1)), AckOutcome::Unmatched);
    assert_eq!(log.reconcile_ack(&wire("m_1", 1)), AckOutcome::Unmatched);
    assert_eq!(log.len(), 1);
    assert!(log.entries()[0].is_pending());
}

#[test]
fn repeated_ack_is_idempotent() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 1));

    assert!(matches!(
        log.reconcile_ack(&ack("m_1", "tmp-a", 1)),
        AckOutcome::Reconciled { .. }
    ));
    assert_eq!(log.reconcile_ack(&ack("m_1", "tmp-a", 1)), AckOutcome::Unmatched);
    assert_eq!(log.len(), 1);
}

#[test]
fn promoted_correlation_id_is_never_reused() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 1));
    log.reconcile_ack(&ack("m_1", "tmp-a", 1));

    assert_eq!(log.insert_pending(pending("tmp-a", "again", 2)), None);
    assert_eq!(log.len(), 1);
}

#[test]
fn duplicate_push_leaves_log_unchanged() {
    let mut log = MessageLog::new();

    assert_eq!(log.insert_push(wire("m_7", 7)), PushOutcome::Inserted { index: 0 });
    assert_eq!(log.insert_push(wire("m_7", 7)), PushOutcome::Duplicate);

    assert_eq!(log.len(), 1);
}

#[test]
fn push_echo_of_own_send_reconciles_pending() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 1));

    let outcome = log.insert_push(ack("m_1", "tmp-a", 1));

    assert_eq!(outcome, PushOutcome::Reconciled { index: 0 });
    assert_eq!(log.len(), 1);
    assert_eq!(log.entries()[0].delivery_state, DeliveryState::Acknowledged);
}

#[test]
fn history_merges_with_live_entries_in_timestamp_order() {
    let mut log = MessageLog::new();
    log.insert_push(wire("m2", 2));

    let stats = log.merge_history(vec![wire("m1", 1), wire("m3", 3)]);

    assert_eq!(stats.inserted, 2);
    assert_eq!(ids(&log), vec!["m1", "m2", "m3"]);
}

#[test]
fn history_deduplicates_against_live_and_itself() {
    let mut log = MessageLog::new();
    log.insert_push(wire("m2", 2));

    let stats = log.merge_history(vec![wire("m2", 2), wire("m1", 1), wire("m1", 1)]);

    assert_eq!(stats.duplicates, 2);
    assert_eq!(stats.inserted, 1);
    assert_eq!(ids(&log), vec!["m1", "m2"]);
}

#[test]
fn history_carrying_correlation_id_promotes_pending_entry() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 5));

    let stats = log.merge_history(vec![wire("m1", 1), ack("m5", "tmp-a", 5)]);

    assert_eq!(stats.reconciled, 1);
    assert_eq!(ids(&log), vec!["m1", "m5"]);
    assert!(log.pending_ids().is_empty());
}

#[test]
fn ack_supersedes_history_copy_without_correlation_id() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 5));
    log.merge_history(vec![wire("m5", 5)]);
    assert_eq!(log.len(), 2);

    log.reconcile_ack(&ack("m5", "tmp-a", 5));

    assert_eq!(ids(&log), vec!["m5"]);
}

#[test]
fn fail_pending_only_touches_pending_entries() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 1));
    log.insert_pending(pending("tmp-b", "world", 2));
    log.reconcile_ack(&ack("m_b", "tmp-b", 2));

    assert!(log.fail_pending(&MessageId::Local("tmp-a".into())));
    assert!(!log.fail_pending(&MessageId::Local("tmp-a".into())));
    assert!(!log.fail_pending(&MessageId::Server("m_b".into())));

    assert_eq!(log.entries()[0].delivery_state, DeliveryState::Failed);
    assert_eq!(log.entries()[1].delivery_state, DeliveryState::Acknowledged);
}

#[test]
fn late_ack_reconciles_failed_entry() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 1));
    log.fail_pending(&MessageId::Local("tmp-a".into()));

    assert_eq!(
        log.reconcile_ack(&ack("m_1", "tmp-a", 1)),
        AckOutcome::Reconciled { index: 0 }
    );
    assert_eq!(ids(&log), vec!["m_1"]);
    assert_eq!(log.entries()[0].delivery_state, DeliveryState::Acknowledged);
}

#[test]
fn failed_send_and_its_persisted_copy_collapse_to_one_entry() {
    let mut log = MessageLog::new();
    log.insert_pending(pending("tmp-a", "hello", 1));
    log.fail_pending(&MessageId::Local("tmp-a".into()));

    let stats = log.merge_history(vec![ack("m_1", "tmp-a", 1), wire("m_2", 2)]);
    log.insert_push(ack("m_1", "tmp-a", 1));

    assert_eq!(stats.reconciled, 1);
    assert_eq!(stats.inserted, 1);
    assert_eq!(ids(&log), vec!["m_1", "m_2"]);
    assert_eq!(log.entries()[0].delivery_state, DeliveryState::Acknowledged);
    assert!(log.insert_pending(pending("tmp-a", "hello", 3)).is_none());
}

#[test]
fn ack_without_timestamp_keeps_local_time() {
    let mut log = MessageLog::new();
    log.insert_push(wire("m1", 1));
    log.insert_pending(pending("tmp-a", "hello", 5));
    log.insert_push(wire("m9", 9));

    let outcome = log.reconcile_ack(&WireMessage {
        created_at: None,
        ..ack("m_5", "tmp-a", 0)
    });

    assert_eq!(outcome, AckOutcome::Reconciled { index: 1 });
    assert_eq!(ids(&log), vec!["m1", "m_5", "m9"]);
    assert_eq!(log.entries()[1].created_at, at(5));
    assert!(log.is_sorted());
}

#[test]
fn interleaved_push_ack_and_history_stay_sorted() {
    let mut log = MessageLog::new();
    let offsets = [7, 3, 11, 1, 9, 5];
    for (n, offset) in offsets.iter().enumerate() {
        log.insert_push(wire(&format!("p{n}"), *offset));
        log.insert_pending(pending(&format!("tmp-{n}"), "x", offset + 1));
        assert!(log.is_sorted());
    }
    for (n, offset) in offsets.iter().enumerate().rev() {
        log.reconcile_ack(&ack(&format!("a{n}"), &format!("tmp-{n}"), 20 - offset));
        assert!(log.is_sorted());
    }
    log.merge_history((0..6).map(|n| wire(&format!("h{n}"), n * 2)).collect());

    assert!(log.is_sorted());
    assert_eq!(log.len(), 18);
    assert!(log.pending_ids().is_empty());
}
