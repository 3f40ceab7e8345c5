use std::time::Duration;

use serde_json::json;
use shared::{
    domain::SourceId,
    protocol::{Action, Command, InboundMessage},
};

use super::*;

fn inbound(value: serde_json::Value) -> InboundMessage {
    InboundMessage::from_value(value).expect("inbound message should classify")
}

#[test]
fn nothing_is_handed_out_while_the_channel_is_closed() {
    let mut queue = CommandQueue::new();
    queue.enqueue(Command::list_cameras());

    assert!(queue.next_to_send(false).is_none());
    assert_eq!(queue.len(), 1);
    assert!(!queue.awaiting_reply());
}

#[test]
fn second_command_waits_for_reply_to_first() {
    let mut queue = CommandQueue::new();
    let first = queue.enqueue(Command::list_cameras());
    let second = queue.enqueue(Command::start(SourceId::new("cam1")));
    assert!(second > first);

    let sent = queue.next_to_send(true).expect("head should be sent");
    assert_eq!(sent.seq, first);
    assert!(queue.next_to_send(true).is_none());

    let unrelated = inbound(json!({"action": "counter_update", "data": {"person": 2}}));
    assert!(queue
        .acknowledge(&unrelated, AckDiscipline::ExplicitReply)
        .is_none());
    assert!(queue.next_to_send(true).is_none());

    let reply = inbound(json!({"action": "list_cameras", "data": []}));
    let released = queue
        .acknowledge(&reply, AckDiscipline::ExplicitReply)
        .expect("reply releases the gate");
    assert_eq!(released.seq, first);

    let next = queue.next_to_send(true).expect("second command follows");
    assert_eq!(next.seq, second);
    assert_eq!(next.command.action, Action::Start);
}

#[test]
fn any_message_discipline_releases_on_pushes() {
    let mut queue = CommandQueue::new();
    queue.enqueue(Command::get_status());
    queue.next_to_send(true).expect("sent");

    let push = inbound(json!({"action": "task_progress", "data": {"progress": 10}}));
    assert!(queue.acknowledge(&push, AckDiscipline::AnyMessage).is_some());
    assert!(!queue.awaiting_reply());
}

#[test]
fn push_names_release_only_under_push_alias() {
    let mut queue = CommandQueue::new();
    queue.enqueue(Command::move_tilt(30.0));
    queue.next_to_send(true).expect("sent");

    let push = inbound(json!({"action": "update_tilt", "data": {"angle": 30}}));
    assert!(queue
        .acknowledge(&push, AckDiscipline::ExplicitReply)
        .is_none());
    assert!(queue.acknowledge(&push, AckDiscipline::PushAlias).is_some());
}

#[test]
fn acknowledge_without_in_flight_is_a_no_op() {
    let mut queue = CommandQueue::new();
    queue.enqueue(Command::get_status());
    let reply = inbound(json!({"action": "status", "data": {}}));

    assert!(queue.acknowledge(&reply, AckDiscipline::AnyMessage).is_none());
    assert_eq!(queue.len(), 1);
}

#[test]
fn commands_leave_in_enqueue_order_one_per_reply() {
    let mut queue = CommandQueue::new();
    let angles = [0.0, 90.0, 180.0, 270.0];
    for angle in angles {
        queue.enqueue(Command::move_platform(angle));
    }

    let mut sent = Vec::new();
    while let Some(next) = queue.next_to_send(true) {
        assert!(queue.next_to_send(true).is_none());
        sent.push(next.command.data.clone());
        let reply = inbound(json!({"action": "move_platform", "data": {"angle": 0}}));
        queue.acknowledge(&reply, AckDiscipline::ExplicitReply);
    }

    let expected: Vec<_> = angles
        .iter()
        .map(|angle| Some(json!({ "angle": angle })))
        .collect();
    assert_eq!(sent, expected);
}

#[test]
fn requeue_puts_unsent_command_back_at_the_head() {
    let mut queue = CommandQueue::new();
    let first = queue.enqueue(Command::list_cameras());
    queue.enqueue(Command::get_status());

    queue.next_to_send(true).expect("sent");
    queue.requeue_unsent();

    assert!(!queue.awaiting_reply());
    assert_eq!(queue.pending().next().map(|queued| queued.seq), Some(first));
    assert_eq!(queue.len(), 2);
}

#[test]
fn lost_command_is_not_retransmitted() {
    let mut queue = CommandQueue::new();
    let first = queue.enqueue(Command::stop_task());
    let second = queue.enqueue(Command::get_status());
    queue.next_to_send(true).expect("sent");

    let lost = queue.take_lost().expect("in-flight command is lost");
    assert_eq!(lost.seq, first);
    assert_eq!(
        queue.next_to_send(true).map(|queued| queued.seq),
        Some(second)
    );
}

#[tokio::test(start_paused = true)]
async fn reply_deadline_expires_the_in_flight_command() {
    let timeout = Duration::from_secs(10);
    let mut queue = CommandQueue::new();
    queue.enqueue(Command::get_health(SourceId::new("cam1")));
    assert!(queue.reply_deadline(timeout).is_none());

    queue.next_to_send(true).expect("sent");
    let deadline = queue.reply_deadline(timeout).expect("deadline armed");

    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(queue.expire(Instant::now(), timeout).is_none());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(Instant::now() >= deadline);
    let expired = queue
        .expire(Instant::now(), timeout)
        .expect("command expires");
    assert_eq!(expired.command.action, Action::GetHealth);
    assert!(!queue.awaiting_reply());
}
