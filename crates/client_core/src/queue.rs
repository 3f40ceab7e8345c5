//! Outbound FIFO with a single-slot acknowledgement gate.
//!
//! At most one command is in flight. The head of the queue is handed out
//! only while the channel is open and nothing is awaiting a reply; the gate
//! is cleared by an acknowledgement, by loss of the connection, or by the
//! reply deadline expiring.

use std::{collections::VecDeque, time::Duration};

use shared::protocol::{Command, InboundMessage};
use tokio::time::Instant;

use crate::settings::AckDiscipline;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub seq: u64,
    pub command: Command,
}

#[derive(Debug)]
struct InFlight {
    queued: QueuedCommand,
    sent_at: Instant,
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<QueuedCommand>,
    in_flight: Option<InFlight>,
    next_seq: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, command: Command) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.pending.push_back(QueuedCommand { seq, command });
        seq
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueuedCommand> {
        self.pending.iter()
    }

    pub fn awaiting_reply(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&QueuedCommand> {
        self.in_flight.as_ref().map(|in_flight| &in_flight.queued)
    }

    /// Removes the head for transmission iff the channel is open, the gate
    /// is clear and the queue is non-empty. Closes the gate.
    pub fn next_to_send(&mut self, channel_open: bool) -> Option<QueuedCommand> {
        if !channel_open || self.in_flight.is_some() {
            return None;
        }
        let queued = self.pending.pop_front()?;
        self.in_flight = Some(InFlight {
            queued: queued.clone(),
            sent_at: Instant::now(),
        });
        Some(queued)
    }

    /// The head could not be handed to the channel; it was never sent.
    pub fn requeue_unsent(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            self.pending.push_front(in_flight.queued);
        }
    }

    /// Releases the gate if `message` acknowledges the in-flight command
    /// under `discipline`. Returns the released command.
    pub fn acknowledge(
        &mut self,
        message: &InboundMessage,
        discipline: AckDiscipline,
    ) -> Option<QueuedCommand> {
        let in_flight = self.in_flight.as_ref()?;
        let released = match discipline {
            AckDiscipline::AnyMessage => true,
            AckDiscipline::ExplicitReply => message.answers(&in_flight.queued.command),
            AckDiscipline::PushAlias => message.answers_by_alias(&in_flight.queued.command),
        };
        if released {
            self.release()
        } else {
            None
        }
    }

    pub fn release(&mut self) -> Option<QueuedCommand> {
        self.in_flight.take().map(|in_flight| in_flight.queued)
    }

    /// Connection dropped with a command outstanding; its fate is unknown.
    pub fn take_lost(&mut self) -> Option<QueuedCommand> {
        self.release()
    }

    pub fn reply_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.in_flight
            .as_ref()
            .map(|in_flight| in_flight.sent_at + timeout)
    }

    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Option<QueuedCommand> {
        let deadline = self.reply_deadline(timeout)?;
        if now >= deadline {
            self.release()
        } else {
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
