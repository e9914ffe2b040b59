use std::collections::HashSet;

use shared::domain::{DeliveryState, Message, MessageId, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The local entry now carries the server identity, at `index`.
    Reconciled { index: usize },
    /// No local entry with that correlation id; nothing changed.
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted { index: usize },
    /// The push echoed one of our own pending sends.
    Reconciled { index: usize },
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub reconciled: usize,
    pub duplicates: usize,
}

/// Ordered, duplicate-free message log of one conversation.
///
/// Entries are kept ascending by `created_at` after every mutation; entries
/// with equal timestamps keep arrival order.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    promoted: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.iter().find(|message| &message.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.get(id).is_some()
    }

    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter(|message| message.is_pending())
            .map(|message| message.id.clone())
            .collect()
    }

    pub fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at)
    }

    /// Optimistic insert of a local send. Refuses ids that are not local,
    /// already present, or already promoted to a server id.
    pub fn insert_pending(&mut self, message: Message) -> Option<usize> {
        let MessageId::Local(correlation_id) = &message.id else {
            return None;
        };
        if self.promoted.contains(correlation_id) || self.contains(&message.id) {
            return None;
        }
        let index = self.insertion_index(&message);
        self.entries.insert(index, message);
        Some(index)
    }

    /// Replaces the local entry matching the ack's correlation id in place
    /// with the server-authoritative fields. A send already marked Failed is
    /// reconciled too: the server has it after all.
    pub fn reconcile_ack(&mut self, ack: &WireMessage) -> AckOutcome {
        match self.promote(ack) {
            Some(index) => AckOutcome::Reconciled {
                index: self.reposition(index),
            },
            None => AckOutcome::Unmatched,
        }
    }

    /// Live push of a message. Re-delivery of a known server id is ignored.
    pub fn insert_push(&mut self, wire: WireMessage) -> PushOutcome {
        if self.contains(&MessageId::Server(wire.id.clone())) {
            return PushOutcome::Duplicate;
        }
        if let Some(index) = self.promote(&wire) {
            return PushOutcome::Reconciled {
                index: self.reposition(index),
            };
        }
        let message = Message::from(wire);
        let index = self.insertion_index(&message);
        self.entries.insert(index, message);
        PushOutcome::Inserted { index }
    }

    /// Merges a fetched history page with whatever is already buffered,
    /// de-duplicating by id, then re-sorts the whole log.
    pub fn merge_history(&mut self, page: Vec<WireMessage>) -> MergeStats {
        let mut stats = MergeStats::default();
        let mut known: HashSet<String> = self
            .entries
            .iter()
            .filter_map(|message| match &message.id {
                MessageId::Server(id) => Some(id.clone()),
                MessageId::Local(_) => None,
            })
            .collect();

        for wire in page {
            if known.contains(&wire.id) {
                stats.duplicates += 1;
                continue;
            }
            known.insert(wire.id.clone());
            if self.promote(&wire).is_some() {
                stats.reconciled += 1;
                continue;
            }
            self.entries.push(Message::from(wire));
            stats.inserted += 1;
        }

        self.entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stats
    }

    /// Pending → Failed. Entries in any other state are left alone. A Failed
    /// entry still reconciles with its server copy when one arrives.
    pub fn fail_pending(&mut self, id: &MessageId) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|message| &message.id == id && message.is_pending())
        {
            Some(message) => {
                message.delivery_state = DeliveryState::Failed;
                true
            }
            None => false,
        }
    }

    fn insertion_index(&self, message: &Message) -> usize {
        self.entries
            .partition_point(|existing| existing.created_at <= message.created_at)
    }

    /// Applies server fields to the Pending or Failed entry whose correlation
    /// id matches `wire.client_id`. Returns its (unmoved) index.
    fn promote(&mut self, wire: &WireMessage) -> Option<usize> {
        let client_id = wire.client_id.as_deref()?;
        let local = MessageId::Local(client_id.to_string());
        let mut index = self.entries.iter().position(|message| message.id == local)?;

        // A copy of the persisted message may already be present (history
        // page without correlation id); the promoted entry supersedes it.
        let server_id = MessageId::Server(wire.id.clone());
        if let Some(copy) = self.entries.iter().position(|message| message.id == server_id) {
            self.entries.remove(copy);
            if copy < index {
                index -= 1;
            }
        }

        let entry = &mut self.entries[index];
        entry.id = MessageId::Server(wire.id.clone());
        if let Some(created_at) = wire.created_at {
            entry.created_at = created_at;
        }
        entry.is_read = wire.is_read;
        entry.message_type = wire.message_type.clone();
        if !wire.content.is_empty() {
            entry.content = wire.content.clone();
        }
        entry.delivery_state = DeliveryState::Acknowledged;
        self.promoted.insert(client_id.to_string());
        Some(index)
    }

    /// Restores ordering around `index` after its timestamp changed, moving
    /// only that entry. Returns its final index.
    fn reposition(&mut self, index: usize) -> usize {
        let created_at = self.entries[index].created_at;

        if index > 0 && self.entries[index - 1].created_at > created_at {
            let target = self.entries[..index].partition_point(|m| m.created_at <= created_at);
            self.entries[target..=index].rotate_right(1);
            return target;
        }

        if index + 1 < self.entries.len() && self.entries[index + 1].created_at < created_at {
            let after = self.entries[index + 1..].partition_point(|m| m.created_at <= created_at);
            self.entries[index..=index + after].rotate_left(1);
            return index + after;
        }

        index
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
