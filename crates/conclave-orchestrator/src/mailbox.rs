use chrono::{DateTime, Utc};
use conclave_core::{AgentId, CoordinationEvent, EventBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// A message passed between agents through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Per-engine sequence number, starting at 1.
    pub id: u64,
    /// Sending agent.
    pub from: AgentId,
    /// Recipient; `None` when the message was broadcast.
    pub to: Option<AgentId>,
    /// Routing topic chosen by the sender.
    pub topic: String,
    /// Opaque content.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
}

#[derive(Default)]
struct Boxes {
    next_id: u64,
    queues: HashMap<AgentId, VecDeque<AgentMessage>>,
}

/// Per-agent bounded inboxes.
///
/// Sending publishes `MessageSent` once per message; draining an inbox
/// publishes `MessageReceived` once per delivered message. The mailbox does
/// not know which agents exist; callers resolve recipients first.
pub struct Mailbox {
    boxes: Mutex<Boxes>,
    capacity: usize,
    bus: Arc<EventBus>,
}

impl Mailbox {
    /// Inboxes holding at most `capacity` undelivered messages each.
    pub fn new(capacity: usize, bus: Arc<EventBus>) -> Self {
        Self {
            boxes: Mutex::new(Boxes::default()),
            capacity: capacity.max(1),
            bus,
        }
    }

    /// Queue one message for every agent in `recipients`.
    ///
    /// `to` is what the sender addressed (`None` for a broadcast) and is
    /// copied into the message and the event. Returns the message id.
    pub fn send(
        &self,
        from: AgentId,
        to: Option<AgentId>,
        recipients: &[AgentId],
        topic: &str,
        payload: serde_json::Value,
    ) -> u64 {
        let mut boxes = self.boxes.lock();
        boxes.next_id += 1;
        let message = AgentMessage {
            id: boxes.next_id,
            from,
            to,
            topic: topic.to_string(),
            payload,
            sent_at: Utc::now(),
        };
        for recipient in recipients {
            let queue = boxes.queues.entry(*recipient).or_default();
            queue.push_back(message.clone());
            if queue.len() > self.capacity {
                queue.pop_front();
                warn!(agent_id = %recipient, capacity = self.capacity, "mailbox full, oldest message dropped");
            }
        }
        debug!(from = %from, recipients = recipients.len(), topic = %topic, "message sent");
        self.bus.publish(CoordinationEvent::MessageSent {
            from,
            to,
            topic: message.topic,
        });
        message.id
    }

    /// Drain the agent's inbox, oldest first.
    pub fn receive(&self, agent_id: AgentId) -> Vec<AgentMessage> {
        let drained: Vec<AgentMessage> = self
            .boxes
            .lock()
            .queues
            .remove(&agent_id)
            .map(Vec::from)
            .unwrap_or_default();
        for message in &drained {
            self.bus.publish(CoordinationEvent::MessageReceived {
                agent_id,
                topic: message.topic.clone(),
            });
        }
        drained
    }

    /// Undelivered messages waiting for `agent_id`.
    pub fn pending(&self, agent_id: AgentId) -> usize {
        self.boxes
            .lock()
            .queues
            .get(&agent_id)
            .map_or(0, VecDeque::len)
    }

    /// Discard the inbox of an agent that went away.
    pub fn discard(&self, agent_id: AgentId) -> usize {
        self.boxes
            .lock()
            .queues
            .remove(&agent_id)
            .map_or(0, |queue| queue.len())
    }
}
