//! Cross-context broadcaster
//!
//! A `BroadcastHub` is the process-wide registry of channels, one per storage
//! location. Each channel fans committed batches out to every subscribed
//! context over bounded queues and routes leader-only requests (snapshots,
//! forwarded writes) to the single registered leader endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libloam_core::{ContextId, ExecutionItem};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::IpcError;
use crate::messages::{Ack, BroadcastMessage, LeaderRequest, Rejection, Snapshot};

/// Registry of broadcast channels keyed by storage location
#[derive(Debug, Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, BroadcastChannel>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the channel for `name`
    pub fn channel(&self, name: &str, capacity: usize) -> BroadcastChannel {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(name.to_string())
            .or_insert_with(|| BroadcastChannel::new(name, capacity))
            .clone()
    }

    pub fn channel_names(&self) -> Vec<String> {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug)]
struct Subscriber {
    context: ContextId,
    tx: mpsc::Sender<BroadcastMessage>,
}

#[derive(Debug)]
struct LeaderEndpoint {
    context: ContextId,
    tx: mpsc::Sender<LeaderRequest>,
}

#[derive(Debug, Default)]
struct ChannelState {
    subscribers: Vec<Subscriber>,
    leader: Option<LeaderEndpoint>,
}

/// One storage location's channel
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    name: Arc<str>,
    capacity: usize,
    state: Arc<Mutex<ChannelState>>,
}

impl BroadcastChannel {
    fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: Arc::from(name),
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(ChannelState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `context` for fan-out. A context has at most one queue;
    /// subscribing again replaces it.
    pub fn subscribe(&self, context: ContextId) -> mpsc::Receiver<BroadcastMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state();
        state.subscribers.retain(|s| s.context != context);
        state.subscribers.push(Subscriber { context, tx });
        debug!(channel = %self.name, context = %context, "subscribed");
        rx
    }

    pub fn unsubscribe(&self, context: ContextId) {
        self.state().subscribers.retain(|s| s.context != context);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    /// Deliver `message` to every subscriber except its sender, in order.
    ///
    /// A full queue applies back-pressure to the publisher. Subscribers whose
    /// receiver is gone are dropped. Returns the number of deliveries.
    pub async fn publish(&self, message: BroadcastMessage) -> usize {
        let sender = message.sender();
        let targets: Vec<(ContextId, mpsc::Sender<BroadcastMessage>)> = self
            .state()
            .subscribers
            .iter()
            .filter(|s| s.context != sender)
            .map(|s| (s.context, s.tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (context, tx) in targets {
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
            } else {
                gone.push(context);
            }
        }

        if !gone.is_empty() {
            warn!(channel = %self.name, dropped = gone.len(), "dropping closed subscribers");
            self.state()
                .subscribers
                .retain(|s| !gone.contains(&s.context));
        }
        debug!(
            channel = %self.name,
            kind = message.notification_type(),
            delivered,
            "published"
        );
        delivered
    }

    /// Install `context` as the channel's leader endpoint
    pub fn register_leader(
        &self,
        context: ContextId,
    ) -> Result<mpsc::Receiver<LeaderRequest>, IpcError> {
        let mut state = self.state();
        if let Some(existing) = &state.leader {
            if existing.context != context && !existing.tx.is_closed() {
                return Err(IpcError::LeaderConflict(existing.context));
            }
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        state.leader = Some(LeaderEndpoint { context, tx });
        debug!(channel = %self.name, leader = %context, "leader registered");
        Ok(rx)
    }

    /// Remove the leader endpoint if it still belongs to `context`
    pub fn unregister_leader(&self, context: ContextId) {
        let mut state = self.state();
        if state.leader.as_ref().map(|l| l.context) == Some(context) {
            state.leader = None;
        }
    }

    pub fn leader(&self) -> Option<ContextId> {
        self.state()
            .leader
            .as_ref()
            .filter(|l| !l.tx.is_closed())
            .map(|l| l.context)
    }

    fn leader_tx(&self) -> Result<mpsc::Sender<LeaderRequest>, IpcError> {
        self.state()
            .leader
            .as_ref()
            .filter(|l| !l.tx.is_closed())
            .map(|l| l.tx.clone())
            .ok_or(IpcError::NoLeader)
    }

    /// Ask the leader for a snapshot of the application store
    pub async fn request_snapshot(&self) -> Result<Snapshot, IpcError> {
        let tx = self.leader_tx()?;
        let (reply, rx) = oneshot::channel();
        tx.send(LeaderRequest::Snapshot { reply })
            .await
            .map_err(|_| IpcError::NoLeader)?;
        rx.await
            .map_err(|_| IpcError::ChannelClosed)?
            .map_err(rejected)
    }

    /// Hand a write batch to the leader and wait for it to commit
    pub async fn forward(
        &self,
        sender: ContextId,
        items: Vec<ExecutionItem>,
    ) -> Result<Ack, IpcError> {
        let tx = self.leader_tx()?;
        let (reply, rx) = oneshot::channel();
        tx.send(LeaderRequest::Forward {
            sender,
            items,
            reply,
        })
        .await
        .map_err(|_| IpcError::NoLeader)?;
        rx.await
            .map_err(|_| IpcError::ChannelClosed)?
            .map_err(rejected)
    }
}

fn rejected(r: Rejection) -> IpcError {
    IpcError::Rejected {
        code: r.code,
        message: r.message,
        fatal: r.fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn committed(sender: ContextId, seq: u64) -> BroadcastMessage {
        BroadcastMessage::committed(sender, seq, Vec::new(), BTreeSet::new())
    }

    #[tokio::test]
    async fn test_publish_skips_sender() {
        let hub = BroadcastHub::new();
        let channel = hub.channel("loc", 8);
        let a = ContextId::generate();
        let b = ContextId::generate();
        let mut rx_a = channel.subscribe(a);
        let mut rx_b = channel.subscribe(b);

        assert_eq!(channel.publish(committed(a, 1)).await, 1);
        assert_eq!(rx_b.recv().await.unwrap(), committed(a, 1));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_name_shares_channel() {
        let hub = BroadcastHub::new();
        let a = ContextId::generate();
        let mut rx = hub.channel("loc", 8).subscribe(a);
        hub.channel("loc", 8)
            .publish(BroadcastMessage::LeaderReleased {
                leader: ContextId::generate(),
            })
            .await;
        assert_eq!(rx.recv().await.unwrap().notification_type(), "leader_released");
        assert!(hub.channel("other", 8).subscriber_count() == 0);
        assert_eq!(hub.channel_names(), vec!["loc".to_string(), "other".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let hub = BroadcastHub::new();
        let channel = hub.channel("loc", 8);
        let rx = channel.subscribe(ContextId::generate());
        drop(rx);
        assert_eq!(channel.publish(committed(ContextId::generate(), 1)).await, 0);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let hub = BroadcastHub::new();
        let channel = hub.channel("loc", 2);
        let leader = ContextId::generate();
        let mut rx = channel.subscribe(ContextId::generate());

        let publisher = {
            let channel = channel.clone();
            tokio::spawn(async move {
                for seq in 1..=10 {
                    channel.publish(committed(leader, seq)).await;
                }
            })
        };
        for expected in 1..=10 {
            match rx.recv().await.unwrap() {
                BroadcastMessage::Committed { seq, .. } => assert_eq!(seq, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_leader_conflicts() {
        let hub = BroadcastHub::new();
        let channel = hub.channel("loc", 8);
        let a = ContextId::generate();
        let _rx = channel.register_leader(a).unwrap();
        let err = channel.register_leader(ContextId::generate()).unwrap_err();
        assert!(matches!(err, IpcError::LeaderConflict(c) if c == a));
        assert_eq!(channel.leader(), Some(a));

        channel.unregister_leader(a);
        assert_eq!(channel.leader(), None);
    }

    #[tokio::test]
    async fn test_no_leader() {
        let hub = BroadcastHub::new();
        let channel = hub.channel("loc", 8);
        assert!(matches!(
            channel.request_snapshot().await,
            Err(IpcError::NoLeader)
        ));
        assert!(matches!(
            channel.forward(ContextId::generate(), Vec::new()).await,
            Err(IpcError::NoLeader)
        ));
    }

    #[tokio::test]
    async fn test_forward_reaches_leader() {
        let hub = BroadcastHub::new();
        let channel = hub.channel("loc", 8);
        let leader = ContextId::generate();
        let mut requests = channel.register_leader(leader).unwrap();
        tokio::spawn(async move {
            while let Some(req) = requests.recv().await {
                match req {
                    LeaderRequest::Forward { items, reply, .. } => {
                        let result = if items.is_empty() {
                            Err(Rejection {
                                code: "invalid_args".to_string(),
                                message: "empty batch".to_string(),
                                fatal: false,
                            })
                        } else {
                            Ok(Ack { leader, seq: 1 })
                        };
                        let _ = reply.send(result);
                    }
                    LeaderRequest::Snapshot { reply } => {
                        let _ = reply.send(Ok(Snapshot {
                            leader,
                            seq: 7,
                            app_bytes: vec![1, 2],
                        }));
                    }
                }
            }
        });

        let snapshot = channel.request_snapshot().await.unwrap();
        assert_eq!(snapshot.seq, 7);
        assert_eq!(snapshot.leader, leader);

        let err = channel
            .forward(ContextId::generate(), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_args");
        assert!(!err.is_fatal());

        let item = ExecutionItem::execute("DELETE FROM t", serde_json::Value::Null, BTreeSet::new());
        let ack = channel
            .forward(ContextId::generate(), vec![item])
            .await
            .unwrap();
        assert_eq!(ack, Ack { leader, seq: 1 });
    }
}
