//! Inbound multiplexer: one queue in, one ordered lane per user out.
//!
//! Messages from the same user are handled strictly in arrival order so each
//! prompt sees the previous exchange. Different users run concurrently.
//!
//! The run loop is the only writer to the lane map. A lane whose pending count
//! is zero has an empty queue and is not mid-message, so a periodic sweep can
//! drop its sender and let the task exit without reordering anything.

use crate::commands::{AdminCommands, parse_command};
use crate::dispatch::{Dispatcher, Handled};
use anyhow::Result;
use lumi_channels::{ChannelAdapter, InboundMessage, OutboundMessage, SenderId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const DEFAULT_LANE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Lane {
    tx: mpsc::UnboundedSender<InboundMessage>,
    /// Enqueued but not yet fully handled.
    pending: Arc<AtomicUsize>,
}

/// Decrements the live-lane gauge when a lane task ends, panics included.
struct LaneGauge(Arc<AtomicUsize>);

impl Drop for LaneGauge {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Gateway {
    command_prefix: String,
    dispatcher: Arc<Dispatcher>,
    commands: Arc<AdminCommands>,
    channel: Arc<dyn ChannelAdapter>,
    lane_sweep_interval: Duration,
    live_lanes: Arc<AtomicUsize>,
}

impl Gateway {
    pub fn new(
        command_prefix: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        commands: Arc<AdminCommands>,
        channel: Arc<dyn ChannelAdapter>,
    ) -> Self {
        Self {
            command_prefix: command_prefix.into(),
            dispatcher,
            commands,
            channel,
            lane_sweep_interval: DEFAULT_LANE_SWEEP_INTERVAL,
            live_lanes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_lane_sweep_interval(mut self, interval: Duration) -> Self {
        self.lane_sweep_interval = interval;
        self
    }

    /// Lane tasks currently alive.
    pub fn live_lanes(&self) -> usize {
        self.live_lanes.load(Ordering::SeqCst)
    }

    /// Drain `inbound_rx` until it closes or `shutdown` fires, then let every
    /// lane finish what it already queued.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) {
        let mut lanes: HashMap<SenderId, Lane> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut sweep = tokio::time::interval(self.lane_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    retire_idle_lanes(&mut lanes, &mut tasks);
                    continue;
                }
                msg = inbound_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.enqueue(&mut lanes, &mut tasks, inbound);
        }

        tracing::info!(
            lanes = lanes.len(),
            live_lanes = self.live_lanes(),
            "gateway draining user lanes"
        );
        drop(lanes);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "user lane task failed");
            }
        }
    }

    fn enqueue(
        self: &Arc<Self>,
        lanes: &mut HashMap<SenderId, Lane>,
        tasks: &mut JoinSet<()>,
        inbound: InboundMessage,
    ) {
        let user_id = inbound.sender_id.clone();
        let inbound = match lanes.get(&user_id) {
            Some(lane) => {
                lane.pending.fetch_add(1, Ordering::SeqCst);
                match lane.tx.send(inbound) {
                    Ok(()) => return,
                    // The lane task is gone; start a fresh one below.
                    Err(mpsc::error::SendError(inbound)) => {
                        tracing::warn!(%user_id, "user lane closed unexpectedly; restarting");
                        inbound
                    }
                }
            }
            None => inbound,
        };

        let (tx, mut lane_rx) = mpsc::unbounded_channel::<InboundMessage>();
        let pending = Arc::new(AtomicUsize::new(1));
        self.live_lanes.fetch_add(1, Ordering::SeqCst);
        let gauge = LaneGauge(self.live_lanes.clone());
        let gateway = self.clone();
        let lane_pending = pending.clone();
        tasks.spawn(async move {
            let _gauge = gauge;
            while let Some(msg) = lane_rx.recv().await {
                if let Err(e) = gateway.handle_inbound(&msg).await {
                    tracing::warn!(%e, user_id = %msg.sender_id, "handle_inbound failed");
                }
                lane_pending.fetch_sub(1, Ordering::SeqCst);
            }
        });
        if tx.send(inbound).is_err() {
            tracing::error!(%user_id, "new user lane rejected its first message");
            return;
        }
        lanes.insert(user_id, Lane { tx, pending });
    }

    /// Commands are answered directly and never reach the completion endpoint.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(message_id = %inbound.message_id, user_id = %inbound.sender_id)
    )]
    pub async fn handle_inbound(&self, inbound: &InboundMessage) -> Result<()> {
        if let Some(parsed) = parse_command(&self.command_prefix, &inbound.content) {
            let reply = self.commands.execute(inbound, parsed).await.into_message();
            self.channel
                .send(&inbound.channel_id, OutboundMessage::text(reply))
                .await?;
            return Ok(());
        }

        match self.dispatcher.handle(inbound).await? {
            Handled::Ignored => tracing::trace!("message does not qualify; ignored"),
            Handled::Replied => tracing::debug!("reply sent"),
            Handled::Apologized => tracing::debug!("fallback reply sent"),
        }
        Ok(())
    }
}

/// Drop senders of lanes with nothing queued or in flight, and reap finished tasks.
fn retire_idle_lanes(lanes: &mut HashMap<SenderId, Lane>, tasks: &mut JoinSet<()>) {
    let before = lanes.len();
    lanes.retain(|_, lane| lane.pending.load(Ordering::SeqCst) > 0);
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            tracing::error!(error = %e, "user lane task failed");
        }
    }
    let retired = before - lanes.len();
    if retired > 0 {
        tracing::debug!(retired, remaining = lanes.len(), "retired idle user lanes");
    }
}
