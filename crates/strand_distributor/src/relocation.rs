//! Relocation requests and the two delivery paths feeding the queue.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use strand_core::{KeyRange, Uid};

use crate::initial::DataMove;

/// Relocation priorities, higher is more urgent. The queue schedules by
/// these and the disabled-state trace events report per-priority counts.
pub mod priority {
    pub const RECOVER_MOVE: i32 = 110;
    pub const REBALANCE_UNDERUTILIZED_TEAM: i32 = 120;
    pub const REBALANCE_OVERUTILIZED_TEAM: i32 = 122;
    pub const TEAM_HEALTHY: i32 = 140;
    pub const TEAM_CONTAINS_UNDESIRED_SERVER: i32 = 150;
    pub const TEAM_REDUNDANT: i32 = 200;
    pub const MERGE_PHYSICAL_SHARD: i32 = 330;
    pub const MERGE_SHARD: i32 = 340;
    pub const TEAM_UNHEALTHY: i32 = 700;
    pub const TEAM_2_LEFT: i32 = 709;
    pub const TEAM_1_LEFT: i32 = 800;
    pub const TEAM_0_LEFT: i32 = 809;
    pub const SPLIT_SHARD: i32 = 950;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocateReason {
    Other,
    RebalanceDisk,
    RebalanceRead,
    MergeShard,
    SizeSplit,
}

/// One request to move a key range.
#[derive(Clone, Debug)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub priority: i32,
    pub reason: RelocateReason,
    /// Set when the relocation restores or cancels a persisted data move.
    pub data_move_id: Option<Uid>,
    pub data_move: Option<Arc<Mutex<DataMove>>>,
    pub cancelled: bool,
}

impl RelocateShard {
    pub fn new(keys: KeyRange, priority: i32, reason: RelocateReason) -> Self {
        Self {
            keys,
            priority,
            reason,
            data_move_id: None,
            data_move: None,
            cancelled: false,
        }
    }
}

/// Events routed through the runtime-monitor buffer when the framework knob
/// is on.
#[derive(Clone, Debug)]
pub struct DdEvent {
    pub priority: i32,
    pub payload: DdEventPayload,
}

#[derive(Clone, Debug)]
pub enum DdEventPayload {
    Relocation(RelocateShard),
    MergePhysicalShard(u64),
}

/// Sender half of the relocation plumbing. Two delivery paths exist: the
/// direct output channel consumed by the queue, and the event buffer drained
/// by the runtime monitor. `dd_framework` selects which one carries
/// relocations; the other stays wired.
#[derive(Clone)]
pub struct RelocationSender {
    framework: bool,
    output: mpsc::UnboundedSender<RelocateShard>,
    events: mpsc::UnboundedSender<DdEvent>,
}

impl RelocationSender {
    pub fn new(
        framework: bool,
        output: mpsc::UnboundedSender<RelocateShard>,
        events: mpsc::UnboundedSender<DdEvent>,
    ) -> Self {
        Self {
            framework,
            output,
            events,
        }
    }

    pub fn send(&self, rs: RelocateShard) {
        if self.framework {
            let _ = self.events.send(DdEvent {
                priority: rs.priority,
                payload: DdEventPayload::Relocation(rs),
            });
        } else {
            let _ = self.output.send(rs);
        }
    }

    pub fn send_event(&self, event: DdEvent) {
        let _ = self.events.send(event);
    }
}

/// Forward relocations from the producer side to the queue's input,
/// yielding between messages so a burst cannot starve other tasks.
pub async fn yield_relocation_stream(
    mut output: mpsc::UnboundedReceiver<RelocateShard>,
    input: mpsc::UnboundedSender<RelocateShard>,
) -> strand_core::Result<()> {
    while let Some(rs) = output.recv().await {
        if input.send(rs).is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (
        RelocationSender,
        mpsc::UnboundedReceiver<RelocateShard>,
        mpsc::UnboundedReceiver<DdEvent>,
        mpsc::UnboundedSender<RelocateShard>,
        mpsc::UnboundedSender<DdEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            RelocationSender::new(false, out_tx.clone(), ev_tx.clone()),
            out_rx,
            ev_rx,
            out_tx,
            ev_tx,
        )
    }

    #[tokio::test]
    async fn direct_path_preserves_fifo_order() {
        let (sender, mut out_rx, mut ev_rx, _o, _e) = channels();
        for p in [1, 2, 3] {
            sender.send(RelocateShard::new(
                KeyRange::all(),
                p,
                RelocateReason::Other,
            ));
        }
        for expect in [1, 2, 3] {
            assert_eq!(out_rx.recv().await.unwrap().priority, expect);
        }
        assert!(ev_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn framework_path_routes_through_the_event_buffer() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let sender = RelocationSender::new(true, out_tx, ev_tx);

        sender.send(RelocateShard::new(
            KeyRange::all(),
            priority::RECOVER_MOVE,
            RelocateReason::Other,
        ));

        let event = ev_rx.recv().await.unwrap();
        assert_eq!(event.priority, priority::RECOVER_MOVE);
        assert!(matches!(event.payload, DdEventPayload::Relocation(_)));
        assert!(out_rx.try_recv().is_err());
    }
}
