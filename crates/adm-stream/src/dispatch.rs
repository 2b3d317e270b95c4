use crate::store::Stores;
use adm_core::stream_ipc::{decode_frame, Decoded, InboundMessage, DEFAULT_MAX_FRAME_BYTES};
use adm_core::StreamEvent;
use tracing::debug;

/// What a single frame did to the stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    EventInserted { event_id: String },
    HistoryAppended { event_id: String },
    HistoryDuplicate { event_id: String },
    ApprovalQueued { approval_id: String },
    ApprovalDuplicate { approval_id: String },
    ApprovalResolved { approval_id: String },
    ApprovalAbsent { approval_id: String },
    /// Parsed, but the `type` is not one this client routes.
    Ignored { kind: String },
    /// Could not be decoded; nothing changed.
    Discarded,
}

impl DispatchOutcome {
    pub fn changed_events(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::EventInserted { .. } | DispatchOutcome::HistoryAppended { .. }
        )
    }

    pub fn changed_approvals(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::ApprovalQueued { .. } | DispatchOutcome::ApprovalResolved { .. }
        )
    }
}

pub fn dispatch(frame: &[u8], stores: &mut Stores) -> DispatchOutcome {
    dispatch_with_limit(frame, DEFAULT_MAX_FRAME_BYTES, stores)
}

pub fn dispatch_with_limit(
    frame: &[u8],
    max_frame_bytes: usize,
    stores: &mut Stores,
) -> DispatchOutcome {
    match decode_frame(frame, max_frame_bytes) {
        Ok(Decoded::Message(message)) => apply(message, stores),
        Ok(Decoded::Unrecognized { kind }) => {
            debug!(event = "stream_frame_ignored", kind = %kind);
            DispatchOutcome::Ignored { kind }
        }
        Err(err) => {
            debug!(event = "stream_decode_error", error = %err, size = frame.len());
            DispatchOutcome::Discarded
        }
    }
}

fn apply(message: InboundMessage, stores: &mut Stores) -> DispatchOutcome {
    match message {
        InboundMessage::Event { event } => {
            let event_id = event.event_id.clone();
            stores.events.push_live(event);
            DispatchOutcome::EventInserted { event_id }
        }
        InboundMessage::History { event } => {
            let event = StreamEvent::from(event);
            let event_id = event.event_id.clone();
            if stores.events.push_history(event) {
                DispatchOutcome::HistoryAppended { event_id }
            } else {
                DispatchOutcome::HistoryDuplicate { event_id }
            }
        }
        InboundMessage::Approval { approval } => {
            let approval_id = approval.approval_id.clone();
            if stores.approvals.insert(approval) {
                DispatchOutcome::ApprovalQueued { approval_id }
            } else {
                DispatchOutcome::ApprovalDuplicate { approval_id }
            }
        }
        InboundMessage::ApprovalDecided { approval } => {
            match stores.approvals.remove(&approval.approval_id) {
                Some(_) => DispatchOutcome::ApprovalResolved {
                    approval_id: approval.approval_id,
                },
                None => DispatchOutcome::ApprovalAbsent {
                    approval_id: approval.approval_id,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(id: &str) -> String {
        format!(
            r#"{{"type":"history","event":{{"event_id":"{id}","event_type":"plan.created","producer":"meta_planner","payload":{{}},"created_at":"2026-02-07T21:00:00Z"}}}}"#
        )
    }

    fn live(id: &str) -> String {
        format!(
            r#"{{"type":"event","event":{{"event_id":"{id}","event_type":"task.assigned","timestamp":"2026-02-07T21:00:00Z","producer":"meta_planner","payload":{{"plan_id":"p1"}}}}}}"#
        )
    }

    fn event_ids(stores: &Stores) -> Vec<String> {
        stores
            .events
            .iter()
            .map(|event| event.event_id.clone())
            .collect()
    }

    #[test]
    fn live_events_are_newest_first_and_capped() {
        let mut stores = Stores::default();
        for n in 0..105 {
            let outcome = dispatch(live(&format!("e{n}")).as_bytes(), &mut stores);
            assert!(outcome.changed_events());
        }
        let ids = event_ids(&stores);
        assert_eq!(ids.len(), 100);
        assert_eq!(ids.first().map(String::as_str), Some("e104"));
        assert_eq!(ids.last().map(String::as_str), Some("e5"));
    }

    #[test]
    fn repeated_history_matches_single_delivery() {
        let mut once = Stores::default();
        dispatch(history("h1").as_bytes(), &mut once);

        let mut twice = Stores::default();
        assert_eq!(
            dispatch(history("h1").as_bytes(), &mut twice),
            DispatchOutcome::HistoryAppended {
                event_id: "h1".to_string()
            }
        );
        assert_eq!(
            dispatch(history("h1").as_bytes(), &mut twice),
            DispatchOutcome::HistoryDuplicate {
                event_id: "h1".to_string()
            }
        );
        assert_eq!(once.events.snapshot(), twice.events.snapshot());
    }

    #[test]
    fn approval_lifecycle_is_idempotent() {
        let mut stores = Stores::default();
        let queued = r#"{"type":"approval","approval":{"approval_id":"a1","plan_id":"p1"}}"#;
        let decided = r#"{"type":"approval_decided","approval":{"approval_id":"a1"}}"#;

        assert!(dispatch(queued.as_bytes(), &mut stores).changed_approvals());
        assert_eq!(
            dispatch(queued.as_bytes(), &mut stores),
            DispatchOutcome::ApprovalDuplicate {
                approval_id: "a1".to_string()
            }
        );
        assert_eq!(stores.approvals.len(), 1);
        assert_eq!(
            dispatch(decided.as_bytes(), &mut stores),
            DispatchOutcome::ApprovalResolved {
                approval_id: "a1".to_string()
            }
        );
        assert_eq!(
            dispatch(decided.as_bytes(), &mut stores),
            DispatchOutcome::ApprovalAbsent {
                approval_id: "a1".to_string()
            }
        );
        assert!(stores.approvals.is_empty());
    }

    #[test]
    fn bad_frames_leave_stores_untouched() {
        let mut stores = Stores::default();
        dispatch(history("h1").as_bytes(), &mut stores);
        let before = stores.events.snapshot();

        for frame in [
            &b"not json"[..],
            &b"{\"type\":\"event\",\"event\":{}}"[..],
            &b"{\"event\":{\"event_id\":\"x\"}}"[..],
            &[0xc3u8, 0x28][..],
        ] {
            assert_eq!(dispatch(frame, &mut stores), DispatchOutcome::Discarded);
        }
        assert_eq!(
            dispatch(br#"{"type":"ping"}"#, &mut stores),
            DispatchOutcome::Ignored {
                kind: "ping".to_string()
            }
        );
        assert_eq!(
            dispatch_with_limit(live("big").as_bytes(), 16, &mut stores),
            DispatchOutcome::Discarded
        );
        assert_eq!(stores.events.snapshot(), before);
        assert!(stores.approvals.is_empty());
    }

    #[test]
    fn history_then_approval_round_trip_scenario() {
        let mut stores = Stores::default();
        dispatch(history("e1").as_bytes(), &mut stores);
        dispatch(history("e2").as_bytes(), &mut stores);
        dispatch(
            br#"{"type":"approval","approval":{"approval_id":"a1"}}"#,
            &mut stores,
        );
        dispatch(
            br#"{"type":"approval_decided","approval":{"approval_id":"a1"}}"#,
            &mut stores,
        );
        assert_eq!(event_ids(&stores), vec!["e1", "e2"]);
        assert!(stores.approvals.snapshot().is_empty());
    }
}
