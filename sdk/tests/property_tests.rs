use courier_sdk::envelope::{
    Envelope, FailureKind, PayloadRef, ProgressEvent, ResultEnvelope, ResultPayload, Stage,
    TaskEnvelope,
};
use courier_sdk::errors::{CourierErrorExt, DispatchError};
use courier_sdk::Capability;
use proptest::prelude::*;

fn capability_strategy() -> impl Strategy<Value = Capability> {
    prop_oneof![
        Just(Capability::Document),
        Just(Capability::Audio),
        Just(Capability::Image),
    ]
}

fn payload_strategy() -> impl Strategy<Value = PayloadRef> {
    (
        "[A-Za-z0-9_-]{1,40}",
        proptest::option::of("[a-zA-Z0-9 _-]{1,20}\\.[a-z]{1,4}"),
        proptest::option::of(0u64..100_000_000),
        proptest::option::of(0u32..10_000),
    )
        .prop_map(|(file_id, name, size, duration)| {
            let mut payload = PayloadRef::telegram(&file_id);
            payload.file_name = name;
            payload.size_bytes = size;
            payload.duration_secs = duration;
            payload
        })
}

// Error hints are static, non-empty and never echo the internal detail
proptest! {
    #[test]
    fn test_error_user_hint_completeness(detail in "[a-z/._]{12,40}") {
        let errs = vec![
            DispatchError::BusUnavailable(detail.clone()),
            DispatchError::Envelope(detail.clone()),
            DispatchError::Classification(detail.clone()),
            DispatchError::ArtifactDownload(detail.clone()),
            DispatchError::Extraction(detail.clone()),
            DispatchError::Analysis(detail.clone()),
            DispatchError::DispatchTimeout(detail.clone()),
            DispatchError::Config(detail.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(!hint.contains(&detail));
        }
    }
}

// Envelopes survive the wire unchanged
proptest! {
    #[test]
    fn test_task_envelope_roundtrip(
        capability in capability_strategy(),
        conversation in "-?[0-9]{1,15}",
        originator in "[0-9]{1,12}",
        payload in payload_strategy(),
    ) {
        let task = TaskEnvelope::new(capability, conversation, originator, payload);
        let decoded = TaskEnvelope::decode(&task.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded, task);
    }

    #[test]
    fn test_result_envelope_roundtrip(
        capability in capability_strategy(),
        summary in "\\PC{0,200}",
        truncated in any::<bool>(),
        degraded in any::<bool>(),
        failed in any::<bool>(),
    ) {
        let task = TaskEnvelope::new(capability, "C1", "U1", PayloadRef::telegram("f"));
        let result = if failed {
            ResultEnvelope::failure(&task, FailureKind::Extraction, summary)
        } else {
            ResultEnvelope::for_task(&task, ResultPayload::Analysis {
                summary,
                excerpt: None,
                artifact_name: None,
                truncated,
                degraded,
            })
        };

        let decoded = ResultEnvelope::decode(&result.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded.is_ok(), !failed);
        prop_assert_eq!(decoded, result);
    }

    #[test]
    fn test_progress_event_roundtrip(conversation in "[0-9]{1,12}") {
        let task = TaskEnvelope::new(Capability::Audio, conversation, "U1", PayloadRef::telegram("f"));
        for stage in [Stage::Downloaded, Stage::Extracted, Stage::Analyzed] {
            let event = ProgressEvent::new(&task, stage);
            let decoded = ProgressEvent::decode(&event.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, event);
        }
    }
}
