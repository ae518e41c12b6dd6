//! Event name → orchestrator step wiring.

use std::future::Future;
use std::sync::Arc;

use reportflow_events::{
    Dispatcher, EventName, EventPayload, HandlerRecord, LifecyclePayload, Outcome,
    validate_lifecycle, validate_new_extraction,
};

use crate::orchestrator::ExtractionOrchestrator;

fn wrong_payload(event: EventName, payload: &EventPayload) -> anyhow::Error {
    anyhow::anyhow!("{event} handler received unexpected payload {payload:?}")
}

/// Record for a lifecycle event whose step only needs the extraction ids.
fn lifecycle<F, Fut>(
    event: EventName,
    orchestrator: &Arc<ExtractionOrchestrator>,
    step: F,
) -> HandlerRecord
where
    F: Fn(Arc<ExtractionOrchestrator>, LifecyclePayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    let orchestrator = Arc::clone(orchestrator);
    let step = Arc::new(step);
    HandlerRecord::new(validate_lifecycle, move |payload| {
        let orchestrator = Arc::clone(&orchestrator);
        let step = Arc::clone(&step);
        async move {
            match payload {
                EventPayload::Lifecycle(ids) => (*step)(orchestrator, ids).await,
                other => Err(wrong_payload(event, &other)),
            }
        }
    })
}

/// Register every pipeline event on `dispatcher`.
pub fn register_handlers(dispatcher: &mut Dispatcher, orchestrator: Arc<ExtractionOrchestrator>) {
    let starter = Arc::clone(&orchestrator);
    dispatcher.register(
        EventName::NewExtraction,
        HandlerRecord::new(validate_new_extraction, move |payload| {
            let orchestrator = Arc::clone(&starter);
            async move {
                match payload {
                    EventPayload::NewExtraction(request) => {
                        orchestrator.start_extraction(request).await
                    }
                    other => Err(wrong_payload(EventName::NewExtraction, &other)),
                }
            }
        }),
    );

    dispatcher
        .register(
            EventName::Initialized,
            lifecycle(EventName::Initialized, &orchestrator, |o, ids| async move {
                o.perform_query(ids).await
            }),
        )
        .register(
            EventName::CheckQueryStatus,
            lifecycle(EventName::CheckQueryStatus, &orchestrator, |o, ids| async move {
                o.check_query_status(ids).await
            }),
        )
        .register(
            EventName::QueryCompleted,
            lifecycle(EventName::QueryCompleted, &orchestrator, |o, ids| async move {
                o.export_to_csv(ids).await
            }),
        )
        .register(
            EventName::CheckExportStatus,
            lifecycle(EventName::CheckExportStatus, &orchestrator, |o, ids| async move {
                o.check_csv_query_status(ids).await
            }),
        )
        .register(
            EventName::ExportCompleted,
            lifecycle(EventName::ExportCompleted, &orchestrator, |o, ids| async move {
                o.ensure_exported_csv_file_is_not_empty(ids).await
            }),
        )
        .register(
            EventName::ExportContentChecked,
            lifecycle(EventName::ExportContentChecked, &orchestrator, |o, ids| async move {
                o.compress(ids).await
            }),
        );

    for event in [
        EventName::QueryFailed,
        EventName::ExportFailed,
        EventName::ReportConverted,
        EventName::ReportConversionSkipped,
    ] {
        dispatcher.register(
            event,
            lifecycle(event, &orchestrator, move |o, ids| async move {
                o.acknowledge_outcome(event, ids).await
            }),
        );
    }
}
