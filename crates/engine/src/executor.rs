//! Shared command execution plumbing.
//!
//! Every engine operation runs the same pipeline: load the streams it
//! touches, rehydrate aggregates, decide events, append with exact expected
//! versions, then publish the committed events to the bus. The service
//! composes these helpers; none of them performs IO beyond the injected
//! store and bus.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use medsupply_core::{Aggregate, AggregateId, ExpectedVersion};
use medsupply_events::{Event, EventBus, EventEnvelope};

use crate::error::EngineError;
use crate::event_store::{EventStore, StoredEvent, StreamAppend, UncommittedEvent};

/// Load and rehydrate one aggregate, returning it together with its stream
/// version (the expected version for a subsequent append). Streams are
/// addressed by (aggregate type, aggregate id); correlated streams share an
/// id, so the type is a required part of the address.
pub fn load_aggregate<A, S>(
    store: &S,
    aggregate_type: &str,
    aggregate_id: AggregateId,
    make: impl FnOnce(AggregateId) -> A,
) -> Result<(A, u64), EngineError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
    S: EventStore + ?Sized,
{
    let history = store.load_stream(aggregate_type, aggregate_id)?;
    validate_loaded_stream(aggregate_type, aggregate_id, &history)?;

    let version = stream_version(&history);
    let mut aggregate = make(aggregate_id);
    for stored in &history {
        let event: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| EngineError::Deserialize(e.to_string()))?;
        aggregate.apply(&event);
    }

    Ok((aggregate, version))
}

/// Wrap decided domain events into a stream append with an exact version
/// expectation.
pub fn stream_append<E>(
    aggregate_id: AggregateId,
    aggregate_type: &str,
    expected_version: u64,
    events: &[E],
) -> Result<StreamAppend, EngineError>
where
    E: Event + Serialize,
{
    let uncommitted = events
        .iter()
        .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StreamAppend {
        aggregate_id,
        aggregate_type: aggregate_type.to_string(),
        expected_version: ExpectedVersion::Exact(expected_version),
        events: uncommitted,
    })
}

/// Publish committed events to the bus.
///
/// Publication happens only after the append succeeded; a failure here
/// leaves the events durable in the store (at-least-once, subscribers must
/// be idempotent).
pub fn publish_committed<B>(bus: &B, committed: &[StoredEvent]) -> Result<(), EngineError>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    for stored in committed {
        bus.publish(stored.to_envelope())
            .map_err(|e| EngineError::Publish(format!("{e:?}")))?;
    }
    Ok(())
}

pub fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    aggregate_type: &str,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), EngineError> {
    // Defend against a buggy backend: the stream must be scoped to the
    // aggregate and strictly increasing by sequence number.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(EngineError::Deserialize(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.aggregate_type != aggregate_type {
            return Err(EngineError::Deserialize(format!(
                "loaded stream contains wrong aggregate_type at index {idx} \
                 (expected {aggregate_type}, found {})",
                e.aggregate_type
            )));
        }
        if e.sequence_number <= last {
            return Err(EngineError::Deserialize(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}
