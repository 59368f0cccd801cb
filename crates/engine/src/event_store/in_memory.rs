use std::collections::HashMap;
use std::sync::RwLock;

use medsupply_core::AggregateId;

use super::{EventStore, EventStoreError, StoredEvent, StreamAppend};

type StreamKey = (String, AggregateId);

/// In-memory append-only event store.
///
/// Streams are keyed by (aggregate type, aggregate id), so correlated
/// streams that share an id (a product and its stock ledger, an order and
/// its invoice) stay separate. Holds one write lock for the whole append
/// batch, which gives the multi-stream atomicity the trait requires for
/// free. Intended for tests/dev; not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, appends: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        if appends.iter().all(|a| a.events.is_empty()) {
            return Ok(vec![]);
        }

        // Batch-level validation before taking the lock.
        for append in &appends {
            for (idx, e) in append.events.iter().enumerate() {
                if e.aggregate_id != append.aggregate_id {
                    return Err(EventStoreError::InvalidAppend(format!(
                        "stream {} contains foreign aggregate_id (index {idx})",
                        append.aggregate_id
                    )));
                }
                if e.aggregate_type != append.aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream {} contains foreign aggregate_type (index {idx})",
                        append.aggregate_id
                    )));
                }
            }
        }
        {
            let mut keys: Vec<StreamKey> = appends
                .iter()
                .map(|a| (a.aggregate_type.clone(), a.aggregate_id))
                .collect();
            keys.sort();
            keys.dedup();
            if keys.len() != appends.len() {
                return Err(EventStoreError::InvalidAppend(
                    "batch targets the same stream twice".to_string(),
                ));
            }
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        // Check every stream's expectation first so a late conflict cannot
        // leave an earlier stream mutated.
        for append in &appends {
            let key = (append.aggregate_type.clone(), append.aggregate_id);
            let stream = streams.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            let current = Self::current_version(stream);
            if !append.expected_version.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}/{}: expected {:?}, found {current}",
                    append.aggregate_type, append.aggregate_id, append.expected_version
                )));
            }
        }

        // All expectations hold; commit the whole batch.
        let mut committed = Vec::new();
        for append in appends {
            let key = (append.aggregate_type.clone(), append.aggregate_id);
            let stream = streams.entry(key).or_default();
            let mut next = Self::current_version(stream) + 1;
            for e in append.events {
                let stored = StoredEvent {
                    event_id: e.event_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                stream.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams
            .get(&(aggregate_type.to_string(), aggregate_id))
            .cloned()
            .unwrap_or_default())
    }

    fn stream_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let mut ids: Vec<AggregateId> = streams
            .keys()
            .filter(|(stream_type, _)| stream_type == aggregate_type)
            .map(|(_, id)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medsupply_core::ExpectedVersion;
    use serde_json::json;
    use uuid::Uuid;

    use crate::event_store::UncommittedEvent;

    fn event(aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.event".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    fn append_one(
        store: &InMemoryEventStore,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        store.append(vec![StreamAppend {
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            expected_version: expected,
            events: vec![event(aggregate_id, aggregate_type)],
        }])
    }

    #[test]
    fn sequence_numbers_are_per_stream_and_monotonic() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        append_one(&store, "test.stream", a, ExpectedVersion::Exact(0)).unwrap();
        append_one(&store, "test.stream", a, ExpectedVersion::Exact(1)).unwrap();
        append_one(&store, "test.stream", b, ExpectedVersion::Exact(0)).unwrap();

        let stream_a = store.load_stream("test.stream", a).unwrap();
        assert_eq!(
            stream_a.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(store.load_stream("test.stream", b).unwrap().len(), 1);
    }

    #[test]
    fn stale_expectation_is_rejected() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        append_one(&store, "test.stream", a, ExpectedVersion::Exact(0)).unwrap();

        let err = append_one(&store, "test.stream", a, ExpectedVersion::Exact(0)).unwrap_err();
        assert!(err.is_concurrency());
    }

    #[test]
    fn streams_sharing_an_id_are_separated_by_type() {
        // Correlated streams deliberately share ids (product/ledger,
        // order/invoice); each must version and load independently.
        let store = InMemoryEventStore::new();
        let shared = AggregateId::new();

        append_one(&store, "test.stream", shared, ExpectedVersion::Exact(0)).unwrap();
        append_one(&store, "other.stream", shared, ExpectedVersion::Exact(0)).unwrap();
        append_one(&store, "test.stream", shared, ExpectedVersion::Exact(1)).unwrap();

        let first = store.load_stream("test.stream", shared).unwrap();
        let second = store.load_stream("other.stream", shared).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(first.iter().all(|e| e.aggregate_type == "test.stream"));
        assert!(second.iter().all(|e| e.aggregate_type == "other.stream"));
    }

    #[test]
    fn multi_stream_batch_is_all_or_nothing() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        append_one(&store, "test.stream", b, ExpectedVersion::Exact(0)).unwrap();

        // Stream b's expectation is stale, so stream a must stay untouched.
        let err = store
            .append(vec![
                StreamAppend {
                    aggregate_id: a,
                    aggregate_type: "test.stream".to_string(),
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![event(a, "test.stream")],
                },
                StreamAppend {
                    aggregate_id: b,
                    aggregate_type: "test.stream".to_string(),
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![event(b, "test.stream")],
                },
            ])
            .unwrap_err();
        assert!(err.is_concurrency());
        assert!(store.load_stream("test.stream", a).unwrap().is_empty());
        assert_eq!(store.load_stream("test.stream", b).unwrap().len(), 1);
    }

    #[test]
    fn stream_ids_filters_by_aggregate_type() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        append_one(&store, "test.stream", a, ExpectedVersion::Exact(0)).unwrap();
        append_one(&store, "other.stream", b, ExpectedVersion::Exact(0)).unwrap();

        assert_eq!(store.stream_ids("test.stream").unwrap(), vec![a]);
        assert_eq!(store.stream_ids("other.stream").unwrap(), vec![b]);
    }
}
