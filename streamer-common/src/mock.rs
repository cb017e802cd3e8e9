use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::entry::{ConsumerId, Entry, EntryId, Payload};
use crate::store::{GroupCreation, LogStore, StoreError};

/// In-memory `LogStore` for tests.
///
/// `read_group` hands out the scripted batches in order and then blocks forever, the way an
/// idle stream read with `BLOCK 0` does. Clones share their script, groups and recorded calls,
/// so a test can keep one clone around to inspect what the code under test did with another.
#[derive(Clone, Default)]
pub struct MockLogStore {
    batches: Arc<Mutex<VecDeque<Result<Vec<Entry>, StoreError>>>>,
    groups: Arc<Mutex<HashSet<(String, String)>>>,
    create_group_error: Option<StoreError>,
    ack_ret: HashMap<String, Result<u64, StoreError>>,
    delete_consumer_ret: Option<Result<u64, StoreError>>,
    stall_delete_consumer: bool,
    append_error: Option<StoreError>,
    calls: Arc<Mutex<Vec<MockStoreCall>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStoreCall {
    CreateGroup {
        stream: String,
        group: String,
    },
    ReadGroup {
        stream: String,
        group: String,
        consumer: ConsumerId,
    },
    Ack {
        stream: String,
        group: String,
        id: EntryId,
    },
    DeleteConsumer {
        stream: String,
        group: String,
        consumer: ConsumerId,
    },
    Append {
        stream: String,
        payload: Payload,
        max_len: Option<usize>,
    },
}

// A panicking test thread must not hide the calls from the assertions that follow.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `read_group` call.
    pub fn read_group_ret(&mut self, ret: Result<Vec<Entry>, StoreError>) -> Self {
        lock(&self.batches).push_back(ret);
        self.clone()
    }

    pub fn create_group_error(&mut self, err: StoreError) -> Self {
        self.create_group_error = Some(err);
        self.clone()
    }

    pub fn ack_ret(&mut self, id: &str, ret: Result<u64, StoreError>) -> Self {
        self.ack_ret.insert(id.to_owned(), ret);
        self.clone()
    }

    pub fn delete_consumer_ret(&mut self, ret: Result<u64, StoreError>) -> Self {
        self.delete_consumer_ret = Some(ret);
        self.clone()
    }

    /// Make `delete_consumer` record the call and then never answer.
    pub fn stall_delete_consumer(&mut self) -> Self {
        self.stall_delete_consumer = true;
        self.clone()
    }

    pub fn append_error(&mut self, err: StoreError) -> Self {
        self.append_error = Some(err);
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockStoreCall> {
        lock(&self.calls).clone()
    }

    pub fn acked_ids(&self) -> Vec<EntryId> {
        self.get_calls()
            .into_iter()
            .filter_map(|call| match call {
                MockStoreCall::Ack { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_consumers(&self) -> Vec<ConsumerId> {
        self.get_calls()
            .into_iter()
            .filter_map(|call| match call {
                MockStoreCall::DeleteConsumer { consumer, .. } => Some(consumer),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockStoreCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl LogStore for MockLogStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, StoreError> {
        self.record(MockStoreCall::CreateGroup {
            stream: stream.to_owned(),
            group: group.to_owned(),
        });

        if let Some(err) = &self.create_group_error {
            return Err(err.clone());
        }

        let created = lock(&self.groups).insert((stream.to_owned(), group.to_owned()));
        if created {
            Ok(GroupCreation::Created)
        } else {
            Ok(GroupCreation::AlreadyExists)
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &ConsumerId,
        _count: usize,
        _block: Option<Duration>,
    ) -> Result<Vec<Entry>, StoreError> {
        self.record(MockStoreCall::ReadGroup {
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer: consumer.clone(),
        });

        let next = lock(&self.batches).pop_front();
        match next {
            Some(ret) => ret,
            None => std::future::pending().await,
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &EntryId) -> Result<u64, StoreError> {
        self.record(MockStoreCall::Ack {
            stream: stream.to_owned(),
            group: group.to_owned(),
            id: id.clone(),
        });

        match self.ack_ret.get(id.as_str()) {
            Some(ret) => ret.clone(),
            None => Ok(1),
        }
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &ConsumerId,
    ) -> Result<u64, StoreError> {
        self.record(MockStoreCall::DeleteConsumer {
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer: consumer.clone(),
        });

        if self.stall_delete_consumer {
            return std::future::pending().await;
        }

        match &self.delete_consumer_ret {
            Some(ret) => ret.clone(),
            None => Ok(0),
        }
    }

    async fn append(
        &self,
        stream: &str,
        payload: &Payload,
        max_len: Option<usize>,
    ) -> Result<EntryId, StoreError> {
        let appended = {
            let mut calls = lock(&self.calls);
            calls.push(MockStoreCall::Append {
                stream: stream.to_owned(),
                payload: payload.clone(),
                max_len,
            });
            calls
                .iter()
                .filter(|call| matches!(call, MockStoreCall::Append { .. }))
                .count()
        };

        match &self.append_error {
            Some(err) => Err(err.clone()),
            None => Ok(EntryId::new(format!("{appended}-0"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RedisErrorKind;

    #[tokio::test]
    async fn test_scripted_batches_are_returned_in_order() {
        let consumer = ConsumerId::from("c1");
        let store = MockLogStore::new()
            .read_group_ret(Ok(vec![Entry::new("1-0", Payload::new())]))
            .read_group_ret(Err(StoreError::from_redis_kind(
                RedisErrorKind::IoError,
                "Connection reset",
            )));

        let first = store
            .read_group("logs", "loggers", &consumer, 10, None)
            .await
            .expect("first batch is scripted to succeed");
        assert_eq!(first.len(), 1);

        let second = store.read_group("logs", "loggers", &consumer, 10, None).await;
        assert!(second.is_err());

        // Nothing left: the read blocks like an idle stream.
        let third = tokio::time::timeout(
            Duration::from_millis(20),
            store.read_group("logs", "loggers", &consumer, 10, None),
        )
        .await;
        assert!(third.is_err());
    }

    #[tokio::test]
    async fn test_create_group_reports_existing_groups() {
        let store = MockLogStore::new();

        assert_eq!(
            store.create_group("logs", "loggers").await.unwrap(),
            GroupCreation::Created
        );
        assert_eq!(
            store.create_group("logs", "loggers").await.unwrap(),
            GroupCreation::AlreadyExists
        );
    }
}
