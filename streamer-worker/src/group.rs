use std::sync::Arc;

use streamer_common::{ConsumerId, GroupCreation, LogStore, StoreError};
use tracing::{error, info, warn};

/// A consumer group on one stream.
pub struct ConsumerGroup {
    store: Arc<dyn LogStore>,
    stream: String,
    group: String,
}

impl ConsumerGroup {
    pub fn new(store: Arc<dyn LogStore>, stream: &str, group: &str) -> Self {
        Self {
            store,
            stream: stream.to_owned(),
            group: group.to_owned(),
        }
    }

    /// Make sure the group exists, creating the stream along with it if needed.
    /// A group that already exists is not an error.
    pub async fn establish(&self) -> Result<GroupCreation, StoreError> {
        let creation = self.store.create_group(&self.stream, &self.group).await?;

        match creation {
            GroupCreation::Created => {
                info!(group = %self.group, stream = %self.stream, "created consumer group")
            }
            GroupCreation::AlreadyExists => {
                info!(group = %self.group, stream = %self.stream, "consumer group already exists")
            }
        }

        Ok(creation)
    }

    /// Establish the group and take part in it as `consumer`.
    ///
    /// The returned `Membership` must be retired when consumption ends.
    pub async fn join(&self, consumer: ConsumerId) -> Result<Membership, StoreError> {
        self.establish().await?;

        Ok(Membership {
            store: self.store.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            consumer,
            retired: false,
        })
    }
}

/// One consumer's place in a group, held for the length of a consumption session.
///
/// `retire` removes the consumer from the group. A membership dropped without being retired,
/// for example because the session future was cancelled, retires itself in the background on
/// the current Tokio runtime.
pub struct Membership {
    store: Arc<dyn LogStore>,
    stream: String,
    group: String,
    consumer: ConsumerId,
    retired: bool,
}

impl Membership {
    /// Remove this consumer, and only this consumer, from the group.
    /// Returns the number of entries it still had pending.
    ///
    /// If this future is dropped before the store answers, the membership retires itself in the
    /// background as if it had never been retired.
    pub async fn retire(mut self) -> Result<u64, StoreError> {
        warn!(
            consumer = %self.consumer,
            group = %self.group,
            stream = %self.stream,
            "removing consumer from group"
        );

        let removed = self
            .store
            .delete_consumer(&self.stream, &self.group, &self.consumer)
            .await;
        self.retired = true;

        removed
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.retired {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                consumer = %self.consumer,
                group = %self.group,
                stream = %self.stream,
                "membership dropped outside a runtime, consumer stays registered"
            );
            return;
        };

        warn!(
            consumer = %self.consumer,
            group = %self.group,
            stream = %self.stream,
            "membership dropped without being retired, retiring in the background"
        );

        let store = self.store.clone();
        let stream = std::mem::take(&mut self.stream);
        let group = std::mem::take(&mut self.group);
        let consumer = self.consumer.clone();
        runtime.spawn(async move {
            if let Err(error) = store.delete_consumer(&stream, &group, &consumer).await {
                error!(%consumer, %group, %stream, %error, "failed to retire consumer");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use streamer_common::store::RedisErrorKind;
    use streamer_common::{MockLogStore, MockStoreCall};

    use super::*;

    #[tokio::test]
    async fn test_establish_is_idempotent() {
        let store = MockLogStore::new();
        let group = ConsumerGroup::new(Arc::new(store.clone()), "logs", "logger");

        assert_eq!(group.establish().await.unwrap(), GroupCreation::Created);
        assert_eq!(group.establish().await.unwrap(), GroupCreation::AlreadyExists);
    }

    #[tokio::test]
    async fn test_establish_surfaces_other_errors() {
        let store = MockLogStore::new().create_group_error(StoreError::from_redis_kind(
            RedisErrorKind::IoError,
            "Connection refused",
        ));
        let group = ConsumerGroup::new(Arc::new(store), "logs", "logger");

        assert!(group.establish().await.is_err());
    }

    #[tokio::test]
    async fn test_retire_removes_only_own_consumer() {
        let store = MockLogStore::new();
        let group = ConsumerGroup::new(Arc::new(store.clone()), "logs", "logger");

        let membership = group
            .join(ConsumerId::from("my_logger"))
            .await
            .expect("failed to join");
        membership.retire().await.expect("failed to retire");

        assert_eq!(
            store.get_calls(),
            vec![
                MockStoreCall::CreateGroup {
                    stream: "logs".to_owned(),
                    group: "logger".to_owned(),
                },
                MockStoreCall::DeleteConsumer {
                    stream: "logs".to_owned(),
                    group: "logger".to_owned(),
                    consumer: ConsumerId::from("my_logger"),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_membership_retires_in_background() {
        let store = MockLogStore::new();
        let group = ConsumerGroup::new(Arc::new(store.clone()), "logs", "logger");

        let membership = group
            .join(ConsumerId::from("my_logger"))
            .await
            .expect("failed to join");
        drop(membership);

        for _ in 0..50 {
            if !store.deleted_consumers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(store.deleted_consumers(), vec![ConsumerId::from("my_logger")]);
    }

    #[tokio::test]
    async fn test_interrupted_retire_still_retires_in_background() {
        let store = MockLogStore::new().stall_delete_consumer();
        let group = ConsumerGroup::new(Arc::new(store.clone()), "logs", "logger");

        let membership = group
            .join(ConsumerId::from("my_logger"))
            .await
            .expect("failed to join");
        let interrupted = tokio::time::timeout(Duration::from_millis(10), membership.retire()).await;
        assert!(interrupted.is_err());

        for _ in 0..50 {
            if store.deleted_consumers().len() > 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Once from the interrupted retire, once more from the background retire.
        assert_eq!(
            store.deleted_consumers(),
            vec![ConsumerId::from("my_logger"), ConsumerId::from("my_logger")]
        );
    }
}
