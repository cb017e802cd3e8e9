use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use streamer_common::{ConsumerId, Entry, LogStore, StoreError};
use tracing::debug;

/// A source of batches of entries, each fetch waiting until at least one entry is available.
#[async_trait]
pub trait BatchSource: Send {
    async fn fetch_batch(&mut self) -> Result<Vec<Entry>, StoreError>;
}

/// Reads new entries for one consumer of a group.
pub struct GroupReader {
    store: Arc<dyn LogStore>,
    stream: String,
    group: String,
    consumer: ConsumerId,
    count: usize,
    block: Option<Duration>,
}

impl GroupReader {
    pub fn new(store: Arc<dyn LogStore>, stream: &str, group: &str, consumer: ConsumerId) -> Self {
        Self {
            store,
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer,
            count: 1,
            block: None,
        }
    }

    /// Maximum number of entries claimed per fetch.
    pub fn count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    /// How long a fetch waits for entries before coming back empty. `None` waits forever.
    pub fn block(mut self, block: Option<Duration>) -> Self {
        self.block = block;
        self
    }
}

#[async_trait]
impl BatchSource for GroupReader {
    async fn fetch_batch(&mut self) -> Result<Vec<Entry>, StoreError> {
        self.store
            .read_group(
                &self.stream,
                &self.group,
                &self.consumer,
                self.count,
                self.block,
            )
            .await
    }
}

/// A stream of claimed entries that holds some of them back between fetches.
///
/// Entries the store has already assigned to this consumer are its responsibility: whoever stops
/// reading the stream takes the held back ones with `take_buffered` and finishes them.
pub trait BufferedEntries: Stream<Item = Result<Entry, StoreError>> + Unpin {
    /// Remove and return the entries fetched but not yielded yet, in stream order.
    fn take_buffered(&mut self) -> Vec<Entry>;
}

type Fetch<S> = BoxFuture<'static, (S, Result<Vec<Entry>, StoreError>)>;

enum State<S> {
    Idle(S),
    Fetching(Fetch<S>),
    Failed,
}

/// The entries of repeated batch fetches, one at a time. Built by `unpack`.
pub struct Unpacker<S> {
    state: State<S>,
    buffer: VecDeque<Entry>,
    idle_backoff: Duration,
    backing_off: bool,
}

// The source is moved in and out of the fetch future, it is never pinned in place.
impl<S> Unpin for Unpacker<S> {}

/// Turn repeated batch fetches into one unbounded stream of entries.
///
/// Entries come out in the order the source returned them, batch after batch. The next fetch
/// is only issued once every entry of the current batch has been taken. An empty batch never
/// ends the stream: after `idle_backoff` the source is asked again. A fetch error is yielded
/// once and ends the stream.
pub fn unpack<S>(source: S, idle_backoff: Duration) -> Unpacker<S>
where
    S: BatchSource + 'static,
{
    Unpacker {
        state: State::Idle(source),
        buffer: VecDeque::new(),
        idle_backoff,
        backing_off: false,
    }
}

impl<S> Unpacker<S>
where
    S: BatchSource + 'static,
{
    fn start_fetch(&self, mut source: S) -> Fetch<S> {
        let backoff = Some(self.idle_backoff)
            .filter(|backoff| self.backing_off && !backoff.is_zero());

        async move {
            if let Some(backoff) = backoff {
                tokio::time::sleep(backoff).await;
            }
            let fetched = source.fetch_batch().await;
            (source, fetched)
        }
        .boxed()
    }
}

impl<S> Stream for Unpacker<S>
where
    S: BatchSource + 'static,
{
    type Item = Result<Entry, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(entry) = this.buffer.pop_front() {
                return Poll::Ready(Some(Ok(entry)));
            }

            let mut fetch = match std::mem::replace(&mut this.state, State::Failed) {
                State::Idle(source) => this.start_fetch(source),
                State::Fetching(fetch) => fetch,
                State::Failed => return Poll::Ready(None),
            };

            let (source, fetched) = match fetch.poll_unpin(cx) {
                Poll::Ready(done) => done,
                Poll::Pending => {
                    this.state = State::Fetching(fetch);
                    return Poll::Pending;
                }
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(error) => return Poll::Ready(Some(Err(error))),
            };

            this.state = State::Idle(source);
            this.backing_off = batch.is_empty();

            if this.backing_off {
                debug!(
                    backoff_ms = this.idle_backoff.as_millis() as u64,
                    "fetched an empty batch, fetching again"
                );
                if this.idle_backoff.is_zero() {
                    // Let other tasks run before asking again.
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
            }

            this.buffer.extend(batch);
        }
    }
}

impl<S> BufferedEntries for Unpacker<S>
where
    S: BatchSource + 'static,
{
    fn take_buffered(&mut self) -> Vec<Entry> {
        self.buffer.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt;
    use streamer_common::store::RedisErrorKind;
    use streamer_common::Payload;
    use tokio::time::Instant;

    use super::*;

    /// Hands out scripted batches, then blocks forever. Records when each fetch was issued.
    struct ScriptedSource {
        batches: VecDeque<Result<Vec<Entry>, StoreError>>,
        fetched_at: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Result<Vec<Entry>, StoreError>>) -> Self {
            Self {
                batches: batches.into(),
                fetched_at: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl BatchSource for ScriptedSource {
        async fn fetch_batch(&mut self) -> Result<Vec<Entry>, StoreError> {
            self.fetched_at.lock().unwrap().push(Instant::now());
            match self.batches.pop_front() {
                Some(batch) => batch,
                None => std::future::pending().await,
            }
        }
    }

    fn entries(ids: &[&str]) -> Vec<Entry> {
        ids.iter()
            .map(|id| Entry::new(*id, [("id", id.to_string())].into_iter().collect()))
            .collect()
    }

    fn ids(entries: &[Result<Entry, StoreError>]) -> Vec<String> {
        entries
            .iter()
            .map(|entry| entry.as_ref().expect("no errors").id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_unpack_concatenates_batches_in_order() {
        let source = ScriptedSource::new(vec![
            Ok(entries(&["1-0", "1-1", "1-2"])),
            Ok(vec![]),
            Ok(entries(&["2-0"])),
            Ok(entries(&["3-0", "3-1"])),
        ]);

        let unpacked: Vec<_> = unpack(source, Duration::ZERO).take(6).collect().await;

        assert_eq!(ids(&unpacked), vec!["1-0", "1-1", "1-2", "2-0", "3-0", "3-1"]);
    }

    #[tokio::test]
    async fn test_unpack_keeps_waiting_after_empty_batches() {
        let source = ScriptedSource::new(vec![Ok(vec![]), Ok(vec![]), Ok(entries(&["9-0"]))]);

        let unpacked: Vec<_> = unpack(source, Duration::from_millis(1))
            .take(1)
            .collect()
            .await;

        assert_eq!(ids(&unpacked), vec!["9-0"]);
    }

    #[tokio::test]
    async fn test_empty_batch_waits_for_backoff_before_fetching_again() {
        tokio::time::pause();
        let source = ScriptedSource::new(vec![Ok(vec![]), Ok(vec![]), Ok(entries(&["9-0"]))]);
        let fetched_at = source.fetched_at.clone();
        let started = Instant::now();
        let mut unpacked = unpack(source, Duration::from_millis(100));

        let early = tokio::time::timeout(Duration::from_millis(99), unpacked.next()).await;
        assert!(early.is_err(), "nothing to yield before the backoff elapsed");
        assert_eq!(fetched_at.lock().unwrap().len(), 1);

        let entry = unpacked.next().await.expect("stream is infinite").unwrap();
        assert_eq!(entry.id.as_str(), "9-0");

        let fetched_at = fetched_at.lock().unwrap();
        assert_eq!(fetched_at.len(), 3);
        assert_eq!(fetched_at[0], started);
        for pair in fetched_at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_zero_backoff_fetches_again_immediately() {
        tokio::time::pause();
        let source = ScriptedSource::new(vec![Ok(vec![]), Ok(vec![]), Ok(entries(&["9-0"]))]);
        let fetched_at = source.fetched_at.clone();
        let started = Instant::now();

        let entry = unpack(source, Duration::ZERO)
            .next()
            .await
            .expect("stream is infinite")
            .unwrap();

        assert_eq!(entry.id.as_str(), "9-0");
        let fetched_at = fetched_at.lock().unwrap();
        assert_eq!(fetched_at.len(), 3);
        assert!(fetched_at.iter().all(|at| *at == started));
    }

    #[tokio::test]
    async fn test_unpack_does_not_fetch_ahead() {
        let source = ScriptedSource::new(vec![
            Ok(entries(&["1-0", "1-1"])),
            Ok(entries(&["2-0"])),
        ]);
        let fetched_at = source.fetched_at.clone();
        let mut unpacked = unpack(source, Duration::ZERO);

        unpacked.next().await.expect("stream is infinite").unwrap();
        unpacked.next().await.expect("stream is infinite").unwrap();
        // Both entries of the first batch were served by a single fetch.
        assert_eq!(fetched_at.lock().unwrap().len(), 1);

        unpacked.next().await.expect("stream is infinite").unwrap();
        assert_eq!(fetched_at.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_take_buffered_hands_back_the_rest_of_the_batch() {
        let source = ScriptedSource::new(vec![
            Ok(entries(&["1-0", "1-1", "1-2"])),
            Ok(entries(&["2-0"])),
        ]);
        let fetched_at = source.fetched_at.clone();
        let mut unpacked = unpack(source, Duration::ZERO);

        unpacked.next().await.expect("stream is infinite").unwrap();
        let rest: Vec<_> = unpacked
            .take_buffered()
            .into_iter()
            .map(|entry| entry.id.to_string())
            .collect();

        assert_eq!(rest, vec!["1-1", "1-2"]);
        assert!(unpacked.take_buffered().is_empty());
        assert_eq!(fetched_at.lock().unwrap().len(), 1);

        // Reading on after taking the buffer moves to the next batch.
        let next = unpacked.next().await.expect("stream is infinite").unwrap();
        assert_eq!(next.id.as_str(), "2-0");
    }

    #[tokio::test]
    async fn test_unpack_ends_after_fetch_error() {
        let source = ScriptedSource::new(vec![
            Ok(entries(&["1-0"])),
            Err(StoreError::from_redis_kind(
                RedisErrorKind::IoError,
                "Connection reset by peer",
            )),
            Ok(entries(&["2-0"])),
        ]);

        let unpacked: Vec<_> = unpack(source, Duration::ZERO).collect().await;

        assert_eq!(unpacked.len(), 2);
        assert!(unpacked[0].is_ok());
        assert!(matches!(&unpacked[1], Err(err) if err.is_connection_error()));
    }

    #[tokio::test]
    async fn test_group_reader_reads_as_its_consumer() {
        let store = streamer_common::MockLogStore::new()
            .read_group_ret(Ok(vec![Entry::new("1-0", Payload::new())]));
        let mut reader = GroupReader::new(
            Arc::new(store.clone()),
            "logs",
            "loggers",
            ConsumerId::from("c1"),
        )
        .count(10);

        let batch = reader.fetch_batch().await.expect("scripted batch");

        assert_eq!(batch.len(), 1);
        assert_eq!(
            store.get_calls(),
            vec![streamer_common::MockStoreCall::ReadGroup {
                stream: "logs".to_owned(),
                group: "loggers".to_owned(),
                consumer: ConsumerId::from("c1"),
            }]
        );
    }
}
