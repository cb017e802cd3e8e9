use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamMaxlen;
use redis::{AsyncCommands, RedisResult, Value};
use tracing::debug;

use crate::entry::{ConsumerId, Entry, EntryId, Payload};
use crate::store::{GroupCreation, LogStore, StoreError};

/// Start new groups at the end of the stream, so they only see entries appended afterwards.
const NEW_GROUP_START_ID: &str = "$";

/// `LogStore` backed by Redis streams.
///
/// Blocking reads get a connection of their own: Redis serves a connection's commands in
/// order, so an `XREADGROUP ... BLOCK` would otherwise hold every `XACK` behind it.
pub struct RedisStore {
    commands: MultiplexedConnection,
    reads: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to the Redis instance at `addr`, e.g. `redis://localhost:6379/0`.
    pub async fn new(addr: &str) -> Result<RedisStore, StoreError> {
        let client = redis::Client::open(addr)?;

        let config = redis::AsyncConnectionConfig::new();
        let commands = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        let reads = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisStore { commands, reads })
    }
}

/// Milliseconds for the `BLOCK` argument. Redis reads `0` as "forever".
fn block_millis(block: Option<Duration>) -> u64 {
    match block {
        None => 0,
        Some(duration) => u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .max(1),
    }
}

#[async_trait]
impl LogStore for RedisStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, StoreError> {
        let mut conn = self.commands.clone();

        let created: RedisResult<()> = conn
            .xgroup_create_mkstream(stream, group, NEW_GROUP_START_ID)
            .await;

        match created {
            Ok(()) => Ok(GroupCreation::Created),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &ConsumerId,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Entry>, StoreError> {
        let mut conn = self.reads.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer.as_str())
            .arg("COUNT")
            .arg(count.max(1))
            .arg("BLOCK")
            .arg(block_millis(block))
            .arg("STREAMS")
            .arg(stream)
            .arg(">");

        let reply: Value = cmd.query_async(&mut conn).await?;
        let entries = parse_read_reply(reply)?;

        debug!(stream, group, consumer = %consumer, count = entries.len(), "read batch");

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &EntryId) -> Result<u64, StoreError> {
        let mut conn = self.commands.clone();

        let acked: u64 = conn.xack(stream, group, &[id.as_str()]).await?;

        Ok(acked)
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &ConsumerId,
    ) -> Result<u64, StoreError> {
        let mut conn = self.commands.clone();

        let pending: u64 = conn
            .xgroup_delconsumer(stream, group, consumer.as_str())
            .await?;

        Ok(pending)
    }

    async fn append(
        &self,
        stream: &str,
        payload: &Payload,
        max_len: Option<usize>,
    ) -> Result<EntryId, StoreError> {
        let mut conn = self.commands.clone();

        let fields: Vec<(&[u8], &[u8])> = payload
            .iter()
            .map(|(field, value)| (field.as_ref(), value.as_ref()))
            .collect();

        let id: String = match max_len {
            Some(limit) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(limit), "*", &fields)
                    .await?
            }
            None => conn.xadd(stream, "*", &fields).await?,
        };

        Ok(EntryId::from(id))
    }
}

/// Flatten an `XREADGROUP` reply into entries, keeping the order Redis sent them in.
///
/// The reply is `nil` when the block elapsed, otherwise one `[stream, [[id, [field, value, ...]], ...]]`
/// element per stream (or a map keyed by stream name under RESP3).
pub(crate) fn parse_read_reply(reply: Value) -> Result<Vec<Entry>, StoreError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(streams) => streams
            .into_iter()
            .map(stream_entries)
            .collect::<Result<Vec<_>, _>>()?,
        Value::Map(streams) => streams.into_iter().map(|(_key, entries)| entries).collect(),
        other => return Err(unexpected("XREADGROUP reply", &other)),
    };

    let mut parsed = Vec::new();
    for entries in streams {
        match entries {
            Value::Array(entries) => {
                for entry in entries {
                    parsed.push(parse_entry(entry)?);
                }
            }
            Value::Nil => {}
            other => return Err(unexpected("entry list", &other)),
        }
    }

    Ok(parsed)
}

/// Pull the entry list out of one `[key, entries]` stream element.
fn stream_entries(stream: Value) -> Result<Value, StoreError> {
    match stream {
        Value::Array(parts) => {
            let [_key, entries]: [Value; 2] = parts.try_into().map_err(|_| {
                StoreError::ParseError("stream reply is not a [key, entries] pair".into())
            })?;
            Ok(entries)
        }
        other => Err(unexpected("stream reply", &other)),
    }
}

fn parse_entry(entry: Value) -> Result<Entry, StoreError> {
    let parts = match entry {
        Value::Array(parts) => parts,
        other => return Err(unexpected("entry", &other)),
    };
    let [id, fields]: [Value; 2] = parts
        .try_into()
        .map_err(|_| StoreError::ParseError("entry is not an [id, fields] pair".into()))?;

    let id = String::from_utf8(into_bytes(id)?.to_vec())?;

    let mut payload = Payload::new();
    match fields {
        // Entries deleted while still pending come back without fields.
        Value::Nil => {}
        Value::Array(flat) => {
            if flat.len() % 2 != 0 {
                return Err(StoreError::ParseError(format!(
                    "entry {id} has an odd number of field elements"
                )));
            }
            let mut flat = flat.into_iter();
            while let (Some(field), Some(value)) = (flat.next(), flat.next()) {
                payload.insert(into_bytes(field)?, into_bytes(value)?);
            }
        }
        Value::Map(pairs) => {
            for (field, value) in pairs {
                payload.insert(into_bytes(field)?, into_bytes(value)?);
            }
        }
        other => return Err(unexpected("entry fields", &other)),
    }

    Ok(Entry::new(id, payload))
}

fn into_bytes(value: Value) -> Result<Bytes, StoreError> {
    match value {
        Value::BulkString(data) => Ok(Bytes::from(data)),
        Value::SimpleString(data) => Ok(Bytes::from(data)),
        Value::Int(number) => Ok(Bytes::from(number.to_string())),
        other => Err(unexpected("string", &other)),
    }
}

fn unexpected(expected: &str, got: &Value) -> StoreError {
    StoreError::ParseError(format!("expected {expected}, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[&str]) -> Value {
        Value::Array(vec![
            bulk(id),
            Value::Array(fields.iter().map(|f| bulk(f)).collect()),
        ])
    }

    #[test]
    fn test_parse_nil_reply_is_empty_batch() {
        let entries = parse_read_reply(Value::Nil).expect("nil is a valid reply");
        assert!(entries.is_empty());
    }

    #[test]
    fn test_parse_read_reply_keeps_order() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("logs"),
            Value::Array(vec![
                entry("1-0", &["msg", "hello", "level", "info"]),
                entry("1-1", &["msg", "world"]),
            ]),
        ])]);

        let entries = parse_read_reply(reply).expect("failed to parse reply");

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, EntryId::from("1-0"));
        assert_eq!(
            entries[0].payload,
            [("msg", "hello"), ("level", "info")].into_iter().collect()
        );
        assert_eq!(entries[1].id, EntryId::from("1-1"));
        assert_eq!(entries[1].payload.get(b"msg").map(|v| v.as_ref()), Some(&b"world"[..]));
    }

    #[test]
    fn test_parse_resp3_map_reply() {
        let reply = Value::Map(vec![(
            bulk("logs"),
            Value::Array(vec![Value::Array(vec![
                bulk("5-0"),
                Value::Map(vec![(bulk("msg"), bulk("hi"))]),
            ])]),
        )]);

        let entries = parse_read_reply(reply).expect("failed to parse reply");

        assert_eq!(entries, vec![Entry::new("5-0", [("msg", "hi")].into_iter().collect())]);
    }

    #[test]
    fn test_parse_deleted_entry_has_empty_payload() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("logs"),
            Value::Array(vec![Value::Array(vec![bulk("2-0"), Value::Nil])]),
        ])]);

        let entries = parse_read_reply(reply).expect("failed to parse reply");

        assert_eq!(entries.len(), 1);
        assert!(entries[0].payload.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_entries() {
        let odd_fields = Value::Array(vec![Value::Array(vec![
            bulk("logs"),
            Value::Array(vec![entry("3-0", &["msg"])]),
        ])]);
        assert!(matches!(
            parse_read_reply(odd_fields),
            Err(StoreError::ParseError(_))
        ));

        assert!(matches!(
            parse_read_reply(Value::Okay),
            Err(StoreError::ParseError(_))
        ));
    }

    #[test]
    fn test_block_millis() {
        assert_eq!(block_millis(None), 0);
        assert_eq!(block_millis(Some(Duration::from_millis(250))), 250);
        // A zero duration must not turn into "block forever".
        assert_eq!(block_millis(Some(Duration::ZERO)), 1);
    }
}
