use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

/// Identifier assigned by the store to an entry, e.g. `1526919030474-55`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The field/value mapping carried by an entry.
///
/// Field names are unique and keep the order in which they were inserted, which for entries
/// read back from the store is the order the store returned them in. Values are opaque bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    fields: Vec<(Bytes, Bytes)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, replacing the value in place if the field is already present.
    /// Returns the previous value, if any.
    pub fn insert(&mut self, field: impl Into<Bytes>, value: impl Into<Bytes>) -> Option<Bytes> {
        let field = field.into();
        let value = value.into();

        match self.fields.iter_mut().find(|(existing, _)| *existing == field) {
            Some((_, current)) => Some(std::mem::replace(current, value)),
            None => {
                self.fields.push((field, value));
                None
            }
        }
    }

    pub fn get(&self, field: &[u8]) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|(existing, _)| existing.as_ref() == field)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.fields.iter().map(|(field, value)| (field, value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Payload
where
    K: Into<Bytes>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut payload = Payload::new();
        for (field, value) in iter {
            payload.insert(field, value);
        }
        payload
    }
}

/// Renders fields lossily as UTF-8, for logging.
impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (field, value)) in self.fields.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{}: {}",
                String::from_utf8_lossy(field),
                String::from_utf8_lossy(value)
            )?;
        }
        f.write_str("}")
    }
}

/// A single record read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    pub payload: Payload,
}

impl Entry {
    pub fn new(id: impl Into<EntryId>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Name of one participant within a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random v4 UUID, for sessions that were not given an identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_keeps_insertion_order() {
        let payload: Payload = [("b", "2"), ("a", "1"), ("c", "3")].into_iter().collect();

        let fields: Vec<&[u8]> = payload.iter().map(|(field, _)| field.as_ref()).collect();
        assert_eq!(fields, vec![&b"b"[..], &b"a"[..], &b"c"[..]]);
    }

    #[test]
    fn test_payload_insert_replaces_in_place() {
        let mut payload: Payload = [("msg", "hello"), ("level", "info")].into_iter().collect();

        let previous = payload.insert("msg", "goodbye");

        assert_eq!(previous, Some(Bytes::from_static(b"hello")));
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.get(b"msg"), Some(&Bytes::from_static(b"goodbye")));
        assert_eq!(payload.iter().next().map(|(f, _)| f.as_ref()), Some(&b"msg"[..]));
    }

    #[test]
    fn test_payload_display() {
        let payload: Payload = [("msg", "hello"), ("n", "1")].into_iter().collect();
        assert_eq!(payload.to_string(), "{msg: hello, n: 1}");
        assert_eq!(Payload::new().to_string(), "{}");
    }

    #[test]
    fn test_generated_consumer_ids_are_unique() {
        let first = ConsumerId::generate();
        let second = ConsumerId::generate();

        assert_ne!(first, second);
        assert!(Uuid::parse_str(first.as_str()).is_ok());
    }
}
