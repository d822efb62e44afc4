use bytes::Bytes;

/// Markers that identify an out-of-band pub/sub delivery.
pub const PUSH_MARKERS: [&[u8]; 3] = [b"message", b"pmessage", b"smessage"];

/// A parsed RESP value.
///
/// Blob payloads are `Bytes` views split off the connection's receive
/// buffer; [`RespValue::into_owned`] detaches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    NullBulk,
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    pub fn simple<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::BulkString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::NullBulk | RespValue::NullArray)
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    /// Textual payload of simple strings, errors and bulk strings.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(data) | RespValue::Error(data) | RespValue::BulkString(data) => {
                Some(data.as_ref())
            }
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            RespValue::BulkString(data) | RespValue::SimpleString(data) => {
                std::str::from_utf8(data).ok()?.parse().ok()
            }
            _ => None,
        }
    }

    /// Copy every blob out of the shared receive buffer.
    pub fn into_owned(self) -> RespValue {
        match self {
            RespValue::SimpleString(data) => RespValue::SimpleString(Bytes::copy_from_slice(&data)),
            RespValue::Error(data) => RespValue::Error(Bytes::copy_from_slice(&data)),
            RespValue::BulkString(data) => RespValue::BulkString(Bytes::copy_from_slice(&data)),
            RespValue::Array(values) => {
                RespValue::Array(values.into_iter().map(RespValue::into_owned).collect())
            }
            other => other,
        }
    }

    /// Structural check for pub/sub deliveries that bypass the pending
    /// ledger: an array of at least three elements led by a push marker.
    pub fn is_push_message(&self) -> bool {
        match self {
            RespValue::Array(items) if items.len() >= 3 => match items[0].as_bytes() {
                Some(head) if !items[0].is_error() => {
                    PUSH_MARKERS.iter().any(|marker| head.eq_ignore_ascii_case(marker))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// A pub/sub delivery diverted from a connection's read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub endpoint: String,
    pub kind: Bytes,
    pub pattern: Option<Bytes>,
    pub channel: Bytes,
    pub payload: RespValue,
}

impl PushMessage {
    pub fn from_resp(endpoint: &str, value: RespValue) -> Option<Self> {
        let mut items = match value {
            RespValue::Array(items) if items.len() >= 3 => items,
            _ => return None,
        };
        let kind = Bytes::copy_from_slice(items[0].as_bytes()?);
        if items.len() >= 4 && kind.eq_ignore_ascii_case(b"pmessage") {
            let payload = items.pop()?;
            let channel = Bytes::copy_from_slice(items[2].as_bytes()?);
            let pattern = Some(Bytes::copy_from_slice(items[1].as_bytes()?));
            return Some(Self {
                endpoint: endpoint.to_string(),
                kind,
                pattern,
                channel,
                payload,
            });
        }
        let payload = items.pop()?;
        let channel = Bytes::copy_from_slice(items[1].as_bytes()?);
        Some(Self {
            endpoint: endpoint.to_string(),
            kind,
            pattern: None,
            channel,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_detection_is_structural() {
        let message = RespValue::Array(vec![
            RespValue::bulk("message"),
            RespValue::bulk("news"),
            RespValue::bulk("hello"),
        ]);
        assert!(message.is_push_message());

        let ack = RespValue::Array(vec![
            RespValue::bulk("subscribe"),
            RespValue::bulk("news"),
            RespValue::Integer(1),
        ]);
        assert!(!ack.is_push_message());

        let short = RespValue::Array(vec![RespValue::bulk("message"), RespValue::bulk("x")]);
        assert!(!short.is_push_message());

        let lookalike = RespValue::Array(vec![RespValue::Integer(1); 3]);
        assert!(!lookalike.is_push_message());
    }

    #[test]
    fn pmessage_keeps_pattern() {
        let value = RespValue::Array(vec![
            RespValue::bulk("pmessage"),
            RespValue::bulk("news.*"),
            RespValue::bulk("news.tech"),
            RespValue::bulk("payload"),
        ]);
        let push = PushMessage::from_resp("a:1", value).expect("push");
        assert_eq!(push.pattern.as_deref(), Some(&b"news.*"[..]));
        assert_eq!(push.channel.as_ref(), b"news.tech");
        assert_eq!(push.payload, RespValue::bulk("payload"));
    }

    #[test]
    fn into_owned_preserves_shape() {
        let value = RespValue::Array(vec![RespValue::bulk("a"), RespValue::NullBulk]);
        assert_eq!(value.clone().into_owned(), value);
    }
}
