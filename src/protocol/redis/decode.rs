use bytes::Bytes;

use crate::error::{MuxError, MuxResult};

use super::types::RespValue;

/// Turns a reply into the caller's type.
///
/// Error replies never reach a decoder; the multiplexer maps them to
/// [`MuxError::CommandRejected`] first.
pub trait ResultDecoder: Send + 'static {
    type Output: Send + 'static;

    fn decode(&self, value: RespValue) -> MuxResult<Self::Output>;

    /// What a fire-and-forget call resolves to. No reply is read for it.
    fn unanswered(&self) -> MuxResult<Self::Output> {
        self.decode(RespValue::NullBulk)
    }
}

fn unexpected(expected: &str, value: &RespValue) -> MuxError {
    MuxError::CommandRejected(format!("expected {expected}, got {value:?}"))
}

/// The reply as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl ResultDecoder for RawDecoder {
    type Output = RespValue;

    fn decode(&self, value: RespValue) -> MuxResult<RespValue> {
        Ok(value)
    }
}

/// `+OK` (or any simple string).
#[derive(Debug, Clone, Copy, Default)]
pub struct OkDecoder;

impl ResultDecoder for OkDecoder {
    type Output = ();

    fn decode(&self, value: RespValue) -> MuxResult<()> {
        match value {
            RespValue::SimpleString(_) => Ok(()),
            other => Err(unexpected("simple string", &other)),
        }
    }

    fn unanswered(&self) -> MuxResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerDecoder;

impl ResultDecoder for IntegerDecoder {
    type Output = i64;

    fn decode(&self, value: RespValue) -> MuxResult<i64> {
        value
            .as_integer()
            .ok_or_else(|| unexpected("integer", &value))
    }

    fn unanswered(&self) -> MuxResult<i64> {
        Ok(0)
    }
}

/// Nullable blob.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkDecoder;

impl ResultDecoder for BulkDecoder {
    type Output = Option<Bytes>;

    fn decode(&self, value: RespValue) -> MuxResult<Option<Bytes>> {
        match value {
            RespValue::NullBulk | RespValue::NullArray => Ok(None),
            RespValue::BulkString(data) | RespValue::SimpleString(data) => Ok(Some(data)),
            other => Err(unexpected("bulk string", &other)),
        }
    }
}

/// Nullable UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDecoder;

impl ResultDecoder for StringDecoder {
    type Output = Option<String>;

    fn decode(&self, value: RespValue) -> MuxResult<Option<String>> {
        match BulkDecoder.decode(value)? {
            Some(data) => String::from_utf8(data.to_vec())
                .map(Some)
                .map_err(|err| MuxError::CommandRejected(format!("reply is not utf-8: {err}"))),
            None => Ok(None),
        }
    }
}

/// Array of nullable blobs, as returned by `MGET`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkArrayDecoder;

impl ResultDecoder for BulkArrayDecoder {
    type Output = Vec<Option<Bytes>>;

    fn decode(&self, value: RespValue) -> MuxResult<Vec<Option<Bytes>>> {
        match value {
            RespValue::Array(items) => items.into_iter().map(|item| BulkDecoder.decode(item)).collect(),
            RespValue::NullArray => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    fn unanswered(&self) -> MuxResult<Vec<Option<Bytes>>> {
        Ok(Vec::new())
    }
}

/// Adapter for ad-hoc closures.
pub struct FnDecoder<F>(F);

pub fn decode_with<F, T>(f: F) -> FnDecoder<F>
where
    F: Fn(RespValue) -> MuxResult<T> + Send + 'static,
    T: Send + 'static,
{
    FnDecoder(f)
}

impl<F, T> ResultDecoder for FnDecoder<F>
where
    F: Fn(RespValue) -> MuxResult<T> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn decode(&self, value: RespValue) -> MuxResult<T> {
        (self.0)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn scalar_decoders() {
        assert_eq!(IntegerDecoder.decode(RespValue::Integer(5)).unwrap(), 5);
        assert_eq!(IntegerDecoder.decode(RespValue::bulk("12")).unwrap(), 12);
        assert!(OkDecoder.decode(RespValue::simple("OK")).is_ok());
        assert_eq!(
            OkDecoder.decode(RespValue::Integer(1)).unwrap_err().kind(),
            FailureKind::CommandRejected
        );
    }

    #[test]
    fn nullable_decoders() {
        assert_eq!(BulkDecoder.decode(RespValue::NullBulk).unwrap(), None);
        assert_eq!(
            StringDecoder.decode(RespValue::bulk("v")).unwrap().as_deref(),
            Some("v")
        );
        let mget = RespValue::Array(vec![RespValue::bulk("a"), RespValue::NullBulk]);
        assert_eq!(
            BulkArrayDecoder.decode(mget).unwrap(),
            vec![Some(Bytes::from_static(b"a")), None]
        );
    }

    #[test]
    fn unanswered_calls_resolve_to_empty_values() {
        assert!(OkDecoder.unanswered().is_ok());
        assert_eq!(IntegerDecoder.unanswered().unwrap(), 0);
        assert_eq!(BulkDecoder.unanswered().unwrap(), None);
        assert!(BulkArrayDecoder.unanswered().unwrap().is_empty());
        assert_eq!(RawDecoder.unanswered().unwrap(), RespValue::NullBulk);
    }

    #[test]
    fn closures_decode() {
        let len = decode_with(|value: RespValue| Ok(value.as_array().map_or(0, |a| a.len())));
        assert_eq!(len.decode(RespValue::Array(vec![RespValue::Integer(1)])).unwrap(), 1);
    }
}
