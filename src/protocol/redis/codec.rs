use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{MuxError, MuxResult};

use super::message::{Arg, Message};
use super::types::RespValue;

/// Largest bulk string accepted from the server.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Deepest array nesting accepted from the server.
pub const MAX_DEPTH: usize = 32;
/// Longest header or simple line tolerated without a terminator.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Incremental RESP2 codec.
///
/// Decoding is resumable: an incomplete frame leaves the buffer untouched
/// and yields `Ok(None)`. Complete frames are split off the buffer and blob
/// payloads become `Bytes` views into that frame.
///
/// Elements of a partial frame that were already validated are not scanned
/// again, so the buffer must only grow between calls until a frame is
/// returned.
#[derive(Debug, Clone, Default)]
pub struct RespCodec {
    scan: ScanState,
}

/// Progress through the frame at the front of the buffer.
#[derive(Debug, Clone, Default)]
struct ScanState {
    /// Start of the first element not yet validated.
    pos: usize,
    /// Elements still missing from each open array, outermost first.
    open: Vec<usize>,
}

impl RespCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> MuxResult<Option<Self::Item>> {
        if self.scan.pos > src.len() {
            self.scan = ScanState::default();
        }
        match scan_frame(&src[..], &mut self.scan) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(err) => {
                self.scan = ScanState::default();
                return Err(err);
            }
        }
        let frame = src.split_to(self.scan.pos).freeze();
        self.scan = ScanState::default();
        let mut cursor = 0usize;
        build_value(&frame, &mut cursor)
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = MuxError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> MuxResult<()> {
        write_value(&item, dst);
        Ok(())
    }
}

impl<'a> Encoder<&'a Message> for RespCodec {
    type Error = MuxError;

    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> MuxResult<()> {
        encode_request(item.command.verb(), &item.args, item.exec.permit_null, dst)
    }
}

/// Frame a request as an array of bulk strings: the verb, then every
/// argument. Nothing is written when the request is rejected.
pub fn encode_request(
    verb: &[u8],
    args: &[Arg],
    permit_null: bool,
    dst: &mut BytesMut,
) -> MuxResult<()> {
    if !permit_null && args.iter().any(|arg| matches!(arg, Arg::Null)) {
        return Err(MuxError::CommandRejected(format!(
            "{} does not accept a null argument",
            String::from_utf8_lossy(verb)
        )));
    }
    write_header(b'*', args.len() as i64 + 1, dst);
    write_bulk(verb, dst);
    for arg in args {
        match arg {
            Arg::Key(data) | Arg::Value(data) | Arg::Channel(data) => write_bulk(data, dst),
            Arg::Int(value) => write_bulk(value.to_string().as_bytes(), dst),
            Arg::Null => dst.extend_from_slice(b"$-1\r\n"),
        }
    }
    Ok(())
}

/// Validate the frame at the front of `src`, resuming from `state`.
/// Returns `false` when more bytes are needed; on `true`, `state.pos` is the
/// frame length.
fn scan_frame(src: &[u8], state: &mut ScanState) -> MuxResult<bool> {
    loop {
        let mut pos = state.pos;
        let Some(opened) = scan_element(src, &mut pos, state.open.len())? else {
            return Ok(false);
        };
        state.pos = pos;
        match opened {
            Some(len) => state.open.push(len),
            None => {
                // One element done; close every array it completes.
                while let Some(missing) = state.open.last_mut() {
                    *missing -= 1;
                    if *missing > 0 {
                        break;
                    }
                    state.open.pop();
                }
            }
        }
        if state.open.is_empty() {
            return Ok(true);
        }
    }
}

/// Validate one element header (and a scalar's body) at `pos`.
///
/// `None` means more bytes are needed. `Some(Some(len))` opens an array of
/// `len > 0` elements; `Some(None)` is a complete element.
fn scan_element(src: &[u8], pos: &mut usize, depth: usize) -> MuxResult<Option<Option<usize>>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let prefix = src[*pos];
    *pos += 1;
    match prefix {
        b'+' | b'-' => Ok(read_line(src, pos)?.map(|_| None)),
        b':' => match read_line(src, pos)? {
            Some(line) => {
                parse_integer(line, "integer")?;
                Ok(Some(None))
            }
            None => Ok(None),
        },
        b'$' => {
            let len = match read_line(src, pos)? {
                Some(line) => parse_length(line, "bulk string")?,
                None => return Ok(None),
            };
            let Some(len) = len else {
                return Ok(Some(None));
            };
            if len > MAX_BULK_LEN {
                return Err(MuxError::protocol(format!(
                    "bulk string length {len} exceeds limit"
                )));
            }
            if *pos + len + 2 > src.len() {
                return Ok(None);
            }
            if &src[*pos + len..*pos + len + 2] != b"\r\n" {
                return Err(MuxError::protocol("bulk string is not terminated by CRLF"));
            }
            *pos += len + 2;
            Ok(Some(None))
        }
        b'*' => {
            let len = match read_line(src, pos)? {
                Some(line) => parse_length(line, "array")?,
                None => return Ok(None),
            };
            match len {
                None | Some(0) => Ok(Some(None)),
                Some(_) if depth + 1 > MAX_DEPTH => {
                    Err(MuxError::protocol("array nesting too deep"))
                }
                Some(len) => Ok(Some(Some(len))),
            }
        }
        other => Err(MuxError::protocol(format!(
            "unsupported RESP prefix 0x{other:02x}"
        ))),
    }
}

/// Materialize a value already validated by `scan_frame`.
fn build_value(frame: &Bytes, pos: &mut usize) -> MuxResult<Option<RespValue>> {
    let prefix = frame[*pos];
    *pos += 1;
    let line_start = *pos;
    let line = match read_line(frame, pos)? {
        Some(line) => line,
        None => return Err(MuxError::protocol("truncated frame")),
    };
    let line_end = line_start + line.len();
    let value = match prefix {
        b'+' => RespValue::SimpleString(frame.slice(line_start..line_end)),
        b'-' => RespValue::Error(frame.slice(line_start..line_end)),
        b':' => RespValue::Integer(parse_integer(line, "integer")?),
        b'$' => match parse_length(line, "bulk string")? {
            None => RespValue::NullBulk,
            Some(len) => {
                let data = frame.slice(*pos..*pos + len);
                *pos += len + 2;
                RespValue::BulkString(data)
            }
        },
        b'*' => match parse_length(line, "array")? {
            None => RespValue::NullArray,
            Some(len) => {
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    match build_value(frame, pos)? {
                        Some(value) => values.push(value),
                        None => return Err(MuxError::protocol("truncated array")),
                    }
                }
                RespValue::Array(values)
            }
        },
        other => {
            return Err(MuxError::protocol(format!(
                "unsupported RESP prefix 0x{other:02x}"
            )))
        }
    };
    Ok(Some(value))
}

/// Strict `-?[0-9]+`.
fn parse_integer(bytes: &[u8], kind: &str) -> MuxResult<i64> {
    let digits = bytes.strip_prefix(b"-").unwrap_or(bytes);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(MuxError::protocol(format!(
            "invalid {kind} '{}'",
            String::from_utf8_lossy(bytes)
        )));
    }
    let text = std::str::from_utf8(bytes).map_err(|err| MuxError::protocol(err.to_string()))?;
    text.parse::<i64>()
        .map_err(|err| MuxError::protocol(format!("invalid {kind}: {err}")))
}

/// Length header; `-1` is the null marker, other negatives are invalid.
fn parse_length(bytes: &[u8], kind: &str) -> MuxResult<Option<usize>> {
    match parse_integer(bytes, kind)? {
        -1 => Ok(None),
        len if len < 0 => Err(MuxError::protocol(format!("invalid {kind} length {len}"))),
        len => Ok(Some(len as usize)),
    }
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> MuxResult<Option<&'a [u8]>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Ok(Some(line));
        }
        idx += 1;
    }
    if src.len() - *pos > MAX_LINE_LEN {
        return Err(MuxError::protocol("line exceeds limit without terminator"));
    }
    Ok(None)
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => write_line(b'+', data, dst),
        RespValue::Error(data) => write_line(b'-', data, dst),
        RespValue::Integer(value) => write_header(b':', *value, dst),
        RespValue::BulkString(data) => write_bulk(data, dst),
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            write_header(b'*', values.len() as i64, dst);
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

fn write_line(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.reserve(data.len() + 3);
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

fn write_header(prefix: u8, value: i64, dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(value.to_string().as_bytes());
    dst.extend_from_slice(b"\r\n");
}

fn write_bulk(data: &[u8], dst: &mut BytesMut) {
    dst.reserve(data.len() + 16);
    write_header(b'$', data.len() as i64, dst);
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::protocol::redis::command::Command;

    fn decode_all(codec: &mut RespCodec, buf: &mut BytesMut) -> Vec<RespValue> {
        let mut out = Vec::new();
        while let Some(value) = codec.decode(buf).expect("decode") {
            out.push(value);
        }
        out
    }

    const MIXED: &[u8] = b"+OK\r\n-ERR bad\r\n:-42\r\n$5\r\nhello\r\n$-1\r\n$0\r\n\r\n*2\r\n*1\r\n:1\r\n$1\r\nx\r\n*-1\r\n*0\r\n";

    #[test]
    fn decodes_every_kind() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(MIXED);
        let values = decode_all(&mut codec, &mut buf);
        assert_eq!(
            values,
            vec![
                RespValue::simple("OK"),
                RespValue::error("ERR bad"),
                RespValue::Integer(-42),
                RespValue::bulk("hello"),
                RespValue::NullBulk,
                RespValue::bulk(""),
                RespValue::Array(vec![
                    RespValue::Array(vec![RespValue::Integer(1)]),
                    RespValue::bulk("x"),
                ]),
                RespValue::NullArray,
                RespValue::Array(vec![]),
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn null_and_empty_are_distinct() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"$-1\r\n$0\r\n\r\n*-1\r\n*0\r\n"[..]);
        let values = decode_all(&mut codec, &mut buf);
        assert!(values[0].is_null());
        assert_eq!(values[1].as_bytes(), Some(&b""[..]));
        assert!(!values[1].is_null());
        assert!(values[2].is_null());
        assert_eq!(values[3].as_array().map(|a| a.len()), Some(0));
    }

    #[test]
    fn byte_at_a_time_matches_bulk_decode() {
        let mut whole = BytesMut::from(MIXED);
        let expected = decode_all(&mut RespCodec::new(), &mut whole);

        let mut codec = RespCodec::new();
        let mut buf = BytesMut::new();
        let mut seen = Vec::new();
        for byte in MIXED {
            buf.extend_from_slice(&[*byte]);
            seen.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(seen, expected);
        assert_eq!(buf, whole);
    }

    #[test]
    fn incomplete_frame_is_not_consumed() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n$3\r\nba"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 19);
        buf.extend_from_slice(b"r\r\n");
        let value = codec.decode(&mut buf).unwrap().expect("complete");
        assert_eq!(value, RespValue::Array(vec![RespValue::bulk("foo"), RespValue::bulk("bar")]));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_arrays_resume_after_the_last_whole_element() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"*3\r\n$1\r\na\r\n*2\r\n:1\r\n$1\r\nb"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.scan.pos, 19);
        assert_eq!(codec.scan.open, vec![2, 1]);

        buf.extend_from_slice(b"\r\n+done\r\n:9\r\n");
        let value = codec.decode(&mut buf).unwrap().expect("complete");
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::bulk("a"),
                RespValue::Array(vec![RespValue::Integer(1), RespValue::bulk("b")]),
                RespValue::simple("done"),
            ])
        );
        assert_eq!(codec.scan.pos, 0);
        assert!(codec.scan.open.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RespValue::Integer(9)));
    }

    #[test]
    fn errors_reset_the_scan() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"*2\r\n:1\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"%oops\r\n");
        assert!(codec.decode(&mut buf).is_err());
        assert_eq!(codec.scan.pos, 0);

        let mut fresh = BytesMut::from(&b":7\r\n"[..]);
        assert_eq!(codec.decode(&mut fresh).unwrap(), Some(RespValue::Integer(7)));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut buf = BytesMut::new();
        for _ in 0..=MAX_DEPTH {
            buf.extend_from_slice(b"*1\r\n");
        }
        buf.extend_from_slice(b":1\r\n");
        let err = RespCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProtocolViolation);
    }

    #[test]
    fn rejects_non_digit_lengths() {
        for input in [&b"$+3\r\nabc\r\n"[..], b"$ 3\r\nabc\r\n", b"*x\r\n", b"$\r\n", b":1.5\r\n"] {
            let err = RespCodec::new()
                .decode(&mut BytesMut::from(input))
                .expect_err("must reject");
            assert_eq!(err.kind(), FailureKind::ProtocolViolation);
        }
    }

    #[test]
    fn rejects_bad_terminators_and_prefixes() {
        let err = RespCodec::new().decode(&mut BytesMut::from(&b"$3\r\nabcXY"[..])).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProtocolViolation);
        let err = RespCodec::new().decode(&mut BytesMut::from(&b"%1\r\n"[..])).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProtocolViolation);
        let err = RespCodec::new().decode(&mut BytesMut::from(&b"$-2\r\n"[..])).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProtocolViolation);
    }

    #[test]
    fn encodes_request_with_ints_and_null() {
        let mut buf = BytesMut::new();
        let args = [Arg::Key(Bytes::from_static(b"k")), Arg::Int(-7), Arg::Null];
        encode_request(b"SET", &args, true, &mut buf).unwrap();
        assert_eq!(
            buf.as_ref(),
            b"*4\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\n-7\r\n$-1\r\n"
        );

        let mut buf = BytesMut::new();
        let err = encode_request(b"SET", &args, false, &mut buf).unwrap_err();
        assert_eq!(err.kind(), FailureKind::CommandRejected);
        assert!(buf.is_empty());
    }

    #[test]
    fn echoed_request_reproduces_arguments() {
        let message = Message::builder(Command::MSet)
            .key("{a}1")
            .value(Bytes::from_static(b"\r\n\x00binary"))
            .arg(Arg::Int(99))
            .build();
        let mut wire = BytesMut::new();
        RespCodec::new().encode(&message, &mut wire).unwrap();

        let value = RespCodec::new().decode(&mut wire).unwrap().expect("frame");
        let items = value.as_array().expect("array");
        assert_eq!(items[0].as_bytes(), Some(&b"MSET"[..]));
        assert_eq!(items[1].as_bytes(), Some(&b"{a}1"[..]));
        assert_eq!(items[2].as_bytes(), Some(&b"\r\n\x00binary"[..]));
        assert_eq!(items[3].as_bytes(), Some(&b"99"[..]));
    }

    #[test]
    fn value_encoder_round_trips_shapes() {
        let value = RespValue::Array(vec![
            RespValue::simple("OK"),
            RespValue::NullBulk,
            RespValue::Array(vec![]),
            RespValue::NullArray,
            RespValue::Integer(3),
        ]);
        let mut buf = BytesMut::new();
        RespCodec::new().encode(value.clone(), &mut buf).unwrap();
        assert_eq!(RespCodec::new().decode(&mut buf).unwrap(), Some(value));
    }
}
