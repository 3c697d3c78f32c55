//! On-disk format of write-ahead log records
//!
//! A record is `[id: u64][length: u32][checksum: u32][payload]`. The payload
//! is a whitespace-separated textual tuple whose first token is the
//! operation keyword; raw-byte fields are hex-escaped so a payload never
//! contains whitespace or control bytes. Two framings carry the same
//! payload: binary (little-endian header, default) and text (one decimal
//! header + payload line per record).
//!
//! The checksum is a 31-polynomial rolling hash over the payload bytes.

use std::path::Path;

use crate::error::{KvtError, KvtResult};

/// Binary frame header size: id(8) + length(4) + checksum(4)
pub const HEADER_SIZE: usize = 16;

/// Rolling checksum over payload bytes: `c <- c*31 + byte`, 32-bit wrap.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let mut c = 0u32;
    for &b in payload {
        c = c.wrapping_mul(31).wrapping_add(u32::from(b));
    }
    c
}

// ---------------------------------------------------------------------------
// Field escaping
// ---------------------------------------------------------------------------

/// Token denoting the empty byte string. A backslash is always followed by
/// two hex digits in escaped data, so `\-` cannot collide with a real field.
const EMPTY_FIELD: &str = "\\-";

/// Token denoting the open upper bound of a scan. A literal `*` byte is
/// escaped, so the bare token is unambiguous.
const OPEN_BOUND: &str = "*";

fn needs_escape(b: u8) -> bool {
    !(0x21..=0x7e).contains(&b) || b == b'\\' || b == b'*'
}

/// Encode raw bytes as a single whitespace-free token.
pub fn escape_field(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return EMPTY_FIELD.to_string();
    }
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if needs_escape(b) {
            out.push('\\');
            out.push_str(&format!("{:02x}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Decode a token produced by `escape_field`.
pub fn unescape_field(token: &str) -> Result<Vec<u8>, String> {
    if token == EMPTY_FIELD {
        return Ok(Vec::new());
    }
    let raw = token.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            if i + 2 >= raw.len() {
                return Err(format!("truncated escape in token '{}'", token));
            }
            let hex = &token[i + 1..i + 3];
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| format!("bad escape '\\{}' in token '{}'", hex, token))?;
            out.push(b);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn escape_bound(bound: Option<&[u8]>) -> String {
    match bound {
        Some(key) => escape_field(key),
        None => OPEN_BOUND.to_string(),
    }
}

fn unescape_bound(token: &str) -> Result<Option<Vec<u8>>, String> {
    if token == OPEN_BOUND {
        Ok(None)
    } else {
        unescape_field(token).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Operation payloads
// ---------------------------------------------------------------------------

/// A decoded log record payload.
///
/// Compound operations (scan, process, batch) are recorded for the audit
/// trail but skipped on replay; their effects are derived from the
/// component SET/DEL records they emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    CreateTable { name: String, partition: String },
    DropTable { table_id: u64 },
    StartTx { tx_id: u64 },
    CommitTx { tx_id: u64 },
    RollbackTx { tx_id: u64 },
    Set { tx_id: u64, table_id: u64, key: Vec<u8>, value: Vec<u8> },
    Del { tx_id: u64, table_id: u64, key: Vec<u8> },
    Get { tx_id: u64, table_id: u64, key: Vec<u8> },
    Scan { tx_id: u64, table_id: u64, start: Vec<u8>, end: Option<Vec<u8>>, limit: u64 },
    Process { tx_id: u64, table_id: u64, key: Vec<u8> },
    RangeProcess { tx_id: u64, table_id: u64, start: Vec<u8>, end: Option<Vec<u8>>, limit: u64 },
    BatchExecute { tx_id: u64, num_ops: u64 },
}

impl LogOp {
    /// Whether this record mutates state when replayed.
    pub fn replayable(&self) -> bool {
        matches!(
            self,
            LogOp::CreateTable { .. }
                | LogOp::DropTable { .. }
                | LogOp::StartTx { .. }
                | LogOp::CommitTx { .. }
                | LogOp::RollbackTx { .. }
                | LogOp::Set { .. }
                | LogOp::Del { .. }
        )
    }

    /// Encode to the textual payload tuple.
    pub fn encode(&self) -> String {
        match self {
            LogOp::CreateTable { name, partition } => {
                format!("CREATE_TABLE {} {}", escape_field(name.as_bytes()), partition)
            }
            LogOp::DropTable { table_id } => format!("DROP_TABLE {}", table_id),
            LogOp::StartTx { tx_id } => format!("START_TRANSACTION {}", tx_id),
            LogOp::CommitTx { tx_id } => format!("COMMIT_TRANSACTION {}", tx_id),
            LogOp::RollbackTx { tx_id } => format!("ROLLBACK_TRANSACTION {}", tx_id),
            LogOp::Set { tx_id, table_id, key, value } => format!(
                "SET {} {} {} {}",
                tx_id,
                table_id,
                escape_field(key),
                escape_field(value)
            ),
            LogOp::Del { tx_id, table_id, key } => {
                format!("DEL {} {} {}", tx_id, table_id, escape_field(key))
            }
            LogOp::Get { tx_id, table_id, key } => {
                format!("GET {} {} {}", tx_id, table_id, escape_field(key))
            }
            LogOp::Scan { tx_id, table_id, start, end, limit } => format!(
                "SCAN {} {} {} {} {}",
                tx_id,
                table_id,
                escape_field(start),
                escape_bound(end.as_deref()),
                limit
            ),
            LogOp::Process { tx_id, table_id, key } => {
                format!("PROCESS {} {} {}", tx_id, table_id, escape_field(key))
            }
            LogOp::RangeProcess { tx_id, table_id, start, end, limit } => format!(
                "RANGE_PROCESS {} {} {} {} {}",
                tx_id,
                table_id,
                escape_field(start),
                escape_bound(end.as_deref()),
                limit
            ),
            LogOp::BatchExecute { tx_id, num_ops } => {
                format!("BATCH_EXECUTE {} {}", tx_id, num_ops)
            }
        }
    }

    /// Decode a payload tuple. Errors carry a reason; the caller adds file
    /// and offset context.
    pub fn decode(payload: &str) -> Result<LogOp, String> {
        let mut fields = Fields::split(payload)?;

        let op = match fields.keyword {
            "CREATE_TABLE" => {
                let name = String::from_utf8(unescape_field(fields.next("name")?)?)
                    .map_err(|_| "CREATE_TABLE: name is not UTF-8".to_string())?;
                LogOp::CreateTable { name, partition: fields.next("partition")?.to_string() }
            }
            "DROP_TABLE" => LogOp::DropTable { table_id: fields.next_u64("table_id")? },
            "START_TRANSACTION" => LogOp::StartTx { tx_id: fields.next_u64("tx_id")? },
            "COMMIT_TRANSACTION" => LogOp::CommitTx { tx_id: fields.next_u64("tx_id")? },
            "ROLLBACK_TRANSACTION" => LogOp::RollbackTx { tx_id: fields.next_u64("tx_id")? },
            "SET" => LogOp::Set {
                tx_id: fields.next_u64("tx_id")?,
                table_id: fields.next_u64("table_id")?,
                key: unescape_field(fields.next("key")?)?,
                value: unescape_field(fields.next("value")?)?,
            },
            "DEL" => LogOp::Del {
                tx_id: fields.next_u64("tx_id")?,
                table_id: fields.next_u64("table_id")?,
                key: unescape_field(fields.next("key")?)?,
            },
            "GET" => LogOp::Get {
                tx_id: fields.next_u64("tx_id")?,
                table_id: fields.next_u64("table_id")?,
                key: unescape_field(fields.next("key")?)?,
            },
            "SCAN" => LogOp::Scan {
                tx_id: fields.next_u64("tx_id")?,
                table_id: fields.next_u64("table_id")?,
                start: unescape_field(fields.next("start")?)?,
                end: unescape_bound(fields.next("end")?)?,
                limit: fields.next_u64("limit")?,
            },
            "PROCESS" => LogOp::Process {
                tx_id: fields.next_u64("tx_id")?,
                table_id: fields.next_u64("table_id")?,
                key: unescape_field(fields.next("key")?)?,
            },
            "RANGE_PROCESS" => LogOp::RangeProcess {
                tx_id: fields.next_u64("tx_id")?,
                table_id: fields.next_u64("table_id")?,
                start: unescape_field(fields.next("start")?)?,
                end: unescape_bound(fields.next("end")?)?,
                limit: fields.next_u64("limit")?,
            },
            "BATCH_EXECUTE" => LogOp::BatchExecute {
                tx_id: fields.next_u64("tx_id")?,
                num_ops: fields.next_u64("num_ops")?,
            },
            other => return Err(format!("unknown operation keyword '{}'", other)),
        };

        fields.finish()?;
        Ok(op)
    }
}

/// Cursor over the whitespace-separated fields of a payload.
struct Fields<'a> {
    keyword: &'a str,
    rest: std::str::Split<'a, char>,
}

impl<'a> Fields<'a> {
    fn split(payload: &'a str) -> Result<Self, String> {
        let mut rest = payload.split(' ');
        let keyword = rest.next().filter(|k| !k.is_empty()).ok_or("empty payload")?;
        Ok(Self { keyword, rest })
    }

    fn next(&mut self, what: &str) -> Result<&'a str, String> {
        self.rest
            .next()
            .ok_or_else(|| format!("{}: missing {} field", self.keyword, what))
    }

    fn next_u64(&mut self, what: &str) -> Result<u64, String> {
        let token = self.next(what)?;
        token
            .parse::<u64>()
            .map_err(|_| format!("{}: bad {} '{}'", self.keyword, what, token))
    }

    fn finish(mut self) -> Result<(), String> {
        if self.rest.next().is_some() {
            return Err(format!("{}: trailing fields in payload", self.keyword));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record framing
// ---------------------------------------------------------------------------

/// Outcome of decoding one frame from a buffer.
#[derive(Debug)]
pub enum FrameRead {
    /// A whole, verified record.
    Record {
        id: u64,
        payload: String,
        /// Offset of the byte following this record.
        next_offset: usize,
    },
    /// The buffer ends inside a record: the crash point. Replay stops here.
    Torn,
}

/// Encode one record in the configured framing.
pub fn encode_frame(id: u64, payload: &str, text: bool) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let checksum = payload_checksum(bytes);
    if text {
        format!("{} {} {} {}\n", id, bytes.len(), checksum, payload).into_bytes()
    } else {
        let mut buf = Vec::with_capacity(HEADER_SIZE + bytes.len());
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf.extend_from_slice(bytes);
        buf
    }
}

/// Decode one binary frame starting at `offset`.
pub fn decode_binary_frame(buf: &[u8], offset: usize, path: &Path) -> KvtResult<FrameRead> {
    if offset + HEADER_SIZE > buf.len() {
        return Ok(FrameRead::Torn);
    }
    let id = u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8-byte slice"));
    let length =
        u32::from_le_bytes(buf[offset + 8..offset + 12].try_into().expect("4-byte slice")) as usize;
    let stored =
        u32::from_le_bytes(buf[offset + 12..offset + 16].try_into().expect("4-byte slice"));

    let payload_start = offset + HEADER_SIZE;
    let payload_end = payload_start + length;
    if payload_end > buf.len() {
        return Ok(FrameRead::Torn);
    }

    let payload = &buf[payload_start..payload_end];
    let actual = payload_checksum(payload);
    if actual != stored {
        return Err(KvtError::ChecksumMismatch {
            path: path.to_path_buf(),
            record_id: id,
            expected: stored,
            actual,
        });
    }

    let payload = std::str::from_utf8(payload)
        .map_err(|_| KvtError::Corrupted {
            path: path.to_path_buf(),
            offset: payload_start as u64,
            reason: "payload is not valid UTF-8".into(),
        })?
        .to_string();

    Ok(FrameRead::Record { id, payload, next_offset: payload_end })
}

/// Decode one text frame (a line) starting at `offset`.
pub fn decode_text_frame(buf: &[u8], offset: usize, path: &Path) -> KvtResult<FrameRead> {
    if offset >= buf.len() {
        return Ok(FrameRead::Torn);
    }
    let rest = &buf[offset..];
    let Some(line_len) = rest.iter().position(|&b| b == b'\n') else {
        // No terminator: the record was being written when the process died
        return Ok(FrameRead::Torn);
    };

    let corrupt = |reason: String| KvtError::Corrupted {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason,
    };

    let line = std::str::from_utf8(&rest[..line_len])
        .map_err(|_| corrupt("log line is not valid UTF-8".into()))?;
    let mut parts = line.splitn(4, ' ');
    let id = parts
        .next()
        .and_then(|t| t.parse::<u64>().ok())
        .ok_or_else(|| corrupt("bad record id field".into()))?;
    let length = parts
        .next()
        .and_then(|t| t.parse::<usize>().ok())
        .ok_or_else(|| corrupt("bad record length field".into()))?;
    let stored = parts
        .next()
        .and_then(|t| t.parse::<u32>().ok())
        .ok_or_else(|| corrupt("bad record checksum field".into()))?;
    let payload = parts.next().unwrap_or("");

    if payload.len() != length {
        return Err(corrupt(format!(
            "payload length {} does not match header {}",
            payload.len(),
            length
        )));
    }

    let actual = payload_checksum(payload.as_bytes());
    if actual != stored {
        return Err(KvtError::ChecksumMismatch {
            path: path.to_path_buf(),
            record_id: id,
            expected: stored,
            actual,
        });
    }

    Ok(FrameRead::Record {
        id,
        payload: payload.to_string(),
        next_offset: offset + line_len + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_checksum_rolls() {
        assert_eq!(payload_checksum(b""), 0);
        assert_eq!(payload_checksum(b"a"), 97);
        assert_eq!(payload_checksum(b"ab"), 97 * 31 + 98);
    }

    #[test]
    fn test_escape_printable_passthrough() {
        assert_eq!(escape_field(b"hello_key.1"), "hello_key.1");
        assert_eq!(unescape_field("hello_key.1").unwrap(), b"hello_key.1");
    }

    #[test]
    fn test_escape_binary_and_space() {
        let raw = b"a b\x00\xff\\*";
        let escaped = escape_field(raw);
        assert_eq!(escaped, "a\\20b\\00\\ff\\5c\\2a");
        assert_eq!(unescape_field(&escaped).unwrap(), raw);
    }

    #[test]
    fn test_escape_empty_field() {
        assert_eq!(escape_field(b""), "\\-");
        assert_eq!(unescape_field("\\-").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_unescape_rejects_truncated() {
        assert!(unescape_field("abc\\f").is_err());
        assert!(unescape_field("\\zz").is_err());
    }

    #[test]
    fn test_op_roundtrip_all_keywords() {
        let ops = vec![
            LogOp::CreateTable { name: "users".into(), partition: "hash".into() },
            LogOp::DropTable { table_id: 3 },
            LogOp::StartTx { tx_id: 9 },
            LogOp::CommitTx { tx_id: 9 },
            LogOp::RollbackTx { tx_id: 9 },
            LogOp::Set { tx_id: 0, table_id: 1, key: b"k 1".to_vec(), value: vec![0, 255] },
            LogOp::Del { tx_id: 2, table_id: 1, key: b"gone".to_vec() },
            LogOp::Get { tx_id: 0, table_id: 1, key: Vec::new() },
            LogOp::Scan { tx_id: 0, table_id: 1, start: Vec::new(), end: None, limit: 10 },
            LogOp::Scan {
                tx_id: 4,
                table_id: 2,
                start: b"a".to_vec(),
                end: Some(b"*".to_vec()),
                limit: 0,
            },
            LogOp::Process { tx_id: 1, table_id: 1, key: b"p".to_vec() },
            LogOp::RangeProcess {
                tx_id: 1,
                table_id: 1,
                start: b"a".to_vec(),
                end: Some(b"z".to_vec()),
                limit: 5,
            },
            LogOp::BatchExecute { tx_id: 0, num_ops: 4 },
        ];
        for op in ops {
            let payload = op.encode();
            let decoded = LogOp::decode(&payload).unwrap();
            assert_eq!(decoded, op, "payload was: {}", payload);
        }
    }

    #[test]
    fn test_literal_star_key_is_not_open_bound() {
        let op = LogOp::Scan {
            tx_id: 0,
            table_id: 1,
            start: b"*".to_vec(),
            end: Some(b"*".to_vec()),
            limit: 1,
        };
        let payload = op.encode();
        // the real '*' key must be escaped in both bound positions
        assert_eq!(payload, "SCAN 0 1 \\2a \\2a 1");
        assert_eq!(LogOp::decode(&payload).unwrap(), op);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(LogOp::decode("").is_err());
        assert!(LogOp::decode("FROB 1 2").is_err());
        assert!(LogOp::decode("SET 1 2 k").is_err());
        assert!(LogOp::decode("SET 1 2 k v extra").is_err());
        assert!(LogOp::decode("DROP_TABLE notanumber").is_err());
    }

    #[test]
    fn test_binary_frame_roundtrip() {
        let path = PathBuf::from("kvt_log_0");
        let frame = encode_frame(7, "SET 0 1 k v", false);
        match decode_binary_frame(&frame, 0, &path).unwrap() {
            FrameRead::Record { id, payload, next_offset } => {
                assert_eq!(id, 7);
                assert_eq!(payload, "SET 0 1 k v");
                assert_eq!(next_offset, frame.len());
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_frame_torn() {
        let path = PathBuf::from("kvt_log_0");
        let frame = encode_frame(1, "COMMIT_TRANSACTION 5", false);
        // header only
        assert!(matches!(
            decode_binary_frame(&frame[..10], 0, &path).unwrap(),
            FrameRead::Torn
        ));
        // header plus part of the payload
        assert!(matches!(
            decode_binary_frame(&frame[..frame.len() - 3], 0, &path).unwrap(),
            FrameRead::Torn
        ));
    }

    #[test]
    fn test_binary_frame_checksum_mismatch() {
        let path = PathBuf::from("kvt_log_0");
        let mut frame = encode_frame(1, "DEL 0 1 key", false);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(
            decode_binary_frame(&frame, 0, &path),
            Err(KvtError::ChecksumMismatch { record_id: 1, .. })
        ));
    }

    #[test]
    fn test_text_frame_roundtrip_and_torn() {
        let path = PathBuf::from("kvt_log_0");
        let frame = encode_frame(3, "START_TRANSACTION 3", true);
        match decode_text_frame(&frame, 0, &path).unwrap() {
            FrameRead::Record { id, payload, next_offset } => {
                assert_eq!(id, 3);
                assert_eq!(payload, "START_TRANSACTION 3");
                assert_eq!(next_offset, frame.len());
            }
            other => panic!("expected record, got {:?}", other),
        }
        // drop the newline: torn
        assert!(matches!(
            decode_text_frame(&frame[..frame.len() - 1], 0, &path).unwrap(),
            FrameRead::Torn
        ));
    }

    #[test]
    fn test_text_frame_checksum_mismatch() {
        let path = PathBuf::from("kvt_log_0");
        let frame = encode_frame(2, "SET 0 1 a b", true);
        let text = String::from_utf8(frame).unwrap();
        let tampered = text.replace("a b", "a c");
        assert!(matches!(
            decode_text_frame(tampered.as_bytes(), 0, &path),
            Err(KvtError::ChecksumMismatch { .. })
        ));
    }
}
