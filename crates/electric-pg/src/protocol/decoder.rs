//! pgoutput decoder
//!
//! Decodes binary pgoutput messages and the `CopyData` frames that carry
//! them. Every read is bounds checked: a truncated message yields
//! [`DecodeError::NotEnoughData`] rather than a panic.

use super::message::*;
use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder errors
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid message type: {0:#04x}")]
    InvalidType(u8),
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

type Result<T> = std::result::Result<T, DecodeError>;

/// pgoutput decoder
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    /// Decode one pgoutput message
    pub fn decode(data: &mut Bytes) -> Result<ReplicationMessage> {
        let msg_type = get_u8(data)?;

        match msg_type {
            b'B' => Self::decode_begin(data).map(ReplicationMessage::Begin),
            b'C' => Self::decode_commit(data).map(ReplicationMessage::Commit),
            b'O' => Self::decode_origin(data).map(ReplicationMessage::Origin),
            b'R' => Self::decode_relation(data).map(ReplicationMessage::Relation),
            b'Y' => Self::decode_type(data).map(ReplicationMessage::Type),
            b'I' => Self::decode_insert(data).map(ReplicationMessage::Insert),
            b'U' => Self::decode_update(data).map(ReplicationMessage::Update),
            b'D' => Self::decode_delete(data).map(ReplicationMessage::Delete),
            b'T' => Self::decode_truncate(data).map(ReplicationMessage::Truncate),
            b'M' => Self::decode_message(data).map(ReplicationMessage::Message),
            t => Err(DecodeError::InvalidType(t)),
        }
    }

    /// Decode the payload of a `CopyData` frame
    pub fn decode_frame(mut data: Bytes) -> Result<ReplicationFrame> {
        match get_u8(&mut data)? {
            b'w' => {
                let wal_start = get_u64(&mut data)?;
                let wal_end = get_u64(&mut data)?;
                let timestamp = get_i64(&mut data)?;
                Ok(ReplicationFrame::XLogData {
                    wal_start,
                    wal_end,
                    timestamp,
                    data,
                })
            }
            b'k' => {
                let wal_end = get_u64(&mut data)?;
                let timestamp = get_i64(&mut data)?;
                let reply_requested = get_u8(&mut data)? == 1;
                Ok(ReplicationFrame::PrimaryKeepAlive {
                    wal_end,
                    timestamp,
                    reply_requested,
                })
            }
            t => Err(DecodeError::InvalidType(t)),
        }
    }

    fn decode_begin(buf: &mut Bytes) -> Result<BeginBody> {
        Ok(BeginBody {
            final_lsn: get_u64(buf)?,
            timestamp: get_i64(buf)?,
            xid: get_u32(buf)?,
        })
    }

    fn decode_commit(buf: &mut Bytes) -> Result<CommitBody> {
        Ok(CommitBody {
            flags: get_u8(buf)?,
            commit_lsn: get_u64(buf)?,
            end_lsn: get_u64(buf)?,
            timestamp: get_i64(buf)?,
        })
    }

    fn decode_origin(buf: &mut Bytes) -> Result<OriginBody> {
        Ok(OriginBody {
            commit_lsn: get_u64(buf)?,
            name: read_string(buf)?,
        })
    }

    fn decode_relation(buf: &mut Bytes) -> Result<RelationBody> {
        let id = get_u32(buf)?;
        let namespace = read_string(buf)?;
        let name = read_string(buf)?;
        let replica_identity = get_u8(buf)?;
        let num_columns = get_u16(buf)?;

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            columns.push(RelationColumn {
                flags: get_u8(buf)?,
                name: read_string(buf)?,
                type_id: get_u32(buf)?,
                type_mod: get_i32(buf)?,
            });
        }

        Ok(RelationBody {
            id,
            namespace,
            name,
            replica_identity,
            columns,
        })
    }

    fn decode_type(buf: &mut Bytes) -> Result<TypeBody> {
        Ok(TypeBody {
            id: get_u32(buf)?,
            namespace: read_string(buf)?,
            name: read_string(buf)?,
        })
    }

    fn decode_insert(buf: &mut Bytes) -> Result<InsertBody> {
        let relation_id = get_u32(buf)?;
        expect_tag(buf, b'N')?;
        let tuple = decode_tuple(buf)?;
        Ok(InsertBody { relation_id, tuple })
    }

    fn decode_update(buf: &mut Bytes) -> Result<UpdateBody> {
        let relation_id = get_u32(buf)?;

        let old = match get_u8(buf)? {
            b'N' => None,
            b'K' => {
                let key = decode_tuple(buf)?;
                expect_tag(buf, b'N')?;
                Some(OldTuple::Key(key))
            }
            b'O' => {
                let old = decode_tuple(buf)?;
                expect_tag(buf, b'N')?;
                Some(OldTuple::Full(old))
            }
            t => return Err(DecodeError::InvalidType(t)),
        };
        let new_tuple = decode_tuple(buf)?;

        Ok(UpdateBody {
            relation_id,
            old,
            new_tuple,
        })
    }

    fn decode_delete(buf: &mut Bytes) -> Result<DeleteBody> {
        let relation_id = get_u32(buf)?;
        let old = match get_u8(buf)? {
            b'K' => OldTuple::Key(decode_tuple(buf)?),
            b'O' => OldTuple::Full(decode_tuple(buf)?),
            t => return Err(DecodeError::InvalidType(t)),
        };
        Ok(DeleteBody { relation_id, old })
    }

    fn decode_truncate(buf: &mut Bytes) -> Result<TruncateBody> {
        let num_rels = get_u32(buf)?;
        let options = get_u8(buf)?;
        let mut relation_ids = Vec::with_capacity(num_rels.min(1024) as usize);
        for _ in 0..num_rels {
            relation_ids.push(get_u32(buf)?);
        }
        Ok(TruncateBody {
            options,
            relation_ids,
        })
    }

    fn decode_message(buf: &mut Bytes) -> Result<LogicalMessageBody> {
        let transactional = get_u8(buf)? == 1;
        let lsn = get_u64(buf)?;
        let prefix = read_string(buf)?;
        let len = get_u32(buf)? as usize;
        need(buf, len)?;
        Ok(LogicalMessageBody {
            transactional,
            lsn,
            prefix,
            content: buf.split_to(len),
        })
    }
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(DecodeError::NotEnoughData);
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

fn expect_tag(buf: &mut Bytes, tag: u8) -> Result<()> {
    let found = get_u8(buf)?;
    if found != tag {
        return Err(DecodeError::Protocol(format!(
            "expected tuple tag '{}', found {found:#04x}",
            tag as char
        )));
    }
    Ok(())
}

fn read_string(buf: &mut Bytes) -> Result<String> {
    let n = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::NotEnoughData)?;
    let s_bytes = buf.split_to(n);
    buf.advance(1); // skip NUL
    Ok(std::str::from_utf8(&s_bytes)?.to_string())
}

fn decode_tuple(buf: &mut Bytes) -> Result<Tuple> {
    let num_cols = get_u16(buf)?;
    let mut columns = Vec::with_capacity(num_cols as usize);

    for _ in 0..num_cols {
        let data = match get_u8(buf)? {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                let len = get_u32(buf)? as usize;
                need(buf, len)?;
                TupleData::Text(buf.split_to(len))
            }
            t => return Err(DecodeError::InvalidType(t)),
        };
        columns.push(data);
    }

    Ok(Tuple(columns))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    pub(crate) fn put_tuple(buf: &mut BytesMut, values: &[Option<&str>]) {
        buf.put_u16(values.len() as u16);
        for v in values {
            match v {
                Some(text) => {
                    buf.put_u8(b't');
                    buf.put_u32(text.len() as u32);
                    buf.put_slice(text.as_bytes());
                }
                None => buf.put_u8(b'n'),
            }
        }
    }

    #[test]
    fn test_decode_begin() {
        let mut data = BytesMut::new();
        data.put_u8(b'B');
        data.put_u64(0x0000_0001_0000_0000);
        data.put_i64(1_705_000_000_000_000);
        data.put_u32(42);

        let msg = PgOutputDecoder::decode(&mut data.freeze()).unwrap();
        assert_eq!(
            msg,
            ReplicationMessage::Begin(BeginBody {
                final_lsn: 0x0000_0001_0000_0000,
                timestamp: 1_705_000_000_000_000,
                xid: 42,
            })
        );
    }

    #[test]
    fn test_decode_relation() {
        let mut data = BytesMut::new();
        data.put_u8(b'R');
        data.put_u32(16384);
        put_string(&mut data, "public");
        put_string(&mut data, "users");
        data.put_u8(b'f');
        data.put_u16(2);
        data.put_u8(1);
        put_string(&mut data, "id");
        data.put_u32(23);
        data.put_i32(-1);
        data.put_u8(0);
        put_string(&mut data, "name");
        data.put_u32(1043);
        data.put_i32(68);

        let ReplicationMessage::Relation(rel) = PgOutputDecoder::decode(&mut data.freeze()).unwrap()
        else {
            panic!("expected relation");
        };
        assert_eq!(rel.id, 16384);
        assert_eq!(rel.namespace, "public");
        assert_eq!(rel.name, "users");
        assert_eq!(rel.replica_identity, b'f');
        assert!(rel.columns[0].is_key());
        assert!(!rel.columns[1].is_key());
        assert_eq!(rel.columns[1].type_id, 1043);
        assert_eq!(rel.columns[1].type_mod, 68);
    }

    #[test]
    fn test_decode_update_with_old_row() {
        let mut data = BytesMut::new();
        data.put_u8(b'U');
        data.put_u32(7);
        data.put_u8(b'O');
        put_tuple(&mut data, &[Some("1"), Some("a")]);
        data.put_u8(b'N');
        put_tuple(&mut data, &[Some("1"), None]);

        let ReplicationMessage::Update(update) = PgOutputDecoder::decode(&mut data.freeze()).unwrap()
        else {
            panic!("expected update");
        };
        assert_eq!(update.relation_id, 7);
        assert!(matches!(update.old, Some(OldTuple::Full(ref t)) if t.len() == 2));
        assert_eq!(update.new_tuple.0[1], TupleData::Null);
    }

    #[test]
    fn test_decode_update_without_old_row() {
        let mut data = BytesMut::new();
        data.put_u8(b'U');
        data.put_u32(7);
        data.put_u8(b'N');
        data.put_u16(1);
        data.put_u8(b'u');

        let ReplicationMessage::Update(update) = PgOutputDecoder::decode(&mut data.freeze()).unwrap()
        else {
            panic!("expected update");
        };
        assert!(update.old.is_none());
        assert_eq!(update.new_tuple.0, vec![TupleData::Toast]);
    }

    #[test]
    fn test_decode_truncate() {
        let mut data = BytesMut::new();
        data.put_u8(b'T');
        data.put_u32(2);
        data.put_u8(0);
        data.put_u32(10);
        data.put_u32(11);

        let msg = PgOutputDecoder::decode(&mut data.freeze()).unwrap();
        assert_eq!(
            msg,
            ReplicationMessage::Truncate(TruncateBody {
                options: 0,
                relation_ids: vec![10, 11],
            })
        );
    }

    #[test]
    fn test_truncated_message_is_an_error() {
        let mut data = BytesMut::new();
        data.put_u8(b'I');
        data.put_u32(7);
        data.put_u8(b'N');
        data.put_u16(1);
        data.put_u8(b't');
        data.put_u32(100);
        data.put_slice(b"short");

        let err = PgOutputDecoder::decode(&mut data.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::NotEnoughData));
    }

    #[test]
    fn test_unknown_type() {
        let mut data = Bytes::from_static(b"Z");
        assert!(matches!(
            PgOutputDecoder::decode(&mut data),
            Err(DecodeError::InvalidType(b'Z'))
        ));
    }

    #[test]
    fn test_decode_keepalive_frame() {
        let mut data = BytesMut::new();
        data.put_u8(b'k');
        data.put_u64(0x16_B374_D848);
        data.put_i64(0);
        data.put_u8(1);

        let frame = PgOutputDecoder::decode_frame(data.freeze()).unwrap();
        assert_eq!(
            frame,
            ReplicationFrame::PrimaryKeepAlive {
                wal_end: 0x16_B374_D848,
                timestamp: 0,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn test_decode_xlog_frame() {
        let mut data = BytesMut::new();
        data.put_u8(b'w');
        data.put_u64(1);
        data.put_u64(2);
        data.put_i64(3);
        data.put_slice(b"B...");

        let ReplicationFrame::XLogData { wal_start, data, .. } =
            PgOutputDecoder::decode_frame(data.freeze()).unwrap()
        else {
            panic!("expected xlog data");
        };
        assert_eq!(wal_start, 1);
        assert_eq!(&data[..], b"B...");
    }
}
