//! pgoutput logical replication messages (protocol version 1)

use bytes::Bytes;

/// pgoutput replication message
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    /// Origin of a transaction replicated from another node
    Origin(OriginBody),
    /// Table definition, sent before the first change of a table in a
    /// session and again after every schema change
    Relation(RelationBody),
    /// Custom type definition
    Type(TypeBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
    /// Logical decoding message emitted by `pg_logical_emit_message`
    Message(LogicalMessageBody),
}

/// BEGIN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginBody {
    pub final_lsn: u64,
    /// Microseconds since 2000-01-01
    pub timestamp: i64,
    pub xid: u32,
}

/// COMMIT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

/// ORIGIN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginBody {
    pub commit_lsn: u64,
    pub name: String,
}

/// RELATION message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    /// `d` default, `n` nothing, `f` full, `i` index
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

/// Column definition within a relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    /// Bit 1 marks a replica identity column
    pub flags: u8,
    pub name: String,
    pub type_id: u32,
    pub type_mod: i32,
}

impl RelationColumn {
    pub fn is_key(&self) -> bool {
        self.flags & 1 == 1
    }
}

/// TYPE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

/// INSERT message
#[derive(Debug, Clone, PartialEq)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: Tuple,
}

/// Old row image carried by UPDATE and DELETE
#[derive(Debug, Clone, PartialEq)]
pub enum OldTuple {
    /// Replica identity columns only (`K`)
    Key(Tuple),
    /// Full old row (`O`), sent with `REPLICA IDENTITY FULL`
    Full(Tuple),
}

impl OldTuple {
    pub fn tuple(&self) -> &Tuple {
        match self {
            OldTuple::Key(t) | OldTuple::Full(t) => t,
        }
    }
}

/// UPDATE message
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBody {
    pub relation_id: u32,
    pub old: Option<OldTuple>,
    pub new_tuple: Tuple,
}

/// DELETE message
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old: OldTuple,
}

/// TRUNCATE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateBody {
    /// Bit 1 `CASCADE`, bit 2 `RESTART IDENTITY`
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

/// MESSAGE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessageBody {
    pub transactional: bool,
    pub lsn: u64,
    pub prefix: String,
    pub content: Bytes,
}

/// Row tuple
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple(pub Vec<TupleData>);

impl Tuple {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Column data within a tuple
#[derive(Debug, Clone, PartialEq)]
pub enum TupleData {
    Null,
    /// Unchanged TOASTed value; the actual value is not sent
    Toast,
    /// Text representation
    Text(Bytes),
}

/// Payload of a `CopyData` frame on a replication connection
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    /// WAL data (`w`)
    XLogData {
        wal_start: u64,
        wal_end: u64,
        timestamp: i64,
        data: Bytes,
    },
    /// Primary keepalive (`k`)
    PrimaryKeepAlive {
        wal_end: u64,
        timestamp: i64,
        reply_requested: bool,
    },
}
