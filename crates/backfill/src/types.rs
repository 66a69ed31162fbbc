use common::types::{
    IndexId,
    RowKey,
    SchemaVersion,
    TableId,
    TabletId,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Visibility/write-eligibility stage of an index under construction.
///
/// Live writes start maintaining the index before any historic row is copied:
/// first deletes only, then all writes, and only then does the backfill copy
/// the frozen history underneath them. Stages never regress; the only
/// transition off the ladder is into terminal `Failed`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum IndexPermission {
    /// Live writes delete stale entries from the index but insert nothing.
    DeleteOnly,
    /// Live writes maintain the index fully; historic rows are still absent.
    WriteAndDelete,
    /// Historic rows are being copied in at a frozen read point.
    Backfill,
    /// Fully built and eligible for reads.
    Public,
    /// The build failed. Never exposed for reads or writes; carries the
    /// first observed error as diagnostic context.
    Failed { message: String },
}

impl IndexPermission {
    fn phase(&self) -> u8 {
        match self {
            IndexPermission::DeleteOnly => 0,
            IndexPermission::WriteAndDelete => 1,
            IndexPermission::Backfill => 2,
            IndexPermission::Public => 3,
            IndexPermission::Failed { .. } => u8::MAX,
        }
    }

    /// The stage the alter controller advances to next, one stage per alter
    /// round. `Backfill` has no successor here: it advances to `Public` only
    /// through a completed backfill run.
    pub fn next_stage(&self) -> Option<IndexPermission> {
        match self {
            IndexPermission::DeleteOnly => Some(IndexPermission::WriteAndDelete),
            IndexPermission::WriteAndDelete => Some(IndexPermission::Backfill),
            IndexPermission::Backfill
            | IndexPermission::Public
            | IndexPermission::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IndexPermission::Public | IndexPermission::Failed { .. }
        )
    }

    /// Stage transitions are monotonic: forward on the ladder, or into
    /// terminal `Failed` from any non-terminal stage.
    pub fn can_transition_to(&self, next: &IndexPermission) -> bool {
        match (self, next) {
            (IndexPermission::Failed { .. }, _) => false,
            (IndexPermission::Public, _) => false,
            (_, IndexPermission::Failed { .. }) => true,
            (_, _) => next.phase() > self.phase(),
        }
    }
}

/// One target index under construction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: IndexId,
    /// The index's own backing table. It has tablets of its own; the
    /// compaction hold is released there after a successful build.
    pub table_id: TableId,
    /// Requested visibility name.
    pub name: String,
    pub permission: IndexPermission,
}

/// The indexed table: the table whose rows are copied into new indexes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub id: TableId,
    pub schema_version: SchemaVersion,
    pub indexes: Vec<IndexDescriptor>,
}

impl TableDescriptor {
    pub fn index(&self, id: &IndexId) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|index| &index.id == id)
    }
}

/// One tablet of a table, as this subsystem sees it. Leader location is
/// resolved externally and may move at any time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TabletDescriptor {
    pub id: TabletId,
    /// Inclusive lower bound of the tablet's key range.
    pub start_key: RowKey,
}

/// Persisted resume state for one tablet within a backfill run. Written only
/// by the tablet's driver, read again on coordinator restart so completed
/// work is never redone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackfillCheckpoint {
    NotStarted,
    /// Everything strictly before this key has been backfilled; the next
    /// chunk starts here.
    Resume(RowKey),
    Complete,
}

impl BackfillCheckpoint {
    /// Whether replacing `self` with `next` moves forward. Within one run a
    /// checkpoint only ever advances, to a strictly later resume key or to
    /// the completion marker; anything else indicates chunk responses
    /// applied out of order.
    pub fn advances_to(&self, next: &BackfillCheckpoint) -> bool {
        match (self, next) {
            (BackfillCheckpoint::Complete, _) => false,
            (_, BackfillCheckpoint::Complete) => true,
            (_, BackfillCheckpoint::NotStarted) => false,
            (BackfillCheckpoint::NotStarted, BackfillCheckpoint::Resume(_)) => true,
            (BackfillCheckpoint::Resume(prev), BackfillCheckpoint::Resume(next)) => next > prev,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedBackfillCheckpoint {
    state: String,
    resume_key: Option<String>,
}

impl From<BackfillCheckpoint> for SerializedBackfillCheckpoint {
    fn from(checkpoint: BackfillCheckpoint) -> Self {
        match checkpoint {
            BackfillCheckpoint::NotStarted => SerializedBackfillCheckpoint {
                state: "not_started".to_owned(),
                resume_key: None,
            },
            BackfillCheckpoint::Resume(key) => SerializedBackfillCheckpoint {
                state: "resume".to_owned(),
                resume_key: Some(key.hex()),
            },
            BackfillCheckpoint::Complete => SerializedBackfillCheckpoint {
                state: "complete".to_owned(),
                resume_key: None,
            },
        }
    }
}

impl TryFrom<SerializedBackfillCheckpoint> for BackfillCheckpoint {
    type Error = anyhow::Error;

    fn try_from(checkpoint: SerializedBackfillCheckpoint) -> anyhow::Result<Self> {
        match checkpoint.state.as_str() {
            "not_started" => Ok(BackfillCheckpoint::NotStarted),
            "resume" => {
                let key = checkpoint
                    .resume_key
                    .ok_or_else(|| anyhow::anyhow!("resume checkpoint missing its key"))?;
                Ok(BackfillCheckpoint::Resume(RowKey::from_hex(&key)?))
            },
            "complete" => Ok(BackfillCheckpoint::Complete),
            state => anyhow::bail!("unknown checkpoint state {state}"),
        }
    }
}
