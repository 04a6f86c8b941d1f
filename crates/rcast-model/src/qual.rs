use serde::{Deserialize, Serialize};

use crate::snapshot::XidSnapshot;
use crate::{EventSeq, SetId, TableId};

/// Persistent per-set replication progress: the last fully applied SYNC and
/// the residual action-sequence exclusion list.
///
/// `action_list` is a comma-separated list of quoted `log_actionseq` values
/// already applied ahead of the snapshot (from a partial apply or the
/// initial copy). It is stored verbatim in `sl_setsync.ssy_action_list` and
/// spliced verbatim into the qualification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSyncCursor {
    pub seqno: EventSeq,
    pub snapshot: XidSnapshot,
    pub action_list: String,
}

/// One set participating in a SYNC for a given provider: the set, the local
/// ids of its tables and the stored cursor to resume from.
#[derive(Debug, Clone)]
pub struct SyncSet {
    pub set_id: SetId,
    pub tab_ids: Vec<TableId>,
    pub cursor: SetSyncCursor,
}

/// Build the WHERE clause a helper attaches to its log-row cursor for one
/// provider.
///
/// For every set served by the provider the clause selects rows that are
/// (a) in one of the set's tables, (b) visible to the SYNC being applied,
/// and (c) not yet covered by the stored cursor:
///
/// ```text
/// where (log_tableid in (<tab_ids>)
///     and <visible-to-new-SYNC>
///     and <after-stored-cursor> [and log_actionseq not in (<action_list>)])
///  or (... next set ...)
/// ```
///
/// Sets with no tables are skipped. Returns an empty string when nothing
/// qualifies, in which case the caller must not dispatch the helper with an
/// unfiltered cursor.
pub fn provider_qualification(sync_snapshot: &XidSnapshot, sets: &[SyncSet]) -> String {
    let new_qual = sync_snapshot.visible_qual();
    let mut clause = String::new();

    for set in sets {
        if set.tab_ids.is_empty() {
            continue;
        }

        clause.push_str(if clause.is_empty() { "where (" } else { "\n or (" });

        clause.push_str("log_tableid in (");
        for (i, tab_id) in set.tab_ids.iter().enumerate() {
            if i > 0 {
                clause.push(',');
            }
            clause.push_str(&tab_id.to_string());
        }
        clause.push_str(")\n    and ");
        clause.push_str(&new_qual);
        clause.push_str("\n    and ");
        clause.push_str(&set.cursor.snapshot.after_qual());
        if !set.cursor.action_list.is_empty() {
            clause.push_str(" and log_actionseq not in (");
            clause.push_str(&set.cursor.action_list);
            clause.push(')');
        }
        clause.push(')');
    }

    clause
}
