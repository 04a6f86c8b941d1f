use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::{NodeId, TableId};

/// Kind of row change captured by the log triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowChange {
    Insert,
    Update,
    Delete,
}

impl RowChange {
    pub fn parse(cmdtype: &str) -> Result<Self> {
        match cmdtype {
            "I" => Ok(Self::Insert),
            "U" => Ok(Self::Update),
            "D" => Ok(Self::Delete),
            other => Err(anyhow!("unknown log_cmdtype {:?}", other)),
        }
    }
}

/// One captured change from `sl_log_1` / `sl_log_2`.
///
/// `cmddata` is a preformed SQL clause produced by the capture triggers:
/// a `(cols) values (...)` list for inserts, a `SET` list for updates, a
/// `WHERE` condition for deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRow {
    pub origin: NodeId,
    pub xid: String,
    pub tableid: TableId,
    pub actionseq: i64,
    pub change: RowChange,
    pub cmddata: String,
}

impl LogRow {
    /// Re-materialize the change as a single statement against the local
    /// replica of the table. The two leading comment lines record where the
    /// statement came from for debugging failed applies.
    pub fn apply_statement(&self, tab_fqname: &str) -> String {
        let header = format!(
            "-- log_xid {}\n-- log_actionseq {}\n",
            self.xid, self.actionseq
        );
        match self.change {
            RowChange::Insert => format!("{}insert into {} {};", header, tab_fqname, self.cmddata),
            RowChange::Update => format!("{}update {} set {};", header, tab_fqname, self.cmddata),
            RowChange::Delete => {
                format!("{}delete from {} where {};", header, tab_fqname, self.cmddata)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(change: RowChange, cmddata: &str) -> LogRow {
        LogRow {
            origin: 1,
            xid: "100".into(),
            tableid: 7,
            actionseq: 42,
            change,
            cmddata: cmddata.into(),
        }
    }

    #[test]
    fn insert_statement_shape() {
        let stmt = row(RowChange::Insert, "(a,b) values (1,'x')").apply_statement("public.t1");
        assert_eq!(
            stmt,
            "-- log_xid 100\n-- log_actionseq 42\ninsert into public.t1 (a,b) values (1,'x');"
        );
    }

    #[test]
    fn update_statement_shape() {
        let stmt = row(RowChange::Update, "b='y' where a=1").apply_statement("public.t1");
        assert!(stmt.ends_with("update public.t1 set b='y' where a=1;"));
    }

    #[test]
    fn delete_statement_shape() {
        let stmt = row(RowChange::Delete, "a=1").apply_statement("public.t1");
        assert!(stmt.ends_with("delete from public.t1 where a=1;"));
    }

    #[test]
    fn cmdtype_parse() {
        assert_eq!(RowChange::parse("I").unwrap(), RowChange::Insert);
        assert_eq!(RowChange::parse("U").unwrap(), RowChange::Update);
        assert_eq!(RowChange::parse("D").unwrap(), RowChange::Delete);
        assert!(RowChange::parse("T").is_err());
    }
}
