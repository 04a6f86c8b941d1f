use serde::{Deserialize, Serialize};

/// The visibility boundary of a transaction set, as captured by the origin
/// when it announced an event.
///
/// All transaction ids strictly below `minxid` were committed; ids at or
/// above `maxxid` are in the future; ids in between are committed unless
/// listed in `xip` (in progress at snapshot time).
///
/// The xid values are opaque, origin-formatted strings. They are only ever
/// compared server-side by the origin's xid operators, so no numeric
/// interpretation happens on this end. `xip` is a comma-separated list of
/// quoted xids, possibly empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XidSnapshot {
    pub minxid: String,
    pub maxxid: String,
    pub xip: String,
}

impl XidSnapshot {
    pub fn new(minxid: impl Into<String>, maxxid: impl Into<String>, xip: impl Into<String>) -> Self {
        Self {
            minxid: minxid.into(),
            maxxid: maxxid.into(),
            xip: xip.into(),
        }
    }

    /// A zeroed snapshot, used to seed a set sync cursor when the origin has
    /// never emitted a SYNC.
    pub fn zero() -> Self {
        Self::new("0", "0", "")
    }

    /// SQL predicate matching log rows *visible to* this snapshot: work that
    /// was committed when the snapshot was taken.
    pub fn visible_qual(&self) -> String {
        if self.xip.is_empty() {
            format!("(log_xid <= '{}')", self.maxxid)
        } else {
            format!(
                "(log_xid < '{}' or (log_xid <= '{}' and log_xid not in ({})))",
                self.minxid, self.maxxid, self.xip
            )
        }
    }

    /// SQL predicate matching log rows *after* this snapshot: the inverse of
    /// [`visible_qual`](Self::visible_qual), used against a stored sync
    /// cursor to pick up exactly the work the last SYNC did not cover.
    pub fn after_qual(&self) -> String {
        if self.xip.is_empty() {
            format!("(log_xid >= '{}')", self.minxid)
        } else {
            format!(
                "(log_xid > '{}' or (log_xid >= '{}' and log_xid in ({})))",
                self.maxxid, self.minxid, self.xip
            )
        }
    }
}
