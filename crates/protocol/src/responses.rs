//! Typed responses returned by storage servers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status code carried by every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// The server does not own the tablet for (some of) the keys; the
    /// client's routing information is stale
    UnknownTablet,
    /// The table does not exist anywhere in the cluster
    TableDoesntExist,
    ObjectDoesntExist,
    /// The server is temporarily unable to serve the request
    Retry,
    InternalError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "STATUS_OK",
            Self::UnknownTablet => "STATUS_UNKNOWN_TABLET",
            Self::TableDoesntExist => "STATUS_TABLE_DOESNT_EXIST",
            Self::ObjectDoesntExist => "STATUS_OBJECT_DOESNT_EXIST",
            Self::Retry => "STATUS_RETRY",
            Self::InternalError => "STATUS_INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Participant vote in the prepare phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// All ops were locked and validated
    Prepared,
    /// A lock conflict or validation failure; the transaction must abort
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub status: Status,
    pub vote: Vote,
}

impl PrepareResponse {
    pub fn prepared() -> Self {
        Self {
            status: Status::Ok,
            vote: Vote::Prepared,
        }
    }

    pub fn abort() -> Self {
        Self {
            status: Status::Ok,
            vote: Vote::Abort,
        }
    }

    /// A non-OK status; the vote is meaningless and reported as abort
    pub fn failed(status: Status) -> Self {
        Self {
            status,
            vote: Vote::Abort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub status: Status,
    pub value: Option<Vec<u8>>,
}

/// Any response a server sends back to a transaction client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxResponse {
    Prepare(PrepareResponse),
    Decision(DecisionResponse),
    Read(ReadResponse),
}

impl TxResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prepare(_) => "prepare",
            Self::Decision(_) => "decision",
            Self::Read(_) => "read",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Prepare(r) => r.status,
            Self::Decision(r) => r.status,
            Self::Read(r) => r.status,
        }
    }
}
