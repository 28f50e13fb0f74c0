//! Replication directions and pipe connect options.

use crate::error::{IpcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bit mask selecting what an endpoint does with deltas.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateMode(u8);

impl UpdateMode {
    /// Send local changes to the peer.
    pub const SEND: UpdateMode = UpdateMode(0x01);
    /// Apply changes received from the peer.
    pub const RECEIVE: UpdateMode = UpdateMode(0x02);
    /// Push the whole local tree as soon as a connection is made.
    pub const FULL_SYNC_ON_CONNECT: UpdateMode = UpdateMode(0x04);
    /// Send and receive.
    pub const BIDIRECTIONAL: UpdateMode = UpdateMode(0x01 | 0x02);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: UpdateMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check that the mask makes sense: it must send or receive, and a full
    /// sync on connect is only possible when sending.
    pub fn validate(self) -> Result<()> {
        if !self.contains(Self::SEND) && !self.contains(Self::RECEIVE) {
            return Err(IpcError::InvalidMode(format!(
                "{:?} neither sends nor receives",
                self
            )));
        }
        if self.contains(Self::FULL_SYNC_ON_CONNECT) && !self.contains(Self::SEND) {
            return Err(IpcError::InvalidMode(format!(
                "{:?} requests a full sync on connect without sending",
                self
            )));
        }
        Ok(())
    }
}

impl BitOr for UpdateMode {
    type Output = UpdateMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        UpdateMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::SEND) {
            names.push("SEND");
        }
        if self.contains(Self::RECEIVE) {
            names.push("RECEIVE");
        }
        if self.contains(Self::FULL_SYNC_ON_CONNECT) {
            names.push("FULL_SYNC_ON_CONNECT");
        }
        if names.is_empty() {
            write!(f, "UpdateMode(empty)")
        } else {
            write!(f, "UpdateMode({})", names.join(" | "))
        }
    }
}

/// How [`Endpoint::connect`](crate::Endpoint::connect) treats a named pipe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectOption {
    /// For sockets, which take no options.
    #[default]
    NoOptions,
    /// Create the pipe; fail if it already exists.
    CreateOrFail,
    /// Connect to an existing pipe; fail if there is none.
    MustExist,
    /// Connect if the pipe exists, otherwise create it.
    CreateIfNeeded,
}
