//! Command table of the control channel.
//!
//! Each command declares how a client issues it and what the master
//! broadcasts afterwards:
//!
//! | command              | reply  | broadcast |
//! |----------------------|--------|-----------|
//! | Hello                | -      | -         |
//! | Ping                 | Sync   | -         |
//! | StatSnapshot         | Sync   | -         |
//! | StatSetConf          | Sync   | Replay    |
//! | StatClearTraffic     | Async  | Replay    |
//! | StatDeleteApp        | Sync   | Replay    |
//! | StatQueryBuckets     | Sync   | -         |
//! | StatListApps         | Sync   | -         |
//! | StatAppCreated       | -      | Observe   |
//! | StatTrafficLogged    | -      | Observe   |
//! | StatQuotaAlert       | -      | Observe   |
//! | DriverStatus         | Sync   | -         |
//! | DriverUpdateConf     | Sync   | -         |
//! | DriverSetFlags       | Async  | -         |
//! | DriverQueryCounters  | Sync   | -         |
//! | DriverClearCounters  | Async  | -         |
//! | DriverStateChanged   | -      | Observe   |
//! | DriverConfUpdated    | -      | Observe   |
//! | LogRecord            | -      | Observe   |
//!
//! `Replay` broadcasts carry the same command and arguments the operation was
//! invoked with; `Observe` broadcasts carry a result payload.

/// How a client waits for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// The caller blocks for a reply frame.
    Sync,
    /// Posted without a correlation id; the effect arrives as a broadcast.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    None,
    Replay,
    Observe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Hello,
    Ping,
    StatSnapshot,
    StatSetConf,
    StatClearTraffic,
    StatDeleteApp,
    StatQueryBuckets,
    StatListApps,
    StatAppCreated,
    StatTrafficLogged,
    StatQuotaAlert,
    DriverStatus,
    DriverUpdateConf,
    DriverSetFlags,
    DriverQueryCounters,
    DriverClearCounters,
    DriverStateChanged,
    DriverConfUpdated,
    LogRecord,
}

impl Command {
    pub const ALL: [Command; 19] = [
        Command::Hello,
        Command::Ping,
        Command::StatSnapshot,
        Command::StatSetConf,
        Command::StatClearTraffic,
        Command::StatDeleteApp,
        Command::StatQueryBuckets,
        Command::StatListApps,
        Command::StatAppCreated,
        Command::StatTrafficLogged,
        Command::StatQuotaAlert,
        Command::DriverStatus,
        Command::DriverUpdateConf,
        Command::DriverSetFlags,
        Command::DriverQueryCounters,
        Command::DriverClearCounters,
        Command::DriverStateChanged,
        Command::DriverConfUpdated,
        Command::LogRecord,
    ];

    /// Wire id. Ids are grouped by capability and never renumbered.
    pub fn id(self) -> u32 {
        match self {
            Command::Hello => 1,
            Command::Ping => 2,
            Command::StatSnapshot => 10,
            Command::StatSetConf => 11,
            Command::StatClearTraffic => 12,
            Command::StatDeleteApp => 13,
            Command::StatQueryBuckets => 14,
            Command::StatListApps => 15,
            Command::StatAppCreated => 16,
            Command::StatTrafficLogged => 17,
            Command::StatQuotaAlert => 18,
            Command::DriverStatus => 20,
            Command::DriverUpdateConf => 21,
            Command::DriverSetFlags => 22,
            Command::DriverQueryCounters => 23,
            Command::DriverClearCounters => 24,
            Command::DriverStateChanged => 25,
            Command::DriverConfUpdated => 26,
            Command::LogRecord => 30,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    /// `None` for commands a client may not send (hello and broadcast-only ones).
    pub fn reply_mode(self) -> Option<ReplyMode> {
        match self {
            Command::Ping
            | Command::StatSnapshot
            | Command::StatSetConf
            | Command::StatDeleteApp
            | Command::StatQueryBuckets
            | Command::StatListApps
            | Command::DriverStatus
            | Command::DriverUpdateConf
            | Command::DriverQueryCounters => Some(ReplyMode::Sync),
            Command::StatClearTraffic | Command::DriverSetFlags | Command::DriverClearCounters => {
                Some(ReplyMode::Async)
            }
            Command::Hello
            | Command::StatAppCreated
            | Command::StatTrafficLogged
            | Command::StatQuotaAlert
            | Command::DriverStateChanged
            | Command::DriverConfUpdated
            | Command::LogRecord => None,
        }
    }

    pub fn broadcast_mode(self) -> BroadcastMode {
        match self {
            Command::StatSetConf | Command::StatClearTraffic | Command::StatDeleteApp => {
                BroadcastMode::Replay
            }
            Command::StatAppCreated
            | Command::StatTrafficLogged
            | Command::StatQuotaAlert
            | Command::DriverStateChanged
            | Command::DriverConfUpdated
            | Command::LogRecord => BroadcastMode::Observe,
            _ => BroadcastMode::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_round_trip() {
        let ids: HashSet<u32> = Command::ALL.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), Command::ALL.len());
        for c in Command::ALL {
            assert_eq!(Command::from_id(c.id()), Some(c));
        }
        assert_eq!(Command::from_id(0), None);
        assert_eq!(Command::from_id(999), None);
    }

    #[test]
    fn test_broadcast_only_commands_are_not_requests() {
        for c in Command::ALL {
            if c.broadcast_mode() == BroadcastMode::Observe {
                assert_eq!(c.reply_mode(), None, "{c:?}");
            }
        }
        assert_eq!(Command::Hello.reply_mode(), None);
    }

    #[test]
    fn test_replayed_commands_are_requests() {
        for c in Command::ALL {
            if c.broadcast_mode() == BroadcastMode::Replay {
                assert!(c.reply_mode().is_some(), "{c:?}");
            }
        }
        assert_eq!(Command::StatClearTraffic.reply_mode(), Some(ReplyMode::Async));
    }
}
