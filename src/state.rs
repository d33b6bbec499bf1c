// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Per-device replication status and the predicates derived from it.
//!
//! A device's status is an eventually-consistent snapshot of the last poll. Operations consult
//! these predicates to decide whether a requested transition is legal.

use std::{collections::BTreeMap, fmt};

use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskState {
    /// The minor is not configured in the kernel at all.
    #[default]
    Unconfigured,
    Diskless,
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    StandAlone,
    Connecting,
    WFConnection,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Secondary,
    Primary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Synced,
    SyncSource,
    SyncTarget,
    PausedSync,
    Verifying,
}

/// The last known replication status of a single block device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    pub disk: DiskState,
    pub connection: ConnectionState,
    pub role: Role,
    pub sync: SyncState,
    pub split_brain: bool,
}

impl DeviceStatus {
    pub fn is_configured(&self) -> bool {
        self.disk != DiskState::Unconfigured
    }

    pub fn is_attached(&self) -> bool {
        self.disk == DiskState::Attached
    }

    pub fn is_diskless(&self) -> bool {
        self.disk == DiskState::Diskless
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Connected, or waiting for the peer to connect.
    pub fn is_connected_or_wf(&self) -> bool {
        matches!(
            self.connection,
            ConnectionState::Connected | ConnectionState::WFConnection
        )
    }

    pub fn is_standalone(&self) -> bool {
        self.connection == ConnectionState::StandAlone
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// A resync is in progress, including one that is currently paused.
    pub fn is_syncing(&self) -> bool {
        matches!(
            self.sync,
            SyncState::SyncSource | SyncState::SyncTarget | SyncState::PausedSync
        )
    }

    pub fn is_paused_sync(&self) -> bool {
        self.sync == SyncState::PausedSync
    }

    pub fn is_verifying(&self) -> bool {
        self.sync == SyncState::Verifying
    }

    pub fn is_split_brain(&self) -> bool {
        self.split_brain
    }

    /// Combine a freshly polled status with this one. Polls cannot observe split brain, so the
    /// mark is carried over until the device reports a working connection again.
    pub fn merge_poll(&self, polled: DeviceStatus) -> DeviceStatus {
        DeviceStatus {
            split_brain: (self.split_brain || polled.split_brain) && !polled.is_connected(),
            ..polled
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{:?}/{:?}",
            self.disk, self.connection, self.role, self.sync
        )?;
        if self.split_brain {
            write!(f, "/SplitBrain")?;
        }
        Ok(())
    }
}

/// Status of a volume, derived from the statuses of its endpoints.
///
/// A volume counts as connected as soon as any endpoint is, but as connected-or-waiting only when
/// every endpoint is. Syncing, split brain, paused sync and verification are reported if any
/// endpoint reports them.
#[derive(Debug, Clone, Default)]
pub struct VolumeStatus {
    members: Vec<DeviceStatus>,
}

impl VolumeStatus {
    pub fn new(members: Vec<DeviceStatus>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[DeviceStatus] {
        &self.members
    }

    fn any(&self, f: impl Fn(&DeviceStatus) -> bool) -> bool {
        self.members.iter().any(f)
    }

    pub fn is_connected(&self) -> bool {
        self.any(DeviceStatus::is_connected)
    }

    pub fn is_connected_or_wf(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(DeviceStatus::is_connected_or_wf)
    }

    pub fn is_syncing(&self) -> bool {
        self.any(DeviceStatus::is_syncing)
    }

    pub fn is_split_brain(&self) -> bool {
        self.any(DeviceStatus::is_split_brain)
    }

    pub fn is_paused_sync(&self) -> bool {
        self.any(DeviceStatus::is_paused_sync)
    }

    pub fn is_verifying(&self) -> bool {
        self.any(DeviceStatus::is_verifying)
    }

    pub fn is_diskless(&self) -> bool {
        self.any(DeviceStatus::is_diskless)
    }
}

/// Parse the contents of `/proc/drbd` into the status of each configured minor.
///
/// Lines look like
/// ` 0: cs:SyncSource ro:Primary/Secondary ds:UpToDate/Inconsistent C r-----`; DRBD 8.3 and older
/// report the role as `st:` instead of `ro:`. Statistics and progress lines are ignored.
pub fn parse_proc_drbd(output: &str) -> BTreeMap<u32, DeviceStatus> {
    let mut devices = BTreeMap::new();

    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        let Some(minor) = tokens
            .next()
            .and_then(|t| t.strip_suffix(':'))
            .and_then(|t| t.parse::<u32>().ok())
        else {
            continue;
        };

        let mut status = DeviceStatus::default();
        let mut disk = None;
        for token in tokens {
            let Some((key, value)) = token.split_once(':') else {
                continue;
            };
            match key {
                "cs" => apply_connection_state(&mut status, value),
                "ro" | "st" => {
                    if value.split('/').next() == Some("Primary") {
                        status.role = Role::Primary;
                    }
                }
                "ds" => disk = value.split('/').next().map(str::to_string),
                _ => {}
            }
        }

        status.disk = match disk.as_deref() {
            None | Some("Unconfigured") => DiskState::Unconfigured,
            Some("Diskless") => DiskState::Diskless,
            Some(_) => DiskState::Attached,
        };
        if status.disk == DiskState::Unconfigured {
            status = DeviceStatus::default();
        }

        devices.insert(minor, status);
    }

    devices
}

fn apply_connection_state(status: &mut DeviceStatus, cs: &str) {
    let (connection, sync) = match cs {
        "StandAlone" | "Unconfigured" => (ConnectionState::StandAlone, SyncState::Synced),
        "WFConnection" => (ConnectionState::WFConnection, SyncState::Synced),
        "Connected" => (ConnectionState::Connected, SyncState::Synced),
        "SyncSource" | "StartingSyncS" | "WFBitMapS" => {
            (ConnectionState::Connected, SyncState::SyncSource)
        }
        "SyncTarget" | "StartingSyncT" | "WFBitMapT" | "WFSyncUUID" => {
            (ConnectionState::Connected, SyncState::SyncTarget)
        }
        "PausedSyncS" | "PausedSyncT" => (ConnectionState::Connected, SyncState::PausedSync),
        "VerifyS" | "VerifyT" => (ConnectionState::Connected, SyncState::Verifying),
        "Disconnecting" | "Unconnected" | "Timeout" | "BrokenPipe" | "NetworkFailure"
        | "ProtocolError" | "TearDown" | "WFReportParams" => {
            (ConnectionState::Connecting, SyncState::Synced)
        }
        other => {
            warn!("unknown connection state '{other}' in /proc/drbd");
            (ConnectionState::Connecting, SyncState::Synced)
        }
    };
    status.connection = connection;
    status.sync = sync;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> DeviceStatus {
        DeviceStatus {
            disk: DiskState::Attached,
            connection: ConnectionState::Connected,
            ..Default::default()
        }
    }

    fn waiting() -> DeviceStatus {
        DeviceStatus {
            connection: ConnectionState::WFConnection,
            ..connected()
        }
    }

    fn standalone() -> DeviceStatus {
        DeviceStatus {
            connection: ConnectionState::StandAlone,
            ..connected()
        }
    }

    fn syncing() -> DeviceStatus {
        DeviceStatus {
            sync: SyncState::SyncSource,
            ..connected()
        }
    }

    #[test]
    fn volume_connected_is_any_but_connected_or_wf_is_all() {
        let two = VolumeStatus::new(vec![connected(), standalone()]);
        assert!(two.is_connected());
        assert!(!two.is_connected_or_wf());

        let two = VolumeStatus::new(vec![connected(), waiting()]);
        assert!(two.is_connected());
        assert!(two.is_connected_or_wf());

        let three = VolumeStatus::new(vec![waiting(), waiting(), standalone()]);
        assert!(!three.is_connected());
        assert!(!three.is_connected_or_wf());

        let three = VolumeStatus::new(vec![connected(), waiting(), connected()]);
        assert!(three.is_connected_or_wf());

        assert!(!VolumeStatus::new(vec![]).is_connected_or_wf());
    }

    #[test]
    fn volume_syncing_and_split_brain_are_any() {
        let two = VolumeStatus::new(vec![connected(), syncing()]);
        assert!(two.is_syncing());
        assert!(!two.is_split_brain());

        let mut sb = standalone();
        sb.split_brain = true;
        let three = VolumeStatus::new(vec![standalone(), standalone(), sb]);
        assert!(three.is_split_brain());
        assert!(!three.is_syncing());

        let three = VolumeStatus::new(vec![connected(), connected(), connected()]);
        assert!(!three.is_syncing());
        assert!(!three.is_split_brain());
    }

    #[test]
    fn proc_drbd() {
        let out = "\
version: 8.4.11 (api:1/proto:86-101)
srcversion: 0123456789ABCDEF
 0: cs:Connected ro:Primary/Secondary ds:UpToDate/UpToDate C r-----
    ns:0 nr:0 dw:0 dr:912 al:0 bm:0 lo:0 pe:0 ua:0 ap:0 ep:1 wo:f oos:0
 1: cs:SyncTarget ro:Secondary/Primary ds:Inconsistent/UpToDate C r-----
\t[=>..................] sync'ed: 10.2% (921344/1024000)K
 2: cs:Unconfigured
 3: cs:StandAlone ro:Secondary/Unknown ds:Diskless/DUnknown   r-----
 4: cs:PausedSyncS st:Primary/Secondary ds:UpToDate/Inconsistent C r--u-
";
        let devices = parse_proc_drbd(out);
        assert_eq!(devices.len(), 5);

        assert!(devices[&0].is_primary());
        assert!(devices[&0].is_connected());
        assert!(devices[&0].is_attached());

        assert_eq!(devices[&1].sync, SyncState::SyncTarget);
        assert!(devices[&1].is_syncing());

        assert!(!devices[&2].is_configured());

        assert!(devices[&3].is_diskless());
        assert!(devices[&3].is_standalone());

        assert!(devices[&4].is_paused_sync());
        assert!(devices[&4].is_syncing());
        assert!(devices[&4].is_primary());
    }

    #[test]
    fn split_brain_survives_polls_until_connected() {
        let mut current = standalone();
        current.split_brain = true;

        let merged = current.merge_poll(standalone());
        assert!(merged.is_split_brain());

        let merged = merged.merge_poll(connected());
        assert!(!merged.is_split_brain());
    }
}
