// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Operations that request a state transition of one endpoint of a volume.
//!
//! Each variant carries its own precondition, checked against the last known status of the
//! endpoint, and its own drbdadm command lines.

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::{
    host::DrbdVersion,
    remote::{
        drbdadm::{drbdadm, volume_target, Invocation},
        RemoteCommand,
    },
    resource::{EndpointId, VolumeId},
    state::DeviceStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrbdOperation {
    Attach,
    Detach,
    Connect,
    Disconnect,
    SetPrimary,
    SetSecondary,
    ForcePrimary,
    Invalidate,
    DiscardData,
    Resize,
    PauseSync,
    ResumeSync,
    Verify,
    SkipInitialFullSync,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OperationError {
    #[error("cannot {operation} {endpoint}: {reason} (state {state})")]
    Illegal {
        operation: DrbdOperation,
        endpoint: EndpointId,
        state: DeviceStatus,
        reason: &'static str,
    },

    #[error("cannot {operation} {endpoint}: resource is used by the cluster resource manager")]
    UsedByCrm {
        operation: DrbdOperation,
        endpoint: EndpointId,
    },

    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
}

impl DrbdOperation {
    pub const ALL: [DrbdOperation; 14] = [
        DrbdOperation::Attach,
        DrbdOperation::Detach,
        DrbdOperation::Connect,
        DrbdOperation::Disconnect,
        DrbdOperation::SetPrimary,
        DrbdOperation::SetSecondary,
        DrbdOperation::ForcePrimary,
        DrbdOperation::Invalidate,
        DrbdOperation::DiscardData,
        DrbdOperation::Resize,
        DrbdOperation::PauseSync,
        DrbdOperation::ResumeSync,
        DrbdOperation::Verify,
        DrbdOperation::SkipInitialFullSync,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DrbdOperation::Attach => "attach",
            DrbdOperation::Detach => "detach",
            DrbdOperation::Connect => "connect",
            DrbdOperation::Disconnect => "disconnect",
            DrbdOperation::SetPrimary => "set-primary",
            DrbdOperation::SetSecondary => "set-secondary",
            DrbdOperation::ForcePrimary => "force-primary",
            DrbdOperation::Invalidate => "invalidate",
            DrbdOperation::DiscardData => "discard-data",
            DrbdOperation::Resize => "resize",
            DrbdOperation::PauseSync => "pause-sync",
            DrbdOperation::ResumeSync => "resume-sync",
            DrbdOperation::Verify => "verify",
            DrbdOperation::SkipInitialFullSync => "skip-initial-full-sync",
        }
    }

    /// Operations that can take data or service away from whatever runs on top of the volume.
    /// They are refused on resources used by the cluster resource manager unless advanced mode
    /// is requested.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            DrbdOperation::Detach
                | DrbdOperation::Disconnect
                | DrbdOperation::SetPrimary
                | DrbdOperation::SetSecondary
                | DrbdOperation::ForcePrimary
                | DrbdOperation::Invalidate
                | DrbdOperation::DiscardData
                | DrbdOperation::SkipInitialFullSync
        )
    }

    /// Check that the operation is legal for an endpoint in `status`.
    pub fn validate(&self, endpoint: &EndpointId, status: &DeviceStatus) -> Result<(), OperationError> {
        let illegal = |reason| {
            Err(OperationError::Illegal {
                operation: *self,
                endpoint: endpoint.clone(),
                state: status.clone(),
                reason,
            })
        };

        match self {
            DrbdOperation::Attach if status.is_attached() => illegal("already attached"),
            DrbdOperation::Detach if status.is_syncing() => illegal("resync in progress"),
            DrbdOperation::Detach if !status.is_attached() => illegal("not attached"),
            DrbdOperation::Connect if status.is_connected_or_wf() => illegal("already connected"),
            DrbdOperation::Disconnect if status.is_standalone() => illegal("not connected"),
            DrbdOperation::SetPrimary | DrbdOperation::ForcePrimary if status.is_primary() => {
                illegal("already primary")
            }
            DrbdOperation::SetSecondary if !status.is_primary() => illegal("not primary"),
            DrbdOperation::Invalidate if !status.is_attached() => illegal("not attached"),
            DrbdOperation::Invalidate if status.is_syncing() || status.is_verifying() => {
                illegal("resync or verify in progress")
            }
            DrbdOperation::DiscardData if status.is_primary() => illegal("device is primary"),
            DrbdOperation::DiscardData if status.is_syncing() => illegal("resync in progress"),
            DrbdOperation::Resize if !status.is_attached() => illegal("not attached"),
            DrbdOperation::PauseSync if !status.is_syncing() => illegal("no resync in progress"),
            DrbdOperation::PauseSync if status.is_paused_sync() => illegal("resync already paused"),
            DrbdOperation::ResumeSync if !status.is_paused_sync() => illegal("resync not paused"),
            DrbdOperation::Verify if !status.is_connected() || !status.is_attached() => {
                illegal("not connected to an attached peer")
            }
            DrbdOperation::Verify if status.is_syncing() || status.is_verifying() => {
                illegal("resync or verify in progress")
            }
            DrbdOperation::SkipInitialFullSync
                if !status.is_attached() || !status.is_connected() =>
            {
                illegal("not attached and connected")
            }
            DrbdOperation::SkipInitialFullSync if status.is_primary() || status.is_syncing() => {
                illegal("device is primary or syncing")
            }
            _ => Ok(()),
        }
    }

    /// The commands carrying out the operation on the host of the endpoint. Connection and role
    /// changes act on the whole resource, everything else on the single volume.
    pub fn commands(
        &self,
        version: DrbdVersion,
        invocation: &Invocation,
        volume: &VolumeId,
    ) -> Vec<RemoteCommand> {
        let res = volume.resource.as_str();
        let vol = volume_target(version, volume);
        let cmd = |subcommand: &str, options: &[&str], target: &str| {
            drbdadm(version, invocation, subcommand, options, target)
        };
        let new_syntax = version.has_volumes();

        match self {
            DrbdOperation::Attach => vec![cmd("attach", &[], &vol)],
            DrbdOperation::Detach => vec![cmd("detach", &[], &vol)],
            DrbdOperation::Connect => vec![cmd("connect", &[], res)],
            DrbdOperation::Disconnect => vec![cmd("disconnect", &[], res)],
            DrbdOperation::SetPrimary => vec![cmd("primary", &[], res)],
            DrbdOperation::SetSecondary => vec![cmd("secondary", &[], res)],
            DrbdOperation::ForcePrimary if new_syntax => vec![cmd("primary", &["--force"], res)],
            DrbdOperation::ForcePrimary => {
                vec![cmd("primary", &["--overwrite-data-of-peer"], res)]
            }
            DrbdOperation::Invalidate => vec![cmd("invalidate", &[], &vol)],
            DrbdOperation::DiscardData => vec![
                cmd("disconnect", &[], res),
                cmd("connect", &["--discard-my-data"], res),
            ],
            DrbdOperation::Resize => vec![cmd("resize", &[], &vol)],
            DrbdOperation::PauseSync => vec![cmd("pause-sync", &[], &vol)],
            DrbdOperation::ResumeSync => vec![cmd("resume-sync", &[], &vol)],
            DrbdOperation::Verify => vec![cmd("verify", &[], &vol)],
            DrbdOperation::SkipInitialFullSync => {
                vec![cmd("new-current-uuid", &["--clear-bitmap"], &vol)]
            }
        }
    }
}

impl fmt::Display for DrbdOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DrbdOperation {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DrbdOperation::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| OperationError::UnknownOperation(s.to_string()))
    }
}
