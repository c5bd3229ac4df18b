// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operations allowed to overlap on the same cluster.

use crate::descriptor::{Operation, PatchCategory, TargetType};
use crate::request::ActiveOperationRow;

/// One side of a compatibility entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKey {
    pub target: TargetType,
    pub operation: Operation,
    pub category: PatchCategory,
}

const fn key(
    target: TargetType,
    operation: Operation,
    category: PatchCategory,
) -> OperationKey {
    OperationKey { target, operation, category }
}

use Operation::{Patch, PatchPrereqCheck};
use PatchCategory::{Incremental, ScheduledBundle};
use TargetType::{Cell, Dom0, Domu};

/// `(running, incoming)` pairs that may share a cluster.
pub const COMPATIBLE_OPERATIONS: &[(OperationKey, OperationKey)] = &[
    (
        key(Dom0, PatchPrereqCheck, ScheduledBundle),
        key(Domu, PatchPrereqCheck, ScheduledBundle),
    ),
    (
        key(Domu, PatchPrereqCheck, ScheduledBundle),
        key(Dom0, PatchPrereqCheck, ScheduledBundle),
    ),
    (
        key(Domu, PatchPrereqCheck, ScheduledBundle),
        key(Cell, PatchPrereqCheck, ScheduledBundle),
    ),
    (
        key(Cell, PatchPrereqCheck, ScheduledBundle),
        key(Domu, PatchPrereqCheck, ScheduledBundle),
    ),
    (key(Dom0, Patch, Incremental), key(Domu, Patch, ScheduledBundle)),
    (key(Domu, Patch, ScheduledBundle), key(Dom0, Patch, Incremental)),
    (
        key(Domu, PatchPrereqCheck, ScheduledBundle),
        key(Dom0, Patch, Incremental),
    ),
];

/// Whether an incoming operation may run alongside `running`.
///
/// Rows or requests without a patch category never match.
pub fn is_compatible(
    running: &ActiveOperationRow,
    incoming_target: TargetType,
    incoming_operation: Operation,
    incoming_category: Option<PatchCategory>,
) -> bool {
    let (Some(running_category), Some(incoming_category)) =
        (running.patch_category, incoming_category)
    else {
        return false;
    };
    let running = key(running.target_type, running.operation, running_category);
    let incoming = key(incoming_target, incoming_operation, incoming_category);
    COMPATIBLE_OPERATIONS.contains(&(running, incoming))
}
