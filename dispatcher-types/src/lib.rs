// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the patch dispatcher and its collaborators.
//!
//! Nothing in here performs I/O. Lock stores, workers and test fakes all
//! speak in these types.

pub mod compat;
pub mod descriptor;
pub mod fabric;
pub mod request;
pub mod result_code;
pub mod typed_uuid;

pub use result_code::ResultCode;
pub use typed_uuid::{ChildRequestUuid, MasterJobUuid};
