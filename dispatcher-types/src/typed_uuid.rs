// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use derive_where::derive_where;
use parse_display::Display;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// A UUID with type-level information about what it identifies.
///
/// Master jobs and child requests are both keyed by UUIDs, and the lock store
/// takes both in the same calls. Keeping them as distinct types stops a child
/// correlation id from being written where a master job id belongs.
#[derive_where(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedUuid<T: TypedUuidKind> {
    uuid: Uuid,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: TypedUuidKind> TypedUuid<T> {
    /// Creates a new random UUID of this type.
    #[inline]
    pub fn new_v4() -> Self {
        Self { uuid: Uuid::new_v4(), _phantom: std::marker::PhantomData }
    }

    /// The all-zero UUID of this type.
    ///
    /// For child requests this is the "never started" sentinel.
    #[inline]
    pub fn nil() -> Self {
        Self { uuid: Uuid::nil(), _phantom: std::marker::PhantomData }
    }

    /// Create a new `TypedUuid` from an untyped [`Uuid`].
    ///
    /// It is the caller's responsibility to ensure that the UUID is of the
    /// correct type.
    #[inline]
    pub fn from_untyped(uuid: Uuid) -> Self {
        Self { uuid, _phantom: std::marker::PhantomData }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.uuid.is_nil()
    }

    #[inline]
    pub fn as_untyped_uuid(&self) -> &Uuid {
        &self.uuid
    }
}

impl<T: TypedUuidKind> fmt::Debug for TypedUuid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)?;
        write!(f, " ({})", T::tag())
    }
}

impl<T: TypedUuidKind> fmt::Display for TypedUuid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)
    }
}

impl<T: TypedUuidKind> FromStr for TypedUuid<T> {
    type Err = TypedUuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|error| TypedUuidParseError { error, tag: T::tag() })?;
        Ok(Self { uuid, _phantom: std::marker::PhantomData })
    }
}

/// Represents marker types that can be used as a type parameter for
/// [`TypedUuid`].
pub trait TypedUuidKind: Send + Sync + 'static {
    /// Returns the corresponding tag for this kind.
    fn tag() -> TypedUuidTag;
}

/// Describes what kind of [`TypedUuid`] something is.
///
/// This is the runtime equivalent of [`TypedUuidKind`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display(style = "snake_case")]
pub enum TypedUuidTag {
    MasterJob,
    ChildRequest,
}

macro_rules! impl_typed_uuid_kind {
    ($($kind:ident => $tag:ident),* $(,)?) => {
        $(
            pub enum $kind {}

            impl TypedUuidKind for $kind {
                #[inline]
                fn tag() -> TypedUuidTag {
                    TypedUuidTag::$tag
                }
            }
        )*
    };
}

impl_typed_uuid_kind! {
    MasterJobKind => MasterJob,
    ChildRequestKind => ChildRequest,
}

/// Identifies one top-level patch run.
pub type MasterJobUuid = TypedUuid<MasterJobKind>;

/// Correlation id issued by the patch worker for one child work unit.
pub type ChildRequestUuid = TypedUuid<ChildRequestKind>;

#[derive(Error, Debug)]
#[error("error parsing uuid for {tag}")]
pub struct TypedUuidParseError {
    #[source]
    pub(crate) error: uuid::Error,
    pub(crate) tag: TypedUuidTag,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nil_child_request_is_sentinel() {
        let nil = ChildRequestUuid::nil();
        assert!(nil.is_nil());
        assert_eq!(nil.to_string(), "00000000-0000-0000-0000-000000000000");
        assert!(!ChildRequestUuid::new_v4().is_nil());
    }

    #[test]
    fn parse_error_names_kind() {
        let error = "not-a-uuid".parse::<MasterJobUuid>().unwrap_err();
        assert_eq!(error.to_string(), "error parsing uuid for master_job");
    }
}
