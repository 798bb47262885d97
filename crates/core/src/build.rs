//! Build lifecycle status and its state machine.
//!
//! Each variant's discriminant matches the seed order (1-based) of the
//! `build_statuses` lookup table.
//!
//! ```text
//! queued --claimed--> running --exit 0--------> success
//!                     running --exit != 0-----> error
//!                     running --cancelled-----> cancelled
//! queued --cancelled (not yet claimed)--------> cancelled
//! ```
//!
//! All non-`queued`, non-`running` statuses are terminal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant, in discriminant order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by its database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Lowercase name, as stored in the lookup table and sent on the wire.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $label => Ok($name::$variant), )+
                    other => Err(CoreError::Validation(format!(
                        "unknown {} '{other}'",
                        stringify!($name),
                    ))),
                }
            }
        }
    };
}

define_status_enum! {
    /// Build execution status.
    BuildStatus {
        Queued = 1 => "queued",
        Running = 2 => "running",
        Cancelled = 3 => "cancelled",
        Success = 4 => "success",
        Error = 5 => "error",
    }
}

impl BuildStatus {
    /// `true` once the build can no longer change status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Success | Self::Error)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running | Self::Cancelled) => true,
            // A job that fails before its process starts (unknown distro,
            // failed pull, failed spawn) goes straight to `error`.
            (Self::Queued, Self::Error) => true,
            (Self::Running, Self::Success | Self::Error | Self::Cancelled) => true,
            _ => false,
        }
    }

    /// Classify the terminal status of a finished build process.
    ///
    /// A requested cancellation wins over the exit code: a stopped container
    /// usually exits non-zero, and occasionally zero. A missing exit code
    /// (killed by a signal, stream lost) is an error.
    pub fn from_exit(exit_code: Option<i32>, cancel_requested: bool) -> Self {
        if cancel_requested {
            return Self::Cancelled;
        }
        match exit_code {
            Some(0) => Self::Success,
            _ => Self::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn ids_match_seed_order() {
        assert_eq!(BuildStatus::Queued.id(), 1);
        assert_eq!(BuildStatus::Running.id(), 2);
        assert_eq!(BuildStatus::Cancelled.id(), 3);
        assert_eq!(BuildStatus::Success.id(), 4);
        assert_eq!(BuildStatus::Error.id(), 5);
    }

    #[test]
    fn from_id_round_trips_every_variant() {
        for status in BuildStatus::ALL {
            assert_eq!(BuildStatus::from_id(status.id()), Some(*status));
        }
        assert_eq!(BuildStatus::from_id(0), None);
        assert_eq!(BuildStatus::from_id(6), None);
    }

    #[test]
    fn parses_lowercase_names() {
        assert_eq!("running".parse::<BuildStatus>().unwrap(), BuildStatus::Running);
        assert_matches!("Running".parse::<BuildStatus>(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn serializes_as_lowercase_string() {
        let json = serde_json::to_string(&BuildStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BuildStatus::Queued.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Error.is_terminal());
    }

    #[test]
    fn queued_can_be_cancelled_without_running() {
        assert!(BuildStatus::Queued.can_transition_to(BuildStatus::Cancelled));
        assert!(BuildStatus::Queued.can_transition_to(BuildStatus::Running));
        assert!(!BuildStatus::Queued.can_transition_to(BuildStatus::Success));
    }

    #[test]
    fn terminal_statuses_never_transition() {
        for from in BuildStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in BuildStatus::ALL {
                assert!(
                    !from.can_transition_to(*to),
                    "{from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn exit_zero_is_success() {
        assert_eq!(BuildStatus::from_exit(Some(0), false), BuildStatus::Success);
    }

    #[test]
    fn non_zero_exit_is_error() {
        assert_eq!(BuildStatus::from_exit(Some(2), false), BuildStatus::Error);
        assert_eq!(BuildStatus::from_exit(None, false), BuildStatus::Error);
    }

    #[test]
    fn cancellation_wins_over_exit_code() {
        assert_eq!(BuildStatus::from_exit(Some(137), true), BuildStatus::Cancelled);
        assert_eq!(BuildStatus::from_exit(Some(0), true), BuildStatus::Cancelled);
        assert_eq!(BuildStatus::from_exit(None, true), BuildStatus::Cancelled);
    }
}
