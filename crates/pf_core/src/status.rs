//! Flag-based status metadata (C1).
//!
//! Ported from the source system's `Status`/`Flags` dataclass pair
//! (`models/status.py`): every status value carries a small flag set, and
//! a handful of cross-flag rules are validated once, at registry build
//! time, instead of scattered through control flow.

use std::sync::OnceLock;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusFlags: u8 {
        /// A fresh task may begin work from this status.
        const STARTABLE         = 0b0000_0001;
        /// Presence on worker boot implies an interrupted process; recovery re-dispatches it.
        const RECOVERABLE       = 0b0000_0010;
        /// An external service is processing asynchronously (poll or webhook).
        const AWAITING_EXTERNAL = 0b0000_0100;
        /// Terminal; no further automatic processing.
        const FINAL             = 0b0000_1000;
        /// A user may manually retry from this (final) status.
        const RETRYABLE         = 0b0001_0000;
    }
}

/// A single declared status value: its wire representation, its flags,
/// and a human label for UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDef {
    pub value: &'static str,
    pub flags: StatusFlags,
    pub label: &'static str,
}

/// Error raised when a status's flag combination violates one of the
/// cross-flag rules below. Declaring a bad status is a programming error,
/// caught by the `status_flag_rules_hold` test in every status module.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlagRuleError {
    #[error("status '{0}': RETRYABLE requires FINAL")]
    RetryableRequiresFinal(&'static str),
    #[error("status '{0}': FINAL forbids RECOVERABLE, STARTABLE, and AWAITING_EXTERNAL")]
    FinalForbidsActive(&'static str),
    #[error("status '{0}': AWAITING_EXTERNAL requires RECOVERABLE and forbids STARTABLE")]
    AwaitingExternalShape(&'static str),
}

/// Validate the flag-combination rules:
/// `Retryable ⇒ Final`, `Final ⇒ ¬(Recoverable ∨ Startable ∨ AwaitingExternal)`,
/// `AwaitingExternal ⇒ Recoverable ∧ ¬Startable`.
pub fn validate_flags(def: &StatusDef) -> Result<(), FlagRuleError> {
    let f = def.flags;
    if f.contains(StatusFlags::RETRYABLE) && !f.contains(StatusFlags::FINAL) {
        return Err(FlagRuleError::RetryableRequiresFinal(def.value));
    }
    if f.contains(StatusFlags::FINAL)
        && f.intersects(
            StatusFlags::RECOVERABLE | StatusFlags::STARTABLE | StatusFlags::AWAITING_EXTERNAL,
        )
    {
        return Err(FlagRuleError::FinalForbidsActive(def.value));
    }
    if f.contains(StatusFlags::AWAITING_EXTERNAL)
        && (!f.contains(StatusFlags::RECOVERABLE) || f.contains(StatusFlags::STARTABLE))
    {
        return Err(FlagRuleError::AwaitingExternalShape(def.value));
    }
    Ok(())
}

/// A status enum that carries `StatusDef` metadata per variant.
///
/// Implementors provide the full variant list; derived sets
/// (`startable_states`, `intermediate_states`, ...) are computed once and
/// cached, mirroring the source's module-level registry dict without
/// runtime reflection; explicit `register` replaces decorator-driven
/// discovery.
pub trait ProcessingStatus: Copy + Eq + std::hash::Hash + 'static {
    fn all() -> &'static [Self];
    fn def(&self) -> &'static StatusDef;
    fn as_str(&self) -> &'static str {
        self.def().value
    }

    fn is_startable(&self) -> bool {
        self.def().flags.contains(StatusFlags::STARTABLE)
    }
    fn is_recoverable(&self) -> bool {
        self.def().flags.contains(StatusFlags::RECOVERABLE)
    }
    fn is_awaiting_external(&self) -> bool {
        self.def().flags.contains(StatusFlags::AWAITING_EXTERNAL)
    }
    fn is_final(&self) -> bool {
        self.def().flags.contains(StatusFlags::FINAL)
    }
    fn is_retryable(&self) -> bool {
        self.def().flags.contains(StatusFlags::RETRYABLE)
    }

    /// Validate every declared variant's flags against the cross-flag
    /// rules. Call once (tests call it directly; `pf_cli` calls it at
    /// startup) rather than per-comparison.
    fn validate_registry() -> Result<(), FlagRuleError> {
        for s in Self::all() {
            validate_flags(s.def())?;
        }
        Ok(())
    }

    /// States from which a fresh task may begin work (Startable or Retryable).
    fn startable_states() -> &'static [Self];
    /// States recovery should re-dispatch on worker boot (Recoverable).
    fn intermediate_states() -> &'static [Self];
    /// States where an external service is processing async.
    fn awaiting_external_states() -> &'static [Self];
    /// Terminal states.
    fn final_states() -> &'static [Self];
    /// States a user may manually retry from.
    fn retryable_states() -> &'static [Self];
}

/// Computes and leaks a derived-set slice the first time it's requested,
/// caching the pointer in `cell` for every later call. Derived sets never
/// change after the binary starts, so one leak per (type, predicate) pair
/// for the process lifetime is the right tradeoff against recomputing
/// per call.
fn cached_filter<T: Copy>(
    cell: &'static OnceLock<Vec<T>>,
    all: &'static [T],
    pred: impl Fn(&T) -> bool,
) -> &'static [T] {
    cell.get_or_init(|| all.iter().copied().filter(|s| pred(s)).collect())
}

macro_rules! processing_status_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident => ($value:literal, $flags:expr, $label:literal) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        $vis enum $name {
            $( $variant ),+
        }

        impl $name {
            const DEFS: &'static [StatusDef] = &[
                $( StatusDef { value: $value, flags: $flags, label: $label } ),+
            ];
        }

        impl ProcessingStatus for $name {
            fn all() -> &'static [Self] {
                static ALL: &[$name] = &[ $( $name::$variant ),+ ];
                ALL
            }

            fn def(&self) -> &'static StatusDef {
                static CELL: OnceLock<std::collections::HashMap<&'static str, &'static StatusDef>> = OnceLock::new();
                let map = CELL.get_or_init(|| {
                    $name::all().iter().zip($name::DEFS.iter())
                        .map(|(s, d)| (s.wire_key(), d))
                        .collect()
                });
                map[self.wire_key()]
            }

            fn startable_states() -> &'static [Self] {
                static CELL: OnceLock<Vec<$name>> = OnceLock::new();
                cached_filter(&CELL, $name::all(), |s| s.is_startable() || s.is_retryable())
            }
            fn intermediate_states() -> &'static [Self] {
                static CELL: OnceLock<Vec<$name>> = OnceLock::new();
                cached_filter(&CELL, $name::all(), |s| s.is_recoverable())
            }
            fn awaiting_external_states() -> &'static [Self] {
                static CELL: OnceLock<Vec<$name>> = OnceLock::new();
                cached_filter(&CELL, $name::all(), |s| s.is_awaiting_external())
            }
            fn final_states() -> &'static [Self] {
                static CELL: OnceLock<Vec<$name>> = OnceLock::new();
                cached_filter(&CELL, $name::all(), |s| s.is_final())
            }
            fn retryable_states() -> &'static [Self] {
                static CELL: OnceLock<Vec<$name>> = OnceLock::new();
                cached_filter(&CELL, $name::all(), |s| s.is_retryable())
            }
        }

        impl $name {
            fn wire_key(&self) -> &'static str {
                match self {
                    $( $name::$variant => $value ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

processing_status_enum! {
    /// Order-level status. No Recoverable/Retryable flags are
    /// declared on it; order recovery rides on its child versions.
    pub enum OrderStatus {
        Pending => ("pending", StatusFlags::STARTABLE, "Pending"),
        Downloading => ("downloading", StatusFlags::RECOVERABLE, "Downloading"),
        Processing => ("processing", StatusFlags::RECOVERABLE, "Processing"),
        ReadyForReview => ("ready_for_review", StatusFlags::FINAL, "Ready for review"),
        Error => ("error", StatusFlags::from_bits_truncate(StatusFlags::FINAL.bits() | StatusFlags::RETRYABLE.bits()), "Error"),
    }
}

processing_status_enum! {
    /// ColoringVersion status: Pending → Queued → Processing →
    /// RunpodSubmitting → RunpodSubmitted → (RunpodQueued ⇄ RunpodProcessing)
    /// → RunpodCompleted → StorageUpload → Completed.
    pub enum ColoringStatus {
        Pending => ("pending", StatusFlags::STARTABLE, "Pending"),
        Queued => ("queued", StatusFlags::from_bits_truncate(StatusFlags::STARTABLE.bits() | StatusFlags::RECOVERABLE.bits()), "Queued"),
        Processing => ("processing", StatusFlags::RECOVERABLE, "Processing"),
        RunpodSubmitting => ("runpod_submitting", StatusFlags::RECOVERABLE, "Submitting"),
        RunpodSubmitted => ("runpod_submitted", StatusFlags::from_bits_truncate(StatusFlags::RECOVERABLE.bits() | StatusFlags::AWAITING_EXTERNAL.bits()), "Submitted"),
        RunpodQueued => ("runpod_queued", StatusFlags::from_bits_truncate(StatusFlags::RECOVERABLE.bits() | StatusFlags::AWAITING_EXTERNAL.bits()), "Queued remotely"),
        RunpodProcessing => ("runpod_processing", StatusFlags::from_bits_truncate(StatusFlags::RECOVERABLE.bits() | StatusFlags::AWAITING_EXTERNAL.bits()), "Generating"),
        RunpodCompleted => ("runpod_completed", StatusFlags::RECOVERABLE, "Generated"),
        StorageUpload => ("storage_upload", StatusFlags::RECOVERABLE, "Uploading"),
        Completed => ("completed", StatusFlags::FINAL, "Completed"),
        RunpodCancelled => ("runpod_cancelled", StatusFlags::FINAL, "Cancelled"),
        Error => ("error", StatusFlags::from_bits_truncate(StatusFlags::FINAL.bits() | StatusFlags::RETRYABLE.bits()), "Error"),
    }
}

processing_status_enum! {
    /// SvgVersion status: Pending → Queued → Processing →
    /// VectorizerProcessing → VectorizerCompleted → StorageUpload → Completed.
    pub enum SvgStatus {
        Pending => ("pending", StatusFlags::STARTABLE, "Pending"),
        Queued => ("queued", StatusFlags::from_bits_truncate(StatusFlags::STARTABLE.bits() | StatusFlags::RECOVERABLE.bits()), "Queued"),
        Processing => ("processing", StatusFlags::RECOVERABLE, "Processing"),
        VectorizerProcessing => ("vectorizer_processing", StatusFlags::from_bits_truncate(StatusFlags::RECOVERABLE.bits() | StatusFlags::AWAITING_EXTERNAL.bits()), "Vectorizing"),
        VectorizerCompleted => ("vectorizer_completed", StatusFlags::RECOVERABLE, "Vectorized"),
        StorageUpload => ("storage_upload", StatusFlags::RECOVERABLE, "Uploading"),
        Completed => ("completed", StatusFlags::FINAL, "Completed"),
        Error => ("error", StatusFlags::from_bits_truncate(StatusFlags::FINAL.bits() | StatusFlags::RETRYABLE.bits()), "Error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_flag_rules_hold() {
        OrderStatus::validate_registry().unwrap();
    }

    #[test]
    fn coloring_status_flag_rules_hold() {
        ColoringStatus::validate_registry().unwrap();
    }

    #[test]
    fn svg_status_flag_rules_hold() {
        SvgStatus::validate_registry().unwrap();
    }

    #[test]
    fn coloring_startable_includes_pending_queued_and_error() {
        let startable = ColoringStatus::startable_states();
        assert!(startable.contains(&ColoringStatus::Pending));
        assert!(startable.contains(&ColoringStatus::Queued));
        assert!(startable.contains(&ColoringStatus::Error));
        assert!(!startable.contains(&ColoringStatus::Completed));
    }

    #[test]
    fn coloring_awaiting_external_is_submitted_queued_processing() {
        let set = ColoringStatus::awaiting_external_states();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&ColoringStatus::RunpodSubmitted));
        assert!(set.contains(&ColoringStatus::RunpodQueued));
        assert!(set.contains(&ColoringStatus::RunpodProcessing));
    }

    #[test]
    fn reject_bad_flag_combo() {
        let bad = StatusDef {
            value: "bogus",
            flags: StatusFlags::FINAL | StatusFlags::STARTABLE,
            label: "Bogus",
        };
        assert!(validate_flags(&bad).is_err());
    }
}
