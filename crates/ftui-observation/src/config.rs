#![forbid(unsafe_code)]

//! Registrar configuration.
//!
//! Defaults are chosen for UI recompute cycles. Every field can be
//! overridden through an `FTUI_OBSERVE_*` environment variable via
//! [`RegistrarConfig::from_env`]; explicit `with_*` calls take precedence
//! over both.

use std::env;

/// Env var selecting the [`NestedTracking`] policy (`innermost`|`propagate`).
pub const ENV_NESTED: &str = "FTUI_OBSERVE_NESTED";

/// Env var enabling contract checks (`1`/`true` or `0`/`false`).
pub const ENV_CONTRACT_CHECKS: &str = "FTUI_OBSERVE_CONTRACT_CHECKS";

/// How reads inside nested tracking contexts are recorded.
///
/// The policy belongs to the context: a context opened by a registrar with
/// `Propagate` also collects reads made while a nested context is active.
/// The innermost context always collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NestedTracking {
    /// Reads register only against the innermost context.
    Innermost,
    /// Reads also register against enclosing contexts that opted in.
    #[default]
    Propagate,
}

impl NestedTracking {
    /// Parse a policy name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("innermost") {
            Some(Self::Innermost)
        } else if name.eq_ignore_ascii_case("propagate") {
            Some(Self::Propagate)
        } else {
            None
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Innermost => "innermost",
            Self::Propagate => "propagate",
        }
    }
}

/// Configuration for an [`ObservationRegistrar`](crate::ObservationRegistrar).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarConfig {
    /// Nested tracking policy for contexts opened by this registrar.
    pub nested: NestedTracking,
    /// Log unbalanced `will_set`/`did_set` brackets at `debug` level.
    pub contract_checks: bool,
    /// Optional name included in log events.
    pub label: Option<String>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            nested: NestedTracking::default(),
            contract_checks: cfg!(debug_assertions),
            label: None,
        }
    }
}

impl RegistrarConfig {
    /// Defaults with `FTUI_OBSERVE_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unrecognized values are ignored with a warning and leave the field
    /// unchanged.
    #[must_use]
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(val) = lookup(ENV_NESTED) {
            match NestedTracking::parse(val.trim()) {
                Some(policy) => self.nested = policy,
                None => tracing::warn!(var = ENV_NESTED, value = %val, "ignoring invalid value"),
            }
        }
        if let Some(val) = lookup(ENV_CONTRACT_CHECKS) {
            match parse_flag(val.trim()) {
                Some(enabled) => self.contract_checks = enabled,
                None => {
                    tracing::warn!(var = ENV_CONTRACT_CHECKS, value = %val, "ignoring invalid value");
                }
            }
        }
        self
    }

    /// Set the nested tracking policy.
    #[must_use]
    pub fn with_nested(mut self, nested: NestedTracking) -> Self {
        self.nested = nested;
        self
    }

    /// Enable or disable contract checks.
    #[must_use]
    pub fn with_contract_checks(mut self, enabled: bool) -> Self {
        self.contract_checks = enabled;
        self
    }

    /// Set the label used in log events.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

fn parse_flag(val: &str) -> Option<bool> {
    if val == "1" || val.eq_ignore_ascii_case("true") {
        Some(true)
    } else if val == "0" || val.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}
