//! Run-scoped tenant configuration.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Provisioning state of a tenant in the directory.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TenantStatus {
    /// Tenant is live.
    Active,
    /// Tenant finished provisioning and may be ingested.
    Ready,
    /// Tenant is still being set up.
    Provisioning,
    /// Tenant was paused by an operator.
    Suspended,
    /// Tenant was switched off.
    Disabled,
}

impl TenantStatus {
    /// Whether a run may contact the external API for this tenant.
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        matches!(self, Self::Active | Self::Ready)
    }
}

/// Immutable copy of a tenant's directory record, resolved once per run.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    /// Tax identifier exactly as stored in the directory (sent upstream).
    pub tax_id: String,
    /// Tax identifier with punctuation removed. Used for storage prefixes
    /// and dataset names.
    pub tenant_key: String,
    /// Access token for the external API.
    pub access_token: String,
    /// Provisioning state at resolution time.
    pub status: TenantStatus,
}

impl TenantConfig {
    /// Builds a config, deriving the tenant key from the tax identifier.
    #[must_use]
    pub fn new(tax_id: &str, access_token: &str, status: TenantStatus) -> Self {
        Self {
            tax_id: tax_id.to_string(),
            tenant_key: normalize_tax_id(tax_id),
            access_token: access_token.to_string(),
            status,
        }
    }

    /// Name of the tenant's warehouse dataset.
    #[must_use]
    pub fn dataset_name(&self) -> String {
        format!("CNPJ_{}_RAW", self.tenant_key)
    }
}

impl std::fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConfig")
            .field("tax_id", &self.tax_id)
            .field("tenant_key", &self.tenant_key)
            .field("access_token", &"<redacted>")
            .field("status", &self.status)
            .finish()
    }
}

/// Strips the `.`, `/`, and `-` separators from a CNPJ
/// (`12.345.678/0001-90` becomes `12345678000190`).
#[must_use]
pub fn normalize_tax_id(tax_id: &str) -> String {
    tax_id
        .trim()
        .chars()
        .filter(|c| !matches!(c, '.' | '/' | '-'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_formatted_cnpj() {
        assert_eq!(normalize_tax_id("12.345.678/0001-90"), "12345678000190");
        assert_eq!(normalize_tax_id(" 12345678000190 "), "12345678000190");
    }

    #[test]
    fn parses_status_case_insensitively() {
        assert_eq!(
            "Provisioning".parse::<TenantStatus>().unwrap(),
            TenantStatus::Provisioning
        );
        assert_eq!("ACTIVE".parse::<TenantStatus>().unwrap(), TenantStatus::Active);
        assert!("archived".parse::<TenantStatus>().is_err());
    }

    #[test]
    fn only_active_and_ready_are_eligible() {
        assert!(TenantStatus::Active.is_eligible());
        assert!(TenantStatus::Ready.is_eligible());
        assert!(!TenantStatus::Provisioning.is_eligible());
        assert!(!TenantStatus::Suspended.is_eligible());
        assert!(!TenantStatus::Disabled.is_eligible());
    }

    #[test]
    fn debug_output_redacts_token() {
        let config = TenantConfig::new("12.345.678/0001-90", "secret-token", TenantStatus::Active);
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-token"));
        assert_eq!(config.dataset_name(), "CNPJ_12345678000190_RAW");
    }
}
