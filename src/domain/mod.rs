//! Domain model: the Environment aggregate, audit events, operations, users.

pub mod audit;
pub mod environment;
pub mod operation;
pub mod user;

pub use audit::{ActionType, Actor, AuditEvent, AuditFilter, AuditKind, AuditLevel};
pub use environment::{
    CommandDetails, CommandSpec, CredentialKind, CredentialRef, EnvStatus, Environment,
    EnvironmentFilter, Health, HealthCheckConfig, JsonRegexRule, ProbeValidation, SystemInfo,
    Target, Timestamps, UpgradeConfig, VersionListSpec,
};
pub use operation::{Operation, OperationKind, OperationStatus, OperationUpdate};
pub use user::User;

/// Allow-list check applied to names and free-text filters before they reach
/// any query predicate: alphanumerics plus `_`, `-` and space.
pub fn is_safe_text(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ')
}

/// Pagination window shared by list queries. `page` is 1-based.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct Page {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

impl Page {
    pub const MAX_PAGE_SIZE: u32 = 500;

    /// Clamp to sane bounds; page 0 is treated as page 1.
    pub fn clamped(self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: default_page_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_text_allows_names() {
        assert!(is_safe_text("api-prod"));
        assert!(is_safe_text("Staging EU_1"));
    }

    #[test]
    fn test_safe_text_rejects_injection_shapes() {
        assert!(!is_safe_text(""));
        assert!(!is_safe_text("a;drop"));
        assert!(!is_safe_text("x' OR '1'='1"));
        assert!(!is_safe_text("a$b"));
    }

    #[test]
    fn test_page_clamping() {
        let page = Page {
            page: 0,
            page_size: 10_000,
        }
        .clamped();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, Page::MAX_PAGE_SIZE);
        assert_eq!(page.offset(), 0);
    }
}
