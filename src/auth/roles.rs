// Mapping of token roles onto pre-provisioned database service accounts.

use std::collections::HashMap;

use crate::config::{Config, ServiceAccount};
use crate::errors::Error;

/// Static, process-lifetime mapping from OIDC role names to service
/// accounts. Role matching is first-match-wins over the token's role list,
/// so operators rank privileges by claim order.
pub struct RoleMapper {
    mappings: HashMap<String, ServiceAccount>,
    default_role: Option<String>,
    fallback: Option<ServiceAccount>,
}

impl RoleMapper {
    pub fn new(
        accounts: impl IntoIterator<Item = ServiceAccount>,
        default_role: Option<String>,
        fallback: Option<ServiceAccount>,
    ) -> RoleMapper {
        let mappings = accounts
            .into_iter()
            .map(|account| (account.role.clone(), account))
            .collect();
        RoleMapper {
            mappings,
            default_role,
            fallback,
        }
    }

    pub fn from_config(config: &Config) -> RoleMapper {
        let fallback = ServiceAccount {
            role: "fallback".to_string(),
            username: config.fallback_user.clone(),
            password: config.fallback_pass.clone(),
        };
        RoleMapper::new(
            config.role_mappings.clone(),
            config.default_role.clone(),
            Some(fallback),
        )
    }

    /// Pick the service account for a token's role list. Roles are tried in
    /// order, normalized to lowercase with surrounding whitespace stripped;
    /// then the configured default role; then the fallback account.
    pub fn map(&self, roles: &[String]) -> Result<&ServiceAccount, Error> {
        for role in roles {
            let normalized = role.trim().to_lowercase();
            if let Some(account) = self.mappings.get(&normalized) {
                return Ok(account);
            }
        }

        if let Some(default_role) = &self.default_role {
            if let Some(account) = self.mappings.get(default_role) {
                return Ok(account);
            }
        }

        self.fallback.as_ref().ok_or_else(|| {
            Error::NoServiceAccount(format!("no eligible service account for roles {roles:?}"))
        })
    }
}
