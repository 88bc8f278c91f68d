//! Account-lookup collaborator

use crate::Result;
use async_trait::async_trait;
use hookline_core::AccountBinding;
use std::collections::HashMap;

/// Maps provider accounts to internal accounts and their owners
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Internal account id for a provider page/account id
    async fn resolve_account(&self, provider_account_id: &str) -> Result<Option<String>>;

    /// User id owning an internal account
    async fn owner_of(&self, account_id: &str) -> Result<Option<String>>;
}

/// Directory built from static configuration
#[derive(Debug, Clone, Default)]
pub struct StaticAccountDirectory {
    by_provider: HashMap<String, String>,
    owners: HashMap<String, String>,
}

impl StaticAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bindings(bindings: &[AccountBinding]) -> Self {
        bindings.iter().fold(Self::new(), |directory, binding| {
            directory.with_account(
                &binding.provider_account_id,
                &binding.account_id,
                &binding.owner_id,
            )
        })
    }

    pub fn with_account(mut self, provider_account_id: &str, account_id: &str, owner_id: &str) -> Self {
        self.by_provider
            .insert(provider_account_id.to_string(), account_id.to_string());
        self.owners
            .insert(account_id.to_string(), owner_id.to_string());
        self
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn resolve_account(&self, provider_account_id: &str) -> Result<Option<String>> {
        Ok(self.by_provider.get(provider_account_id).cloned())
    }

    async fn owner_of(&self, account_id: &str) -> Result<Option<String>> {
        Ok(self.owners.get(account_id).cloned())
    }
}
