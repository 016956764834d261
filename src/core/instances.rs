//! Merchant instances and their bank accounts
//!
//! An instance is created with its settings and at least one payto URI.
//! Creating the same instance twice is an idempotent replay when the
//! settings and the set of active accounts are equal, and a conflict
//! otherwise. Accounts are never revived: once deactivated, a URI stays
//! inactive and a patch that lists it again leaves it alone.

use super::backend::{load_instance, MerchantBackend};
use crate::crypto::{hash_wire, EddsaKeyPair};
use crate::db::{MerchantTx, QueryStatus};
use crate::types::instance::wire_method_of;
use crate::types::{
    AccountRecord, HashCode, InstanceRecord, InstanceSettings, InstanceSummary, MerchantError,
    Salt,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Settings plus bank accounts, as posted by the merchant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(flatten)]
    pub settings: InstanceSettings,
    pub payto_uris: Vec<String>,
}

impl InstanceConfig {
    /// Check the configuration and return its distinct payto URIs
    ///
    /// # Errors
    ///
    /// * `ParameterMalformed` - empty id, no URIs, a URI without a wire method, or a zero amortization
    /// * `CurrencyMismatch` - the default fee limits use different currencies
    fn validate(&self) -> Result<BTreeSet<String>, MerchantError> {
        let settings = &self.settings;
        if settings.id.is_empty() || settings.id.contains('/') {
            return Err(MerchantError::malformed("id", "instance id must be a non-empty path segment"));
        }
        if settings.default_wire_fee_amortization == 0 {
            return Err(MerchantError::malformed(
                "default_wire_fee_amortization",
                "must be at least 1",
            ));
        }
        let currency = settings.default_max_deposit_fee.currency();
        if settings.default_max_wire_fee.currency() != currency {
            return Err(MerchantError::CurrencyMismatch {
                expected: currency.to_string(),
                actual: settings.default_max_wire_fee.currency().to_string(),
            });
        }
        if self.payto_uris.is_empty() {
            return Err(MerchantError::malformed("payto_uris", "at least one account is required"));
        }
        for uri in &self.payto_uris {
            if wire_method_of(uri).is_none() {
                return Err(MerchantError::malformed("payto_uris", format!("'{}' is not a payto URI", uri)));
            }
        }
        Ok(self.payto_uris.iter().cloned().collect())
    }
}

fn new_account(payto_uri: &str) -> AccountRecord {
    let salt = Salt::random();
    AccountRecord {
        h_wire: hash_wire(payto_uri, &salt),
        payto_uri: payto_uri.to_string(),
        salt,
        active: true,
    }
}

fn active_uris(accounts: &[AccountRecord]) -> BTreeSet<String> {
    accounts
        .iter()
        .filter(|a| a.active)
        .map(|a| a.payto_uri.clone())
        .collect()
}

fn summarize(tx: &mut dyn MerchantTx, record: InstanceRecord) -> Result<InstanceSummary, MerchantError> {
    let accounts = tx
        .lookup_accounts(&record.settings.id)?
        .into_iter()
        .filter(|a| a.active)
        .collect();
    Ok(InstanceSummary {
        active: record.is_active(),
        merchant_pub: record.merchant_pub,
        settings: record.settings,
        accounts,
    })
}

impl MerchantBackend {
    /// Create an instance with a fresh signing key and one account per URI
    ///
    /// # Arguments
    ///
    /// * `config` - settings and payto URIs of the new instance
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the instance was created, or already existed with equal settings
    ///
    /// # Errors
    ///
    /// * `InstanceConflict` - the id is taken by an instance with different settings or accounts
    /// * validation errors from the settings
    pub fn create_instance(&self, config: &InstanceConfig) -> Result<(), MerchantError> {
        let uris = config.validate()?;
        let id = config.settings.id.as_str();
        let (merchant_priv, keypair) = EddsaKeyPair::generate();
        let merchant_pub = keypair.merchant_pub();

        let created = self.transact("create_instance", |tx| {
            if let Some(existing) = tx.lookup_instance(id)? {
                let accounts = tx.lookup_accounts(id)?;
                if existing.settings == config.settings && active_uris(&accounts) == uris {
                    return Ok(false);
                }
                return Err(MerchantError::InstanceConflict {
                    instance: id.to_string(),
                });
            }
            tx.insert_instance(&config.settings, &merchant_pub, &merchant_priv)?;
            for uri in &uris {
                tx.insert_account(id, &new_account(uri))?;
            }
            Ok(true)
        })?;

        if created {
            info!(instance = id, merchant_pub = %merchant_pub, accounts = uris.len(), "Instance created");
        }
        Ok(())
    }

    /// Replace the settings of an instance and reconcile its accounts
    ///
    /// URIs not yet known get a new account; active accounts whose URI is
    /// no longer listed are deactivated. A listed URI whose account was
    /// deactivated earlier stays inactive.
    ///
    /// # Errors
    ///
    /// `InstanceUnknown` if there is no such instance, or validation errors.
    pub fn update_instance(&self, instance: &str, config: &InstanceConfig) -> Result<(), MerchantError> {
        let mut config = config.clone();
        config.settings.id = instance.to_string();
        let uris = config.validate()?;

        self.transact("update_instance", |tx| {
            load_instance(tx, instance)?;
            tx.update_instance(&config.settings)?;
            let accounts = tx.lookup_accounts(instance)?;
            for uri in &uris {
                match accounts.iter().find(|a| &a.payto_uri == uri) {
                    Some(account) if !account.active => {
                        warn!(instance, payto_uri = %uri, "Deactivated account cannot be revived; add a new URI instead");
                    }
                    Some(_) => {}
                    None => tx.insert_account(instance, &new_account(uri))?,
                }
            }
            for account in accounts.iter().filter(|a| a.active && !uris.contains(&a.payto_uri)) {
                tx.inactivate_account(instance, &account.h_wire)?;
            }
            Ok(())
        })
    }

    /// Remove an instance's private key, or the whole instance when `purge` is set
    ///
    /// # Errors
    ///
    /// `InstanceUnknown` if nothing matched.
    pub fn delete_instance(&self, instance: &str, purge: bool) -> Result<(), MerchantError> {
        let status = self.transact("delete_instance", |tx| {
            let status = if purge {
                tx.purge_instance(instance)?
            } else {
                tx.delete_instance_private_key(instance)?
            };
            Ok(status)
        })?;
        if status == QueryStatus::NoResults {
            return Err(MerchantError::instance_unknown(instance));
        }
        info!(instance, purge, "Instance deleted");
        Ok(())
    }

    /// Settings, public key and active accounts of an instance
    pub fn get_instance(&self, instance: &str) -> Result<InstanceSummary, MerchantError> {
        self.transact("get_instance", |tx| {
            let record = load_instance(tx, instance)?;
            summarize(tx, record)
        })
    }

    /// All instances in creation order
    pub fn list_instances(&self) -> Result<Vec<InstanceSummary>, MerchantError> {
        self.transact("list_instances", |tx| {
            let records = tx.list_instances()?;
            records.into_iter().map(|r| summarize(tx, r)).collect()
        })
    }

    /// Mark an account inactive; it cannot be revived afterwards
    ///
    /// # Errors
    ///
    /// `InstanceUnknown` or `AccountUnknown`.
    pub fn deactivate_account(&self, instance: &str, h_wire: &HashCode) -> Result<(), MerchantError> {
        self.transact("deactivate_account", |tx| {
            load_instance(tx, instance)?;
            match tx.inactivate_account(instance, h_wire)? {
                QueryStatus::NoResults => Err(MerchantError::AccountUnknown {
                    instance: instance.to_string(),
                    h_wire: h_wire.to_string(),
                }),
                _ => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{backend, instance_config};
    use crate::types::HttpStatus;
    use rstest::rstest;

    #[test]
    fn test_create_instance_is_idempotent() {
        let backend = backend();
        let config = instance_config("shop");
        backend.create_instance(&config).unwrap();
        let first = backend.get_instance("shop").unwrap();

        backend.create_instance(&config).unwrap();
        let second = backend.get_instance("shop").unwrap();
        assert_eq!(first, second);
        assert_eq!(second.accounts.len(), 1);
        assert!(second.active);
    }

    #[test]
    fn test_uri_order_and_duplicates_do_not_matter() {
        let backend = backend();
        let mut config = instance_config("shop");
        config.payto_uris = vec![
            "payto://iban/A".to_string(),
            "payto://x-taler-bank/bank/1".to_string(),
        ];
        backend.create_instance(&config).unwrap();

        config.payto_uris = vec![
            "payto://x-taler-bank/bank/1".to_string(),
            "payto://iban/A".to_string(),
            "payto://iban/A".to_string(),
        ];
        assert_eq!(backend.create_instance(&config), Ok(()));
    }

    #[rstest]
    #[case::different_name(|c: &mut InstanceConfig| c.settings.name = "Other".to_string())]
    #[case::different_accounts(|c: &mut InstanceConfig| c.payto_uris.push("payto://iban/B".to_string()))]
    #[case::different_fee(|c: &mut InstanceConfig| c.settings.default_max_wire_fee = "EUR:1".parse().unwrap())]
    fn test_create_instance_conflict(#[case] change: fn(&mut InstanceConfig)) {
        let backend = backend();
        let mut config = instance_config("shop");
        backend.create_instance(&config).unwrap();
        change(&mut config);
        let error = backend.create_instance(&config).unwrap_err();
        assert_eq!(
            error,
            MerchantError::InstanceConflict {
                instance: "shop".to_string()
            }
        );
        assert_eq!(error.http_status(), HttpStatus::Conflict);
    }

    #[rstest]
    #[case::no_accounts(|c: &mut InstanceConfig| c.payto_uris.clear())]
    #[case::not_payto(|c: &mut InstanceConfig| c.payto_uris = vec!["iban/DE89".to_string()])]
    #[case::zero_amortization(|c: &mut InstanceConfig| c.settings.default_wire_fee_amortization = 0)]
    #[case::slash_in_id(|c: &mut InstanceConfig| c.settings.id = "a/b".to_string())]
    fn test_create_instance_rejects_bad_config(#[case] change: fn(&mut InstanceConfig)) {
        let backend = backend();
        let mut config = instance_config("shop");
        change(&mut config);
        let error = backend.create_instance(&config).unwrap_err();
        assert_eq!(error.http_status(), HttpStatus::BadRequest);
    }

    #[test]
    fn test_soft_delete_keeps_instance_readable() {
        let backend = backend();
        backend.create_instance(&instance_config("shop")).unwrap();
        backend.delete_instance("shop", false).unwrap();

        let summary = backend.get_instance("shop").unwrap();
        assert!(!summary.active);
        assert_eq!(
            backend.delete_instance("shop", false),
            Err(MerchantError::instance_unknown("shop"))
        );
    }

    #[test]
    fn test_purge_removes_instance() {
        let backend = backend();
        backend.create_instance(&instance_config("shop")).unwrap();
        backend.delete_instance("shop", true).unwrap();
        assert_eq!(
            backend.get_instance("shop"),
            Err(MerchantError::instance_unknown("shop"))
        );
        assert_eq!(
            backend.delete_instance("shop", true),
            Err(MerchantError::instance_unknown("shop"))
        );
    }

    #[test]
    fn test_update_reconciles_accounts() {
        let backend = backend();
        let mut config = instance_config("shop");
        backend.create_instance(&config).unwrap();
        let old_uri = config.payto_uris[0].clone();

        config.settings.name = "Renamed".to_string();
        config.payto_uris = vec!["payto://iban/NEW".to_string()];
        backend.update_instance("shop", &config).unwrap();

        let summary = backend.get_instance("shop").unwrap();
        assert_eq!(summary.settings.name, "Renamed");
        let uris: Vec<&str> = summary.accounts.iter().map(|a| a.payto_uri.as_str()).collect();
        assert_eq!(uris, vec!["payto://iban/NEW"]);

        // listing the old URI again does not revive it
        config.payto_uris = vec![old_uri, "payto://iban/NEW".to_string()];
        backend.update_instance("shop", &config).unwrap();
        assert_eq!(backend.get_instance("shop").unwrap().accounts.len(), 1);
    }

    #[test]
    fn test_deactivate_account() {
        let backend = backend();
        backend.create_instance(&instance_config("shop")).unwrap();
        let h_wire = backend.get_instance("shop").unwrap().accounts[0].h_wire;

        backend.deactivate_account("shop", &h_wire).unwrap();
        assert!(backend.get_instance("shop").unwrap().accounts.is_empty());

        let unknown = HashCode::random();
        assert!(matches!(
            backend.deactivate_account("shop", &unknown),
            Err(MerchantError::AccountUnknown { .. })
        ));
    }

    #[test]
    fn test_list_instances_in_creation_order() {
        let backend = backend();
        backend.create_instance(&instance_config("b")).unwrap();
        backend.create_instance(&instance_config("a")).unwrap();
        let ids: Vec<String> = backend
            .list_instances()
            .unwrap()
            .into_iter()
            .map(|s| s.settings.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_h_wire_derives_from_uri_and_salt() {
        let backend = backend();
        backend.create_instance(&instance_config("shop")).unwrap();
        let account = &backend.get_instance("shop").unwrap().accounts[0];
        assert_eq!(account.h_wire, hash_wire(&account.payto_uri, &account.salt));
    }
}
