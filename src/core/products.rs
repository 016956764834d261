//! Inventory management
//!
//! Product counters only grow. At every instant the units neither sold
//! nor lost cover all active locks, so a lock that would break this is
//! refused with `ProductOutOfStock` rather than stored.

use super::backend::{load_instance, MerchantBackend};
use crate::db::QueryStatus;
use crate::types::{MerchantError, ProductDetails, ProductRecord, RelativeTime, Timestamp};
use tracing::{debug, info};
use uuid::Uuid;

impl MerchantBackend {
    fn check_price_currency(&self, details: &ProductDetails) -> Result<(), MerchantError> {
        let currency = self.settings().currency.as_str();
        let mismatch = std::iter::once(&details.price)
            .chain(details.taxes.iter().map(|t| &t.tax))
            .find(|amount| amount.currency() != currency);
        match mismatch {
            Some(amount) => Err(MerchantError::CurrencyMismatch {
                expected: currency.to_string(),
                actual: amount.currency().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Add a product to an instance's inventory
    ///
    /// Re-posting identical details is an idempotent success.
    ///
    /// # Errors
    ///
    /// * `ProductConflict` - the id exists with different details
    /// * `ProductLostExceedsStock` - sold and lost units exceed the stock
    /// * `InstanceUnknown`, `CurrencyMismatch`
    pub fn create_product(
        &self,
        instance: &str,
        product_id: &str,
        details: &ProductDetails,
    ) -> Result<(), MerchantError> {
        self.check_price_currency(details)?;
        if !details.counters_consistent() {
            return Err(MerchantError::ProductLostExceedsStock {
                product_id: product_id.to_string(),
            });
        }
        self.transact("create_product", |tx| {
            load_instance(tx, instance)?;
            match tx.lookup_product(instance, product_id)? {
                Some(existing) if existing.details == *details => Ok(()),
                Some(_) => Err(MerchantError::ProductConflict {
                    product_id: product_id.to_string(),
                }),
                None => {
                    tx.insert_product(instance, product_id, details)?;
                    info!(instance, product_id, "Product created");
                    Ok(())
                }
            }
        })
    }

    /// Replace a product's details without moving any counter backwards
    ///
    /// # Errors
    ///
    /// * `ProductUnknown` - no such product
    /// * `ProductCounterReduced` - names the first counter that would decrease
    /// * `ProductLostExceedsStock` - the new counters leave less than the locked units
    pub fn update_product(
        &self,
        instance: &str,
        product_id: &str,
        details: &ProductDetails,
    ) -> Result<(), MerchantError> {
        self.check_price_currency(details)?;
        self.transact("update_product", |tx| {
            load_instance(tx, instance)?;
            let current = tx
                .lookup_product(instance, product_id)?
                .ok_or_else(|| MerchantError::product_unknown(product_id))?;
            if let Some(field) = current.details.regressed_field(details) {
                return Err(MerchantError::ProductCounterReduced {
                    product_id: product_id.to_string(),
                    field,
                });
            }
            let covers_locks = || {
                details
                    .remaining()
                    .map_or(true, |left| left >= current.total_locked)
            };
            if !details.counters_consistent() || !covers_locks() {
                return Err(MerchantError::ProductLostExceedsStock {
                    product_id: product_id.to_string(),
                });
            }
            tx.update_product(instance, product_id, details)?;
            Ok(())
        })
    }

    pub fn get_product(&self, instance: &str, product_id: &str) -> Result<ProductRecord, MerchantError> {
        self.transact("get_product", |tx| {
            load_instance(tx, instance)?;
            tx.lookup_product(instance, product_id)?
                .ok_or_else(|| MerchantError::product_unknown(product_id))
        })
    }

    /// Product ids of an instance in insertion order
    pub fn list_products(&self, instance: &str) -> Result<Vec<String>, MerchantError> {
        self.transact("list_products", |tx| {
            load_instance(tx, instance)?;
            Ok(tx.list_products(instance)?)
        })
    }

    /// Remove a product that no lock refers to
    ///
    /// # Errors
    ///
    /// `ProductUnknown`, or `ProductDeleteConflictingLock` while units are locked.
    pub fn delete_product(&self, instance: &str, product_id: &str) -> Result<(), MerchantError> {
        self.transact("delete_product", |tx| {
            load_instance(tx, instance)?;
            let current = tx
                .lookup_product(instance, product_id)?
                .ok_or_else(|| MerchantError::product_unknown(product_id))?;
            if current.total_locked > 0 {
                return Err(MerchantError::ProductDeleteConflictingLock {
                    product_id: product_id.to_string(),
                });
            }
            tx.delete_product(instance, product_id)?;
            Ok(())
        })
    }

    /// Hold `quantity` units under `uuid` for `duration`
    ///
    /// Locking again under the same UUID adds to the hold. A quantity of
    /// zero releases every hold of the UUID instead.
    ///
    /// # Errors
    ///
    /// * `ProductUnknown` - no such product
    /// * `ProductOutOfStock` - fewer than `quantity` units are free
    pub fn lock_product(
        &self,
        instance: &str,
        product_id: &str,
        uuid: Uuid,
        quantity: u64,
        duration: RelativeTime,
    ) -> Result<(), MerchantError> {
        if quantity == 0 {
            return self.release_lock(instance, uuid);
        }
        let now = Timestamp::now();
        self.transact("lock_product", |tx| {
            load_instance(tx, instance)?;
            if tx.lookup_product(instance, product_id)?.is_none() {
                return Err(MerchantError::product_unknown(product_id));
            }
            match tx.lock_product(instance, product_id, uuid, quantity, now + duration, now)? {
                QueryStatus::NoResults => Err(MerchantError::ProductOutOfStock {
                    product_id: product_id.to_string(),
                    requested: quantity,
                }),
                _ => Ok(()),
            }
        })
    }

    /// Drop every inventory lock held under `uuid`
    pub fn release_lock(&self, instance: &str, uuid: Uuid) -> Result<(), MerchantError> {
        let status = self.transact("release_lock", |tx| {
            load_instance(tx, instance)?;
            Ok(tx.unlock_inventory(instance, uuid)?)
        })?;
        debug!(instance, %uuid, released = status.is_found(), "Inventory lock released");
        Ok(())
    }
}
