// In-memory storage backend. Used by tests and single-node demos; the
// conditional claim semantics match the PostgreSQL backend exactly.
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::{Charge, ChargeStatus, CustomerSummary, MerchantStats, Store, User};
use crate::channel::ChannelAddress;
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    handle_index: HashMap<String, String>,
    channel_index: HashMap<String, String>,
    charges: HashMap<String, Charge>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.handle_index.insert(user.handle.clone(), user.id.clone());
        inner
            .channel_index
            .insert(user.channel_address.to_string(), user.id.clone());
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn find_user_by_handle(&self, handle: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .handle_index
            .get(handle)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn find_user_by_channel(
        &self,
        address: &ChannelAddress,
    ) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .channel_index
            .get(&address.to_string())
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().users.get(id).cloned())
    }

    async fn save_charge(&self, charge: &Charge) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .charges
            .entry(charge.id.clone())
            .or_insert_with(|| charge.clone());
        Ok(())
    }

    async fn find_charge(&self, id: &str) -> Result<Option<Charge>, StoreError> {
        Ok(self.inner.lock().charges.get(id).cloned())
    }

    async fn claim_charge(
        &self,
        id: &str,
        customer: &User,
    ) -> Result<Option<Charge>, StoreError> {
        // The whole check-and-transition happens under one lock, mirroring the
        // single conditional UPDATE of the postgres backend.
        let mut inner = self.inner.lock();
        match inner.charges.get_mut(id) {
            Some(charge) if charge.status == ChargeStatus::Pending => {
                charge.status = ChargeStatus::InProgress;
                charge.customer_id = Some(customer.id.clone());
                charge.customer_handle = Some(customer.handle.clone());
                Ok(Some(charge.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_charge(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(charge) = inner.charges.get_mut(id) {
            if charge.status == ChargeStatus::InProgress {
                charge.status = ChargeStatus::Pending;
            }
        }
        Ok(())
    }

    async fn complete_charge(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(charge) = inner.charges.get_mut(id) {
            charge.status = ChargeStatus::Complete;
        }
        Ok(())
    }

    async fn merchant_stats(&self, merchant_id: &str) -> Result<MerchantStats, StoreError> {
        let inner = self.inner.lock();
        let charges: Vec<&Charge> = inner
            .charges
            .values()
            .filter(|c| c.merchant_id == merchant_id)
            .collect();

        let pending_settlement = charges
            .iter()
            .filter(|c| c.status == ChargeStatus::Complete)
            .map(|c| c.amount)
            .sum::<Decimal>();
        let unique_customers = {
            let mut ids: Vec<&String> =
                charges.iter().filter_map(|c| c.customer_id.as_ref()).collect();
            ids.sort();
            ids.dedup();
            ids.len() as i64
        };

        Ok(MerchantStats {
            pending_settlement,
            total_transactions: charges.len() as i64,
            unique_customers,
        })
    }

    async fn merchant_charges(&self, merchant_id: &str) -> Result<Vec<Charge>, StoreError> {
        let inner = self.inner.lock();
        let mut charges: Vec<Charge> = inner
            .charges
            .values()
            .filter(|c| c.merchant_id == merchant_id)
            .cloned()
            .collect();
        charges.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(charges)
    }

    async fn merchant_customers(
        &self,
        merchant_id: &str,
    ) -> Result<Vec<CustomerSummary>, StoreError> {
        let inner = self.inner.lock();
        let mut by_handle: HashMap<String, CustomerSummary> = HashMap::new();
        for charge in inner.charges.values().filter(|c| c.merchant_id == merchant_id) {
            let Some(handle) = charge.customer_handle.clone() else {
                continue;
            };
            let entry = by_handle
                .entry(handle.clone())
                .or_insert_with(|| CustomerSummary {
                    customer_handle: handle,
                    transaction_count: 0,
                    total_spent: Decimal::ZERO,
                    last_seen: charge.created_at,
                });
            entry.transaction_count += 1;
            entry.total_spent += charge.amount;
            entry.last_seen = entry.last_seen.max(charge.created_at);
        }
        let mut customers: Vec<CustomerSummary> = by_handle.into_values().collect();
        customers.sort_by(|a, b| b.total_spent.cmp(&a.total_spent));
        Ok(customers)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
