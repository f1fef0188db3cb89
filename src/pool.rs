//! Subscription pool setup, selection and teardown.
//!
//! Funding and consumer registration happen in a single-writer setup phase
//! before load starts; during the load phase the pool is read-only and shots
//! only pick ids from it, so no locking is needed while traffic is running.

use rand::Rng;
use tracing::{debug, info};

use crate::billing::BillingType;
use crate::client::{Address, CoordinatorClient};
use crate::error::Error;

/// How much each new subscription receives per currency.
#[derive(Debug, Clone, Copy)]
pub struct PoolFunding {
    pub link_juels: u128,
    pub native_wei: u128,
}

pub struct SubscriptionPool {
    ids: Vec<u64>,
}

impl SubscriptionPool {
    /// Create, authorize and fund `size` subscriptions for `consumer`.
    ///
    /// Which balances get funded follows the billing mode: `LINK` and
    /// `NATIVE` fund only their own currency, `LINK_AND_NATIVE` funds both.
    pub async fn setup(
        coordinator: &dyn CoordinatorClient,
        consumer: Address,
        size: usize,
        funding: PoolFunding,
        billing: BillingType,
    ) -> Result<Self, Error> {
        let mut ids = Vec::with_capacity(size);
        for _ in 0..size {
            let sub_id = coordinator.create_subscription().await?;
            coordinator.add_consumer(sub_id, consumer).await?;
            match billing {
                BillingType::Link => {
                    coordinator
                        .fund_subscription_link(sub_id, funding.link_juels)
                        .await?;
                }
                BillingType::Native => {
                    coordinator
                        .fund_subscription_native(sub_id, funding.native_wei)
                        .await?;
                }
                BillingType::LinkAndNative => {
                    coordinator
                        .fund_subscription_link(sub_id, funding.link_juels)
                        .await?;
                    coordinator
                        .fund_subscription_native(sub_id, funding.native_wei)
                        .await?;
                }
            }

            let sub = coordinator.get_subscription(sub_id).await?;
            debug!(
                sub_id,
                owner = %sub.owner,
                link_balance = %sub.link_balance,
                native_balance = %sub.native_balance,
                consumers = sub.consumers.len(),
                "Subscription ready"
            );
            ids.push(sub_id);
        }

        info!(count = ids.len(), billing = %billing, "Subscription pool funded");
        Ok(Self { ids })
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Pick one subscription uniformly at random.
    pub fn pick(&self) -> Result<u64, Error> {
        if self.ids.is_empty() {
            return Err(Error::EmptyPool);
        }
        let idx = rand::thread_rng().gen_range(0..self.ids.len());
        Ok(self.ids[idx])
    }

    /// Cancel every subscription, refunding remaining balances to `to`.
    pub async fn teardown(
        &self,
        coordinator: &dyn CoordinatorClient,
        to: Address,
    ) -> Result<(), Error> {
        for &sub_id in &self.ids {
            coordinator.cancel_subscription(sub_id, to).await?;
        }
        info!(count = self.ids.len(), refund_to = %to, "Subscription pool cancelled");
        Ok(())
    }
}
