//! A flash sale against the in-memory store.
//!
//! Twenty shoppers race for eight units; a few of them double-click. Run with
//! `RUST_LOG=stockguard=debug` to watch locks and retries.

use stockguard::{CoordinatorConfig, OrderCoordinator, OrderError, OrderLineRequest, SkuId};
use stockguard_memory::InMemoryStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let coordinator = OrderCoordinator::new(InMemoryStore::new(), CoordinatorConfig::new()?);
    let sku = SkuId::try_new("LIMITED-SNEAKER")?;
    coordinator.register_sku(&sku, 8).await?;

    let mut handles = Vec::new();
    for shopper in 0..20 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let buyer = format!("shopper-{shopper}");
            let key = format!("checkout-{shopper}");
            let lines = [OrderLineRequest::new("LIMITED-SNEAKER", 1, 12_000)];
            let first = coordinator.place_order(Some(&key), &buyer, &lines).await;
            // Every third shopper double-clicks.
            if shopper % 3 == 0 {
                let again = coordinator.place_order(Some(&key), &buyer, &lines).await;
                if let (Ok(a), Ok(b)) = (&first, &again) {
                    assert_eq!(a.order_id, b.order_id);
                }
            }
            first
        }));
    }

    let (mut placed, mut sold_out) = (0, 0);
    for handle in handles {
        match handle.await? {
            Ok(_) => placed += 1,
            Err(OrderError::InsufficientStock { .. }) => sold_out += 1,
            Err(error) => info!(code = error.code(), %error, "checkout failed"),
        }
    }

    let stats = coordinator.get_stock_stats("LIMITED-SNEAKER").await?;
    info!(
        placed,
        sold_out,
        available = stats.available,
        reserved = stats.reserved,
        "sale over"
    );
    Ok(())
}
