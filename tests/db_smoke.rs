// tests/db_smoke.rs
// Postgres-backed sanity checks. Skipped when DATABASE_URL is not set.
use chrono::Utc;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

use zarlink::channel::ChannelAddress;
use zarlink::store::{Charge, ChargeStatus, PostgresStore, Store, User};

fn test_user(id: &str, handle: &str, number: &str) -> User {
    User {
        id: id.into(),
        payment_identifier: format!("pay_{}", id),
        handle: handle.into(),
        channel_address: ChannelAddress::Whatsapp(number.into()),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn store_round_trip_and_conditional_claim() {
    let db_url = match env::var("DATABASE_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("DATABASE_URL not set. Skipping db_smoke test.");
            return;
        }
    };

    let store = PostgresStore::connect(&db_url).await.expect("connect pg");
    store.init_schema().await.expect("init schema");
    store.ping().await.expect("ping");

    let suffix = uuid_suffix();
    let merchant = test_user(
        &format!("merch_{}", suffix),
        &format!("@spaza_{}", suffix),
        &format!("+2782100{}", &suffix[..4]),
    );
    let customer = test_user(
        &format!("cust_{}", suffix),
        &format!("@thabo_{}", suffix),
        &format!("+2782200{}", &suffix[..4]),
    );
    store.save_user(&merchant).await.expect("save merchant");
    store.save_user(&customer).await.expect("save customer");

    let found = store
        .find_user_by_handle(&merchant.handle)
        .await
        .expect("lookup")
        .expect("merchant present");
    assert_eq!(found.id, merchant.id);
    assert_eq!(found.channel_address, merchant.channel_address);

    let charge = Charge {
        id: format!("charge_{}", suffix),
        merchant_id: merchant.id.clone(),
        customer_id: None,
        customer_handle: None,
        amount: Decimal::from_str("12.50").unwrap(),
        notes: "2x coffee".into(),
        status: ChargeStatus::Pending,
        created_at: Utc::now(),
    };
    store.save_charge(&charge).await.expect("save charge");

    let claimed = store
        .claim_charge(&charge.id, &customer)
        .await
        .expect("claim query")
        .expect("charge was pending");
    assert_eq!(claimed.status, ChargeStatus::InProgress);
    assert_eq!(claimed.customer_handle.as_deref(), Some(customer.handle.as_str()));

    // The second claim loses.
    assert!(store
        .claim_charge(&charge.id, &customer)
        .await
        .expect("claim query")
        .is_none());

    store.complete_charge(&charge.id).await.expect("complete");
    let settled = store
        .find_charge(&charge.id)
        .await
        .expect("find")
        .expect("present");
    assert_eq!(settled.status, ChargeStatus::Complete);

    let stats = store.merchant_stats(&merchant.id).await.expect("stats");
    assert_eq!(stats.total_transactions, 1);
    assert_eq!(stats.unique_customers, 1);
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
