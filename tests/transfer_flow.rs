// tests/transfer_flow.rs
// End-to-end orchestration behavior against the in-memory store with a
// scripted processor and a recording notifier.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use zarlink::channel::ChannelAddress;
use zarlink::chat::ChatRelay;
use zarlink::error::{NotifyError, ProcessorError};
use zarlink::notify::Notifier;
use zarlink::processor::{
    Coupon, CreateChargeRequest, CreateUserRequest, MintRequest, Processor, ProcessorCharge,
    ProcessorTransaction, ProcessorUser, TokenBalance, TransferReceipt, TransferRequest,
    TransferResponse,
};
use zarlink::store::{Charge, ChargeStatus, MemoryStore, Store, User};
use zarlink::transfer::{Orchestrator, TransferJob, TransferWorker};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[derive(Default)]
struct MockProcessor {
    /// Receipt status returned for every transfer; None means the response
    /// carries no receipt at all.
    receipt_status: Option<i64>,
    transfers: Mutex<Vec<(String, TransferRequest)>>,
    charge_updates: Mutex<Vec<(String, String, String)>>,
    mints: Mutex<Vec<MintRequest>>,
    coupons: Vec<Coupon>,
    tokens: Vec<TokenBalance>,
    transactions: Vec<ProcessorTransaction>,
    /// Charge the processor knows about; None means every lookup is a 404.
    remote_charge: Option<ProcessorCharge>,
}

impl MockProcessor {
    fn committing() -> Self {
        Self {
            receipt_status: Some(1),
            ..Default::default()
        }
    }

    fn transfer_count(&self) -> usize {
        self.transfers.lock().len()
    }
}

#[async_trait]
impl Processor for MockProcessor {
    async fn create_user(&self, _req: &CreateUserRequest) -> Result<ProcessorUser, ProcessorError> {
        Err(ProcessorError::Api {
            status: 500,
            message: "not scripted".into(),
        })
    }

    async fn enable_gas(&self, _user_id: &str) -> Result<(), ProcessorError> {
        Ok(())
    }

    async fn mint_funds(&self, req: &MintRequest) -> Result<(), ProcessorError> {
        self.mints.lock().push(req.clone());
        Ok(())
    }

    async fn transfer_funds(
        &self,
        sender_id: &str,
        req: &TransferRequest,
    ) -> Result<TransferResponse, ProcessorError> {
        self.transfers.lock().push((sender_id.to_string(), req.clone()));
        Ok(TransferResponse {
            receipt: self.receipt_status.map(|status| TransferReceipt { status }),
        })
    }

    async fn get_balance(&self, _user_id: &str) -> Result<Vec<TokenBalance>, ProcessorError> {
        Ok(self.tokens.clone())
    }

    async fn get_transactions(
        &self,
        _user_id: &str,
    ) -> Result<Vec<ProcessorTransaction>, ProcessorError> {
        Ok(self.transactions.clone())
    }

    async fn create_charge(
        &self,
        _merchant_id: &str,
        _req: &CreateChargeRequest,
    ) -> Result<ProcessorCharge, ProcessorError> {
        Err(ProcessorError::Api {
            status: 500,
            message: "not scripted".into(),
        })
    }

    async fn get_charge(&self, charge_id: &str) -> Result<ProcessorCharge, ProcessorError> {
        match &self.remote_charge {
            Some(charge) if charge.id == charge_id => Ok(charge.clone()),
            _ => Err(ProcessorError::Api {
                status: 404,
                message: "no such charge".into(),
            }),
        }
    }

    async fn update_charge(
        &self,
        merchant_id: &str,
        charge_id: &str,
        status: &str,
    ) -> Result<(), ProcessorError> {
        self.charge_updates
            .lock()
            .push((merchant_id.to_string(), charge_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn get_all_coupons(&self) -> Result<Vec<Coupon>, ProcessorError> {
        Ok(self.coupons.clone())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<(ChannelAddress, String)>>,
}

impl RecordingNotifier {
    fn sent_to(&self, address: &ChannelAddress) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(to, _)| to == address)
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn last(&self) -> Option<String> {
        self.messages.lock().last().map(|(_, text)| text.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_message(&self, to: &ChannelAddress, text: &str) -> Result<(), NotifyError> {
        self.messages.lock().push((to.clone(), text.to_string()));
        Ok(())
    }
}

fn user(id: &str, handle: &str) -> User {
    User {
        id: id.into(),
        payment_identifier: format!("pay_{}", id),
        handle: handle.into(),
        channel_address: ChannelAddress::Whatsapp(format!("+2782000{}", id.len())),
        created_at: Utc::now(),
    }
}

fn pending_charge(id: &str, merchant_id: &str, amount: &str, notes: &str) -> Charge {
    Charge {
        id: id.into(),
        merchant_id: merchant_id.into(),
        customer_id: None,
        customer_handle: None,
        amount: dec(amount),
        notes: notes.into(),
        status: ChargeStatus::Pending,
        created_at: Utc::now(),
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    processor: Arc<MockProcessor>,
    notifier: Arc<RecordingNotifier>,
    orchestrator: Orchestrator,
    thabo: User,
    spaza: User,
    fund: User,
}

async fn fixture(processor: MockProcessor) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let processor = Arc::new(processor);
    let notifier = Arc::new(RecordingNotifier::default());

    let thabo = User {
        channel_address: ChannelAddress::Whatsapp("+27821110001".into()),
        ..user("cust1", "@thabo")
    };
    let spaza = User {
        channel_address: ChannelAddress::Whatsapp("+27821110002".into()),
        ..user("merch1", "@spaza")
    };
    let fund = User {
        channel_address: ChannelAddress::Whatsapp("+27821110003".into()),
        ..user("fund1", "@communityfund")
    };
    for u in [&thabo, &spaza, &fund] {
        store.save_user(u).await.unwrap();
    }

    let orchestrator = Orchestrator::new(
        store.clone(),
        processor.clone(),
        notifier.clone(),
        "@communityfund",
    );

    Fixture {
        store,
        processor,
        notifier,
        orchestrator,
        thabo,
        spaza,
        fund,
    }
}

#[tokio::test]
async fn integral_transfer_skips_the_community_fund() {
    let f = fixture(MockProcessor::committing()).await;

    let lebo = user("cust2", "@lebo");
    f.store.save_user(&lebo).await.unwrap();

    f.orchestrator
        .run(TransferJob {
            sender: f.thabo.clone(),
            recipient: lebo.clone(),
            amount: dec("50.00"),
            notes: "Transfer from @thabo".into(),
            charge_id: None,
        })
        .await;

    let transfers = f.processor.transfers.lock().clone();
    assert_eq!(transfers.len(), 1, "no contribution transfer expected");
    assert_eq!(transfers[0].0, "cust1");
    assert_eq!(transfers[0].1.amount, dec("50"));
    assert_eq!(transfers[0].1.recipient_payment_id, lebo.payment_identifier);

    let sender_msgs = f.notifier.sent_to(&f.thabo.channel_address);
    assert_eq!(sender_msgs.len(), 1);
    assert_eq!(
        sender_msgs[0],
        "✅ Transfer complete! You paid R50.00 to @lebo."
    );

    let recipient_msgs = f.notifier.sent_to(&lebo.channel_address);
    assert_eq!(recipient_msgs.len(), 1);
    assert_eq!(recipient_msgs[0], "🎉 You received R50.00 from @thabo!");
}

#[tokio::test]
async fn charge_payment_rounds_up_contributes_and_completes() {
    let f = fixture(MockProcessor::committing()).await;

    f.store
        .save_charge(&pending_charge("charge_abc123", "merch1", "12.50", "2x coffee"))
        .await
        .unwrap();
    let charge = f
        .store
        .claim_charge("charge_abc123", &f.thabo)
        .await
        .unwrap()
        .expect("claim the pending charge");

    f.orchestrator
        .run(TransferJob {
            sender: f.thabo.clone(),
            recipient: f.spaza.clone(),
            amount: charge.amount,
            notes: charge.notes.clone(),
            charge_id: Some(charge.id.clone()),
        })
        .await;

    let transfers = f.processor.transfers.lock().clone();
    assert_eq!(transfers.len(), 2);

    // Primary: customer pays the rounded amount to the merchant.
    assert_eq!(transfers[0].0, "cust1");
    assert_eq!(transfers[0].1.amount, dec("13"));
    assert_eq!(transfers[0].1.recipient_payment_id, f.spaza.payment_identifier);

    // Contribution: merchant forwards the round-up to the fund.
    assert_eq!(transfers[1].0, "merch1");
    assert_eq!(transfers[1].1.amount, dec("0.50"));
    assert_eq!(transfers[1].1.recipient_payment_id, f.fund.payment_identifier);
    assert_eq!(transfers[1].1.notes, "Round-up from charge charge_abc123");

    // The charge is settled locally and mirrored to the processor.
    let settled = f.store.find_charge("charge_abc123").await.unwrap().unwrap();
    assert_eq!(settled.status, ChargeStatus::Complete);
    assert_eq!(
        f.processor.charge_updates.lock().clone(),
        vec![("merch1".to_string(), "charge_abc123".to_string(), "COMPLETE".to_string())]
    );

    // Sender sees the rounded amount, merchant the nominal one.
    let sender_msgs = f.notifier.sent_to(&f.thabo.channel_address);
    assert_eq!(sender_msgs.len(), 1);
    assert_eq!(
        sender_msgs[0],
        "✅ Transfer complete! You paid R13.00 to @spaza. \
         Thank you for your R0.50 contribution to the community fund!"
    );
    let merchant_msgs = f.notifier.sent_to(&f.spaza.channel_address);
    assert_eq!(merchant_msgs.len(), 1);
    assert_eq!(merchant_msgs[0], "🎉 You received R12.50 from @thabo!");
}

#[tokio::test]
async fn uncommitted_receipt_fails_the_transfer_and_releases_the_charge() {
    let f = fixture(MockProcessor {
        receipt_status: Some(0),
        ..Default::default()
    })
    .await;

    f.store
        .save_charge(&pending_charge("charge_x", "merch1", "12.50", "airtime"))
        .await
        .unwrap();
    let charge = f.store.claim_charge("charge_x", &f.thabo).await.unwrap().unwrap();

    f.orchestrator
        .run(TransferJob {
            sender: f.thabo.clone(),
            recipient: f.spaza.clone(),
            amount: charge.amount,
            notes: charge.notes.clone(),
            charge_id: Some(charge.id.clone()),
        })
        .await;

    // One attempt, no contribution, no completion mirror.
    assert_eq!(f.processor.transfer_count(), 1);
    assert!(f.processor.charge_updates.lock().is_empty());

    // The charge went back to PENDING and stays claimable.
    let released = f.store.find_charge("charge_x").await.unwrap().unwrap();
    assert_eq!(released.status, ChargeStatus::Pending);

    // Failure names the nominal amount; the merchant hears nothing.
    let sender_msgs = f.notifier.sent_to(&f.thabo.channel_address);
    assert_eq!(sender_msgs.len(), 1);
    assert_eq!(
        sender_msgs[0],
        "❌ Your transfer of R12.50 failed. Please try again later."
    );
    assert!(f.notifier.sent_to(&f.spaza.channel_address).is_empty());
}

#[tokio::test]
async fn http_success_without_a_receipt_is_still_a_failure() {
    let f = fixture(MockProcessor {
        receipt_status: None,
        ..Default::default()
    })
    .await;

    f.orchestrator
        .run(TransferJob {
            sender: f.thabo.clone(),
            recipient: f.spaza.clone(),
            amount: dec("20.00"),
            notes: "Transfer from @thabo".into(),
            charge_id: None,
        })
        .await;

    assert_eq!(f.processor.transfer_count(), 1);
    let sender_msgs = f.notifier.sent_to(&f.thabo.channel_address);
    assert_eq!(sender_msgs.len(), 1);
    assert!(sender_msgs[0].starts_with("❌ Your transfer of R20.00 failed"));
    assert!(f.notifier.sent_to(&f.spaza.channel_address).is_empty());
}

#[tokio::test]
async fn contribution_failure_does_not_disturb_the_primary_outcome() {
    // No community fund user registered: the contribution is skipped, the
    // transfer still settles and both parties are notified.
    let store = Arc::new(MemoryStore::new());
    let processor = Arc::new(MockProcessor::committing());
    let notifier = Arc::new(RecordingNotifier::default());

    let thabo = user("cust1", "@thabo");
    let spaza = user("merch1", "@spaza");
    store.save_user(&thabo).await.unwrap();
    store.save_user(&spaza).await.unwrap();

    let orchestrator = Orchestrator::new(
        store.clone(),
        processor.clone(),
        notifier.clone(),
        "@communityfund",
    );

    orchestrator
        .run(TransferJob {
            sender: thabo.clone(),
            recipient: spaza.clone(),
            amount: dec("9.75"),
            notes: "snacks".into(),
            charge_id: None,
        })
        .await;

    assert_eq!(processor.transfer_count(), 1);
    assert_eq!(notifier.sent_to(&thabo.channel_address).len(), 1);
    assert_eq!(notifier.sent_to(&spaza.channel_address).len(), 1);
}

// --- Chat-level flows -----------------------------------------------------

struct ChatFixture {
    f: Fixture,
    relay: ChatRelay,
}

async fn chat_fixture(processor: MockProcessor) -> ChatFixture {
    let f = fixture(processor).await;
    let orchestrator = Orchestrator::new(
        f.store.clone(),
        f.processor.clone(),
        f.notifier.clone(),
        "@communityfund",
    );
    let worker = Arc::new(TransferWorker::spawn(orchestrator));
    let relay = ChatRelay::new(
        f.store.clone(),
        f.processor.clone(),
        f.notifier.clone(),
        worker,
        "L ZAR COIN",
        dec("10.00"),
    );
    ChatFixture { f, relay }
}

async fn wait_for_completion(store: &Arc<MemoryStore>, charge_id: &str) {
    for _ in 0..200 {
        let status = store
            .find_charge(charge_id)
            .await
            .unwrap()
            .map(|charge| charge.status);
        if status == Some(ChargeStatus::Complete) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("charge {} never completed", charge_id);
}

#[tokio::test]
async fn paying_a_charge_twice_is_rejected_without_a_second_transfer() {
    let cf = chat_fixture(MockProcessor::committing()).await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.f.store
        .save_charge(&pending_charge("charge_abc123", "merch1", "12.50", "2x coffee"))
        .await
        .unwrap();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "pay charge_abc123").await;

    // The ack is synchronous; settlement happens on the worker.
    let acks = cf.f.notifier.sent_to(&reply_to);
    assert_eq!(
        acks[0],
        "Processing your payment of R12.50 for \"2x coffee\"..."
    );
    wait_for_completion(&cf.f.store, "charge_abc123").await;

    let transfers_after_first = cf.f.processor.transfer_count();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "pay charge_abc123").await;

    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "Sorry, that payment code is invalid or has already been paid."
    );
    assert_eq!(cf.f.processor.transfer_count(), transfers_after_first);
}

#[tokio::test]
async fn unrecognized_text_gets_the_help_message() {
    let cf = chat_fixture(MockProcessor::committing()).await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "good morning").await;

    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "Sorry, I didn't understand that. Try 'send R50 to @handle' or 'balance'."
    );
    assert_eq!(cf.f.processor.transfer_count(), 0);
}

#[tokio::test]
async fn unknown_recipient_handle_is_reported() {
    let cf = chat_fixture(MockProcessor::committing()).await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "send R10 to @nobody").await;

    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "Sorry, I couldn't find user @nobody."
    );
    assert_eq!(cf.f.processor.transfer_count(), 0);
}

#[tokio::test]
async fn balance_reads_the_stablecoin_token_case_insensitively() {
    let cf = chat_fixture(MockProcessor {
        receipt_status: Some(1),
        tokens: vec![
            TokenBalance {
                name: Some("Gas Token".into()),
                balance: Some("1.0".into()),
            },
            TokenBalance {
                name: Some("l zar coin".into()),
                balance: Some("39.0".into()),
            },
        ],
        ..Default::default()
    })
    .await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "balance").await;

    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "Your current ZarLink balance is R39.00."
    );
}

#[tokio::test]
async fn balance_defaults_to_zero_when_the_token_is_absent() {
    let cf = chat_fixture(MockProcessor::committing()).await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "bal").await;

    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "Your current ZarLink balance is R0.00."
    );
}

#[tokio::test]
async fn history_maps_transaction_types_to_descriptions() {
    let cf = chat_fixture(MockProcessor {
        receipt_status: Some(1),
        transactions: vec![
            ProcessorTransaction {
                tx_type: "DEBIT".into(),
                value: "50".into(),
                created_at: "2025-08-01T09:00:00Z".into(),
            },
            ProcessorTransaction {
                tx_type: "CREDIT".into(),
                value: "12.5".into(),
                created_at: "2025-08-02T09:00:00Z".into(),
            },
            ProcessorTransaction {
                tx_type: "MINT".into(),
                value: "50".into(),
                created_at: "2025-08-03T09:00:00Z".into(),
            },
            ProcessorTransaction {
                tx_type: "ESCROW".into(),
                value: "7".into(),
                created_at: "2025-08-04T09:00:00Z".into(),
            },
        ],
        ..Default::default()
    })
    .await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "history").await;

    let text = cf.f.notifier.last().unwrap();
    assert!(text.starts_with("Your recent transactions:\n\n"));
    assert!(text.contains("➡️ Sent R50.00 on 2025/08/01"));
    assert!(text.contains("⬅️ Received R12.50 on 2025/08/02"));
    assert!(text.contains("🎉 Bonus Received R50.00 on 2025/08/03"));
    assert!(text.contains("ESCROW R7.00 on 2025/08/04"));
}

#[tokio::test]
async fn empty_history_has_its_own_message() {
    let cf = chat_fixture(MockProcessor::committing()).await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "transactions").await;

    assert_eq!(cf.f.notifier.last().unwrap(), "You have no transactions yet.");
}

#[tokio::test]
async fn coupon_claim_mints_the_fixed_reward() {
    let cf = chat_fixture(MockProcessor {
        receipt_status: Some(1),
        coupons: vec![Coupon {
            id: "coup_1".into(),
            code: "SPRING10".into(),
            title: "Spring Special".into(),
        }],
        ..Default::default()
    })
    .await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "claim spring10").await;

    let mints = cf.f.processor.mints.lock().clone();
    assert_eq!(mints.len(), 1);
    assert_eq!(mints[0].amount, dec("10.00"));
    assert_eq!(mints[0].recipient_payment_id, cf.f.thabo.payment_identifier);
    assert_eq!(mints[0].notes, "Reward for claiming coupon: SPRING10");

    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "✅ Success! You have claimed the \"Spring Special\" coupon. \
         R10.00 has been added to your balance."
    );
}

#[tokio::test]
async fn unknown_charge_code_is_invalid() {
    let cf = chat_fixture(MockProcessor::committing()).await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "pay charge_nope").await;

    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "Sorry, that payment code is invalid."
    );
    assert_eq!(cf.f.processor.transfer_count(), 0);
}

#[tokio::test]
async fn processor_side_charge_is_imported_then_claimed() {
    // The merchant created the charge through the processor's own tooling, so
    // the local store has no row for it yet.
    let cf = chat_fixture(MockProcessor {
        receipt_status: Some(1),
        remote_charge: Some(ProcessorCharge {
            id: "charge_remote1".into(),
            status: "PENDING".into(),
            amount: dec("12.50"),
            note: "2x coffee".into(),
            user_id: "merch1".into(),
        }),
        ..Default::default()
    })
    .await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "pay charge_remote1").await;

    let acks = cf.f.notifier.sent_to(&reply_to);
    assert_eq!(
        acks[0],
        "Processing your payment of R12.50 for \"2x coffee\"..."
    );
    wait_for_completion(&cf.f.store, "charge_remote1").await;

    // Imported once, settled once; a replay is now rejected locally.
    cf.relay.dispatch(&cf.f.thabo, &reply_to, "pay charge_remote1").await;
    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "Sorry, that payment code is invalid or has already been paid."
    );
}

#[tokio::test]
async fn invalid_coupon_code_is_rejected_without_a_mint() {
    let cf = chat_fixture(MockProcessor::committing()).await;
    let reply_to = cf.f.thabo.channel_address.clone();

    cf.relay.dispatch(&cf.f.thabo, &reply_to, "redeem NOPE").await;

    assert!(cf.f.processor.mints.lock().is_empty());
    assert_eq!(
        cf.f.notifier.last().unwrap(),
        "Sorry, the coupon code \"NOPE\" is not valid."
    );
}
