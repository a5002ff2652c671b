// src/transfer.rs
// Transfer orchestration: the one funds movement per job, its round-up
// contribution, charge reconciliation and notifications. Jobs run on a
// background worker; the originating request has already been answered by the
// time any of this executes, so nothing here returns an error to a caller.

use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::channel::ChannelAddress;
use crate::error::RelayError;
use crate::notify::Notifier;
use crate::processor::{Processor, TransferRequest};
use crate::store::{Store, User};

/// One requested funds movement. Ephemeral: produced by the chat dispatcher
/// or charge redemption, consumed exactly once by the orchestrator.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub sender: User,
    pub recipient: User,
    /// Nominal amount, 2 decimal places. The sender is charged its ceiling.
    pub amount: Decimal,
    pub notes: String,
    /// Set when this transfer settles a merchant charge. The charge must
    /// already be claimed (`IN_PROGRESS`) by the submitter.
    pub charge_id: Option<String>,
}

/// `(rounded, contribution)` where `rounded = ceil(nominal)`. The
/// contribution is always in `[0, 1)` for 2-decimal inputs.
pub fn round_up(nominal: Decimal) -> (Decimal, Decimal) {
    let rounded = nominal.ceil();
    (rounded, rounded - nominal)
}

/// Format an amount as rands, always with two decimal places.
pub fn zar(amount: Decimal) -> String {
    format!("R{:.2}", amount)
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    processor: Arc<dyn Processor>,
    notifier: Arc<dyn Notifier>,
    community_fund_handle: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        processor: Arc<dyn Processor>,
        notifier: Arc<dyn Notifier>,
        community_fund_handle: impl Into<String>,
    ) -> Self {
        Self {
            store,
            processor,
            notifier,
            community_fund_handle: community_fund_handle.into(),
        }
    }

    /// Execute one job to completion. Terminal: every failure is converted to
    /// logs and a sender-facing failure message.
    pub async fn run(&self, job: TransferJob) {
        let nominal = job.amount.round_dp(2);
        let (rounded, contribution) = round_up(nominal);

        info!(
            "[worker] nominal {}, rounded-up {}, contribution {}",
            zar(nominal),
            zar(rounded),
            zar(contribution)
        );

        if let Err(e) = self.transfer_primary(&job, rounded).await {
            error!(
                "[worker] FAILED to transfer funds for charge {:?}: {}",
                job.charge_id, e
            );
            if let Some(charge_id) = &job.charge_id {
                if let Err(release_err) = self.store.release_charge(charge_id).await {
                    error!(
                        "[worker] could not release charge {}: {}",
                        charge_id, release_err
                    );
                }
            }
            let text = format!(
                "❌ Your transfer of {} failed. Please try again later.",
                zar(nominal)
            );
            self.notify(&job.sender.channel_address, &text).await;
            return;
        }

        info!("[worker] ledger receipt confirmed");

        if contribution > Decimal::ZERO {
            self.contribute(&job, contribution).await;
        }

        if let Some(charge_id) = &job.charge_id {
            self.settle_charge(&job, charge_id).await;
        }

        let mut sender_text = format!(
            "✅ Transfer complete! You paid {} to {}.",
            zar(rounded),
            job.recipient.handle
        );
        if contribution > Decimal::ZERO {
            sender_text.push_str(&format!(
                " Thank you for your {} contribution to the community fund!",
                zar(contribution)
            ));
        }
        self.notify(&job.sender.channel_address, &sender_text).await;

        let recipient_text = format!(
            "🎉 You received {} from {}!",
            zar(nominal),
            job.sender.handle
        );
        self.notify(&job.recipient.channel_address, &recipient_text)
            .await;
    }

    /// The primary movement: sender pays the rounded amount to the recipient.
    /// Only an explicit receipt status of 1 proves the funds moved; an HTTP
    /// success with anything else is a failure.
    async fn transfer_primary(&self, job: &TransferJob, rounded: Decimal) -> Result<(), RelayError> {
        let request = TransferRequest {
            amount: rounded,
            recipient_payment_id: job.recipient.payment_identifier.clone(),
            notes: job.notes.clone(),
        };
        let response = self
            .processor
            .transfer_funds(&job.sender.id, &request)
            .await?;

        if !response.committed() {
            return Err(RelayError::TransferNotCommitted);
        }
        Ok(())
    }

    /// Move the round-up from the recipient (temporary custodian of the full
    /// rounded amount) to the community fund. Best effort: failure is logged
    /// and never alters the primary outcome.
    async fn contribute(&self, job: &TransferJob, contribution: Decimal) {
        info!("[worker] Transferring {} to the community fund", zar(contribution));

        let fund = match self.store.find_user_by_handle(&self.community_fund_handle).await {
            Ok(Some(fund)) => fund,
            Ok(None) => {
                warn!(
                    "[worker] community fund user {} not registered, skipping contribution",
                    self.community_fund_handle
                );
                return;
            }
            Err(e) => {
                warn!("[worker] community fund lookup failed: {}", e);
                return;
            }
        };

        let notes = match &job.charge_id {
            Some(charge_id) => format!("Round-up from charge {}", charge_id),
            None => format!("Round-up from {}", job.sender.handle),
        };
        let request = TransferRequest {
            amount: contribution,
            recipient_payment_id: fund.payment_identifier.clone(),
            notes,
        };

        match self.processor.transfer_funds(&job.recipient.id, &request).await {
            Ok(response) if response.committed() => {
                info!("[worker] Contribution transfer successful");
            }
            Ok(_) => warn!("[worker] contribution transfer not committed by the ledger"),
            Err(e) => warn!("[worker] contribution transfer failed: {}", e),
        }
    }

    /// Record settlement of a claimed charge. The local store is the source
    /// of truth for charge state; the processor's charge object is a mirror.
    async fn settle_charge(&self, job: &TransferJob, charge_id: &str) {
        info!("[worker] Updating status for charge {} to COMPLETE", charge_id);

        if let Err(e) = self.store.complete_charge(charge_id).await {
            error!(
                "[worker] could not record completion of charge {}: {}",
                charge_id, e
            );
        }

        if let Err(e) = self
            .processor
            .update_charge(&job.recipient.id, charge_id, "COMPLETE")
            .await
        {
            warn!(
                "[worker] could not mirror charge {} status to processor: {}",
                charge_id, e
            );
        }
    }

    async fn notify(&self, to: &ChannelAddress, text: &str) {
        if let Err(e) = self.notifier.send_message(to, text).await {
            warn!("[worker] notification to {} failed: {}", to, e);
        }
    }
}

/// Background worker that drains transfer jobs off an mpsc queue, one at a
/// time. Handlers submit and move on; the only contract they get back is
/// "job accepted".
pub struct TransferWorker {
    job_sender: mpsc::Sender<TransferJob>,
    _worker_handle: tokio::task::JoinHandle<()>,
}

impl TransferWorker {
    pub fn spawn(orchestrator: Orchestrator) -> Self {
        let (job_sender, job_receiver) = mpsc::channel::<TransferJob>(1024);

        let worker_handle = tokio::spawn(async move {
            process_jobs(job_receiver, orchestrator).await;
        });

        Self {
            job_sender,
            _worker_handle: worker_handle,
        }
    }

    pub async fn submit(&self, job: TransferJob) -> Result<(), RelayError> {
        self.job_sender
            .send(job)
            .await
            .map_err(|_| RelayError::QueueClosed)
    }
}

async fn process_jobs(mut receiver: mpsc::Receiver<TransferJob>, orchestrator: Orchestrator) {
    info!("🚀 Transfer worker started");
    while let Some(job) = receiver.recv().await {
        orchestrator.run(job).await;
    }
    info!("Transfer worker queue closed, stopping");
}
