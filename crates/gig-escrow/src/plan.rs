//! # Settlement Planning
//!
//! The single place where settlement amounts are computed. A state
//! transition emits an abstract [`Intent`]; [`plan`] turns it into the
//! concrete legs of one settlement batch:
//!
//! | Intent   | Legs                                                            |
//! |----------|-----------------------------------------------------------------|
//! | Fund     | client → escrow (gross)                                         |
//! | Release  | escrow → freelancer (gross − fee), escrow → platform (fee)      |
//! | Refund   | escrow → client (gross)                                         |
//! | Split    | escrow → freelancer (share − fee), escrow → platform (fee),     |
//! |          | escrow → client (gross − share)                                 |
//!
//! Fees are `floor(amount × bps / 10000)` on what the freelancer receives.
//! Zero-amount legs are omitted. The legs of a plan always sum to the gross
//! amount exactly.

use gig_core::{Amount, BatchId, IntentId, JobId, MilestoneId, UserId};
use gig_state::{Intent, IntentKind, MilestoneStatus};
use serde::{Deserialize, Serialize};

use crate::error::EscrowError;

/// Platform fee configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Basis points withheld from freelancer payouts.
    pub platform_fee_bps: u32,
}

impl FeeSchedule {
    /// Validated constructor.
    pub fn new(platform_fee_bps: u32) -> Result<Self, EscrowError> {
        if i64::from(platform_fee_bps) > gig_core::amount::BPS_DENOMINATOR {
            return Err(EscrowError::InvalidFee(platform_fee_bps));
        }
        Ok(Self { platform_fee_bps })
    }

    /// Fee due on a payout of `amount`.
    pub fn fee_on(&self, amount: Amount) -> Result<Amount, EscrowError> {
        Ok(amount.mul_bps_floor(self.platform_fee_bps)?)
    }
}

/// Holder of funds at either end of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "party", content = "user_id", rename_all = "snake_case")]
pub enum Party {
    Escrow,
    Client(UserId),
    Freelancer(UserId),
    Platform,
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Escrow => f.write_str("escrow"),
            Self::Client(u) => write!(f, "client:{u}"),
            Self::Freelancer(u) => write!(f, "freelancer:{u}"),
            Self::Platform => f.write_str("platform"),
        }
    }
}

/// One leg of a settlement batch, as sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementIntent {
    pub intent_id: IntentId,
    pub batch_id: BatchId,
    pub kind: IntentKind,
    pub amount: Amount,
    pub from_party: Party,
    pub to_party: Party,
    pub milestone_id: MilestoneId,
    pub job_id: JobId,
}

/// All legs produced from one [`Intent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPlan {
    pub batch_id: BatchId,
    pub job_id: JobId,
    pub milestone_id: MilestoneId,
    pub kind: IntentKind,
    pub gross: Amount,
    pub platform_fee: Amount,
    pub legs: Vec<SettlementIntent>,
    /// Milestone status restored if the whole batch permanently fails.
    pub revert_to: Option<MilestoneStatus>,
}

impl SettlementPlan {
    /// Sum of every leg.
    pub fn total(&self) -> Result<Amount, EscrowError> {
        Ok(Amount::sum(self.legs.iter().map(|l| l.amount))?)
    }

    /// Amount paid to `party` by this plan.
    pub fn paid_to(&self, party: Party) -> Amount {
        self.legs
            .iter()
            .filter(|l| l.to_party == party)
            .map(|l| l.amount)
            .fold(Amount::ZERO, |acc, a| acc.checked_add(a).unwrap_or(acc))
    }
}

/// Check that arbiter-chosen shares divide `disputed` exactly.
pub fn validate_split(disputed: Amount, freelancer: Amount, client: Amount) -> Result<(), EscrowError> {
    let invalid = || EscrowError::InvalidSplit {
        disputed,
        freelancer,
        client,
    };
    let total = freelancer.checked_add(client).map_err(|_| invalid())?;
    if total != disputed {
        return Err(invalid());
    }
    Ok(())
}

/// Compute the legs for `intent` under `fees`.
pub fn plan(intent: &Intent, fees: &FeeSchedule) -> Result<SettlementPlan, EscrowError> {
    let batch_id = BatchId::new();
    let client = Party::Client(intent.client);
    let mut legs: Vec<(Party, Party, Amount)> = Vec::with_capacity(3);
    let mut platform_fee = Amount::ZERO;

    match intent.kind {
        IntentKind::Fund => legs.push((client, Party::Escrow, intent.amount)),
        IntentKind::Refund => legs.push((Party::Escrow, client, intent.amount)),
        IntentKind::Release => {
            let freelancer = require_freelancer(intent)?;
            platform_fee = fees.fee_on(intent.amount)?;
            legs.push((
                Party::Escrow,
                freelancer,
                intent.amount.checked_sub(platform_fee)?,
            ));
            legs.push((Party::Escrow, Party::Platform, platform_fee));
        }
        IntentKind::Split => {
            let freelancer = require_freelancer(intent)?;
            let share = intent.freelancer_share.ok_or(EscrowError::MissingParty {
                kind: "split",
                party: "freelancer share",
            })?;
            let client_share = intent
                .amount
                .checked_sub(share)
                .map_err(|_| EscrowError::InvalidSplit {
                    disputed: intent.amount,
                    freelancer: share,
                    client: Amount::ZERO,
                })?;
            validate_split(intent.amount, share, client_share)?;
            platform_fee = fees.fee_on(share)?;
            legs.push((Party::Escrow, freelancer, share.checked_sub(platform_fee)?));
            legs.push((Party::Escrow, Party::Platform, platform_fee));
            legs.push((Party::Escrow, client, client_share));
        }
    }

    let legs = legs
        .into_iter()
        .filter(|(_, _, amount)| !amount.is_zero())
        .map(|(from_party, to_party, amount)| SettlementIntent {
            intent_id: IntentId::new(),
            batch_id,
            kind: intent.kind,
            amount,
            from_party,
            to_party,
            milestone_id: intent.milestone_id,
            job_id: intent.job_id,
        })
        .collect();

    Ok(SettlementPlan {
        batch_id,
        job_id: intent.job_id,
        milestone_id: intent.milestone_id,
        kind: intent.kind,
        gross: intent.amount,
        platform_fee,
        legs,
        revert_to: intent.revert_to,
    })
}

fn require_freelancer(intent: &Intent) -> Result<Party, EscrowError> {
    intent
        .freelancer
        .map(Party::Freelancer)
        .ok_or(EscrowError::MissingParty {
            kind: intent.kind.as_str(),
            party: "freelancer",
        })
}
