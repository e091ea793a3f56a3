//! Commit/reveal draw function.
//!
//! The server commits to `sha256(seed)` before a draw and reveals `seed`
//! afterwards. Anyone holding the revealed seed, the client seed and the
//! nonce can recompute the roll and the prize it selects:
//!
//! ```text
//! hash  = hex(sha256(seed_bytes))
//! mac   = HMAC-SHA256(key = seed_bytes, msg = "{client_seed}:{nonce}")
//! roll  = u32_be(mac[0..4]) / 2^32
//! adj   = max(0, roll - pity_bonus)
//! tier  = first tier whose cumulative chance exceeds adj
//! prize = first reward whose cumulative sub-chance exceeds
//!         (adj - tier_lower_bound) / tier.chance
//! ```
//!
//! All comparisons are exact: probabilities are nine-place fixed point and
//! the roll is a 32-bit fraction, so both sides are cross-multiplied in
//! `u128`.

use crate::{
    api::{Commitment, SpinResult},
    case::{CaseDefinition, Tier},
    probability::{Probability, SCALE},
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Roll reduction per spin beyond `pity_after`.
pub const PITY_STEP: Probability = Probability::from_units(20_000_000);
/// Largest roll reduction soft pity can reach.
pub const PITY_CAP: Probability = Probability::from_units(200_000_000);

const ROLL_DENOMINATOR: u128 = 1 << 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FairnessError {
    #[error("server seed is not valid hex: {0}")]
    InvalidSeed(String),
    #[error("server seed is empty")]
    EmptySeed,
    #[error("odds table has no tiers")]
    EmptyTable,
    #[error("roll {roll} is not covered by the odds table")]
    RollNotCovered { roll: u32 },
    #[error("tier {tier} has no reward covering the roll")]
    RewardNotCovered { tier: String },
}

/// Why a draw failed verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Mismatch {
    #[error("server seed hashes to {actual}, commitment was {committed}")]
    CommitmentHash { committed: String, actual: String },
    #[error("revealed seed differs from the one returned by the draw")]
    RevealDisagrees,
    #[error("draw used odds table {declared}, case publishes {published}")]
    OddsVersion { published: String, declared: String },
    #[error("recomputed tier {expected}, server declared {declared}")]
    Tier { expected: String, declared: String },
    #[error("recomputed prize {expected}, server declared {declared}")]
    Prize { expected: String, declared: String },
    #[error("draw could not be recomputed: {0}")]
    Malformed(#[from] FairnessError),
}

/// Uniform draw in `[0, 1)` as a 32-bit fraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Roll(pub u32);

impl Roll {
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / ROLL_DENOMINATOR as f64
    }
}

/// Indices of the tier and reward a roll selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub tier: usize,
    pub reward: usize,
}

fn seed_bytes(server_seed: &str) -> Result<Vec<u8>, FairnessError> {
    let trimmed = server_seed.trim();
    if trimmed.is_empty() {
        return Err(FairnessError::EmptySeed);
    }
    hex::decode(trimmed).map_err(|_| FairnessError::InvalidSeed(trimmed.to_string()))
}

/// Hex SHA-256 of the decoded server seed. This is what `commit` publishes.
pub fn commitment_digest(server_seed: &str) -> Result<String, FairnessError> {
    let bytes = seed_bytes(server_seed)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Recompute the raw roll from the draw inputs.
pub fn roll(server_seed: &str, client_seed: &str, nonce: u64) -> Result<Roll, FairnessError> {
    let key = seed_bytes(server_seed)?;
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|_| FairnessError::InvalidSeed(server_seed.to_string()))?;
    mac.update(format!("{client_seed}:{nonce}").as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut head = [0u8; 4];
    head.copy_from_slice(&digest[..4]);
    Ok(Roll(u32::from_be_bytes(head)))
}

/// Roll reduction after `fail_streak` common results with pity starting at
/// `pity_after`.
pub fn pity_bonus(fail_streak: u32, pity_after: u32) -> Probability {
    if fail_streak < pity_after {
        return Probability::ZERO;
    }
    let steps = (fail_streak - pity_after) as u64 + 1;
    PITY_STEP.saturating_mul(steps).min(PITY_CAP)
}

/// Map a roll onto the odds table.
pub fn select(tiers: &[Tier], roll: Roll, bonus: Probability) -> Result<Selection, FairnessError> {
    if tiers.is_empty() {
        return Err(FairnessError::EmptyTable);
    }

    // Work in units of 1 / (2^32 * SCALE).
    let scale = SCALE as u128;
    let adjusted = (roll.0 as u128 * scale).saturating_sub(bonus.units() as u128 * ROLL_DENOMINATOR);

    let mut lower: u128 = 0;
    for (tier_index, tier) in tiers.iter().enumerate() {
        let upper = lower + tier.chance.units() as u128;
        if adjusted < upper * ROLL_DENOMINATOR {
            let offset = adjusted - lower * ROLL_DENOMINATOR;
            let chance = tier.chance.units() as u128;
            let mut cumulative: u128 = 0;
            for (reward_index, reward) in tier.rewards.iter().enumerate() {
                cumulative += reward.sub_chance.units() as u128;
                // offset / (2^32 * S) / (chance / S) < cumulative / S
                if offset * scale < cumulative * chance * ROLL_DENOMINATOR {
                    return Ok(Selection {
                        tier: tier_index,
                        reward: reward_index,
                    });
                }
            }
            return Err(FairnessError::RewardNotCovered {
                tier: tier.name.clone(),
            });
        }
        lower = upper;
    }
    Err(FairnessError::RollNotCovered { roll: roll.0 })
}

/// Everything needed to recompute one draw.
#[derive(Clone, Debug)]
pub struct DrawInputs<'a> {
    pub commitment: &'a Commitment,
    pub server_seed: &'a str,
    pub client_seed: &'a str,
    pub nonce: u64,
    pub pity_bonus: Probability,
}

/// Successful verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationReport {
    pub roll: Roll,
    pub selection: Selection,
    pub tier: String,
    pub coin_id: String,
    pub amount: String,
    pub odds_version: String,
}

/// Check a draw against its commitment and the published odds table.
pub fn verify_draw(
    inputs: &DrawInputs<'_>,
    definition: &CaseDefinition,
    result: &SpinResult,
) -> Result<VerificationReport, Mismatch> {
    let actual = commitment_digest(inputs.server_seed)?;
    if !actual.eq_ignore_ascii_case(inputs.commitment.hash.trim()) {
        return Err(Mismatch::CommitmentHash {
            committed: inputs.commitment.hash.clone(),
            actual,
        });
    }
    if let Some(returned) = result.server_seed.as_deref() {
        if !returned.trim().eq_ignore_ascii_case(inputs.server_seed.trim()) {
            return Err(Mismatch::RevealDisagrees);
        }
    }
    if let Some(published) = definition.odds_version.as_deref() {
        for declared in [&result.odds_version, &result.table_id] {
            if declared != published {
                return Err(Mismatch::OddsVersion {
                    published: published.to_string(),
                    declared: declared.clone(),
                });
            }
        }
    }

    let roll = roll(inputs.server_seed, inputs.client_seed, inputs.nonce)?;
    let selection = select(&definition.tiers, roll, inputs.pity_bonus)?;
    let tier = &definition.tiers[selection.tier];
    let reward = &tier.rewards[selection.reward];

    if let Some(declared) = result.prize.reward_tier.as_deref() {
        if declared != tier.name {
            return Err(Mismatch::Tier {
                expected: tier.name.clone(),
                declared: declared.to_string(),
            });
        }
    }
    if reward.coin_id != result.prize.coin_id() || !same_decimal(&reward.amount, result.prize.amount())
    {
        return Err(Mismatch::Prize {
            expected: format!("{} {}", reward.amount, reward.coin_id),
            declared: format!("{} {}", result.prize.amount(), result.prize.coin_id()),
        });
    }

    Ok(VerificationReport {
        roll,
        selection,
        tier: tier.name.clone(),
        coin_id: reward.coin_id.clone(),
        amount: reward.amount.clone(),
        odds_version: result.odds_version.clone(),
    })
}

/// Compare decimal strings ignoring insignificant zeros ("1.50" == "1.5").
fn same_decimal(left: &str, right: &str) -> bool {
    fn normalize(raw: &str) -> String {
        let raw = raw.trim();
        let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
        let whole = whole.trim_start_matches('0');
        let whole = if whole.is_empty() { "0" } else { whole };
        let fraction = fraction.trim_end_matches('0');
        if fraction.is_empty() {
            whole.to_string()
        } else {
            format!("{whole}.{fraction}")
        }
    }
    normalize(left) == normalize(right)
}
