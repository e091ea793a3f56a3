use crate::probability::Probability;
use serde::{Deserialize, Deserializer, Serialize};

/// A single prize inside a tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub coin_id: String,
    /// `None` for balances that are not bound to a chain (e.g. the USD wallet).
    #[serde(default)]
    pub network: Option<String>,
    #[serde(deserialize_with = "decimal_string")]
    pub amount: String,
    pub sub_chance: Probability,
}

/// A weighted group of rewards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    pub chance: Probability,
    pub rewards: Vec<Reward>,
}

/// Case metadata as served by `GET /cases/get_one`.
///
/// `nonce` is the last nonce consumed by this user for this case; the next
/// draw must use `nonce + 1`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDefinition {
    pub case_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(deserialize_with = "decimal_string")]
    pub price_usd: String,
    #[serde(default)]
    pub nonce: u64,
    pub tiers: Vec<Tier>,
    /// Odds table version currently used for draws of this case.
    #[serde(default)]
    pub odds_version: Option<String>,
    /// Consecutive common results before the soft-pity bonus kicks in.
    #[serde(default)]
    pub pity_after: Option<u32>,
    /// The caller's current streak of common results, when published.
    #[serde(default)]
    pub fail_streak: Option<u32>,
}

/// Absolute chance of winning one reward, for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewardOdds {
    pub tier: String,
    pub coin_id: String,
    pub network: Option<String>,
    pub amount: String,
    pub chance: Probability,
}

impl CaseDefinition {
    /// Tier chance times reward sub-chance, for every reward in table order.
    ///
    /// Display only: the draw itself happens on the server.
    pub fn reward_odds(&self) -> Vec<RewardOdds> {
        self.tiers
            .iter()
            .flat_map(|tier| {
                tier.rewards.iter().map(move |reward| RewardOdds {
                    tier: tier.name.clone(),
                    coin_id: reward.coin_id.clone(),
                    network: reward.network.clone(),
                    amount: reward.amount.clone(),
                    chance: tier.chance.compose(reward.sub_chance),
                })
            })
            .collect()
    }

    /// Nonce to send with the next `open` call.
    pub fn next_nonce(&self) -> u64 {
        self.nonce.saturating_add(1)
    }
}

/// Accept decimals encoded either as JSON strings or numbers and keep the
/// textual form.
pub(crate) fn decimal_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}
