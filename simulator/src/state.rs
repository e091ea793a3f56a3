use casebox_types::{CaseDefinition, Reward, Tier};
use std::collections::{BTreeMap, HashMap};

const DEFAULT_STARTING_BALANCE_CENTS: u64 = 100_000;
const DEFAULT_ODDS_VERSION: &str = "v1";
const DEFAULT_PITY_AFTER: u32 = 20;

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_env_string(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// When set, `init_data` must carry a valid signature for this token.
    pub bot_token: Option<String>,
    pub starting_balance_cents: u64,
    pub cases: Vec<CaseDefinition>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            starting_balance_cents: DEFAULT_STARTING_BALANCE_CENTS,
            cases: default_cases(),
        }
    }
}

impl SimulatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bot_token: parse_env_string("CASEBOX_SIM_BOT_TOKEN"),
            starting_balance_cents: parse_env_u64("CASEBOX_SIM_BALANCE_CENTS")
                .unwrap_or(defaults.starting_balance_cents),
            cases: defaults.cases,
        }
    }
}

fn reward(coin_id: &str, network: Option<&str>, amount: &str, sub_chance: &str) -> Reward {
    Reward {
        coin_id: coin_id.to_string(),
        network: network.map(str::to_string),
        amount: amount.to_string(),
        sub_chance: sub_chance.parse().unwrap_or_default(),
    }
}

fn tier(name: &str, chance: &str, rewards: Vec<Reward>) -> Tier {
    Tier {
        name: name.to_string(),
        chance: chance.parse().unwrap_or_default(),
        rewards,
    }
}

/// Starter catalogue served when no cases are configured.
pub fn default_cases() -> Vec<CaseDefinition> {
    vec![
        CaseDefinition {
            case_id: "starter".to_string(),
            name: Some("Starter Case".to_string()),
            price_usd: "5".to_string(),
            nonce: 0,
            tiers: vec![
                tier(
                    "common",
                    "0.7",
                    vec![
                        reward("USD", None, "1", "0.6"),
                        reward("DOGE", Some("doge"), "10", "0.4"),
                    ],
                ),
                tier("rare", "0.25", vec![reward("TON", Some("ton"), "2", "1")]),
                tier("epic", "0.05", vec![reward("USDT", Some("ton"), "50", "1")]),
            ],
            odds_version: Some(DEFAULT_ODDS_VERSION.to_string()),
            pity_after: Some(DEFAULT_PITY_AFTER),
            fail_streak: None,
        },
        CaseDefinition {
            case_id: "premium".to_string(),
            name: Some("Premium Case".to_string()),
            price_usd: "25".to_string(),
            nonce: 0,
            tiers: vec![
                tier("common", "0.8", vec![reward("USD", None, "10", "1")]),
                tier(
                    "legendary",
                    "0.2",
                    vec![
                        reward("TON", Some("ton"), "20", "0.75"),
                        reward("BTC", Some("bitcoin"), "0.001", "0.25"),
                    ],
                ),
            ],
            odds_version: Some(DEFAULT_ODDS_VERSION.to_string()),
            pity_after: None,
            fail_streak: None,
        },
    ]
}

/// Parse a non-negative decimal USD amount into cents, truncating
/// sub-cent digits.
pub fn usd_to_cents(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut cents = fraction.chars().take(2).collect::<String>();
    while cents.len() < 2 {
        cents.push('0');
    }
    whole.checked_mul(100)?.checked_add(cents.parse().ok()?)
}

#[derive(Clone, Debug)]
pub struct Player {
    pub id: u64,
    pub username: Option<String>,
    pub balance_cents: u64,
    pub nonces: HashMap<String, u64>,
    pub fail_streak: u32,
}

#[derive(Clone, Debug)]
pub struct SeedRecord {
    pub owner: u64,
    /// Hex of the 32 seed bytes.
    pub seed: String,
    pub hash: String,
    pub used: bool,
}

#[derive(Clone, Debug)]
pub struct SpinLog {
    pub owner: u64,
    pub server_seed_id: String,
    pub odds_version: String,
}

/// Everything the simulated backend persists.
#[derive(Default)]
pub struct State {
    pub cases: BTreeMap<String, CaseDefinition>,
    pub players: HashMap<u64, Player>,
    pub access_tokens: HashMap<String, u64>,
    pub refresh_tokens: HashMap<String, u64>,
    pub seeds: HashMap<String, SeedRecord>,
    pub spins: HashMap<String, SpinLog>,
}

impl State {
    pub fn new(cases: Vec<CaseDefinition>) -> Self {
        Self {
            cases: cases
                .into_iter()
                .map(|case| (case.case_id.clone(), case))
                .collect(),
            ..Self::default()
        }
    }

    /// The case as seen by `player`: their nonce and fail streak filled in.
    pub fn case_for(&self, case_id: &str, player: u64) -> Option<CaseDefinition> {
        let mut case = self.cases.get(case_id)?.clone();
        if let Some(player) = self.players.get(&player) {
            case.nonce = player.nonces.get(case_id).copied().unwrap_or(0);
            case.fail_streak = Some(player.fail_streak);
        }
        Some(case)
    }

    pub fn unused_seed(&self, owner: u64) -> Option<(&String, &SeedRecord)> {
        self.seeds
            .iter()
            .find(|(_, record)| record.owner == owner && !record.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usd_to_cents() {
        assert_eq!(usd_to_cents("5"), Some(500));
        assert_eq!(usd_to_cents("2.5"), Some(250));
        assert_eq!(usd_to_cents("0.019"), Some(1));
        assert_eq!(usd_to_cents(".75"), Some(75));
        assert_eq!(usd_to_cents("-1"), None);
        assert_eq!(usd_to_cents("1e3"), None);
        assert_eq!(usd_to_cents(""), None);
    }

    #[test]
    fn test_default_cases_are_complete_tables() {
        for case in default_cases() {
            let total = case
                .tiers
                .iter()
                .fold(casebox_types::Probability::ZERO, |acc, tier| {
                    acc.saturating_add(tier.chance)
                });
            assert_eq!(total, casebox_types::Probability::ONE, "{}", case.case_id);
            for tier in &case.tiers {
                let total = tier
                    .rewards
                    .iter()
                    .fold(casebox_types::Probability::ZERO, |acc, reward| {
                        acc.saturating_add(reward.sub_chance)
                    });
                assert_eq!(total, casebox_types::Probability::ONE, "{}", tier.name);
            }
        }
    }

    #[test]
    fn test_case_for_fills_player_progress() {
        let mut state = State::new(default_cases());
        state.players.insert(
            7,
            Player {
                id: 7,
                username: None,
                balance_cents: 0,
                nonces: HashMap::from([("starter".to_string(), 4)]),
                fail_streak: 3,
            },
        );
        let case = state.case_for("starter", 7).unwrap();
        assert_eq!(case.nonce, 4);
        assert_eq!(case.fail_streak, Some(3));
        assert_eq!(state.case_for("premium", 7).unwrap().nonce, 0);
        assert!(state.case_for("missing", 7).is_none());
    }
}
