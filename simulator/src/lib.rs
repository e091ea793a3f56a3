//! Local casebox backend.
//!
//! Serves the same REST surface as the production API from memory, draws
//! with the same provably-fair function the client verifies, and exposes
//! knobs ([`Controls`]) that let tests provoke refresh failures, reserve
//! denials and dishonest draws.

use casebox_types::{
    fairness::{self, FairnessError},
    Admission, CaseDefinition, Commitment, OpenRequest, Prize, Probability, Reveal, SpinResult,
    TokenPair, UserProfile,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod api;
pub use api::Api;

mod auth;
pub use auth::{init_data, verify_init_data, HostUser};

mod state;
pub use state::{default_cases, usd_to_cents, Player, SeedRecord, SimulatorConfig, SpinLog, State};

const TAMPERED_ODDS_VERSION: &str = "v0";

/// Error returned by every simulated endpoint; rendered as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("insufficient_balance")]
    InsufficientBalance,
    #[error("{0}")]
    Conflict(&'static str),
    #[error("service_unavailable")]
    Unavailable,
    #[error("draw failed: {0}")]
    Draw(#[from] FairnessError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshMode {
    #[default]
    Accept,
    /// Answer 401 to every refresh.
    Reject,
    /// Answer 503 to every refresh.
    Unavailable,
}

/// Ways the simulator can lie about a draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tamper {
    #[default]
    None,
    /// Award a different prize than the seed selects.
    Prize,
    /// Return a server seed that does not match the commitment.
    Seed,
    /// Declare an odds table other than the published one.
    OddsVersion,
    /// Publish a commitment hash that is not the seed's digest.
    Commitment,
}

#[derive(Clone, Debug)]
pub struct Controls {
    pub refresh: RefreshMode,
    pub refresh_delay: Duration,
    /// Delay before answering commit and open.
    pub draw_delay: Duration,
    pub reserve_available: bool,
    pub reserve_reason: String,
    /// Return the server seed in the `open` response. When off, clients
    /// have to call reveal.
    pub include_seed_in_open: bool,
    pub tamper: Tamper,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            refresh: RefreshMode::Accept,
            refresh_delay: Duration::ZERO,
            draw_delay: Duration::ZERO,
            reserve_available: true,
            reserve_reason: "reserve_low".to_string(),
            include_seed_in_open: true,
            tamper: Tamper::None,
        }
    }
}

#[derive(Default)]
struct CallCounters {
    login: AtomicU64,
    refresh: AtomicU64,
    current_user: AtomicU64,
    list: AtomicU64,
    get_one: AtomicU64,
    precheck: AtomicU64,
    commit: AtomicU64,
    delete_commitment: AtomicU64,
    open: AtomicU64,
    reveal: AtomicU64,
}

/// Number of calls that reached each endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub login: u64,
    pub refresh: u64,
    pub current_user: u64,
    pub list: u64,
    pub get_one: u64,
    pub precheck: u64,
    pub commit: u64,
    pub delete_commitment: u64,
    pub open: u64,
    pub reveal: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Indicative USD rates for prize valuation.
fn usd_rate(coin_id: &str) -> f64 {
    match coin_id {
        "USD" | "USDT" | "USDC" => 1.0,
        "TON" => 5.0,
        "DOGE" => 0.1,
        "BTC" => 60_000.0,
        _ => 0.0,
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct Simulator {
    config: SimulatorConfig,
    state: RwLock<State>,
    controls: Mutex<Controls>,
    calls: CallCounters,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let state = State::new(config.cases.clone());
        Self {
            config,
            state: RwLock::new(state),
            controls: Mutex::new(Controls::default()),
            calls: CallCounters::default(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn controls(&self) -> Controls {
        self.controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update_controls(&self, update: impl FnOnce(&mut Controls)) {
        let mut controls = self
            .controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut controls);
    }

    pub fn calls(&self) -> CallCounts {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CallCounts {
            login: load(&self.calls.login),
            refresh: load(&self.calls.refresh),
            current_user: load(&self.calls.current_user),
            list: load(&self.calls.list),
            get_one: load(&self.calls.get_one),
            precheck: load(&self.calls.precheck),
            commit: load(&self.calls.commit),
            delete_commitment: load(&self.calls.delete_commitment),
            open: load(&self.calls.open),
            reveal: load(&self.calls.reveal),
        }
    }

    /// Forget every issued access token, as if they had all expired.
    pub async fn invalidate_access_tokens(&self) {
        self.state.write().await.access_tokens.clear();
    }

    /// Move a player's nonce for a case, as a draw from another device
    /// would.
    pub async fn set_nonce(&self, user: u64, case_id: &str, nonce: u64) {
        if let Some(player) = self.state.write().await.players.get_mut(&user) {
            player.nonces.insert(case_id.to_string(), nonce);
        }
    }

    pub async fn set_balance_cents(&self, user: u64, balance_cents: u64) {
        if let Some(player) = self.state.write().await.players.get_mut(&user) {
            player.balance_cents = balance_cents;
        }
    }

    pub async fn balance_cents(&self, user: u64) -> Option<u64> {
        self.state
            .read()
            .await
            .players
            .get(&user)
            .map(|player| player.balance_cents)
    }

    /// Whether a commitment exists and has not been spent.
    pub async fn commitment_unused(&self, server_seed_id: &str) -> bool {
        self.state
            .read()
            .await
            .seeds
            .get(server_seed_id)
            .is_some_and(|record| !record.used)
    }

    fn issue_tokens(state: &mut State, user: u64) -> TokenPair {
        let access_token = format!("at-{}", Uuid::new_v4());
        let refresh_token = format!("rt-{}", Uuid::new_v4());
        state.access_tokens.insert(access_token.clone(), user);
        state.refresh_tokens.insert(refresh_token.clone(), user);
        TokenPair {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
        }
    }

    pub async fn login(&self, init_data: &str) -> Result<TokenPair, SimError> {
        bump(&self.calls.login);
        let user = verify_init_data(init_data, self.config.bot_token.as_deref())?;
        let mut state = self.state.write().await;
        let starting_balance = self.config.starting_balance_cents;
        state.players.entry(user.id).or_insert_with(|| Player {
            id: user.id,
            username: user.username.clone(),
            balance_cents: starting_balance,
            nonces: HashMap::new(),
            fail_streak: 0,
        });
        info!(user = user.id, "login");
        Ok(Self::issue_tokens(&mut state, user.id))
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, SimError> {
        bump(&self.calls.refresh);
        let controls = self.controls();
        if !controls.refresh_delay.is_zero() {
            tokio::time::sleep(controls.refresh_delay).await;
        }
        match controls.refresh {
            RefreshMode::Accept => {}
            RefreshMode::Reject => return Err(SimError::Unauthorized("invalid_refresh_token")),
            RefreshMode::Unavailable => return Err(SimError::Unavailable),
        }
        let mut state = self.state.write().await;
        let user = state
            .refresh_tokens
            .remove(refresh_token)
            .ok_or(SimError::Unauthorized("invalid_refresh_token"))?;
        debug!(user, "refresh token rotated");
        Ok(Self::issue_tokens(&mut state, user))
    }

    pub async fn authenticate(&self, bearer: Option<&str>) -> Result<u64, SimError> {
        let token = bearer.ok_or(SimError::Unauthorized("not_authenticated"))?;
        self.state
            .read()
            .await
            .access_tokens
            .get(token)
            .copied()
            .ok_or(SimError::Unauthorized("invalid_token"))
    }

    pub async fn current_user(&self, user: u64) -> Result<UserProfile, SimError> {
        bump(&self.calls.current_user);
        let state = self.state.read().await;
        let player = state
            .players
            .get(&user)
            .ok_or(SimError::NotFound("user_not_found"))?;
        Ok(UserProfile {
            id: player.id.to_string(),
            username: player.username.clone(),
            role: Some("user".to_string()),
        })
    }

    pub async fn list_cases(&self, user: u64) -> Vec<CaseDefinition> {
        bump(&self.calls.list);
        let state = self.state.read().await;
        state
            .cases
            .keys()
            .filter_map(|case_id| state.case_for(case_id, user))
            .collect()
    }

    pub async fn case(&self, user: u64, case_id: &str) -> Result<CaseDefinition, SimError> {
        bump(&self.calls.get_one);
        self.state
            .read()
            .await
            .case_for(case_id, user)
            .ok_or(SimError::NotFound("invalid_case"))
    }

    pub async fn precheck(&self, case_id: &str) -> Result<Admission, SimError> {
        bump(&self.calls.precheck);
        if !self.state.read().await.cases.contains_key(case_id) {
            return Err(SimError::NotFound("invalid_case"));
        }
        let controls = self.controls();
        Ok(if controls.reserve_available {
            Admission {
                spin: true,
                reason: None,
            }
        } else {
            Admission {
                spin: false,
                reason: Some(controls.reserve_reason),
            }
        })
    }

    /// Commit to a server seed. A player holds at most one unused seed; it
    /// is returned again until spent or deleted.
    pub async fn commit(&self, user: u64) -> Result<Commitment, SimError> {
        bump(&self.calls.commit);
        let controls = self.controls();
        if !controls.draw_delay.is_zero() {
            tokio::time::sleep(controls.draw_delay).await;
        }
        let tamper = controls.tamper;
        let mut state = self.state.write().await;
        let (server_seed_id, hash) = match state.unused_seed(user) {
            Some((id, record)) => (id.clone(), record.hash.clone()),
            None => {
                let mut seed = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut seed);
                let id = Uuid::new_v4().to_string();
                let hash = digest_hex(&seed);
                state.seeds.insert(
                    id.clone(),
                    SeedRecord {
                        owner: user,
                        seed: hex::encode(seed),
                        hash: hash.clone(),
                        used: false,
                    },
                );
                (id, hash)
            }
        };
        let hash = if tamper == Tamper::Commitment {
            digest_hex(hash.as_bytes())
        } else {
            hash
        };
        Ok(Commitment {
            server_seed_id,
            hash,
        })
    }

    pub async fn delete_commitment(&self, user: u64, server_seed_id: &str) -> Result<(), SimError> {
        bump(&self.calls.delete_commitment);
        let mut state = self.state.write().await;
        let record = state
            .seeds
            .get(server_seed_id)
            .ok_or(SimError::NotFound("commit_not_found"))?;
        if record.owner != user {
            return Err(SimError::Forbidden("forbidden"));
        }
        if record.used {
            return Err(SimError::Conflict("commit_already_used"));
        }
        state.seeds.remove(server_seed_id);
        debug!(user, server_seed_id, "commitment deleted");
        Ok(())
    }

    /// Draw. The seed is spent before any other check, so a rejected draw
    /// still consumes its commitment.
    pub async fn open(&self, user: u64, request: &OpenRequest) -> Result<SpinResult, SimError> {
        bump(&self.calls.open);
        let controls = self.controls();
        if !controls.draw_delay.is_zero() {
            tokio::time::sleep(controls.draw_delay).await;
        }
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let record = state
            .seeds
            .get_mut(&request.server_seed_id)
            .filter(|record| record.owner == user && !record.used)
            .ok_or_else(|| SimError::BadRequest("invalid or already used commit_id".to_string()))?;
        record.used = true;
        let server_seed = record.seed.clone();
        let server_seed_hash = record.hash.clone();

        let case = state
            .cases
            .get(&request.case_id)
            .cloned()
            .ok_or(SimError::NotFound("invalid_case"))?;
        let price = usd_to_cents(&case.price_usd)
            .ok_or_else(|| SimError::BadRequest("invalid_case_price".to_string()))?;
        let player = state
            .players
            .get_mut(&user)
            .ok_or(SimError::NotFound("user_not_found"))?;
        let last_nonce = player.nonces.get(&request.case_id).copied().unwrap_or(0);
        if request.nonce <= last_nonce {
            return Err(SimError::BadRequest(format!(
                "nonce must be greater than {last_nonce}"
            )));
        }
        if player.balance_cents < price {
            return Err(SimError::InsufficientBalance);
        }
        if !controls.reserve_available {
            return Err(SimError::Conflict("reserve_exhausted"));
        }

        let roll = fairness::roll(&server_seed, &request.client_seed, request.nonce)?;
        let bonus = case
            .pity_after
            .map(|after| fairness::pity_bonus(player.fail_streak, after))
            .unwrap_or(Probability::ZERO);
        let selection = fairness::select(&case.tiers, roll, bonus)?;
        let tier = &case.tiers[selection.tier];
        let mut reward = tier.rewards[selection.reward].clone();
        let mut tier_name = tier.name.clone();

        player.balance_cents -= price;
        if reward.coin_id == "USD" {
            player.balance_cents += usd_to_cents(&reward.amount).unwrap_or(0);
        }
        player.nonces.insert(request.case_id.clone(), request.nonce);
        // The most likely tier counts as a miss for soft pity.
        player.fail_streak = if selection.tier == 0 {
            player.fail_streak.saturating_add(1)
        } else {
            0
        };
        let fail_streak = player.fail_streak;

        let odds_version = case.odds_version.clone().unwrap_or_default();
        let spin_log_id = Uuid::new_v4().to_string();
        state.spins.insert(
            spin_log_id.clone(),
            SpinLog {
                owner: user,
                server_seed_id: request.server_seed_id.clone(),
                odds_version: odds_version.clone(),
            },
        );

        let mut declared_version = odds_version;
        let mut declared_seed = server_seed;
        match controls.tamper {
            Tamper::None | Tamper::Commitment => {}
            Tamper::Prize => {
                if let Some((other_tier, other)) = case
                    .tiers
                    .iter()
                    .flat_map(|tier| tier.rewards.iter().map(move |reward| (tier, reward)))
                    .find(|(_, other)| other.coin_id != reward.coin_id)
                {
                    tier_name = other_tier.name.clone();
                    reward = other.clone();
                }
            }
            Tamper::Seed => declared_seed = server_seed_hash,
            Tamper::OddsVersion => declared_version = TAMPERED_ODDS_VERSION.to_string(),
        }
        if controls.tamper != Tamper::None {
            warn!(tamper = ?controls.tamper, "serving a tampered draw");
        }

        let amount: f64 = reward.amount.parse().unwrap_or(0.0);
        info!(
            user,
            case_id = %request.case_id,
            nonce = request.nonce,
            tier = %tier_name,
            coin = %reward.coin_id,
            "case opened"
        );
        Ok(SpinResult {
            server_seed: controls.include_seed_in_open.then_some(declared_seed),
            table_id: declared_version.clone(),
            odds_version: declared_version,
            prize: Prize {
                reward_tier: Some(tier_name),
                coin_amount: (reward.coin_id.clone(), reward.network.clone(), reward.amount.clone()),
                usd_value: format!("{:.2}", amount * usd_rate(&reward.coin_id)),
            },
            spin_log_id: Some(spin_log_id),
            fail_streak: Some(fail_streak),
        })
    }

    pub async fn reveal(&self, user: u64, spin_log_id: &str) -> Result<Reveal, SimError> {
        bump(&self.calls.reveal);
        let tamper = self.controls().tamper;
        let state = self.state.read().await;
        let spin = state
            .spins
            .get(spin_log_id)
            .ok_or(SimError::NotFound("spin_log_not_found"))?;
        if spin.owner != user {
            return Err(SimError::Forbidden("forbidden"));
        }
        let record = state
            .seeds
            .get(&spin.server_seed_id)
            .ok_or(SimError::NotFound("server_seed_not_found"))?;
        let server_seed = if tamper == Tamper::Seed {
            record.hash.clone()
        } else {
            record.seed.clone()
        };
        let odds_version = if tamper == Tamper::OddsVersion {
            TAMPERED_ODDS_VERSION.to_string()
        } else {
            spin.odds_version.clone()
        };
        Ok(Reveal {
            server_seed,
            table_id: odds_version.clone(),
            odds_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebox_types::{fairness::verify_draw, fairness::DrawInputs};

    async fn logged_in(simulator: &Simulator, user: u64) -> u64 {
        let tokens = simulator.login(&init_data(user, "alice", None)).await.unwrap();
        simulator
            .authenticate(Some(&tokens.access_token))
            .await
            .unwrap()
    }

    fn open_request(commitment: &Commitment, nonce: u64) -> OpenRequest {
        OpenRequest {
            case_id: "starter".to_string(),
            client_seed: "client-seed".to_string(),
            nonce,
            server_seed_id: commitment.server_seed_id.clone(),
        }
    }

    #[tokio::test]
    async fn test_commit_returns_unused_seed_until_spent() {
        let simulator = Simulator::default();
        let user = logged_in(&simulator, 1).await;

        let first = simulator.commit(user).await.unwrap();
        let again = simulator.commit(user).await.unwrap();
        assert_eq!(first, again);

        simulator.open(user, &open_request(&first, 1)).await.unwrap();
        let next = simulator.commit(user).await.unwrap();
        assert_ne!(next.server_seed_id, first.server_seed_id);
    }

    #[tokio::test]
    async fn test_open_draw_verifies() {
        let simulator = Simulator::default();
        let user = logged_in(&simulator, 1).await;
        let commitment = simulator.commit(user).await.unwrap();
        let definition = simulator.case(user, "starter").await.unwrap();

        let request = open_request(&commitment, definition.next_nonce());
        let result = simulator.open(user, &request).await.unwrap();
        let server_seed = result.server_seed.clone().unwrap();
        let inputs = DrawInputs {
            commitment: &commitment,
            server_seed: &server_seed,
            client_seed: &request.client_seed,
            nonce: request.nonce,
            pity_bonus: Probability::ZERO,
        };
        verify_draw(&inputs, &definition, &result).unwrap();

        assert_eq!(simulator.case(user, "starter").await.unwrap().nonce, 1);
        let reveal = simulator
            .reveal(user, result.spin_log_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(reveal.server_seed, server_seed);
        assert_eq!(reveal.odds_version, "v1");
    }

    #[tokio::test]
    async fn test_commitment_cannot_be_reused() {
        let simulator = Simulator::default();
        let user = logged_in(&simulator, 1).await;
        let commitment = simulator.commit(user).await.unwrap();

        simulator.open(user, &open_request(&commitment, 1)).await.unwrap();
        let err = simulator
            .open(user, &open_request(&commitment, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_rejected_open_still_spends_seed() {
        let simulator = Simulator::default();
        let user = logged_in(&simulator, 1).await;
        simulator.set_balance_cents(user, 100).await;
        let commitment = simulator.commit(user).await.unwrap();

        let err = simulator
            .open(user, &open_request(&commitment, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::InsufficientBalance));
        assert!(!simulator.commitment_unused(&commitment.server_seed_id).await);
        assert_eq!(simulator.balance_cents(user).await, Some(100));
    }

    #[tokio::test]
    async fn test_nonce_must_increase() {
        let simulator = Simulator::default();
        let user = logged_in(&simulator, 1).await;
        simulator.set_nonce(user, "starter", 5).await;
        let commitment = simulator.commit(user).await.unwrap();

        let err = simulator
            .open(user, &open_request(&commitment, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::BadRequest(message) if message.contains("greater than 5")));
    }

    #[tokio::test]
    async fn test_delete_commitment_rules() {
        let simulator = Simulator::default();
        let user = logged_in(&simulator, 1).await;
        let other = logged_in(&simulator, 2).await;
        let commitment = simulator.commit(user).await.unwrap();

        assert!(matches!(
            simulator.delete_commitment(other, &commitment.server_seed_id).await,
            Err(SimError::Forbidden(_))
        ));
        simulator
            .delete_commitment(user, &commitment.server_seed_id)
            .await
            .unwrap();
        assert!(matches!(
            simulator.delete_commitment(user, &commitment.server_seed_id).await,
            Err(SimError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_tokens() {
        let simulator = Simulator::default();
        let tokens = simulator.login(&init_data(1, "alice", None)).await.unwrap();
        let rotated = simulator.refresh(&tokens.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, tokens.refresh_token);
        assert!(simulator.refresh(&tokens.refresh_token).await.is_err());

        simulator.update_controls(|controls| controls.refresh = RefreshMode::Unavailable);
        assert!(matches!(
            simulator.refresh(&rotated.refresh_token).await,
            Err(SimError::Unavailable)
        ));
        assert_eq!(simulator.calls().refresh, 3);
    }

    #[tokio::test]
    async fn test_precheck_follows_reserve() {
        let simulator = Simulator::default();
        assert!(simulator.precheck("starter").await.unwrap().spin);
        simulator.update_controls(|controls| {
            controls.reserve_available = false;
            controls.reserve_reason = "reserve_exhausted".to_string();
        });
        let admission = simulator.precheck("starter").await.unwrap();
        assert!(!admission.spin);
        assert_eq!(admission.reason.as_deref(), Some("reserve_exhausted"));
        assert!(matches!(
            simulator.precheck("missing").await,
            Err(SimError::NotFound(_))
        ));
    }
}
