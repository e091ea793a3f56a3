//! Commit/reveal lifecycle for one case view.
//!
//! ```text
//! Idle -> Loading -> AdmissionChecked -> Committing -> Committed
//!      -> Drawing -> Drawn -> (Verified | VerificationFailed)
//! ```
//!
//! Any step may end in `Failed`. [`DrawController::reset`] returns to `Idle`
//! keeping the fetched case definition; [`DrawController::leave`] drops
//! everything. Both bump an epoch so results of calls still in flight are
//! discarded instead of applied.

use crate::{Client, Error, ErrorKind, Result};
use casebox_types::{
    fairness::{pity_bonus, verify_draw, DrawInputs, FairnessError},
    Admission, CaseDefinition, Commitment, Mismatch, OpenRequest, Probability, Reveal, SpinResult,
    VerificationReport,
};
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything needed to re-check a finished draw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draw {
    pub commitment: Commitment,
    pub nonce: u64,
    pub client_seed: String,
    pub pity_bonus: Probability,
    /// Case definition as it was when `open` was sent.
    pub definition: CaseDefinition,
    pub result: SpinResult,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrawState {
    Idle,
    Loading,
    AdmissionChecked { admission: Admission },
    Committing,
    Committed { commitment: Commitment },
    Drawing { commitment: Commitment, nonce: u64 },
    Drawn { draw: Box<Draw> },
    Verified { draw: Box<Draw>, report: VerificationReport },
    VerificationFailed { draw: Box<Draw>, mismatch: Mismatch },
    Failed { kind: ErrorKind, message: String },
}

/// State tag without payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawPhase {
    Idle,
    Loading,
    AdmissionChecked,
    Committing,
    Committed,
    Drawing,
    Drawn,
    Verified,
    VerificationFailed,
    Failed,
}

impl DrawPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DrawPhase::Idle => "idle",
            DrawPhase::Loading => "loading",
            DrawPhase::AdmissionChecked => "admission_checked",
            DrawPhase::Committing => "committing",
            DrawPhase::Committed => "committed",
            DrawPhase::Drawing => "drawing",
            DrawPhase::Drawn => "drawn",
            DrawPhase::Verified => "verified",
            DrawPhase::VerificationFailed => "verification_failed",
            DrawPhase::Failed => "failed",
        }
    }
}

impl DrawState {
    pub fn phase(&self) -> DrawPhase {
        match self {
            DrawState::Idle => DrawPhase::Idle,
            DrawState::Loading => DrawPhase::Loading,
            DrawState::AdmissionChecked { .. } => DrawPhase::AdmissionChecked,
            DrawState::Committing => DrawPhase::Committing,
            DrawState::Committed { .. } => DrawPhase::Committed,
            DrawState::Drawing { .. } => DrawPhase::Drawing,
            DrawState::Drawn { .. } => DrawPhase::Drawn,
            DrawState::Verified { .. } => DrawPhase::Verified,
            DrawState::VerificationFailed { .. } => DrawPhase::VerificationFailed,
            DrawState::Failed { .. } => DrawPhase::Failed,
        }
    }

    fn name(&self) -> &'static str {
        self.phase().as_str()
    }
}

/// What the UI renders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DrawSnapshot {
    pub case_id: String,
    pub phase: DrawPhase,
    pub can_play: bool,
    pub admission_reason: Option<String>,
    pub error: Option<String>,
    pub next_nonce: Option<u64>,
}

/// Result of [`DrawController::open`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    Drawn(SpinResult),
    /// A draw was already in flight; nothing was sent.
    AlreadyDrawing,
}

struct Lifecycle {
    epoch: u64,
    client_seed: String,
    definition: Option<CaseDefinition>,
    state: DrawState,
    /// Seed ids handed to `open`, successful or not.
    consumed: HashSet<String>,
    /// Last streak of common results reported by the server.
    fail_streak: Option<u32>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            epoch: 0,
            client_seed: Uuid::new_v4().to_string(),
            definition: None,
            state: DrawState::Idle,
            consumed: HashSet::new(),
            fail_streak: None,
        }
    }

    /// Start over in `next`. Returns a held commitment that was never used.
    fn restart(&mut self, next: DrawState) -> Option<Commitment> {
        self.epoch += 1;
        match std::mem::replace(&mut self.state, next) {
            DrawState::Committed { commitment }
                if !self.consumed.contains(&commitment.server_seed_id) =>
            {
                Some(commitment)
            }
            _ => None,
        }
    }

    /// Install a freshly fetched definition. Its nonce replaces the cached
    /// one, whichever direction it moved.
    fn apply_definition(&mut self, fetched: CaseDefinition) {
        if fetched.fail_streak.is_some() {
            self.fail_streak = fetched.fail_streak;
        }
        self.definition = Some(fetched);
    }

    fn pity_bonus(&self, definition: &CaseDefinition) -> Probability {
        match definition.pity_after {
            Some(after) => pity_bonus(self.fail_streak.unwrap_or(0), after),
            None => Probability::ZERO,
        }
    }

    fn snapshot(&self, case_id: &str) -> DrawSnapshot {
        let (can_play, admission_reason) = match &self.state {
            DrawState::AdmissionChecked { admission } => {
                (admission.spin, admission.reason.clone())
            }
            DrawState::Committed { .. } => (true, None),
            _ => (false, None),
        };
        let error = match &self.state {
            DrawState::Failed { message, .. } => Some(message.clone()),
            DrawState::VerificationFailed { mismatch, .. } => Some(mismatch.to_string()),
            _ => None,
        };
        DrawSnapshot {
            case_id: case_id.to_string(),
            phase: self.state.phase(),
            can_play,
            admission_reason,
            error,
            next_nonce: self.definition.as_ref().map(CaseDefinition::next_nonce),
        }
    }
}

/// Drives one case view through admission, commit, draw and verification.
pub struct DrawController {
    client: Client,
    case_id: String,
    inner: Mutex<Lifecycle>,
    snapshots: watch::Sender<DrawSnapshot>,
}

impl DrawController {
    pub fn new(client: Client, case_id: impl Into<String>) -> Self {
        let case_id = case_id.into();
        let lifecycle = Lifecycle::new();
        let (snapshots, _) = watch::channel(lifecycle.snapshot(&case_id));
        Self {
            client,
            case_id,
            inner: Mutex::new(lifecycle),
            snapshots,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self) {
        let snapshot = self.lock().snapshot(&self.case_id);
        self.snapshots.send_replace(snapshot);
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn client_seed(&self) -> String {
        self.lock().client_seed.clone()
    }

    pub fn state(&self) -> DrawState {
        self.lock().state.clone()
    }

    pub fn definition(&self) -> Option<CaseDefinition> {
        self.lock().definition.clone()
    }

    pub fn snapshot(&self) -> DrawSnapshot {
        self.lock().snapshot(&self.case_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<DrawSnapshot> {
        self.snapshots.subscribe()
    }

    /// Record a failure unless the lifecycle moved on meanwhile.
    fn fail(&self, epoch: u64, err: Error) -> Error {
        {
            let mut lifecycle = self.lock();
            if lifecycle.epoch != epoch {
                return Error::Cancelled;
            }
            warn!(case_id = %self.case_id, error = %err, "draw lifecycle failed");
            lifecycle.state = DrawState::Failed {
                kind: err.kind(),
                message: err.to_string(),
            };
        }
        self.publish();
        err
    }

    /// Best-effort server-side cleanup of an unused commitment.
    async fn discard_commitment(&self, commitment: &Commitment) {
        match self.client.delete_commitment(&commitment.server_seed_id).await {
            Ok(()) => debug!(server_seed_id = %commitment.server_seed_id, "discarded unused commitment"),
            Err(err) => warn!(
                server_seed_id = %commitment.server_seed_id,
                error = %err,
                "failed to discard unused commitment"
            ),
        }
    }

    /// Enter the case view: load the definition and run the admission
    /// check. A denial is returned as data and leaves play disabled.
    pub async fn enter(&self) -> Result<Admission> {
        let (epoch, abandoned) = {
            let mut lifecycle = self.lock();
            let abandoned = lifecycle.restart(DrawState::Loading);
            (lifecycle.epoch, abandoned)
        };
        self.publish();
        if let Some(commitment) = abandoned {
            self.discard_commitment(&commitment).await;
        }

        let definition = match self.client.case(&self.case_id).await {
            Ok(definition) => definition,
            Err(err) => return Err(self.fail(epoch, err)),
        };
        {
            let mut lifecycle = self.lock();
            if lifecycle.epoch != epoch {
                return Err(Error::Cancelled);
            }
            lifecycle.apply_definition(definition);
        }
        self.admit(epoch).await
    }

    /// Repeat the admission check after a denial.
    pub async fn recheck(&self) -> Result<Admission> {
        let epoch = {
            let lifecycle = self.lock();
            match &lifecycle.state {
                DrawState::AdmissionChecked { .. } => lifecycle.epoch,
                other => {
                    return Err(Error::InvalidState {
                        expected: "admission_checked",
                        actual: other.name(),
                    })
                }
            }
        };
        self.admit(epoch).await
    }

    async fn admit(&self, epoch: u64) -> Result<Admission> {
        let admission = match self.client.precheck(&self.case_id).await {
            Ok(admission) => admission,
            Err(err) => return Err(self.fail(epoch, err)),
        };
        {
            let mut lifecycle = self.lock();
            if lifecycle.epoch != epoch {
                return Err(Error::Cancelled);
            }
            lifecycle.state = DrawState::AdmissionChecked {
                admission: admission.clone(),
            };
        }
        self.publish();
        if !admission.spin {
            info!(
                case_id = %self.case_id,
                reason = admission.reason.as_deref().unwrap_or_default(),
                "draw not admitted"
            );
        }
        Ok(admission)
    }

    /// Obtain a server seed commitment. Returns the held one if it is still
    /// unused.
    pub async fn commit(&self) -> Result<Commitment> {
        let epoch = {
            let mut lifecycle = self.lock();
            match &lifecycle.state {
                DrawState::Committed { commitment } => return Ok(commitment.clone()),
                DrawState::AdmissionChecked { admission } if !admission.spin => {
                    return Err(Error::AdmissionDenied {
                        reason: admission.reason.clone().unwrap_or_default(),
                    })
                }
                DrawState::AdmissionChecked { .. } => {}
                other => {
                    return Err(Error::InvalidState {
                        expected: "admission_checked",
                        actual: other.name(),
                    })
                }
            }
            lifecycle.state = DrawState::Committing;
            lifecycle.epoch
        };
        self.publish();

        let commitment = match self.client.commit().await {
            Ok(commitment) => commitment,
            Err(err) => return Err(self.fail(epoch, err)),
        };
        // Pick up the nonce the next draw has to follow.
        let fetched = self.client.case(&self.case_id).await;

        let outcome = {
            let mut lifecycle = self.lock();
            if lifecycle.epoch != epoch {
                None
            } else {
                match fetched {
                    Ok(definition) => lifecycle.apply_definition(definition),
                    Err(err) => warn!(error = %err, "could not refresh case after commit"),
                }
                if lifecycle.consumed.contains(&commitment.server_seed_id) {
                    Some(Err(Error::CommitmentConsumed(commitment.server_seed_id.clone())))
                } else {
                    lifecycle.state = DrawState::Committed {
                        commitment: commitment.clone(),
                    };
                    Some(Ok(()))
                }
            }
        };
        match outcome {
            None => {
                debug!("commitment arrived after reset");
                self.discard_commitment(&commitment).await;
                Err(Error::Cancelled)
            }
            Some(Err(err)) => Err(self.fail(epoch, err)),
            Some(Ok(())) => {
                self.publish();
                debug!(server_seed_id = %commitment.server_seed_id, "committed");
                Ok(commitment)
            }
        }
    }

    /// Re-fetch the case definition. The next draw derives its nonce from
    /// the latest definition seen.
    pub async fn refresh_definition(&self) -> Result<CaseDefinition> {
        let epoch = self.lock().epoch;
        let fetched = self.client.case(&self.case_id).await?;
        let definition = {
            let mut lifecycle = self.lock();
            if lifecycle.epoch != epoch {
                return Err(Error::Cancelled);
            }
            lifecycle.apply_definition(fetched);
            lifecycle.definition.clone()
        };
        self.publish();
        definition.ok_or(Error::Cancelled)
    }

    /// Spend the held commitment on a draw. Re-entrant calls while a draw is
    /// in flight return [`OpenOutcome::AlreadyDrawing`] without sending.
    pub async fn open(&self) -> Result<OpenOutcome> {
        let (epoch, request, commitment, pity_bonus, definition) = {
            let mut lifecycle = self.lock();
            let commitment = match &lifecycle.state {
                DrawState::Drawing { .. } => {
                    debug!(case_id = %self.case_id, "draw already in flight");
                    return Ok(OpenOutcome::AlreadyDrawing);
                }
                DrawState::Committed { commitment } => commitment.clone(),
                other => {
                    return Err(Error::InvalidState {
                        expected: "committed",
                        actual: other.name(),
                    })
                }
            };
            if lifecycle.consumed.contains(&commitment.server_seed_id) {
                return Err(Error::CommitmentConsumed(commitment.server_seed_id));
            }
            let Some(definition) = lifecycle.definition.clone() else {
                return Err(Error::InvalidState {
                    expected: "loaded case",
                    actual: lifecycle.state.name(),
                });
            };
            let nonce = definition.next_nonce();
            let pity_bonus = lifecycle.pity_bonus(&definition);
            lifecycle.consumed.insert(commitment.server_seed_id.clone());
            lifecycle.state = DrawState::Drawing {
                commitment: commitment.clone(),
                nonce,
            };
            let request = OpenRequest {
                case_id: self.case_id.clone(),
                client_seed: lifecycle.client_seed.clone(),
                nonce,
                server_seed_id: commitment.server_seed_id.clone(),
            };
            (lifecycle.epoch, request, commitment, pity_bonus, definition)
        };
        self.publish();
        debug!(case_id = %self.case_id, nonce = request.nonce, "opening case");

        let result = match self.client.open_case(&request).await {
            Ok(result) => result,
            Err(err) => return Err(self.fail(epoch, err)),
        };
        {
            let mut lifecycle = self.lock();
            if lifecycle.epoch != epoch {
                debug!("discarding draw result that arrived after reset");
                return Err(Error::Cancelled);
            }
            if let Some(current) = lifecycle.definition.as_mut() {
                current.nonce = current.nonce.max(request.nonce);
            }
            if result.fail_streak.is_some() {
                lifecycle.fail_streak = result.fail_streak;
            }
            lifecycle.state = DrawState::Drawn {
                draw: Box::new(Draw {
                    commitment,
                    nonce: request.nonce,
                    client_seed: request.client_seed.clone(),
                    pity_bonus,
                    definition,
                    result: result.clone(),
                }),
            };
        }
        self.publish();
        info!(
            case_id = %self.case_id,
            nonce = request.nonce,
            tier = result.prize.reward_tier.as_deref().unwrap_or_default(),
            coin = result.prize.coin_id(),
            amount = result.prize.amount(),
            "case opened"
        );
        Ok(OpenOutcome::Drawn(result))
    }

    /// Recompute the finished draw from the revealed seed. A disagreement
    /// moves to `VerificationFailed` and is returned as
    /// [`Error::VerificationMismatch`].
    pub async fn verify(&self) -> Result<VerificationReport> {
        let (epoch, draw) = {
            let lifecycle = self.lock();
            match &lifecycle.state {
                DrawState::Drawn { draw } => (lifecycle.epoch, draw.clone()),
                other => {
                    return Err(Error::InvalidState {
                        expected: "drawn",
                        actual: other.name(),
                    })
                }
            }
        };

        // Network errors leave the draw in `Drawn` so verification can be
        // retried.
        let verdict = match self.revealed_seed(&draw).await? {
            Ok(server_seed) => {
                let inputs = DrawInputs {
                    commitment: &draw.commitment,
                    server_seed: &server_seed,
                    client_seed: &draw.client_seed,
                    nonce: draw.nonce,
                    pity_bonus: draw.pity_bonus,
                };
                verify_draw(&inputs, &draw.definition, &draw.result)
            }
            Err(mismatch) => Err(mismatch),
        };

        {
            let mut lifecycle = self.lock();
            if lifecycle.epoch != epoch {
                return Err(Error::Cancelled);
            }
            lifecycle.state = match &verdict {
                Ok(report) => DrawState::Verified {
                    draw,
                    report: report.clone(),
                },
                Err(mismatch) => DrawState::VerificationFailed {
                    draw,
                    mismatch: mismatch.clone(),
                },
            };
        }
        self.publish();
        match verdict {
            Ok(report) => {
                info!(case_id = %self.case_id, roll = report.roll.as_f64(), "draw verified");
                Ok(report)
            }
            Err(mismatch) => {
                warn!(case_id = %self.case_id, %mismatch, "draw failed verification");
                Err(Error::VerificationMismatch(mismatch))
            }
        }
    }

    async fn revealed_seed(&self, draw: &Draw) -> Result<std::result::Result<String, Mismatch>> {
        if let Some(server_seed) = &draw.result.server_seed {
            return Ok(Ok(server_seed.clone()));
        }
        let Some(spin_log_id) = &draw.result.spin_log_id else {
            return Ok(Err(Mismatch::Malformed(FairnessError::EmptySeed)));
        };
        let reveal = self.client.reveal(spin_log_id).await?;
        if let Some(mismatch) = reveal_conflict(&reveal, &draw.result) {
            return Ok(Err(mismatch));
        }
        Ok(Ok(reveal.server_seed))
    }

    /// Play again: back to `Idle` with the case definition kept. An unused
    /// commitment is deleted on the server.
    pub async fn reset(&self) {
        let abandoned = self.lock().restart(DrawState::Idle);
        self.publish();
        if let Some(commitment) = abandoned {
            self.discard_commitment(&commitment).await;
        }
    }

    /// Navigate away: like [`Self::reset`] but the next visit starts from
    /// scratch with a new client seed.
    pub async fn leave(&self) {
        let abandoned = {
            let mut lifecycle = self.lock();
            let abandoned = lifecycle.restart(DrawState::Idle);
            lifecycle.definition = None;
            lifecycle.fail_streak = None;
            lifecycle.client_seed = Uuid::new_v4().to_string();
            abandoned
        };
        self.publish();
        if let Some(commitment) = abandoned {
            self.discard_commitment(&commitment).await;
        }
    }
}

/// The reveal must name the same odds version and table the draw declared.
fn reveal_conflict(reveal: &Reveal, result: &SpinResult) -> Option<Mismatch> {
    if reveal.odds_version != result.odds_version {
        return Some(Mismatch::OddsVersion {
            published: reveal.odds_version.clone(),
            declared: result.odds_version.clone(),
        });
    }
    if reveal.table_id != result.table_id {
        return Some(Mismatch::OddsVersion {
            published: reveal.table_id.clone(),
            declared: result.table_id.clone(),
        });
    }
    None
}
