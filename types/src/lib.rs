//! Types shared by the casebox client and the local simulator.

pub mod api;
pub mod case;
pub mod fairness;
pub mod probability;

pub use api::{Admission, Commitment, OpenRequest, Prize, Reveal, SpinResult, TokenPair, UserProfile};
pub use case::{CaseDefinition, Reward, RewardOdds, Tier};
pub use fairness::{FairnessError, Mismatch, VerificationReport};
pub use probability::Probability;
