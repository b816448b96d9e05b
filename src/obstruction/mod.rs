//! Things that stand between the engine and the form: overlay modals and
//! verification challenges.

pub mod challenge;
pub mod modal;

pub use challenge::{
    detect_challenge, wait_for_challenge, ChallengeInfo, ChallengeProvider, CHALLENGE_SELECTORS,
};
pub use modal::{dismiss_modals, handle_modal, is_dismiss_label, PRIMARY_BUTTON_PATTERNS};
