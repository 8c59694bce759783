//! Decides which best-checkpoint slot, if any, a validation result earns.

use crate::models::CheckpointCategory;

use super::TrainingState;

/// Compare the sweep averages against the running bests, update the bests
/// the matching rule owns, and return the slot to persist.
///
/// Rules are tried in order and the first match wins:
/// 1. lower loss but lower PSNR: `best_loss`
/// 2. higher PSNR but higher loss: `best_psnr`
/// 3. no worse on both: `best_both`
///
/// NaN averages (an empty sweep) match nothing.
pub fn select_checkpoint(
    avg_loss: f64,
    avg_psnr: f64,
    state: &mut TrainingState,
) -> Option<CheckpointCategory> {
    if avg_loss < state.best_loss && avg_psnr < state.best_psnr {
        state.best_loss = avg_loss;
        Some(CheckpointCategory::BestLoss)
    } else if avg_psnr > state.best_psnr && avg_loss > state.best_loss {
        state.best_psnr = avg_psnr;
        Some(CheckpointCategory::BestPsnr)
    } else if avg_loss <= state.best_loss && avg_psnr >= state.best_psnr {
        state.best_loss = avg_loss;
        state.best_psnr = avg_psnr;
        Some(CheckpointCategory::BestBoth)
    } else {
        None
    }
}
