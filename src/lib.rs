pub mod config;
pub mod database_ops;
pub mod logging;
pub mod normalization;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use database_ops::bandit_stats::{sync as sync_bandit_stats, SyncSummary};
pub use database_ops::review_seed::{insert_full_review, seed_review, ReviewSeed, SeededReview};
pub use normalization::prior::{convert_score_to_prior, BetaPrior};
