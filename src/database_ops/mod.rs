pub mod bandit_stats;
pub mod review_seed;
pub mod umami;
