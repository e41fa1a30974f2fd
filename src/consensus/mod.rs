pub mod chain;
pub mod genesis;
pub mod reward;
pub mod rules;
