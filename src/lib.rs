pub mod backtester;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod indicators;
pub mod live;
pub mod market_data;
pub mod models;
pub mod performance;
pub mod persistence;
pub mod position_book;
pub(crate) mod retry;
pub mod signals;
pub mod trading_rules;
