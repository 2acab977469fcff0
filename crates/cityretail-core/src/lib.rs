pub mod clean;
pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod load;
pub mod run;
pub mod types;
