pub mod audit;
pub mod configuration;
pub mod contacts;
pub mod crypto;
pub mod domain;
pub mod errors;
pub mod hmac_hasher;
pub mod ledger;
pub mod normalize;
pub mod orchestrator;
pub mod startup;
pub mod telemetry;
pub mod template;
pub mod transport;
pub mod utils;
pub mod vault;
pub mod workflow;
