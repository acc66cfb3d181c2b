//! Deterministic A/B variant assignment.
//!
//! The core is [`bucketing::assign`], a pure function of an identity hash,
//! a test name and a weighted variant map. The rest of the crate serves it
//! over HTTP: identity resolution, configuration and the request service.

pub mod bucketing;
pub mod config;
pub mod consent;
pub mod errors;
pub mod experiment;
pub mod identity;
pub mod ip;
pub mod metrics_defs;
pub mod record;
pub mod service;

pub use bucketing::assign;
pub use errors::{AssignError, AssignerError};
pub use experiment::{Experiment, TestName, Variants};
pub use record::{AssignmentRecord, Assignments};

use shared::admin_service::AdminService;
use shared::http::run_http_service;

pub async fn run(config: config::Config) -> Result<(), AssignerError> {
    config.validate()?;
    shared::metrics_defs::describe_all(metrics_defs::ALL_METRICS);

    tracing::info!(
        experiments = config.experiments.len(),
        "Starting assigner service"
    );

    let assigner_service = service::AssignerService::new(&config);
    let admin_service = AdminService::<_, AssignerError>::new(|| true);

    let assigner_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        assigner_service,
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(assigner_task, admin_task)?;
    Ok(())
}
