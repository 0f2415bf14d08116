//! Shared application state

use std::sync::Arc;

use lexfam_billing::BillingService;

use crate::{answer::AnswerEngine, auth::JwtManager, config::Config};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub billing: BillingService,
    pub jwt: JwtManager,
    pub answer_engine: Arc<dyn AnswerEngine>,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService, answer_engine: Arc<dyn AnswerEngine>) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            config: Arc::new(config),
            billing,
            jwt,
            answer_engine,
        }
    }

    pub fn message_limit(&self) -> i64 {
        self.config.free_user_message_limit
    }
}
