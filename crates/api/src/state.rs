//! Application state

use std::sync::Arc;

use ledgerly_billing::{
    Catalog, EventDispatcher, LedgerStore, PaymentGateway, ReferralService, StripeGateway,
    TokenLedger,
};
use sqlx::PgPool;

use crate::alerting::AlertService;
use crate::auth::JwtVerifier;
use crate::config::ApiConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<ApiConfig>,
    pub store: LedgerStore,
    pub ledger: TokenLedger,
    pub catalog: Catalog,
    pub referrals: ReferralService,
    pub dispatcher: Arc<EventDispatcher>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub jwt: JwtVerifier,
    pub alerts: AlertService,
}

impl AppState {
    pub fn new(config: ApiConfig, pool: PgPool) -> Self {
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(StripeGateway::new(&config.billing.pg_secret_key));
        let store = LedgerStore::new(pool.clone());
        let ledger = TokenLedger::new(store.clone());
        let catalog = Catalog::new(pool.clone());
        let referrals =
            ReferralService::new(store.clone(), config.billing.referral_token_amount);
        let dispatcher = Arc::new(EventDispatcher::new(
            &config.billing,
            store.clone(),
            gateway.clone(),
        ));
        let jwt = JwtVerifier::new(&config.auth_jwt_secret);
        let alerts = AlertService::new(config.billing.alert_channel_webhook_url.clone());
        Self {
            pool,
            config: Arc::new(config),
            store,
            ledger,
            catalog,
            referrals,
            dispatcher,
            gateway,
            jwt,
            alerts,
        }
    }
}
