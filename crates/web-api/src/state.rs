use std::sync::Arc;

use application::{
    Clock, ConnectionHandler, ConnectionRegistry, DispatcherDependencies, HeartbeatSupervisor,
    MessageDispatcher, PresenceStore, RateLimitTiers, RateLimiter, SessionServices,
};
use config::AppConfig;
use infrastructure::Infrastructure;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<ConnectionHandler>,
    pub registry: Arc<ConnectionRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub presence: Arc<dyn PresenceStore>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    /// 把基础设施装配成完整的实时子系统
    pub fn build(config: &AppConfig, infrastructure: Infrastructure, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            infrastructure.presence.clone(),
            infrastructure.friends,
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(DispatcherDependencies {
            store: infrastructure.messages,
            conversations: infrastructure.conversations,
            users: infrastructure.users,
            registry: registry.clone(),
        }));
        let limiter = Arc::new(RateLimiter::new(
            RateLimitTiers::from(&config.rate_limit),
            clock.clone(),
        ));
        let supervisor = Arc::new(HeartbeatSupervisor::new(
            registry.clone(),
            clock.clone(),
            &config.heartbeat,
        ));
        let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

        let handler = Arc::new(ConnectionHandler::new(SessionServices {
            authenticator: jwt_service.clone(),
            registry: registry.clone(),
            dispatcher,
            limiter: limiter.clone(),
            supervisor,
            clock,
        }));

        Self {
            handler,
            registry,
            limiter,
            presence: infrastructure.presence,
            jwt_service,
        }
    }
}
