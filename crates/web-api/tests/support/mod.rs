use std::{net::SocketAddr, sync::Arc};

use application::{Clock, SystemClock};
use config::{AppConfig, JwtConfig, RatePolicy};
use domain::{UserId, UserProfile};
use infrastructure::{Infrastructure, MemoryChatStore};
use tokio::{net::TcpListener, sync::oneshot};
use web_api::{router, AppState, JwtService};

pub const TEST_SECRET: &str = "test-secret-key";

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryChatStore>,
    pub state: AppState,
    jwt: JwtService,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(AppConfig::default()).await
    }

    pub async fn start_with(mut config: AppConfig) -> Self {
        config.jwt = JwtConfig {
            secret: TEST_SECRET.to_string(),
            expiration_hours: 1,
        };

        let store = Arc::new(MemoryChatStore::new());
        for (id, nickname) in [(1, "alice"), (2, "bob"), (3, "carol")] {
            store
                .add_user(UserProfile {
                    id: UserId(id),
                    nickname: nickname.to_string(),
                    avatar: None,
                })
                .await;
        }
        store.add_friendship(UserId(1), UserId(2)).await;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
        let state = AppState::build(&config, Infrastructure::in_memory(store.clone()), clock);
        let app = router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
        });

        Self {
            addr,
            store,
            state,
            jwt: JwtService::new(config.jwt),
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/api/v1/ws?token={}", self.addr, token)
    }

    pub fn token_for(&self, user_id: i64) -> String {
        self.jwt.generate_token(UserId(user_id)).expect("token")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// 把普通接口限流压到很低，方便触发 429
pub fn tight_general_limit() -> AppConfig {
    let mut config = AppConfig::default();
    config.rate_limit.general = RatePolicy::new(0.001, 2);
    config
}
