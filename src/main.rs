mod config;
mod db;
mod dtos;
mod error;
mod handler;
mod mail;
mod models;
mod routes;
mod service;

use std::sync::Arc;

use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use config::Config;
use dotenv::dotenv;
use redis::aio::ConnectionManager;
use routes::create_router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::filter::LevelFilter;

use crate::db::db::DBClient;
use crate::service::{
    fulfillment::FulfillmentProcessor,
    notification::NotificationDispatcher,
    payment_gateway::PaymentGatewayService,
    queue::{RedisJobQueue, Worker, TOPIC_FULFILLMENT, TOPIC_NOTIFICATIONS},
};

#[derive(Clone)]
pub struct AppState {
    pub env: Config,
    pub db_client: Arc<DBClient>,
    pub gateway: Arc<PaymentGatewayService>,
    pub queue: Arc<RedisJobQueue>,
}

impl AppState {
    pub fn new(
        db_client: DBClient,
        gateway: PaymentGatewayService,
        queue: RedisJobQueue,
        config: Config,
    ) -> Self {
        Self {
            env: config,
            db_client: Arc::new(db_client),
            gateway: Arc::new(gateway),
            queue: Arc::new(queue),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    dotenv().ok();

    let config = Config::init();

    let pool = match PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => {
            println!("✅ Connection to the database is successful!");
            pool
        }
        Err(err) => {
            println!("🔥 Failed to connect to the database: {:?}", err);
            std::process::exit(1);
        }
    };

    // The queue broker is load-bearing for the whole confirmation pipeline;
    // refuse to start without it.
    let redis = match redis::Client::open(config.redis_url.clone()) {
        Ok(client) => match ConnectionManager::new(client).await {
            Ok(conn) => {
                println!("✅ Redis connection established!");
                Arc::new(conn)
            }
            Err(err) => {
                println!("🔥 Failed to connect to Redis: {:?}", err);
                std::process::exit(1);
            }
        },
        Err(err) => {
            println!("🔥 Invalid Redis configuration: {:?}", err);
            std::process::exit(1);
        }
    };

    let db_client = DBClient::with_redis(pool, redis.clone());
    let gateway = PaymentGatewayService::new(&config);
    let queue = RedisJobQueue::new(redis.clone());

    let app_state = Arc::new(AppState::new(db_client, gateway, queue, config.clone()));

    // Fulfillment worker: consumes webhook-enqueued jobs and performs the
    // privileged side effects.
    let fulfillment_processor = Arc::new(FulfillmentProcessor::new(
        app_state.db_client.clone(),
        app_state.gateway.clone(),
        app_state.queue.clone(),
        Some(redis.clone()),
        config.app_url.clone(),
    ));
    let fulfillment_worker = Worker::new(
        RedisJobQueue::new(redis.clone()),
        TOPIC_FULFILLMENT,
        fulfillment_processor,
    );
    tokio::spawn(async move {
        fulfillment_worker
            .run_forever(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
    });

    // Notification worker: sends activation emails after fulfillment.
    let notification_worker = Worker::new(
        RedisJobQueue::new(redis.clone()),
        TOPIC_NOTIFICATIONS,
        Arc::new(NotificationDispatcher::new(&config)),
    );
    tokio::spawn(async move {
        notification_worker
            .run_forever(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
    });

    // Hourly purge of abandoned activations.
    tokio::spawn(service::background::start_expiry_purge_job(app_state.clone()));

    let allowed_origins = vec![
        config.app_url.parse::<HeaderValue>().unwrap(),
        "http://localhost:5173".parse::<HeaderValue>().unwrap(),
        "http://localhost:8000".parse::<HeaderValue>().unwrap(),
    ];

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_headers([AUTHORIZATION, ACCEPT, CONTENT_TYPE])
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST]);

    let app = create_router(app_state.clone()).layer(cors);

    println!("🚀 Server is running on http://localhost:{}", config.port);
    println!(
        "📊 Scan cache: {}",
        if app_state.db_client.is_redis_available() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", &config.port))
        .await
        .unwrap();

    axum::serve(listener, app).await.unwrap();
}
