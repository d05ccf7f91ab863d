// config.rs
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub app_url: String,
    pub port: u16,
    // Payment gateway configuration
    pub gateway_base_url: String,
    pub gateway_access_token: String,
    pub webhook_secret: String,
    // Email delivery configuration
    pub resend_api_key: String,
    pub from_email: String,
}

impl Config {
    pub fn init() -> Config {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
        let app_url = std::env::var("APP_URL").expect("APP_URL must be set");

        let gateway_base_url = std::env::var("GATEWAY_BASE_URL")
            .unwrap_or_else(|_| "https://api.gateway.test".to_string());
        let gateway_access_token =
            std::env::var("GATEWAY_ACCESS_TOKEN").expect("GATEWAY_ACCESS_TOKEN must be set");
        let webhook_secret =
            std::env::var("GATEWAY_WEBHOOK_SECRET").expect("GATEWAY_WEBHOOK_SECRET must be set");

        let resend_api_key = std::env::var("RESEND_API_KEY").unwrap_or_else(|_| "".to_string());
        let from_email = std::env::var("FROM_EMAIL")
            .unwrap_or_else(|_| "MotoGuard <noreply@motoguard.app>".to_string());

        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(8000);

        Config {
            database_url,
            redis_url,
            app_url,
            port,
            gateway_base_url,
            gateway_access_token,
            webhook_secret,
            resend_api_key,
            from_email,
        }
    }
}
