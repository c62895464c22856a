use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    /// Postgres URL. Without one the service keeps its state in memory.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Prefix joined with a referral code to build a shareable link.
    pub referral_link_base: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000_i64)?
            .set_default("database_max_connections", 8_i64)?
            .set_default("referral_link_base", "/r/")?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;
        config.try_deserialize()
    }
}
