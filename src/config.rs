use std::env;

#[derive(Clone)]
pub struct Config {
    pub mongo_uri: String,
    pub database_name: String,
    pub port: u16,
    pub environment: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        // The connection string carries a <PASSWORD> placeholder so the
        // credential can live in its own variable.
        let database = env::var("DATABASE").expect("DATABASE must be set");
        let password = env::var("DATABASE_PASSWORD").unwrap_or_default();
        let mongo_uri = database.replace("<PASSWORD>", &password);

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        Self {
            mongo_uri,
            database_name: env::var("DATABASE_NAME").unwrap_or_else(|_| "tour_booking".to_string()),
            port,
            environment: env::var("RUST_ENV").unwrap_or_else(|_| "development".to_string()),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}
