use config::{Config, Environment, File};

use super::AppConfig;
use crate::error::{Error, Result};

impl AppConfig {
    /// Resolves configuration at startup: optional config files, then
    /// `PRICECACHE_*` environment variables, then the two mandatory process
    /// overrides `PORT` and `ALPHA_VANTAGE_API_KEY`. The result is read-only
    /// for the life of the process.
    pub fn load() -> Result<Self> {
        let resolved = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("PRICECACHE").try_parsing(true))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut app: AppConfig = resolved
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Ok(port) = std::env::var("PORT") {
            app.port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT value: {port}")))?;
        }
        if let Ok(key) = std::env::var("ALPHA_VANTAGE_API_KEY") {
            if !key.is_empty() {
                app.alpha_vantage_api_key = Some(key);
            }
        }

        app.validate()?;
        Ok(app)
    }
}
