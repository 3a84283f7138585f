use std::env;

/// What to do with a delivery whose signature does not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// Log the delivery, skip settlement, answer 401.
    Reject,
    /// Log the delivery with `signature_ok = false` and settle anyway.
    /// Only honoured in dev mode.
    Flag,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    pub dev_mode: bool,
    pub cloudpayments_public_id: String,
    /// Empty means signatures are not checked.
    pub cloudpayments_secret: String,
    pub signature_policy: SignaturePolicy,
    /// Age after which an unfinished webhook claim may be taken over by a redelivery.
    pub webhook_claim_timeout_secs: i64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("GROVE_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let cloudpayments_secret = env::var("CLOUDPAYMENTS_SECRET").unwrap_or_default();
        if cloudpayments_secret.is_empty() && !dev_mode {
            tracing::warn!(
                "CLOUDPAYMENTS_SECRET is not set: webhook signatures will NOT be verified"
            );
        }

        let signature_policy = match env::var("WEBHOOK_SIGNATURE_POLICY")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "flag" if dev_mode => SignaturePolicy::Flag,
            "flag" => {
                tracing::warn!("WEBHOOK_SIGNATURE_POLICY=flag ignored outside dev mode");
                SignaturePolicy::Reject
            }
            _ => SignaturePolicy::Reject,
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "grove.db".to_string()),
            base_url,
            dev_mode,
            cloudpayments_public_id: env::var("CLOUDPAYMENTS_PUBLIC_ID").unwrap_or_default(),
            cloudpayments_secret,
            signature_policy,
            webhook_claim_timeout_secs: env::var("WEBHOOK_CLAIM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &i64| *v > 0)
                .unwrap_or(300),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
