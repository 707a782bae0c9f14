use super::schema::Config;

macro_rules! define_secrets {
    ($( $env:literal => $($path:ident).+ );* $(;)?) => {
        /// (env var, config path) pairs recognized as overrides.
        pub const SECRET_ENV_VARS: &[(&str, &str)] = &[$(($env, stringify!($($path).+))),*];

        /// Apply environment variable overrides.
        ///
        /// Any `RELEVO_*` var that is set and non-empty overwrites the
        /// corresponding config field, allowing secrets to be injected
        /// without touching the config file (containers, CI).
        pub fn apply_env_overrides(config: &mut Config) {
            $(
                if let Ok(val) = std::env::var($env) {
                    if !val.is_empty() {
                        config.$($path).+ = val;
                    }
                }
            )*
        }
    };
}

define_secrets! {
    "RELEVO_INTERNAL_TOKEN"          => server.internal_token;
    "RELEVO_AGENT_URL"               => agent.url;
    "RELEVO_WHATSAPP_WEBHOOK_SECRET" => providers.whatsapp.webhook_secret;
    "RELEVO_CHATWOOT_WEBHOOK_SECRET" => providers.chatwoot.webhook_secret;
    "RELEVO_CHATWOOT_API_TOKEN"      => providers.chatwoot.api_token;
    "RELEVO_TRANSCRIPTION_API_KEY"   => transcription.api_key;
    "RELEVO_NOTIFY_API_KEY"          => notifier.api_key;
}
