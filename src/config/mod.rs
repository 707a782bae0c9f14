pub mod credentials;
pub mod loader;
pub mod schema;

pub use loader::{get_config_path, get_relevo_home, load_config};
pub use schema::{
    AgentConfig, ChatwootProviderConfig, Config, ConversationConfig, DebounceConfig,
    DeliveryConfig, NotifierConfig, ProvidersConfig, ServerConfig, StoreConfig,
    TranscriptionConfig, WhatsappProviderConfig,
};
