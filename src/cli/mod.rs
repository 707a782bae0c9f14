use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::{get_config_path, get_relevo_home, load_config, Config};
use crate::pipeline::Pipeline;
use crate::store::SqliteStore;
use crate::tenant::{normalize_phone, Tenant};

#[derive(Parser)]
#[command(name = "relevo")]
#[command(version = crate::VERSION)]
#[command(about = "Multi-tenant customer-messaging relay")]
pub struct Cli {
    /// Path to config.toml (defaults to <relevo home>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay: webhook gateway plus turn pipeline
    Serve,
    /// Diagnose the configuration and local store
    Check,
    /// Manage tenants in the relay database
    Tenant {
        #[command(subcommand)]
        cmd: TenantCommands,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Create or update a tenant
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Business phone in any format; stored digits-only
        #[arg(long)]
        phone: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Plain-text catalog injected into the agent prompt
        #[arg(long)]
        catalog_file: Option<PathBuf>,
        /// Prompt template with {{store_name}}, {{store_description}} and
        /// {{catalog}} placeholders; omit to use the built-in one
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        /// Recipient for handoff alerts
        #[arg(long, default_value = "")]
        notify_email: String,
        #[arg(long, default_value = "")]
        wa_phone_id: String,
        #[arg(long, default_value = "")]
        wa_token: String,
        /// Bridge account id owned by this tenant
        #[arg(long)]
        bridge_account: Option<i64>,
        /// Save the tenant disabled
        #[arg(long)]
        inactive: bool,
    },
    /// List tenants
    List,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => serve(cli.config.as_deref()).await,
        Commands::Check => check(cli.config.as_deref()),
        Commands::Tenant { cmd } => tenant_command(cli.config.as_deref(), cmd),
    }
}

fn resolve_db_path(config: &Config) -> Result<PathBuf> {
    match &config.store.path {
        Some(path) => Ok(path.clone()),
        None => Ok(get_relevo_home()?.join("relevo.db")),
    }
}

async fn serve(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    if config.agent.url.is_empty() {
        anyhow::bail!("agent.url must be set to run the relay");
    }

    let db_path = resolve_db_path(&config)?;
    let store =
        Arc::new(SqliteStore::new(&db_path).context("failed to open the relay database")?);
    info!("store ready at {}", db_path.display());

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store,
    ));

    let config = Arc::new(config);
    let (server, addr) = crate::gateway::start(config, pipeline).await?;
    println!("relevo {} listening on http://{}", crate::VERSION, addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
        _ = server => {}
    }

    Ok(())
}

#[derive(Debug)]
enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

impl CheckResult {
    fn label(&self) -> &'static str {
        match self {
            Self::Pass(_) => "PASS",
            Self::Fail(_) => "FAIL",
            Self::Skip(_) => "SKIP",
        }
    }

    fn detail(&self) -> &str {
        match self {
            Self::Pass(s) | Self::Fail(s) | Self::Skip(s) => s,
        }
    }

    fn is_fail(&self) -> bool {
        matches!(self, Self::Fail(_))
    }
}

fn print_check(name: &str, result: &CheckResult) {
    println!("  {:<6} {:<22} {}", result.label(), name, result.detail());
}

fn check(config_path: Option<&Path>) -> Result<()> {
    println!("relevo {} — configuration check\n", crate::VERSION);

    let file_check = match config_path.map(Path::to_path_buf) {
        Some(path) => {
            if path.exists() {
                CheckResult::Pass(path.display().to_string())
            } else {
                CheckResult::Fail(format!("not found at {}", path.display()))
            }
        }
        None => match get_config_path() {
            Ok(path) if path.exists() => CheckResult::Pass(path.display().to_string()),
            Ok(path) => CheckResult::Skip(format!("{} missing, defaults apply", path.display())),
            Err(e) => CheckResult::Fail(format!("cannot determine path: {e}")),
        },
    };
    print_check("config file", &file_check);

    let config = match load_config(config_path) {
        Ok(config) => {
            print_check("configuration", &CheckResult::Pass("valid".to_string()));
            config
        }
        Err(e) => {
            print_check("configuration", &CheckResult::Fail(format!("{e:#}")));
            anyhow::bail!("configuration check failed");
        }
    };

    let store_check = match resolve_db_path(&config).and_then(|p| {
        SqliteStore::new(&p)?;
        Ok(p)
    }) {
        Ok(path) => CheckResult::Pass(path.display().to_string()),
        Err(e) => CheckResult::Fail(format!("{e:#}")),
    };
    print_check("store", &store_check);

    let agent_check = if config.agent.url.is_empty() {
        CheckResult::Fail("agent.url is not set".to_string())
    } else {
        CheckResult::Pass(config.agent.url.clone())
    };
    print_check("agent engine", &agent_check);

    let wa = &config.providers.whatsapp;
    let wa_check = if !wa.enabled {
        CheckResult::Skip("disabled".to_string())
    } else if wa.webhook_secret.is_empty() {
        CheckResult::Fail("webhook_secret empty, all webhooks will be rejected".to_string())
    } else {
        CheckResult::Pass(wa.api_base.clone())
    };
    print_check("whatsapp provider", &wa_check);

    let cw = &config.providers.chatwoot;
    let cw_check = if !cw.enabled {
        CheckResult::Skip("disabled".to_string())
    } else if cw.webhook_secret.is_empty() {
        CheckResult::Fail("webhook_secret empty, all webhooks will be rejected".to_string())
    } else if cw.api_token.is_empty() {
        CheckResult::Fail("api_token empty, bridge replies cannot be sent".to_string())
    } else {
        CheckResult::Pass(cw.api_base.clone())
    };
    print_check("bridge provider", &cw_check);

    let tr_check = if !config.transcription.enabled {
        CheckResult::Skip("disabled, voice notes become placeholders".to_string())
    } else if config.transcription.api_key.is_empty() {
        CheckResult::Skip("no api key, voice notes become placeholders".to_string())
    } else {
        CheckResult::Pass(config.transcription.model.clone())
    };
    print_check("transcription", &tr_check);

    let notify_check = if !config.notifier.enabled {
        CheckResult::Skip("disabled, handoffs only logged".to_string())
    } else {
        CheckResult::Pass(config.notifier.from_email.clone())
    };
    print_check("handoff notifier", &notify_check);

    let failed = [
        &file_check,
        &store_check,
        &agent_check,
        &wa_check,
        &cw_check,
    ]
    .iter()
    .any(|c| c.is_fail());

    if failed {
        anyhow::bail!("configuration check failed");
    }
    println!("\nAll checks passed.");
    Ok(())
}

fn tenant_command(config_path: Option<&Path>, cmd: TenantCommands) -> Result<()> {
    let config = load_config(config_path)?;
    let db_path = resolve_db_path(&config)?;
    let store = SqliteStore::new(&db_path).context("failed to open the relay database")?;

    match cmd {
        TenantCommands::Add {
            id,
            name,
            phone,
            description,
            catalog_file,
            prompt_file,
            notify_email,
            wa_phone_id,
            wa_token,
            bridge_account,
            inactive,
        } => {
            let business_phone = normalize_phone(&phone);
            if business_phone.is_empty() {
                anyhow::bail!("--phone {phone:?} has no digits");
            }
            let catalog_text = read_optional(catalog_file.as_deref())?;
            let system_prompt = read_optional(prompt_file.as_deref())?;

            let tenant = Tenant {
                id,
                name,
                business_phone,
                active: !inactive,
                system_prompt,
                store_description: description,
                catalog_text,
                notify_email,
                wa_phone_id,
                wa_token,
                bridge_account_id: bridge_account,
            };
            store.upsert_tenant(&tenant)?;
            println!("tenant {} saved", tenant.id);
        }
        TenantCommands::List => {
            let tenants = store.list_tenants()?;
            if tenants.is_empty() {
                println!("no tenants yet — add one with `relevo tenant add`");
                return Ok(());
            }
            println!(
                "{:<12} {:<24} {:<16} {:<8} {}",
                "ID", "NAME", "PHONE", "ACTIVE", "BRIDGE"
            );
            for t in tenants {
                let bridge = t
                    .bridge_account_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<12} {:<24} {:<16} {:<8} {}",
                    t.id, t.name, t.business_phone, t.active, bridge
                );
            }
        }
    }
    Ok(())
}

fn read_optional(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => Ok(String::new()),
    }
}
