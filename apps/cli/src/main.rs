use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use diagramhub_core_sdk::config::AppConfig;
use diagramhub_core_sdk::llm::factory::ClientFactory;
use diagramhub_core_sdk::models::{
    GenerateDescriptionRequest, GenerateDiagramRequest, ImproveDiagramRequest, Language,
    NewProvider, ProviderKind, ProviderRef, TestProviderRequest, DEFAULT_MODEL,
};
use diagramhub_core_sdk::service::AiProviderService;
use diagramhub_core_sdk::settings::SettingsStore;
use diagramhub_core_sdk::{db, server, telemetry};

/**
 * \brief CLI 程序入口：管理 AI Provider 凭据并调用生成能力。
 */
#[derive(Parser, Debug)]
#[command(name = "diagramhub", version, about = "Diagramahub AI provider toolkit")]
struct Cli {
    /** \brief 数据库路径，覆盖 DIAGRAMHUB_DB_PATH */
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /** \brief 加密主密钥，覆盖 AI_ENCRYPTION_KEY */
    #[arg(long, global = true)]
    encryption_key: Option<String>,
    /** \brief Gemini API 基地址 */
    #[arg(long, global = true)]
    gemini_base: Option<String>,
    /** \brief 单次 Provider 调用超时（秒） */
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    /** \brief 操作的用户 ID */
    #[arg(long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
    },

    /**
     * \brief 显示当前用户的 Provider 配置（Key 已脱敏）。
     */
    Providers,

    /**
     * \brief 校验并保存一个 Provider。
     */
    AddProvider {
        #[arg(long)]
        provider: ProviderKind,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = false)]
        set_default: bool,
    },

    SetDefault {
        #[arg(long)]
        provider: ProviderKind,
    },

    /**
     * \brief 按下标删除 Provider。
     */
    RemoveProvider {
        #[arg(long)]
        index: usize,
    },

    AutoGenerate {
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /**
     * \brief 测试 Key 是否可用，不保存。
     */
    TestProvider {
        #[arg(long)]
        provider: ProviderKind,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,
    },

    /**
     * \brief 为图表代码生成描述。
     * \param file 图表源文件
     */
    Describe {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "mermaid")]
        diagram_type: String,
        #[arg(long, default_value = "es")]
        language: Language,
        #[arg(long)]
        provider: Option<ProviderKind>,
    },

    Generate {
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "mermaid")]
        diagram_type: String,
        #[arg(long, default_value = "es")]
        language: Language,
        #[arg(long)]
        provider: Option<ProviderKind>,
    },

    Improve {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        request: String,
        #[arg(long, default_value = "mermaid")]
        diagram_type: String,
        #[arg(long, default_value = "es")]
        language: Language,
        #[arg(long)]
        provider: Option<ProviderKind>,
    },

    /**
     * \brief 开关审计日志。
     */
    Telemetry {
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing("info");
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(path) = cli.db {
        config.database_path = path;
    }
    if let Some(key) = cli.encryption_key.filter(|k| !k.trim().is_empty()) {
        config.encryption_key = Some(key);
    }
    if let Some(base) = cli.gemini_base {
        config.gemini_base_url = base;
    }
    match cli.timeout_secs {
        Some(0) => warn!("--timeout-secs must be positive, keeping {:?}", config.request_timeout),
        Some(secs) => config.request_timeout = Duration::from_secs(secs),
        None => {}
    }

    let conn = db::open_db(&config.database_path).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    if let Commands::Telemetry { enabled } = cli.command {
        db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
        telemetry::set_enabled(enabled);
        println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        return Ok(());
    }

    let vault = config
        .vault()
        .context("credential vault unavailable, set AI_ENCRYPTION_KEY or --encryption-key")?;
    let store = Arc::new(SettingsStore::new(conn, Arc::new(vault)));
    let factory = Arc::new(
        ClientFactory::standard(&config.factory_options()).context("build client factory failed")?,
    );
    let service = Arc::new(AiProviderService::new(store, factory, config.request_timeout));
    let user = cli.user;

    match cli.command {
        Commands::Serve { addr } => {
            server::run(&addr, service, &config.cors_origins).await?;
        }
        Commands::Providers => {
            print_json(&service.get_settings(&user)?)?;
        }
        Commands::AddProvider {
            provider,
            api_key,
            model,
            name,
            set_default,
        } => {
            let mut new = NewProvider::new(provider, &api_key, &model);
            new.display_name = name;
            new.is_default = set_default;
            let view = service.add_provider(&user, new).await?;
            telemetry::log_event("cli.provider", &format!("add provider={}", provider));
            print_json(&view)?;
        }
        Commands::SetDefault { provider } => {
            print_json(&service.set_default_provider(&user, provider)?)?;
        }
        Commands::RemoveProvider { index } => {
            print_json(&service.remove_provider(&user, ProviderRef::Index(index))?)?;
        }
        Commands::AutoGenerate { enabled } => {
            print_json(&service.set_auto_generate(&user, enabled)?)?;
        }
        Commands::TestProvider {
            provider,
            api_key,
            model,
        } => {
            let report = service
                .test_provider_report(&TestProviderRequest {
                    provider,
                    api_key,
                    model,
                })
                .await?;
            print_json(&report)?;
        }
        Commands::Describe {
            file,
            diagram_type,
            language,
            provider,
        } => {
            let diagram_code = std::fs::read_to_string(&file)
                .with_context(|| format!("read {} failed", file.display()))?;
            let out = service
                .generate_description(
                    &user,
                    &GenerateDescriptionRequest {
                        diagram_code,
                        diagram_type,
                        provider,
                        language,
                    },
                )
                .await?;
            println!("{}", out.description);
            eprintln!("({} | {})", out.provider_used, out.model_used);
        }
        Commands::Generate {
            description,
            diagram_type,
            language,
            provider,
        } => {
            let out = service
                .generate_diagram(
                    &user,
                    &GenerateDiagramRequest {
                        description,
                        diagram_type,
                        provider,
                        language,
                    },
                )
                .await?;
            println!("{}", out.diagram_code);
            eprintln!("({} | {})", out.provider_used, out.model_used);
        }
        Commands::Improve {
            file,
            request,
            diagram_type,
            language,
            provider,
        } => {
            let diagram_code = std::fs::read_to_string(&file)
                .with_context(|| format!("read {} failed", file.display()))?;
            let out = service
                .improve_diagram(
                    &user,
                    &ImproveDiagramRequest {
                        diagram_code,
                        improvement_request: request,
                        diagram_type,
                        provider,
                        language,
                    },
                )
                .await?;
            println!("{}", out.diagram_code);
            eprintln!("({} | {})", out.provider_used, out.model_used);
        }
        Commands::Telemetry { .. } => {}
    }

    Ok(())
}
