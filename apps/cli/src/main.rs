use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use modelrace_core_sdk::config::validate_server_url;
use modelrace_core_sdk::prelude::*;

/**
 * \brief CLI 程序入口：配置 Provider、发起竞速与启动执行服务。
 */
#[derive(Parser, Debug)]
#[command(name = "modelrace", version, about = "Multi-provider AI execution engine")]
struct Cli {
    /** \brief SQLite 数据库路径 */
    #[arg(long, global = true, default_value = "modelrace.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /** \brief 管理 Provider 配置。 */
    #[command(subcommand)]
    Provider(ProviderCommand),

    /** \brief 查看或修改远程执行配置。 */
    Remote(RemoteArgs),

    /** \brief 开关本地遥测日志。 */
    Telemetry {
        #[arg(long, default_value_t = false)]
        enable: bool,
    },

    /**
     * \brief 发送一条消息；一个模型走 single，多个模型走 run-race。
     */
    Chat {
        /** \brief providerId/modelId，可重复 */
        #[arg(long = "model", required = true)]
        models: Vec<String>,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        /** \brief 图片 data URL，可重复 */
        #[arg(long = "image")]
        images: Vec<String>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        /** \brief 不使用事件流，结束后一次性输出 */
        #[arg(long, default_value_t = false)]
        no_stream: bool,
        /** \brief 忽略远程配置 */
        #[arg(long, default_value_t = false)]
        local: bool,
    },

    /**
     * \brief 并发探测多个模型的延迟与状态。
     */
    TestRace {
        #[arg(long = "model", required = true)]
        models: Vec<String>,
        #[arg(long, default_value = "Hello")]
        prompt: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long, default_value_t = false)]
        local: bool,
    },

    /** \brief 检查远程执行服务是否可达。 */
    Health,

    /**
     * \brief 启动远程执行服务（始终本地执行）。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProviderCommand {
    /** \brief 新增或覆盖 Provider 及其模型列表。 */
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: Option<String>,
        /** \brief openai-compatible / anthropic / google-ai / dify */
        #[arg(long = "type", default_value = "openai-compatible")]
        provider_type: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value = "")]
        base_url: String,
        #[arg(long, default_value = "")]
        default_base_url: String,
        /** \brief `id` 或 `id=显示名`，可重复 */
        #[arg(long = "model")]
        models: Vec<String>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    List,
    Remove {
        id: String,
    },
}

#[derive(Args, Debug)]
struct RemoteArgs {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    retry_attempts: Option<u32>,
    #[arg(long)]
    retry_delay_ms: Option<u64>,
    #[arg(long)]
    fallback_to_local: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let store = Arc::new(SqliteStore::open(&cli.db).context("open database failed")?);
    let telemetry_enabled = store.with_conn(db::get_telemetry_enabled).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Provider(command) => provider_command(&store, command)?,
        Commands::Remote(args) => remote_command(&store, args)?,
        Commands::Telemetry { enable } => {
            store
                .with_conn(|conn| db::set_telemetry_enabled(conn, enable))
                .context("save telemetry failed")?;
            telemetry::set_enabled(enable);
            println!("Telemetry {}", if enable { "enabled" } else { "disabled" });
        }
        Commands::Chat {
            models,
            prompt,
            system,
            images,
            temperature,
            max_tokens,
            timeout_ms,
            no_stream,
            local,
        } => {
            let mode = if models.len() > 1 {
                ExecutionMode::RunRace
            } else {
                ExecutionMode::Single
            };
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            let mut user = Message::user(prompt.as_str());
            if !images.is_empty() {
                user = user.with_images(images);
            }
            messages.push(user);

            let config = ExecutionConfig {
                temperature,
                max_tokens,
                timeout_ms,
                is_race_mode: Some(mode == ExecutionMode::RunRace),
                ..ExecutionConfig::with_models(models)
            };
            telemetry::log_event(
                "cli.chat",
                &format!("mode={mode} models={} prompt_len={}", config.models.len(), prompt.len()),
            );

            let dispatcher = dispatcher(&store);
            let mut request = ExecutionRequest::new(mode, messages, config);
            if local {
                request = request.force_local();
            }
            let result = if no_stream {
                let result = dispatcher.dispatch(request).await?.into_completion()?;
                println!("{}", result.content);
                result
            } else {
                chat_streamed(&dispatcher, request).await?
            };
            info!(model = %result.full_model_id, streamed = result.streamed, "chat finished");
        }
        Commands::TestRace {
            models,
            prompt,
            timeout_ms,
            local,
        } => {
            let config = ExecutionConfig {
                timeout_ms,
                ..ExecutionConfig::with_models(models)
            };
            let mut request =
                ExecutionRequest::new(ExecutionMode::TestRace, vec![Message::user(prompt)], config);
            if local {
                request = request.force_local();
            }
            let entries = dispatcher(&store).dispatch(request).await?.into_race_report()?;
            println!("{:<36} {:<20} {:>9}  STATUS", "MODEL", "PROVIDER", "LATENCY");
            for entry in entries {
                println!(
                    "{:<36} {:<20} {:>7}ms  {}{}",
                    entry.full_model_id,
                    entry.provider,
                    entry.latency,
                    entry.status,
                    entry.error.map(|e| format!(" - {e}")).unwrap_or_default()
                );
            }
        }
        Commands::Health => {
            let config = store.with_conn(db::get_remote_config).context("load remote config failed")?;
            validate_server_url(&config.server_url)?;
            let client = RemoteClient::new(&config);
            match client.health_check().await {
                Ok(()) => println!("{} is reachable", client.server_url()),
                Err(err) => bail!("{} is unreachable: {err}", client.server_url()),
            }
        }
        Commands::Serve { addr } => {
            let engine = Engine::new(store.clone(), Arc::new(DefaultLang));
            server::run(&addr, Arc::new(Dispatcher::local_only(engine))).await?;
        }
    }

    Ok(())
}

fn dispatcher(store: &Arc<SqliteStore>) -> Dispatcher {
    let engine = Engine::new(store.clone(), Arc::new(DefaultLang));
    Dispatcher::new(engine, store.clone())
}

async fn chat_streamed(dispatcher: &Dispatcher, request: ExecutionRequest) -> Result<ExecutionResult> {
    let (sink, mut events) = StreamSink::channel();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = events.recv().await {
            if let StreamEvent::Chunk { chunk } = event {
                print!("{chunk}");
                stdout.flush().ok();
            }
        }
    });
    let outcome = dispatcher.dispatch(request.with_stream(sink)).await;
    printer.await.context("output task failed")?;
    println!();
    Ok(outcome?.into_completion()?)
}

fn provider_command(store: &SqliteStore, command: ProviderCommand) -> Result<()> {
    match command {
        ProviderCommand::Add {
            id,
            name,
            provider_type,
            api_key,
            base_url,
            default_base_url,
            models,
            temperature,
            max_tokens,
        } => {
            let provider = ProviderConfig {
                name: name.unwrap_or_else(|| id.clone()),
                provider_id: id,
                provider_type: ProviderType::parse(&provider_type),
                api_key,
                base_url,
                default_base_url,
                temperature,
                max_tokens,
                models: models.iter().map(|raw| parse_model(raw)).collect(),
            };
            if provider.effective_base_url().is_empty() {
                bail!("either --base-url or --default-base-url is required");
            }
            store
                .with_conn(|conn| db::upsert_provider(conn, &provider))
                .context("save provider failed")?;
            println!(
                "Saved provider {} ({} | {} | {} models)",
                provider.provider_id,
                provider.provider_type,
                provider.effective_base_url(),
                provider.models.len()
            );
        }
        ProviderCommand::List => {
            for provider in store.all_providers() {
                let models: Vec<_> = provider.models.iter().map(|m| m.id.as_str()).collect();
                println!(
                    "{}\t{}\t{}\t{}",
                    provider.provider_id,
                    provider.provider_type,
                    provider.effective_base_url(),
                    models.join(",")
                );
            }
        }
        ProviderCommand::Remove { id } => {
            let removed = store
                .with_conn(|conn| db::delete_provider(conn, &id))
                .context("delete provider failed")?;
            if !removed {
                bail!("provider {id} not found");
            }
            println!("Removed provider {id}");
        }
    }
    Ok(())
}

fn parse_model(raw: &str) -> ModelDescriptor {
    match raw.split_once('=') {
        Some((id, display)) => ModelDescriptor {
            id: id.trim().to_string(),
            display_name: display.trim().to_string(),
        },
        None => ModelDescriptor {
            id: raw.trim().to_string(),
            display_name: raw.trim().to_string(),
        },
    }
}

fn remote_command(store: &SqliteStore, args: RemoteArgs) -> Result<()> {
    let mut config = store.with_conn(db::get_remote_config).context("load remote config failed")?;
    let RemoteArgs {
        server_url,
        enabled,
        timeout_ms,
        retry_attempts,
        retry_delay_ms,
        fallback_to_local,
    } = args;
    let changed = server_url.is_some()
        || enabled.is_some()
        || timeout_ms.is_some()
        || retry_attempts.is_some()
        || retry_delay_ms.is_some()
        || fallback_to_local.is_some();

    if let Some(url) = server_url {
        validate_server_url(&url)?;
        config.server_url = url;
    }
    if let Some(enabled) = enabled {
        config.enabled = enabled;
    }
    if let Some(ms) = timeout_ms {
        config.timeout_ms = ms;
    }
    if let Some(n) = retry_attempts {
        config.retry_attempts = n;
    }
    if let Some(ms) = retry_delay_ms {
        config.retry_delay_ms = ms;
    }
    if let Some(fallback) = fallback_to_local {
        config.fallback_to_local = fallback;
    }
    if config.enabled {
        validate_server_url(&config.server_url)?;
    }
    if changed {
        store
            .with_conn(|conn| db::set_remote_config(conn, &config))
            .context("save remote config failed")?;
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
