//! CLI binary for edgequake-html2pdf.
//!
//! `serve` runs the HTTP API; `convert` runs one local conversion without
//! auth or metering; `tenants` and `keys` edit the JSON store directly.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_html2pdf::config::{Margins, PaperFormat, PdfOptions, ServiceConfig};
use edgequake_html2pdf::server::{self, AppState};
use edgequake_html2pdf::service::{issue_key, PdfService};
use edgequake_html2pdf::store::{JsonStore, Store};
use edgequake_html2pdf::vault::{LocalFsVault, RetryPolicy, S3LikeVault, VaultBackend};
use edgequake_html2pdf::{ConversionRequest, Converter, Watermark};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the API with an admin token and a local vault
  html2pdf serve --admin-token s3cret --vault-dir ./vault

  # One-off local conversion
  html2pdf convert --html invoice.html --css print.css -o invoice.pdf

  # Render a URL in landscape with a watermark
  html2pdf convert --url https://example.com --landscape --watermark DRAFT -o site.pdf

  # Manage tenants and keys in the store file
  html2pdf tenants create "Acme Corp" --credits 500
  html2pdf keys create <TENANT_ID> --name ci --daily-limit 200
  html2pdf keys revoke h2p_0123456789abcdef

API USAGE:
  curl -X POST http://localhost:8080/v1/pdf \
       -H "x-api-key: h2p_….<secret>" -H "content-type: application/json" \
       -d '{"html":"<h1>Hello</h1>","options":{"format":"A4"}}' -o hello.pdf

ENVIRONMENT VARIABLES:
  HTML2PDF_*              Every flag has an HTML2PDF_ env fallback (see --help)
  OPENAI_API_KEY          OpenAI API key (AI layout repair)
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Convert HTML and URLs to PDF, locally or as a metered HTTP service.
#[derive(Parser, Debug)]
#[command(
    name = "html2pdf",
    version,
    about = "Convert HTML and URLs to PDF with headless Chromium",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "HTML2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "HTML2PDF_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve(ServeArgs),
    /// Convert one document locally (no auth, no credits).
    Convert(ConvertArgs),
    /// Manage tenants in the store file.
    Tenants {
        #[command(flatten)]
        store: StoreArgs,
        #[command(subcommand)]
        command: TenantsCommand,
    },
    /// Manage API keys in the store file.
    Keys {
        #[command(flatten)]
        store: StoreArgs,
        #[command(subcommand)]
        command: KeysCommand,
    },
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// JSON store holding tenants, keys and usage logs.
    #[arg(long, env = "HTML2PDF_STORE", default_value = "html2pdf-store.json")]
    store: PathBuf,
}

/// Knobs shared by `serve` and `convert`, mapped onto `ServiceConfig`.
#[derive(Args, Debug)]
struct EngineArgs {
    /// Path to the Chromium / Chrome executable.
    #[arg(long, env = "HTML2PDF_CHROME")]
    chrome: Option<String>,

    /// Keep Chromium's sandbox on (off by default for containers).
    #[arg(long, env = "HTML2PDF_CHROME_SANDBOX")]
    chrome_sandbox: bool,

    /// Upper bound on html + css + js bytes.
    #[arg(long, env = "HTML2PDF_MAX_HTML_BYTES", default_value_t = 5 * 1024 * 1024)]
    max_html_bytes: usize,

    /// Render timeout in seconds, browser launch included.
    #[arg(long, env = "HTML2PDF_RENDER_TIMEOUT", default_value_t = 60)]
    render_timeout: u64,

    /// URL and merge-source download timeout in seconds.
    #[arg(long, env = "HTML2PDF_FETCH_TIMEOUT", default_value_t = 30)]
    fetch_timeout: u64,

    /// Cap on the per-request post-load delay.
    #[arg(long, env = "HTML2PDF_MAX_DELAY_MS", default_value_t = 10_000)]
    max_delay_ms: u64,

    /// Cache entry lifetime in seconds.
    #[arg(long, env = "HTML2PDF_CACHE_TTL", default_value_t = 3600)]
    cache_ttl: u64,

    /// Number of cached PDFs (0 disables the cache).
    #[arg(long, env = "HTML2PDF_CACHE_CAPACITY", default_value_t = 128)]
    cache_capacity: usize,

    /// Allow loopback and private-network URLs.
    #[arg(long, env = "HTML2PDF_ALLOW_PRIVATE_HOSTS")]
    allow_private_hosts: bool,

    /// Extra PDFs merged per request.
    #[arg(long, env = "HTML2PDF_MAX_MERGE_SOURCES", default_value_t = 10)]
    max_merge_sources: usize,

    /// LLM model ID for AI layout repair.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Retries for the AI repair call.
    #[arg(long, env = "HTML2PDF_REPAIR_RETRIES", default_value_t = 2)]
    repair_retries: u32,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "HTML2PDF_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    #[command(flatten)]
    store: StoreArgs,

    /// Bearer token for /admin routes. Unset disables them.
    #[arg(long, env = "HTML2PDF_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// S3-compatible endpoint objects are PUT to.
    #[arg(long, env = "HTML2PDF_VAULT_URL", conflicts_with = "vault_dir")]
    vault_url: Option<String>,

    /// Public base URL returned to clients for stored objects.
    #[arg(long, env = "HTML2PDF_VAULT_PUBLIC_URL")]
    vault_public_url: Option<String>,

    /// Bearer token for the vault endpoint.
    #[arg(long, env = "HTML2PDF_VAULT_TOKEN", hide_env_values = true)]
    vault_token: Option<String>,

    /// Store vault objects under this directory instead of over HTTP.
    #[arg(long, env = "HTML2PDF_VAULT_DIR")]
    vault_dir: Option<PathBuf>,

    /// PBKDF2 iterations for new API keys.
    #[arg(long, env = "HTML2PDF_PBKDF2_ITERATIONS", default_value_t = 100_000)]
    pbkdf2_iterations: u32,

    /// Requests per day for new API keys.
    #[arg(long, env = "HTML2PDF_DAILY_LIMIT", default_value_t = 1000)]
    daily_limit: u32,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// HTML file to convert.
    #[arg(long, conflicts_with = "url", required_unless_present = "url")]
    html: Option<PathBuf>,

    /// URL to render.
    #[arg(long)]
    url: Option<String>,

    /// CSS file injected into <head>.
    #[arg(long, requires = "html")]
    css: Option<PathBuf>,

    /// JavaScript file injected before </body>.
    #[arg(long, requires = "html")]
    js: Option<PathBuf>,

    /// Output PDF path.
    #[arg(short, long, default_value = "output.pdf")]
    output: PathBuf,

    /// Paper format: A0–A6, Letter, Legal, Tabloid, Ledger.
    #[arg(long, default_value = "A4")]
    format: String,

    /// Landscape orientation.
    #[arg(long)]
    landscape: bool,

    /// Margin on all sides (CSS length, e.g. 10mm, 0.5in).
    #[arg(long)]
    margin: Option<String>,

    /// Render scale (0.1–2.0).
    #[arg(long, default_value_t = 1.0)]
    scale: f64,

    /// Wait this long after load before printing.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Diagonal watermark text on every page.
    #[arg(long)]
    watermark: Option<String>,

    /// Append the pages of a remote PDF (repeatable).
    #[arg(long = "merge")]
    merge_urls: Vec<String>,

    /// Let an LLM fix print-layout problems first.
    #[arg(long)]
    ai_repair: bool,

    /// Disable the spinner.
    #[arg(long, env = "HTML2PDF_NO_PROGRESS")]
    no_progress: bool,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Subcommand, Debug)]
enum TenantsCommand {
    /// Create a tenant and print its id.
    Create {
        name: String,
        #[arg(long, default_value_t = 0)]
        credits: u64,
    },
    /// Add credits to a tenant.
    Credits { tenant_id: String, amount: u64 },
    /// List tenants.
    List,
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Issue a key. The plaintext is printed once.
    Create {
        tenant_id: String,
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long, default_value_t = 1000)]
        daily_limit: u32,
        #[arg(long, env = "HTML2PDF_PBKDF2_ITERATIONS", default_value_t = 100_000)]
        pbkdf2_iterations: u32,
    },
    /// Revoke a key.
    Revoke { key_id: String },
    /// List keys, optionally for one tenant.
    List {
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // A one-shot convert with a spinner only wants errors on stderr; the
    // server wants request logs.
    let spinner = matches!(&cli.command, Command::Convert(a) if !a.no_progress) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || spinner {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Convert(args) => convert(args, cli.quiet).await,
        Command::Tenants { store, command } => tenants(store, command).await,
        Command::Keys { store, command } => keys(store, command).await,
    }
}

/// Map engine flags to `ServiceConfig`.
fn service_config(
    engine: &EngineArgs,
    pbkdf2_iterations: u32,
    daily_limit: u32,
) -> Result<ServiceConfig> {
    let mut builder = ServiceConfig::builder()
        .max_html_bytes(engine.max_html_bytes)
        .render_timeout_secs(engine.render_timeout)
        .fetch_timeout_secs(engine.fetch_timeout)
        .max_delay_ms(engine.max_delay_ms)
        .cache_ttl_secs(engine.cache_ttl)
        .cache_capacity(engine.cache_capacity)
        .allow_private_hosts(engine.allow_private_hosts)
        .max_merge_sources(engine.max_merge_sources)
        .repair_max_retries(engine.repair_retries)
        .pbkdf2_iterations(pbkdf2_iterations)
        .default_daily_limit(daily_limit)
        .chrome_no_sandbox(!engine.chrome_sandbox);

    if let Some(ref chrome) = engine.chrome {
        builder = builder.chrome_executable(chrome);
    }
    if let Some(ref model) = engine.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = engine.provider {
        builder = builder.provider_name(provider);
    }
    builder.build().context("Invalid configuration")
}

fn build_vault(args: &ServeArgs, timeout_secs: u64) -> Result<Option<Arc<dyn VaultBackend>>> {
    if let Some(ref url) = args.vault_url {
        let vault = S3LikeVault::new(
            url.clone(),
            args.vault_public_url.clone(),
            args.vault_token.clone(),
            RetryPolicy::default(),
            timeout_secs,
        )
        .context("Invalid vault configuration")?;
        return Ok(Some(Arc::new(vault)));
    }
    if let Some(ref dir) = args.vault_dir {
        return Ok(Some(Arc::new(LocalFsVault::new(
            dir.clone(),
            args.vault_public_url.clone(),
        ))));
    }
    Ok(None)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = service_config(&args.engine, args.pbkdf2_iterations, args.daily_limit)?;
    let vault = build_vault(&args, config.fetch_timeout_secs)?;
    if vault.is_none() {
        tracing::warn!("No vault configured; saveToVault requests will be rejected");
    }
    if args.admin_token.is_none() {
        tracing::warn!("No admin token configured; /admin routes are disabled");
    }

    let store = JsonStore::open(&args.store.store)
        .await
        .context("Failed to open store")?;
    let converter = Converter::new(config).context("Failed to initialise converter")?;
    let service = PdfService::new(converter, Arc::new(store), vault);
    let app = server::router(AppState::new(Arc::new(service), args.admin_token.clone()));

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    server::serve(listener, app).await.context("Server error")
}

async fn convert(args: ConvertArgs, quiet: bool) -> Result<()> {
    let config = service_config(&args.engine, 100_000, 1000)?;

    let format = PaperFormat::parse(&args.format)
        .with_context(|| format!("Unknown paper format '{}'", args.format))?;
    let mut options = PdfOptions::builder()
        .format(format)
        .landscape(args.landscape)
        .scale(args.scale)
        .delay_ms(args.delay_ms);
    if let Some(ref margin) = args.margin {
        options = options.margin_all(margin.clone());
    } else {
        options = options.margin(Margins::default());
    }

    let mut request = match (&args.html, &args.url) {
        (Some(path), _) => {
            let html = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ConversionRequest::from_html(html)
        }
        (None, Some(url)) => ConversionRequest::from_url(url.clone()),
        (None, None) => anyhow::bail!("one of --html or --url is required"),
    };
    if let Some(ref path) = args.css {
        request.css = Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
        );
    }
    if let Some(ref path) = args.js {
        request.js = Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
        );
    }
    request.options = options.build().context("Invalid paper options")?;
    request.ai_repair = args.ai_repair;
    request.merge_urls = args.merge_urls.clone();
    request.watermark = args.watermark.clone().map(|text| Watermark {
        text,
        ..Default::default()
    });

    let bar = (!quiet && !args.no_progress).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Rendering");
        bar.set_message(
            args.url
                .clone()
                .or_else(|| args.html.as_ref().map(|p| p.display().to_string()))
                .unwrap_or_default(),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });

    let converter = Converter::new(config).context("Failed to initialise converter")?;
    let result = converter.convert_to_file(&request, &args.output).await;
    if let Some(ref bar) = bar {
        bar.finish_and_clear();
    }
    let stats = result.context("Conversion failed")?;

    if !quiet {
        eprintln!(
            "{}  {} pages  {}  {}ms  →  {}",
            green("✔"),
            stats.pages,
            dim(&format!("{} bytes", stats.bytes)),
            stats.total_duration_ms,
            bold(&args.output.display().to_string()),
        );
    }
    Ok(())
}

async fn tenants(args: StoreArgs, command: TenantsCommand) -> Result<()> {
    let store = JsonStore::open(&args.store)
        .await
        .context("Failed to open store")?;
    match command {
        TenantsCommand::Create { name, credits } => {
            let tenant = store
                .create_tenant(&name, credits)
                .await
                .context("Failed to create tenant")?;
            println!("{}", tenant.id);
            eprintln!("{} tenant {} with {} credits", green("✔"), bold(&name), credits);
        }
        TenantsCommand::Credits { tenant_id, amount } => {
            let tenant = store
                .add_credits(&tenant_id, amount)
                .await
                .context("Failed to add credits")?;
            println!("{}", tenant.credits);
        }
        TenantsCommand::List => {
            for t in store.list_tenants().await? {
                println!(
                    "{}  {:<24} {:>10} credits  {}",
                    t.id,
                    t.name,
                    t.credits,
                    dim(&t.created_at.format("%Y-%m-%d").to_string())
                );
            }
        }
    }
    Ok(())
}

async fn keys(args: StoreArgs, command: KeysCommand) -> Result<()> {
    let store = JsonStore::open(&args.store)
        .await
        .context("Failed to open store")?;
    match command {
        KeysCommand::Create {
            tenant_id,
            name,
            daily_limit,
            pbkdf2_iterations,
        } => {
            let issued = issue_key(&store, &tenant_id, &name, daily_limit, pbkdf2_iterations)
                .await
                .context("Failed to create key")?;
            println!("{}", issued.api_key);
            eprintln!(
                "{} key {} for tenant {}  {}",
                green("✔"),
                bold(&issued.key_id),
                issued.tenant_id,
                yellow("store the key now; it cannot be shown again")
            );
        }
        KeysCommand::Revoke { key_id } => {
            store
                .revoke_key(&key_id)
                .await
                .context("Failed to revoke key")?;
            eprintln!("{} revoked {}", green("✔"), key_id);
        }
        KeysCommand::List { tenant } => {
            for k in store.list_keys(tenant.as_deref()).await? {
                println!(
                    "{}  {:<36} {:<16} {:>6}/day  {}",
                    k.key_id,
                    k.tenant_id,
                    k.name,
                    k.daily_limit,
                    if k.revoked { yellow("revoked") } else { green("active") }
                );
            }
        }
    }
    Ok(())
}
