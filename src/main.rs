use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use clb_controller::cloud::ClientRegistry;
use clb_controller::config::{Credentials, ProviderConfig};
use clb_controller::controller::BatchReconciler;
use clb_controller::model::load_desired;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the port conflict admission webhook
    Run(RunArgs),
    /// Reconcile the listeners of one load balancer against a YAML file
    Reconcile(ReconcileArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Address the webhook listens on
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:8443")]
    addr: SocketAddr,

    /// Admit objects when the cluster cannot be listed
    #[arg(long, env = "WEBHOOK_FAIL_OPEN")]
    fail_open: bool,

    /// Region assumed when an object does not name one
    #[arg(long, env = "CLB_DEFAULT_REGION")]
    default_region: String,

    /// Extra annotated kinds to list, as group/version/Kind
    #[arg(long = "claim-resource", env = "CLB_CLAIM_RESOURCES", value_delimiter = ',')]
    claim_resources: Vec<String>,
}

#[derive(Parser, Debug)]
struct ReconcileArgs {
    /// YAML list of desired listeners
    #[arg(long, short)]
    file: PathBuf,

    /// Region of the load balancer (defaults to the provider default region)
    #[arg(long)]
    region: Option<String>,

    /// Load balancer to reconcile
    #[arg(long)]
    lb_id: String,

    /// Print the planned changes without applying them
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(ClapArgs, Debug)]
struct ProviderArgs {
    #[arg(long, env = "CLB_SECRET_ID", hide_env_values = true)]
    secret_id: Option<String>,

    #[arg(long, env = "CLB_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Base64 AES-128-CBC blob holding {"SecretId","SecretKey"}
    #[arg(long, env = "CLB_ENCRYPTED_CREDENTIALS", hide_env_values = true)]
    encrypted_credentials: Option<String>,

    /// 16-byte key for the encrypted credentials
    #[arg(long, env = "CLB_CREDENTIALS_KEY", hide_env_values = true)]
    credentials_key: Option<String>,

    /// Provider API domain or URL
    #[arg(long, env = "CLB_ENDPOINT", default_value = "clb.tencentcloudapi.com")]
    endpoint: String,

    #[arg(long, env = "CLB_DEFAULT_REGION")]
    default_region: String,

    /// Provider calls per second, shared by every region
    #[arg(long, env = "CLB_RATE_LIMIT", default_value_t = 20.0)]
    rate_limit: f64,
}

impl ProviderArgs {
    fn into_config(self) -> Result<ProviderConfig> {
        let credentials = Credentials::resolve(
            self.secret_id,
            self.secret_key,
            self.encrypted_credentials.as_deref(),
            self.credentials_key.as_deref(),
        )?;
        let mut config = ProviderConfig::new(credentials, self.endpoint, self.default_region);
        config.rate_limit.rate_per_sec = self.rate_limit;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("clb-controller v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => {
            init_tracing();
            run_webhook(run_args).await
        }
        Commands::Reconcile(reconcile_args) => {
            init_tracing();
            run_reconcile(reconcile_args).await
        }
    }
}

/// Logs go to stderr so command output on stdout stays machine readable
fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(feature = "admission-webhook")]
async fn run_webhook(args: RunArgs) -> Result<()> {
    use clb_controller::conflict::{parse_claim_resource, ConflictDetector, KubeClaimSource};
    use clb_controller::webhook::WebhookServer;

    info!("Starting clb-controller webhook v{}", env!("CARGO_PKG_VERSION"));

    let custom_resources = args
        .claim_resources
        .iter()
        .map(|value| parse_claim_resource(value))
        .collect::<clb_controller::Result<Vec<_>>>()?;

    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes cluster")?;

    info!("Connected to Kubernetes cluster");

    if args.fail_open {
        warn!("Fail-open enabled: objects are admitted when claims cannot be listed");
    }

    for resource in &custom_resources {
        info!("Tracking port claims of {}", resource.kind);
    }

    let source = KubeClaimSource::new(client, args.default_region.clone())
        .with_custom_resources(custom_resources);
    WebhookServer::new(ConflictDetector::new(source), args.default_region)
        .with_fail_open(args.fail_open)
        .start(args.addr)
        .await?;
    Ok(())
}

#[cfg(not(feature = "admission-webhook"))]
async fn run_webhook(_args: RunArgs) -> Result<()> {
    bail!("built without the admission-webhook feature")
}

async fn run_reconcile(args: ReconcileArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let desired = load_desired(&raw, &args.lb_id)
        .with_context(|| format!("parsing listeners from {}", args.file.display()))?;

    let config = args.provider.into_config()?;
    let registry = ClientRegistry::new(config);
    let client = match &args.region {
        Some(region) => registry.client(region)?,
        None => registry.default_client()?,
    };

    info!(
        "Reconciling {} listeners on {} in {}",
        desired.len(),
        args.lb_id,
        client.region()
    );

    let reconciler = BatchReconciler::new(Arc::clone(&client), registry.config().segment_concurrency);

    if args.dry_run {
        let diff = reconciler.plan(&args.lb_id, &desired).await?;
        println!("{}", serde_json::to_string_pretty(&diff.summary())?);
        return Ok(());
    }

    let report = reconciler.reconcile(&args.lb_id, &desired).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() {
        let failed: Vec<&String> = report.failed().map(|(name, _)| name).collect();
        bail!("{} listeners failed to reconcile: {:?}", failed.len(), failed);
    }
    Ok(())
}
